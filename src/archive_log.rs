//! §6 "Archive list log" — a sibling log file recording archive identifiers
//! pending deletion across process restarts. Optional and informational: a
//! file that fails to parse is discarded, never treated as a startup
//! failure. Out of scope (per §1/§D): the scheduler that actually rolls
//! files over or deletes them — only the file format is modeled here.

use std::io::{Read, Write};
use std::path::Path;

use crate::error::{Result, StorageError};

const PREFIX: &str = "openHistorian 2.0 Archive List Log";
const CURRENT_VERSION: u8 = 1;
const GUID_SIZE: usize = 16;
const SHA1_SIZE: usize = 20;

/// The parsed, validated contents of an archive list log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveListLog {
    pub pending_deletion: Vec<[u8; GUID_SIZE]>,
}

impl ArchiveListLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize to the wire format: UTF-8 prefix, version byte, a 32-bit
    /// count, `count * 16` bytes of GUIDs, and a trailing SHA-1 over
    /// everything preceding it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            PREFIX.len() + 1 + 4 + self.pending_deletion.len() * GUID_SIZE + SHA1_SIZE,
        );
        out.extend_from_slice(PREFIX.as_bytes());
        out.push(CURRENT_VERSION);
        out.extend_from_slice(&(self.pending_deletion.len() as u32).to_le_bytes());
        for guid in &self.pending_deletion {
            out.extend_from_slice(guid);
        }
        let hash = sha1(&out);
        out.extend_from_slice(&hash);
        out
    }

    /// Write the log to `path`, replacing whatever was there.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = std::fs::File::create(path).map_err(StorageError::Open)?;
        file.write_all(&self.to_bytes()).map_err(StorageError::Io)?;
        file.sync_all().map_err(StorageError::Sync)
    }

    /// Load the log from `path`. Any structural problem — missing/garbled
    /// prefix, unknown version, truncated data, or a hash mismatch — is
    /// reported as `Ok(None)` rather than an error: the log is optional and
    /// informational, so a corrupt one is discarded, not fatal (§6).
    pub fn read_from(path: impl AsRef<Path>) -> Result<Option<ArchiveListLog>> {
        let mut bytes = Vec::new();
        match std::fs::File::open(path) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes).map_err(StorageError::Io)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Open(e)),
        }
        Ok(Self::parse(&bytes))
    }

    fn parse(bytes: &[u8]) -> Option<ArchiveListLog> {
        let prefix_len = PREFIX.len();
        if bytes.len() < prefix_len + 1 + 4 + SHA1_SIZE {
            return None;
        }
        if &bytes[..prefix_len] != PREFIX.as_bytes() {
            return None;
        }
        let version = bytes[prefix_len];
        if version != CURRENT_VERSION {
            return None;
        }
        let count_start = prefix_len + 1;
        let count = u32::from_le_bytes(bytes[count_start..count_start + 4].try_into().ok()?) as usize;
        let guids_start = count_start + 4;
        let guids_end = guids_start.checked_add(count.checked_mul(GUID_SIZE)?)?;
        let hash_end = guids_end.checked_add(SHA1_SIZE)?;
        if hash_end != bytes.len() {
            return None;
        }
        let expected_hash = &bytes[guids_end..hash_end];
        let actual_hash = sha1(&bytes[..guids_end]);
        if expected_hash != actual_hash {
            return None;
        }
        let mut pending_deletion = Vec::with_capacity(count);
        for chunk in bytes[guids_start..guids_end].chunks_exact(GUID_SIZE) {
            pending_deletion.push(chunk.try_into().unwrap());
        }
        Some(ArchiveListLog { pending_deletion })
    }
}

/// A small, self-contained SHA-1 implementation (FIPS 180-4), used only for
/// this log's trailing integrity hash — the teacher's stack reaches for
/// `xxhash-rust` for block checksums, but the wire format here is fixed by
/// an external, already-deployed log file and specifies SHA-1 by name.
fn sha1(data: &[u8]) -> [u8; SHA1_SIZE] {
    let mut h: [u32; 5] = [0x67452301, 0xEFCDAB89, 0x98BADCFE, 0x10325476, 0xC3D2E1F0];

    let ml = (data.len() as u64) * 8;
    let mut msg = data.to_vec();
    msg.push(0x80);
    while msg.len() % 64 != 56 {
        msg.push(0);
    }
    msg.extend_from_slice(&ml.to_be_bytes());

    for chunk in msg.chunks_exact(64) {
        let mut w = [0u32; 80];
        for (i, word) in chunk.chunks_exact(4).enumerate() {
            w[i] = u32::from_be_bytes(word.try_into().unwrap());
        }
        for i in 16..80 {
            w[i] = (w[i - 3] ^ w[i - 8] ^ w[i - 14] ^ w[i - 16]).rotate_left(1);
        }

        let (mut a, mut b, mut c, mut d, mut e) = (h[0], h[1], h[2], h[3], h[4]);
        for (i, word) in w.iter().enumerate() {
            let (f, k) = match i {
                0..=19 => ((b & c) | ((!b) & d), 0x5A827999u32),
                20..=39 => (b ^ c ^ d, 0x6ED9EBA1),
                40..=59 => ((b & c) | (b & d) | (c & d), 0x8F1BBCDC),
                _ => (b ^ c ^ d, 0xCA62C1D6),
            };
            let temp = a
                .rotate_left(5)
                .wrapping_add(f)
                .wrapping_add(e)
                .wrapping_add(k)
                .wrapping_add(*word);
            e = d;
            d = c;
            c = b.rotate_left(30);
            b = a;
            a = temp;
        }
        h[0] = h[0].wrapping_add(a);
        h[1] = h[1].wrapping_add(b);
        h[2] = h[2].wrapping_add(c);
        h[3] = h[3].wrapping_add(d);
        h[4] = h[4].wrapping_add(e);
    }

    let mut out = [0u8; SHA1_SIZE];
    for (i, word) in h.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_matches_known_vector() {
        // SHA-1("abc") per FIPS 180-4's example.
        let digest = sha1(b"abc");
        assert_eq!(
            hex(&digest),
            "a9993e364706816aba3e25717850c26c9cd0d89"
        );
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ArchiveListLog.bin");
        let mut log = ArchiveListLog::new();
        log.pending_deletion.push([1u8; 16]);
        log.pending_deletion.push([2u8; 16]);
        log.write_to(&path).unwrap();

        let loaded = ArchiveListLog::read_from(&path).unwrap().unwrap();
        assert_eq!(loaded, log);
    }

    #[test]
    fn missing_file_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        assert!(ArchiveListLog::read_from(&path).unwrap().is_none());
    }

    #[test]
    fn bad_prefix_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, b"not the right prefix at all").unwrap();
        assert!(ArchiveListLog::read_from(&path).unwrap().is_none());
    }

    #[test]
    fn tampered_hash_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tampered.bin");
        let mut log = ArchiveListLog::new();
        log.pending_deletion.push([9u8; 16]);
        let mut bytes = log.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(ArchiveListLog::read_from(&path).unwrap().is_none());
    }
}
