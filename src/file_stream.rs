//! §4.4 `CustomFileStream` — a synchronous, reference-counted wrapper over an
//! OS file, with position+I/O serialized by an inner monitor and handle
//! swaps (open/close/reopen/rename) serialized by a writer-preferring
//! rw-lock (§5).
//!
//! The teacher's original is `memmap2`-backed; this storage core instead
//! talks to the file through ordinary `seek`+`read`/`write`, since the page
//! cache (§4.3) already owns the only long-lived pointers into file data and
//! a raw file handle has no business being mapped into every consumer's
//! address space. The monitor that serializes "position, then I/O" as one
//! unit stands in for the teacher's combination of an OS file position and a
//! `lock()` around the read/write pair.

use std::fs::{File, OpenOptions as StdOpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use crate::error::{Result, StorageError};

/// A handle to a reusable scratch buffer, returned to the stream's pool on
/// drop. Stands in for §4.4's "buffer-pool for transient scratch arrays" —
/// distinct from [`crate::memory_pool::MemoryPool`], which backs long-lived
/// cache pages, not short-lived I/O staging.
pub struct ScratchBuffer<'a> {
    stream: &'a CustomFileStream,
    buf: Vec<u8>,
}

impl<'a> std::ops::Deref for ScratchBuffer<'a> {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl<'a> std::ops::DerefMut for ScratchBuffer<'a> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl<'a> Drop for ScratchBuffer<'a> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.stream.scratch_pool.lock().unwrap().push(buf);
    }
}

struct OpenHandle {
    file: File,
    path: PathBuf,
    read_only: bool,
}

/// §4.4 `CustomFileStream`. Shared across every [`crate::buffered_file::BufferedFile`]
/// session on a given file; `open`/`close` are reference-counted so several
/// sessions can use one underlying OS handle.
pub struct CustomFileStream {
    /// Writer-preferring rw-lock: reads/writes take the read side; open,
    /// close, reopen, and rename take the write side (§5).
    handle: RwLock<Option<OpenHandle>>,
    /// Inner monitor serializing "seek, then read/write" as one atomic unit.
    io_monitor: Mutex<()>,
    open_count: AtomicUsize,
    cached_length: AtomicU64,
    scratch_pool: Mutex<Vec<Vec<u8>>>,
    io_block_size: usize,
}

impl CustomFileStream {
    /// Open `path`, creating it if absent. `io_block_size` is the chunk size
    /// used by [`Self::read`]/[`Self::write`] (the file-structure block
    /// size of the owning [`crate::buffered_file::BufferedFile`]).
    ///
    /// Takes an advisory lock on the opened handle — shared for a read-only
    /// open, exclusive otherwise — the same `fs4` guard the teacher used to
    /// keep a single writer off one file, here enforcing this crate's own
    /// single-writer Non-goal (§1) instead of trusting callers to honor it.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool, io_block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = StdOpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(&path)
            .map_err(StorageError::Open)?;
        Self::lock_handle(&file, read_only)?;
        let len = file.metadata().map_err(StorageError::Open)?.len();
        Ok(Self {
            handle: RwLock::new(Some(OpenHandle {
                file,
                path,
                read_only,
            })),
            io_monitor: Mutex::new(()),
            open_count: AtomicUsize::new(1),
            cached_length: AtomicU64::new(len),
            scratch_pool: Mutex::new(Vec::new()),
            io_block_size,
        })
    }

    /// Reference-counted open: bumps the count, the handle stays live while
    /// it is above zero.
    pub fn retain(&self) {
        self.open_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Reference-counted close: drops the handle once the count reaches
    /// zero.
    pub fn release(&self) {
        if self.open_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            *self.handle.write().unwrap() = None;
        }
    }

    pub fn length(&self) -> u64 {
        self.cached_length.load(Ordering::SeqCst)
    }

    fn checkout_scratch(&self) -> ScratchBuffer<'_> {
        let mut buf = self
            .scratch_pool
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_default();
        buf.resize(self.io_block_size, 0);
        ScratchBuffer { stream: self, buf }
    }

    /// Reopen the handle with identical flags after the OS is observed to
    /// have closed it out from under us. Logged, never surfaced as an error.
    fn reopen(&self, guard: &mut Option<OpenHandle>) -> Result<()> {
        let (path, read_only) = {
            let existing = guard.as_ref().ok_or(StorageError::Disposed)?;
            (existing.path.clone(), existing.read_only)
        };
        log::warn!("backing file handle was closed out from under us, reopening {path:?}");
        // Drop the stale handle (and its advisory lock) before taking a
        // fresh one on the same path, or the new lock attempt blocks
        // forever on the dying handle's still-held lock.
        *guard = None;
        let file = StdOpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(&path)
            .map_err(StorageError::Open)?;
        Self::lock_handle(&file, read_only)?;
        *guard = Some(OpenHandle {
            file,
            path,
            read_only,
        });
        Ok(())
    }

    fn lock_handle(file: &File, read_only: bool) -> Result<()> {
        use fs4::fs_std::FileExt;
        if read_only {
            file.try_lock_shared().map_err(StorageError::Lock)
        } else {
            file.try_lock_exclusive().map_err(StorageError::Lock)
        }
    }

    fn is_closed_error(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected
        )
    }

    /// Read exactly `len` bytes starting at `pos`, retrying partial reads
    /// until satisfied or EOF. Returns the number of bytes actually read
    /// (less than `len` only at EOF).
    pub fn read_raw(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let _io = self.io_monitor.lock().unwrap();
        let mut handle_guard = self.handle.read().unwrap();
        let mut total = 0usize;
        loop {
            let handle = handle_guard.as_ref().ok_or(StorageError::Disposed)?;
            let mut file = &handle.file;
            let seek_res = (&mut file).seek(SeekFrom::Start(pos + total as u64));
            if let Err(e) = seek_res {
                return Err(StorageError::Io(e));
            }
            match (&mut file).read(&mut buf[total..]) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    total += n;
                    if total >= buf.len() {
                        return Ok(total);
                    }
                }
                Err(e) if Self::is_closed_error(&e) => {
                    drop(handle_guard);
                    let mut write_guard = self.handle.write().unwrap();
                    self.reopen(&mut write_guard)?;
                    drop(write_guard);
                    handle_guard = self.handle.read().unwrap();
                }
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
    }

    /// Write `buf` at `pos`, retrying partial writes. Updates the cached
    /// file length on success.
    pub fn write_raw(&self, pos: u64, buf: &[u8]) -> Result<()> {
        let _io = self.io_monitor.lock().unwrap();
        let mut handle_guard = self.handle.read().unwrap();
        let mut total = 0usize;
        loop {
            let handle = handle_guard.as_ref().ok_or(StorageError::Disposed)?;
            if handle.read_only {
                return Err(StorageError::ReadOnly);
            }
            let mut file = &handle.file;
            if let Err(e) = (&mut file).seek(SeekFrom::Start(pos + total as u64)) {
                return Err(StorageError::Io(e));
            }
            match (&mut file).write(&buf[total..]) {
                Ok(0) => return Err(StorageError::Io(std::io::Error::from(std::io::ErrorKind::WriteZero))),
                Ok(n) => {
                    total += n;
                    if total >= buf.len() {
                        break;
                    }
                }
                Err(e) if Self::is_closed_error(&e) => {
                    drop(handle_guard);
                    let mut write_guard = self.handle.write().unwrap();
                    self.reopen(&mut write_guard)?;
                    drop(write_guard);
                    handle_guard = self.handle.read().unwrap();
                }
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        let end = pos + buf.len() as u64;
        self.cached_length.fetch_max(end, Ordering::SeqCst);
        Ok(())
    }

    /// Read a full `io_block_size`-sized chunk into a pooled scratch buffer,
    /// copy it into `dest`, zero-fill any tail beyond the file's current
    /// length, and refresh the checksum of every file-structure block inside
    /// the chunk.
    pub fn read(&self, pos: u64, dest: &mut [u8]) -> Result<()> {
        debug_assert!(dest.len() % self.io_block_size == 0 || dest.len() <= self.io_block_size);
        let mut scratch = self.checkout_scratch();
        scratch.resize(dest.len(), 0);
        let n = self.read_raw(pos, &mut scratch)?;
        if n < scratch.len() {
            scratch[n..].fill(0);
        }
        dest.copy_from_slice(&scratch);
        let block_size = self.io_block_size;
        for chunk in dest.chunks_mut(block_size) {
            if chunk.len() == block_size {
                crate::footer::compute_checksum(chunk);
            }
        }
        Ok(())
    }

    /// Append `length` bytes read from `src` (a write-buffer-like source) at
    /// `dest_pos`, chunked at `io_block_size`, computing a fresh checksum
    /// footer over every chunk before it is written out. `wait_for_disk`
    /// selects a full `fsync` over a buffered flush.
    pub fn write_from(
        &self,
        dest_pos: u64,
        mut read_chunk: impl FnMut(u64, &mut [u8]) -> Result<()>,
        length: u64,
        wait_for_disk: bool,
    ) -> Result<()> {
        let block_size = self.io_block_size as u64;
        let mut offset = 0u64;
        while offset < length {
            let chunk_len = block_size.min(length - offset) as usize;
            let mut scratch = self.checkout_scratch();
            scratch.resize(chunk_len, 0);
            read_chunk(offset, &mut scratch)?;
            if chunk_len == self.io_block_size {
                crate::footer::Footer::clear_checksum_state(&mut scratch);
                crate::footer::compute_checksum(&mut scratch);
            }
            self.write_raw(dest_pos + offset, &scratch)?;
            offset += chunk_len as u64;
        }
        if wait_for_disk {
            self.sync()?;
        }
        Ok(())
    }

    /// Full `fsync` (`FlushFileBuffers` on Windows).
    pub fn sync(&self) -> Result<()> {
        let guard = self.handle.read().unwrap();
        let handle = guard.as_ref().ok_or(StorageError::Disposed)?;
        handle.file.sync_all().map_err(StorageError::Sync)
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        let guard = self.handle.read().unwrap();
        let handle = guard.as_ref().ok_or(StorageError::Disposed)?;
        handle.file.set_len(len).map_err(StorageError::Io)?;
        self.cached_length.store(len, Ordering::SeqCst);
        Ok(())
    }

    /// Reopen with a new read-only/shared mode. The rename itself is left to
    /// [`Self::change_extension`].
    pub fn change_share_mode(&self, read_only: bool) -> Result<()> {
        let mut guard = self.handle.write().unwrap();
        let path = {
            let existing = guard.as_ref().ok_or(StorageError::Disposed)?;
            existing.path.clone()
        };
        *guard = None;
        let file = StdOpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(StorageError::Open)?;
        Self::lock_handle(&file, read_only)?;
        *guard = Some(OpenHandle {
            file,
            path,
            read_only,
        });
        Ok(())
    }

    /// Atomically rename the backing file to `new_path`, reopening the
    /// handle at the new location. Fails if `new_path` already exists.
    pub fn change_extension(&self, new_path: impl AsRef<Path>) -> Result<()> {
        let new_path = new_path.as_ref().to_path_buf();
        let mut guard = self.handle.write().unwrap();
        let (old_path, read_only) = {
            let existing = guard.as_ref().ok_or(StorageError::Disposed)?;
            (existing.path.clone(), existing.read_only)
        };
        if new_path.exists() {
            return Err(StorageError::AlreadyExists);
        }
        std::fs::rename(&old_path, &new_path).map_err(StorageError::Open)?;
        // Drop the renamed-out-from-under-it handle (and release its lock)
        // only now that the rename has actually succeeded: the new fd takes
        // its own lock once it reopens at the new path.
        *guard = None;
        let file = StdOpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&new_path)
            .map_err(StorageError::Open)?;
        Self::lock_handle(&file, read_only)?;
        *guard = Some(OpenHandle {
            file,
            path: new_path,
            read_only,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_raw_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        let stream = CustomFileStream::open(&path, false, 4096).unwrap();
        stream.write_raw(0, &[0xAB; 4096]).unwrap();
        let mut out = [0u8; 4096];
        let n = stream.read_raw(0, &mut out).unwrap();
        assert_eq!(n, 4096);
        assert_eq!(out, [0xAB; 4096]);
    }

    #[test]
    fn read_past_eof_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        let stream = CustomFileStream::open(&path, false, 4096).unwrap();
        stream.write_raw(0, &[0x11; 100]).unwrap();
        let mut dest = vec![0u8; 4096];
        stream.read(0, &mut dest).unwrap();
        assert_eq!(&dest[0..100], &[0x11; 100]);
        assert_eq!(&dest[100..128], &[0u8; 28]);
    }

    #[test]
    fn rename_fails_if_target_exists() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&b, b"x").unwrap();
        let stream = CustomFileStream::open(&a, false, 4096).unwrap();
        assert!(matches!(
            stream.change_extension(&b),
            Err(StorageError::AlreadyExists)
        ));
    }
}
