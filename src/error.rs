use thiserror::Error;

/// The closed error taxonomy for the storage core.
///
/// Each variant is reported to the caller as-is; nothing here is retried
/// internally except where a component's own docs say otherwise (the file
/// stream's reopen-on-close, see [`crate::file_stream`]).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Position was negative, unaligned, past the file's virtual maximum, or
    /// fell inside the header region.
    #[error("position 0x{position:x} is out of range ({reason})")]
    OutOfRange { position: u64, reason: &'static str },

    /// A write was attempted against a read-only file, subfile, or committed
    /// block.
    #[error("attempted to write a read-only block")]
    ReadOnly,

    /// The pool, algorithm, session, or medium was used after being disposed.
    #[error("use after dispose")]
    Disposed,

    /// The pool was exhausted and a full collection cycle released nothing.
    #[error("out of memory: pool exhausted after a full collection cycle")]
    OutOfMemory,

    /// A block's footer checksum failed verification.
    #[error("checksum invalid for block {block_index}")]
    ChecksumInvalid { block_index: u64 },

    /// A block's footer `blockType` did not match the type the caller
    /// expected.
    #[error("block {block_index} has type {actual}, expected {expected}")]
    BlockTypeMismatch {
        block_index: u64,
        expected: u8,
        actual: u8,
    },

    /// A block's footer `indexValue` did not match the caller's expectation.
    #[error("block {block_index} has index value {actual}, expected {expected}")]
    IndexNumberMismatch {
        block_index: u64,
        expected: u32,
        actual: u32,
    },

    /// A block's footer snapshot sequence is newer than the session's
    /// snapshot.
    #[error("block {block_index} snapshot {actual} is newer than session snapshot {current}")]
    PageNewerThanSnapshot {
        block_index: u64,
        current: u32,
        actual: u32,
    },

    /// A block's footer file id did not match the session's file id.
    #[error("block {block_index} file id {actual} does not match session file id {expected}")]
    FileIdMismatch {
        block_index: u64,
        expected: u16,
        actual: u16,
    },

    /// A rename target already exists.
    #[error("rename target already exists")]
    AlreadyExists,

    /// Couldn't open the backing file.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),

    /// Couldn't lock the backing file for exclusive use.
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),

    /// Couldn't synchronize (fsync) to the backing file.
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),

    /// Couldn't resize the backing file.
    #[error("can't resize the backing file: have {size} bytes, wanted {requested} bytes")]
    ResizeFailed {
        size: u64,
        requested: u64,
        #[source]
        source: std::io::Error,
    },

    /// Couldn't grow the memory pool.
    #[error("can't grow the memory pool by {requested} bytes")]
    AllocFailed {
        requested: usize,
        #[source]
        source: std::io::Error,
    },

    /// Raw read/write I/O against the backing file failed.
    #[error("I/O against the backing file failed")]
    Io(#[source] std::io::Error),

    /// Other, miscellaneous errors that don't warrant their own variant.
    #[error("{0}")]
    Other(&'static str),
}

pub type Result<T> = std::result::Result<T, StorageError>;
