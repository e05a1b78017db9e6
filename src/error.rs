//! Error types for each layer of the crate, following the `thiserror` style
//! used throughout: leaf errors per subsystem, wrapped by a top-level error
//! at the binary boundary.
use thiserror::Error;

/// Errors raised by the guest memory subsystem ([`crate::mmu::Mmu`]).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// The requested range falls outside of guest memory.
    #[error("address range is out of bounds")]
    OutOfRange,
    /// A byte in the requested range lacks the required permission.
    #[error("permission denied at guest address {address:#x}")]
    NoPerm {
        /// The first offending guest address.
        address: u64,
    },
    /// The guest allocator has no more memory to hand out.
    #[error("guest memory is full")]
    MemFull,
    /// The requested allocation would advance the bump pointer past the end
    /// of guest memory.
    #[error("allocation would overrun guest memory")]
    WouldOverrun,
}

/// Errors raised while parsing and loading a target ELF binary.
#[derive(Debug, Error)]
pub enum ElfError {
    /// Failed to read the target file from disk.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The `object` crate failed to parse the ELF headers.
    #[error("malformed ELF: {0}")]
    Parse(#[from] object::read::Error),
    /// The binary is not an ELF file, or uses a bit width/endianness this
    /// emulator does not support.
    #[error("unsupported ELF format: {0}")]
    Unsupported(String),
    /// A loadable segment does not fit in the configured guest memory size.
    #[error("ELF segment at {address:#x} (size {size:#x}) does not fit in guest memory")]
    SegmentTooLarge {
        /// Guest virtual address the segment targets.
        address: u64,
        /// Size in bytes of the segment (memory size, not file size).
        size: u64,
    },
    /// Writing a loaded segment into guest memory failed.
    #[error(transparent)]
    Mmu(#[from] MmuError),
}

/// Fatal engine-level errors: conditions the spec requires a worker to abort
/// on, rather than recover from.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was asked to fuzz with an empty corpus.
    #[error("cannot fuzz: corpus is empty")]
    EmptyCorpus,
    /// The chosen input (after truncating to the fuzz buffer length) is
    /// zero-length.
    #[error("chosen input has effective length 0")]
    EmptyEffectiveInput,
    /// A [`crate::engine::SnapshotEngine`] was driven from a thread other
    /// than the one that created it.
    #[error("engine accessed from a foreign thread")]
    CrossThreadAccess,
    /// Writing a crash file to disk failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top-level error returned from `main`.
#[derive(Debug, Error)]
pub enum FuzzError {
    /// Failure while loading or parsing the target ELF.
    #[error(transparent)]
    Elf(#[from] ElfError),
    /// Failure from the guest MMU during setup (e.g. building the initial stack).
    #[error(transparent)]
    Mmu(#[from] MmuError),
    /// Failure while constructing or running the snapshot engine.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Generic I/O failure (corpus loading, crash directory creation, ...).
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The crash directory could not be created or is not writable.
    #[error("crash directory {0:?} is not usable: {1}")]
    CrashDirUnusable(std::path::PathBuf, std::io::Error),
}
