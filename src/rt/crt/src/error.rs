//! Definitions for errors for the runtime substrate.

use miette::Diagnostic;
use thiserror::Error;

/// The backing allocator, or the block arena, ran out.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum AllocError {
    #[error("backing allocator failed to provide {size} bytes")]
    OutOfMemory { size: usize },
    #[error("block arena exhausted (capacity {capacity} slots)")]
    ArenaExhausted { capacity: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum RegistryError {
    #[error("failed to allocate callback block")]
    Alloc(#[from] AllocError),
    #[error("deferred-exit registry no longer accepts callbacks (draining or drained)")]
    #[diagnostic(help("callbacks registered during teardown are not run"))]
    Closed,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ImageError {
    #[error("mapped image has a bad format")]
    BadFormat {
        #[source]
        err: object::read::Error,
    },
    #[error("no more sections")]
    NoMoreSections,
    #[error("the running module is not a mapped PE image")]
    #[diagnostic(help("introspecting the current module is only available on Windows"))]
    NoHostImage,
}

impl From<object::read::Error> for ImageError {
    fn from(err: object::read::Error) -> Self {
        Self::BadFormat { err }
    }
}

/// Conditions after which the runtime substrate can no longer be assumed sound. These are never
/// handed back to application code as ordinary errors; the top-level wrapper reports them and ends
/// the process.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum FatalError {
    #[error("runtime initialization failed: {detail}")]
    InitFailed { detail: String },
    #[error("unhandled fault in entry point: {detail}")]
    Fault { detail: String },
    #[error("process terminated by interrupt, no interrupt response installed")]
    Interrupted,
}

// Exit statuses. On Windows these match the NTSTATUS values a native runtime would produce.
#[cfg(windows)]
pub(crate) mod status {
    pub const INIT_FAILED: i32 = 0xC000_0142_u32 as i32;
    pub const FAULT: i32 = 0xC000_0409_u32 as i32;
    pub const INTERRUPTED: i32 = 0xC000_013A_u32 as i32;
}

#[cfg(not(windows))]
pub(crate) mod status {
    // 128 + SIGABRT
    pub const INIT_FAILED: i32 = 134;
    pub const FAULT: i32 = 134;
    // 128 + SIGINT
    pub const INTERRUPTED: i32 = 130;
}

impl FatalError {
    /// Numeric code printed along with the diagnostic message.
    pub fn code(&self) -> u32 {
        match self {
            FatalError::InitFailed { .. } => 1,
            FatalError::Fault { .. } => 2,
            FatalError::Interrupted => 3,
        }
    }

    /// Exit status the process terminates with.
    pub fn exit_status(&self) -> i32 {
        match self {
            FatalError::InitFailed { .. } => status::INIT_FAILED,
            FatalError::Fault { .. } => status::FAULT,
            FatalError::Interrupted => status::INTERRUPTED,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum RuntimeError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}
