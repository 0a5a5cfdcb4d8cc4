use std::fmt::Display;

/// Errors that user-initiated operations can return.
#[derive(Debug)]
pub enum JitError {
    /// A device or host allocation failed
    OutOfMemory(Box<str>),
    /// Operands of incompatible sizes (size 1 broadcasts, nothing else does)
    SizeMismatch(Box<str>),
    /// Operation is not defined for the given scalar type
    UnsupportedType(Box<str>),
    /// The requested backend never initialized or was shut down
    BackendUnavailable(Box<str>),
    /// Device index outside the enumerated device list
    DeviceIndexOutOfRange { index: usize, count: usize },
    /// Kernel compilation failed
    CompileFailed(Box<str>),
    /// Kernel launch failed
    LaunchFailed(Box<str>),
    /// Error from file operations
    Io(std::io::Error),
    /// On-disk kernel entry failed validation
    CorruptCacheEntry(Box<str>),
    /// Variable id does not name a live variable
    InvalidHandle(u32),
    /// Operation arrived after shutdown already started
    ShutdownInProgress,
    /// Shutdown found variables that are still referenced
    LeakDetected { leaked: usize },
    /// Error reported by a backend API call
    Backend(BackendError),
}

impl Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::OutOfMemory(e) => write!(f, "out of memory: {e}"),
            JitError::SizeMismatch(e) => write!(f, "size mismatch: {e}"),
            JitError::UnsupportedType(e) => write!(f, "unsupported type: {e}"),
            JitError::BackendUnavailable(e) => f.write_str(e),
            JitError::DeviceIndexOutOfRange { index, count } => {
                write!(f, "device index {index} out of range 0..{count}")
            }
            JitError::CompileFailed(e) => write!(f, "compilation failed: {e}"),
            JitError::LaunchFailed(e) => write!(f, "launch failed: {e}"),
            JitError::Io(e) => write!(f, "io: {e}"),
            JitError::CorruptCacheEntry(e) => write!(f, "corrupt cache entry: {e}"),
            JitError::InvalidHandle(id) => write!(f, "r{id}: unknown variable"),
            JitError::ShutdownInProgress => f.write_str("shutdown in progress"),
            JitError::LeakDetected { leaked } => {
                write!(f, "{leaked} variables are still referenced")
            }
            JitError::Backend(e) => write!(f, "backend: {e}"),
        }
    }
}

impl std::error::Error for JitError {}

impl From<std::io::Error> for JitError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<BackendError> for JitError {
    fn from(value: BackendError) -> Self {
        match value.status {
            ErrorStatus::MemoryAllocation => JitError::OutOfMemory(value.context),
            ErrorStatus::KernelCompilation => JitError::CompileFailed(value.context),
            ErrorStatus::KernelLaunch => JitError::LaunchFailed(value.context),
            _ => JitError::Backend(value),
        }
    }
}

/// Raw failure of a backend API call, translated into [`JitError`]
/// at the public boundary.
#[derive(Debug)]
pub struct BackendError {
    pub status: ErrorStatus,
    pub context: Box<str>,
}

impl BackendError {
    pub(crate) fn new(status: ErrorStatus, context: impl Into<Box<str>>) -> Self {
        Self { status, context: context.into() }
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.status, self.context)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// Shared library was not found on disk
    DyLibNotFound,
    /// Library loaded but a required symbol group is missing
    MissingSymbols,
    /// Backend initialization failure
    Initialization,
    /// Backend deinitialization failure
    Deinitialization,
    /// Failed to enumerate devices
    DeviceEnumeration,
    /// Failed to query device for information
    DeviceQuery,
    /// Failed to allocate memory
    MemoryAllocation,
    /// Failed to deallocate memory
    MemoryDeallocation,
    /// Failed to copy between host and device
    MemoryCopy,
    /// Failed to compile kernel
    KernelCompilation,
    /// Failed to launch kernel
    KernelLaunch,
    /// Failed to synchronize stream or event
    Sync,
}

/// Invariant violations cannot be recovered from without risking silent
/// data corruption. Dump a diagnostic and terminate.
macro_rules! jit_fail {
    ($($arg:tt)*) => {{
        $crate::log::log(
            $crate::log::LogLevel::Error,
            "fail",
            &format!($($arg)*),
        );
        panic!($($arg)*);
    }};
}

pub(crate) use jit_fail;
