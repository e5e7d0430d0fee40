//! Error types.
//!
//! Protocol-internal retries (CAS failures, robust-mutex recovery) are
//! handled where they occur and never surface here.

use std::io;

use shmchan_primitives::LayoutError;

// =============================================================================
// Shared-memory objects
// =============================================================================

/// Errors from named shared-memory object operations.
#[derive(Debug)]
pub enum ShmError {
    /// The OS refused the namespace or mapping operation.
    Unavailable { name: String, source: io::Error },
    /// An existing object's size disagrees with the request.
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    /// The mapped header does not carry our magic/version.
    IncompatibleLayout { name: String, found: u64 },
    /// The creating process never finished initializing the region.
    InitTimeout { name: String },
}

impl std::fmt::Display for ShmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { name, source } => {
                write!(f, "shared memory object {name:?} unavailable: {source}")
            }
            Self::SizeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "shared memory object {name:?} size mismatch: expected {expected}, found {actual}"
            ),
            Self::IncompatibleLayout { name, found } => write!(
                f,
                "shared memory object {name:?} has incompatible layout word {found:#x}"
            ),
            Self::InitTimeout { name } => write!(
                f,
                "shared memory object {name:?} was never marked ready by its creator"
            ),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unavailable { source, .. } => Some(source),
            _ => None,
        }
    }
}

// =============================================================================
// Robust synchronization
// =============================================================================

/// Errors from robust mutex, condvar, and waiter operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Exceeded the owner-death recovery budget.
    LockFailed,
    /// Unlock attempted by a thread that does not own the mutex.
    NotOwner,
    /// Monotonic deadline reached.
    TimedOut,
    /// The waiter was shut down via `quit_waiting`.
    Shutdown,
    /// Unexpected error from the underlying pthread call.
    Os(i32),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LockFailed => write!(f, "lock failed: recovery budget exhausted"),
            Self::NotOwner => write!(f, "unlock by non-owner"),
            Self::TimedOut => write!(f, "lock wait timed out"),
            Self::Shutdown => write!(f, "waiter was shut down"),
            Self::Os(errno) => write!(
                f,
                "pthread error: {}",
                io::Error::from_raw_os_error(*errno)
            ),
        }
    }
}

impl std::error::Error for LockError {}

// =============================================================================
// Queue
// =============================================================================

/// Errors from queue construction and push/pop.
#[derive(Debug)]
pub enum QueueError {
    Shm(ShmError),
    Layout(LayoutError),
    Lock(LockError),
    /// All 32 receiver bits are taken.
    TooManyReceivers,
    /// The topology allows a single sender and one is already connected.
    TooManySenders,
    /// Operation requires the sender role.
    NotSender,
    /// Operation requires the receiver role.
    NotReceiver,
    /// Ring full (non-blocking push).
    Full,
    /// Ring empty (non-blocking pop).
    Empty,
    /// Monotonic deadline reached.
    TimedOut,
    /// The channel was shut down.
    Shutdown,
    /// Invalid channel configuration.
    Config(ConfigError),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shm(e) => write!(f, "{e}"),
            Self::Layout(e) => write!(f, "{e}"),
            Self::Lock(e) => write!(f, "{e}"),
            Self::TooManyReceivers => write!(f, "too many receivers (max 32)"),
            Self::TooManySenders => write!(f, "topology allows a single sender"),
            Self::NotSender => write!(f, "queue handle is not a sender"),
            Self::NotReceiver => write!(f, "queue handle is not a receiver"),
            Self::Full => write!(f, "ring is full"),
            Self::Empty => write!(f, "ring is empty"),
            Self::TimedOut => write!(f, "operation timed out"),
            Self::Shutdown => write!(f, "channel was shut down"),
            Self::Config(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Shm(e) => Some(e),
            Self::Layout(e) => Some(e),
            Self::Lock(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmError> for QueueError {
    fn from(e: ShmError) -> Self {
        Self::Shm(e)
    }
}

impl From<LayoutError> for QueueError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<LockError> for QueueError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::TimedOut => Self::TimedOut,
            LockError::Shutdown => Self::Shutdown,
            other => Self::Lock(other),
        }
    }
}

impl From<ConfigError> for QueueError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// =============================================================================
// Large-message pool
// =============================================================================

/// Errors from the large-message pool.
#[derive(Debug)]
pub enum PoolError {
    Shm(ShmError),
    Lock(LockError),
    /// No free chunk and waiting was not requested.
    Exhausted,
    /// Payload exceeds the largest size class.
    PayloadTooLarge { len: usize, max: usize },
    /// Chunk id does not name a chunk in this pool.
    InvalidChunk,
    /// Monotonic deadline reached.
    TimedOut,
    /// The pool was shut down.
    Shutdown,
    /// Invalid channel configuration.
    Config(ConfigError),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shm(e) => write!(f, "{e}"),
            Self::Lock(e) => write!(f, "{e}"),
            Self::Exhausted => write!(f, "large-message pool exhausted"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {len} bytes, max {max}")
            }
            Self::InvalidChunk => write!(f, "invalid pool chunk id"),
            Self::TimedOut => write!(f, "pool acquire timed out"),
            Self::Shutdown => write!(f, "pool was shut down"),
            Self::Config(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Shm(e) => Some(e),
            Self::Lock(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for PoolError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ShmError> for PoolError {
    fn from(e: ShmError) -> Self {
        Self::Shm(e)
    }
}

impl From<LockError> for PoolError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::TimedOut => Self::TimedOut,
            LockError::Shutdown => Self::Shutdown,
            other => Self::Lock(other),
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Errors from `Sender::send`.
#[derive(Debug)]
pub enum SendError {
    /// Empty payloads are not transported.
    EmptyPayload,
    /// Payload exceeds the largest pool size class.
    PayloadTooLarge { len: usize, max: usize },
    Queue(QueueError),
    Pool(PoolError),
    TimedOut,
    Shutdown,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPayload => write!(f, "empty payload"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {len} bytes, max {max}")
            }
            Self::Queue(e) => write!(f, "{e}"),
            Self::Pool(e) => write!(f, "{e}"),
            Self::TimedOut => write!(f, "send timed out"),
            Self::Shutdown => write!(f, "channel was shut down"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Queue(e) => Some(e),
            Self::Pool(e) => Some(e),
            _ => None,
        }
    }
}

impl From<QueueError> for SendError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::TimedOut => Self::TimedOut,
            QueueError::Shutdown => Self::Shutdown,
            other => Self::Queue(other),
        }
    }
}

impl From<PoolError> for SendError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::TimedOut => Self::TimedOut,
            PoolError::Shutdown => Self::Shutdown,
            PoolError::PayloadTooLarge { len, max } => Self::PayloadTooLarge { len, max },
            other => Self::Pool(other),
        }
    }
}

/// Errors from `Receiver::recv`.
#[derive(Debug)]
pub enum RecvError {
    Queue(QueueError),
    Pool(PoolError),
    TimedOut,
    Shutdown,
}

impl std::fmt::Display for RecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue(e) => write!(f, "{e}"),
            Self::Pool(e) => write!(f, "{e}"),
            Self::TimedOut => write!(f, "recv timed out"),
            Self::Shutdown => write!(f, "channel was shut down"),
        }
    }
}

impl std::error::Error for RecvError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Queue(e) => Some(e),
            Self::Pool(e) => Some(e),
            _ => None,
        }
    }
}

impl From<QueueError> for RecvError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::TimedOut => Self::TimedOut,
            QueueError::Shutdown => Self::Shutdown,
            other => Self::Queue(other),
        }
    }
}

impl From<PoolError> for RecvError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::TimedOut => Self::TimedOut,
            PoolError::Shutdown => Self::Shutdown,
            other => Self::Pool(other),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Invalid configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigError(pub &'static str);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid channel config: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}
