#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]
#![cfg(unix)]

pub mod condvar;
pub mod config;
pub mod error;
pub mod pool;
pub mod queue;
pub mod robust;
pub mod shm;
pub mod transport;
pub mod waiter;

pub use condvar::{CondVar, CondVarCell};
pub use config::{ChannelConfig, MAX_RECEIVERS};
pub use error::{
    ConfigError, LockError, PoolError, QueueError, RecvError, SendError, ShmError,
};
pub use pool::{ChunkId, LargeMsgPool, PoolStatus, SizeClassStatus};
pub use queue::{Queue, QueueStatus, Role, Topology};
pub use robust::{NamedRobustMutex, RobustMutex, RobustMutexCell};
pub use shm::{ShmObject, ShmOpenMode};
pub use transport::{Receiver, RecvBuffer, Sender};
pub use waiter::{Waiter, WaiterCell};

// Re-export the frame types queue callers exchange with the ring engines.
pub use shmchan_primitives::{SlotFrame, SlotView};
