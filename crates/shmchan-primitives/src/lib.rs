#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(any(test, feature = "alloc", feature = "std"))]
extern crate alloc;

pub mod broadcast;
pub mod layout;
pub mod region;
pub mod spsc;
pub mod sync;
pub mod unicast;

pub use broadcast::{BroadcastRing, MpmcBroadcastRing, SpmcBroadcastRing};
pub use layout::{
    DEFAULT_CAPACITY, LayoutError, MAX_RECEIVERS, Popped, PushResult, ReceiverEntry, Ring,
    RingHeader, RingLayout, SlotFrame, SlotMeta, SlotView,
};
#[cfg(any(test, feature = "alloc", feature = "std"))]
pub use region::HeapRegion;
pub use region::Region;
pub use spsc::SpscRing;
pub use unicast::{MpmcUnicastRing, SpmcUnicastRing, UnicastRing};

#[cfg(all(test, loom))]
mod loom_tests;
