//!
//! A UAVCAN/CAN v1 transport: transfer framing, priority-ordered transmission
//! queueing, and reception with per-source reassembly sessions
//!
//! This crate is purely algorithmic and never touches a CAN peripheral. The
//! application drains the outgoing frame queue into its driver with
//! [`peek_frame`](queue::FrameQueueSource::peek_frame) and
//! [`pop_frame`](queue::FrameQueueSource::pop_frame), and feeds frames it has
//! received (with timestamps) to [`Receiver::accept`](rx::Receiver::accept).
//!

#![no_std]

extern crate alloc;
extern crate branta_core;
extern crate fallible_collections;
extern crate heapless;
#[cfg(test)]
extern crate std;

pub mod crc;
pub mod data;
pub mod dlc;
pub mod error;
pub mod queue;
pub mod rx;
pub mod tx;

pub use crate::data::{CanId, Frame, FRAME_CAPACITY};
pub use crate::error::{OutOfMemoryError, TransmitError};
pub use crate::queue::{FrameQueue, FrameQueueSource, FrameSink};
pub use crate::rx::Receiver;
pub use crate::tx::Transmitter;

/// The maximum number of data bytes in a CAN frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mtu {
    /// Classic CAN, up to 8 bytes per frame
    Can8 = 8,
    /// CAN FD, up to 64 bytes per frame
    #[cfg(feature = "can-fd")]
    CanFd64 = 64,
}
