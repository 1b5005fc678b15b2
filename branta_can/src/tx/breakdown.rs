//! Splitting a stream of transfer bytes into frame data

use branta_core::TransferId;
use heapless::Vec;

use crate::data::{TailByte, FRAME_CAPACITY};

/// Accumulates transfer bytes (payload, padding, and CRC) and cuts them into
/// frame data blocks with tail bytes
///
/// The caller feeds in bytes with `add`, collecting a completed frame whenever
/// one is returned, and ends the transfer with `finish` to get the last frame.
/// The toggle starts at 1 and alternates; only the first frame is marked as
/// the start of the transfer and only the last as the end.
pub struct Breakdown {
    /// Frame capacity in bytes, including the tail byte
    frame_capacity: usize,
    /// Data bytes of the frame currently being filled
    data: Vec<u8, FRAME_CAPACITY>,
    transfer_id: TransferId,
    /// True until the first frame has been produced
    start: bool,
    /// Toggle value for the next frame produced
    toggle: bool,
}

impl Breakdown {
    pub fn new(frame_capacity: usize, transfer_id: TransferId) -> Self {
        debug_assert!(frame_capacity >= 8 && frame_capacity <= FRAME_CAPACITY);
        Breakdown {
            frame_capacity,
            data: Vec::new(),
            transfer_id,
            start: true,
            toggle: true,
        }
    }

    /// Adds a byte to the transfer
    ///
    /// If the byte does not fit into the frame currently being filled, that
    /// frame is completed with a tail byte and returned, and the provided byte
    /// starts the next frame.
    pub fn add(&mut self, byte: u8) -> Option<Vec<u8, FRAME_CAPACITY>> {
        if self.data.len() == self.frame_capacity - 1 {
            let tail = TailByte::new(self.start, false, self.toggle, self.transfer_id);
            let mut done = core::mem::take(&mut self.data);
            done.push(tail.bits()).expect("Bug: Frame capacity exceeded");
            self.start = false;
            self.toggle = !self.toggle;
            self.data.push(byte).expect("Bug: Frame capacity exceeded");
            Some(done)
        } else {
            self.data.push(byte).expect("Bug: Frame capacity exceeded");
            None
        }
    }

    /// Ends the transfer, producing its last frame
    pub fn finish(mut self) -> Vec<u8, FRAME_CAPACITY> {
        let tail = TailByte::new(self.start, true, self.toggle, self.transfer_id);
        self.data
            .push(tail.bits())
            .expect("Bug: Frame capacity exceeded");
        self.data
    }
}
