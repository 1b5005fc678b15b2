//! Reassembly of transfer payloads from frame bodies

use alloc::vec::Vec;

use crate::crc::TransferCrc;
use crate::error::OutOfMemoryError;

/// Accumulates the body bytes of the frames of one transfer
///
/// The stored payload is bounded by the limit given at construction. Bytes
/// beyond the limit are dropped but still counted and folded into the CRC, so
/// the end-of-transfer CRC check remains valid for truncated transfers.
#[derive(Debug)]
pub struct Buildup {
    /// Stored payload bytes
    payload: Vec<u8>,
    /// Maximum number of bytes to store
    store_limit: usize,
    /// Total number of body bytes consumed, including dropped bytes
    total_length: usize,
    /// CRC over every body byte consumed
    crc: TransferCrc,
    /// Toggle value the next frame must carry
    toggle: bool,
    /// Number of frames consumed
    frames: usize,
}

impl Buildup {
    pub fn new(store_limit: usize) -> Self {
        Buildup {
            payload: Vec::new(),
            store_limit,
            total_length: 0,
            crc: TransferCrc::new(),
            // The first frame of a transfer has toggle set
            toggle: true,
            frames: 0,
        }
    }

    /// Returns the toggle value expected on the next frame of this transfer
    pub fn expected_toggle(&self) -> bool {
        self.toggle
    }

    /// Returns the number of frames consumed so far
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Returns the total number of body bytes consumed, including any that
    /// were dropped because they exceeded the storage limit
    pub fn total_length(&self) -> usize {
        self.total_length
    }

    /// Returns the running CRC value
    ///
    /// At the end of an intact multi-frame transfer this is zero, because the
    /// CRC bytes themselves have been folded in.
    pub fn crc_value(&self) -> u16 {
        self.crc.get()
    }

    /// Absorbs the body of one frame (with the tail byte already removed)
    pub fn push(&mut self, body: &[u8]) -> Result<(), OutOfMemoryError> {
        let room = self.store_limit - self.payload.len();
        let store = body.len().min(room);
        self.payload.try_reserve(store)?;
        self.payload.extend_from_slice(&body[..store]);
        self.crc.add_bytes(body);
        self.total_length += body.len();
        self.frames += 1;
        self.toggle = !self.toggle;
        Ok(())
    }

    /// Takes the stored payload
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}
