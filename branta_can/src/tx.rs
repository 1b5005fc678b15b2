//!
//! UAVCAN transmission
//!

mod breakdown;
#[cfg(test)]
mod tx_test;

use alloc::vec::Vec;
use core::convert::TryFrom;
use core::iter;

use fallible_collections::FallibleVec;

use branta_core::transfer::{ServiceHeader, Transfer, TransferHeader, TransferKindHeader};
use branta_core::NodeId;

use crate::crc::TransferCrc;
use crate::data::{CanId, Frame};
use crate::dlc;
use crate::error::{OutOfMemoryError, TransmitError};
use crate::queue::FrameSink;
use crate::tx::breakdown::Breakdown;
use crate::Mtu;

/// The number of bytes the transfer CRC occupies on the wire
const CRC_SIZE_BYTES: usize = 2;

const OFFSET_PRIORITY: u32 = 26;
const OFFSET_SUBJECT_ID: u32 = 8;
const OFFSET_SERVICE_ID: u32 = 14;
const OFFSET_DST_NODE_ID: u32 = 7;

const FLAG_SERVICE_NOT_MESSAGE: u32 = 1 << 25;
const FLAG_ANONYMOUS_MESSAGE: u32 = 1 << 24;
const FLAG_REQUEST_NOT_RESPONSE: u32 = 1 << 24;

/// Splits outgoing transfers into frames
pub struct Transmitter<Q> {
    /// Queue of frames waiting to be sent
    frame_queue: Q,
    /// Transport MTU, in bytes per frame including the tail byte
    mtu: usize,
    /// Number of transfers successfully transmitted
    ///
    /// Success means that the frames were placed into the frame queue
    /// successfully. CAN bus errors are ignored.
    transfer_count: u64,
    /// Number of transfers that could not be transmitted
    error_count: u64,
}

impl<Q> Transmitter<Q> {
    /// Creates a transmitter
    ///
    /// mtu: The maximum number of bytes in a frame
    pub fn new(mtu: Mtu, frame_queue: Q) -> Self {
        Transmitter {
            frame_queue,
            mtu: mtu as usize,
            transfer_count: 0,
            error_count: 0,
        }
    }

    /// Sets the MTU
    ///
    /// This will take effect on the next call to push().
    pub fn set_mtu(&mut self, mtu: Mtu) {
        self.mtu = mtu as usize;
    }

    /// The number of payload bytes each frame can carry, leaving room for the
    /// tail byte
    fn presentation_layer_mtu(&self) -> usize {
        dlc::round_up_frame_payload(self.mtu) - 1
    }

    /// Breaks a transfer into frames and adds them to the frame queue
    ///
    /// The frames can be retrieved and sent using the queue's peek and pop
    /// functions. Each frame carries the transfer timestamp as its deadline.
    ///
    /// An anonymous transfer is given a payload-derived pseudo source ID and
    /// must fit into a single frame.
    ///
    /// If an allocation fails, the queue is left unchanged and no frames of
    /// this transfer are enqueued.
    pub fn push<P, I>(&mut self, transfer: Transfer<P, I>) -> Result<(), TransmitError>
    where
        P: AsRef<[u8]>,
        Q: FrameSink<I>,
        I: Clone,
    {
        // Convert the transfer payload into borrowed form
        let transfer = Transfer {
            timestamp: transfer.timestamp,
            header: transfer.header,
            transfer_id: transfer.transfer_id,
            payload: transfer.payload.as_ref(),
        };

        match self.push_inner(transfer) {
            Ok(()) => {
                self.transfer_count = self.transfer_count.wrapping_add(1);
                Ok(())
            }
            Err(e) => {
                self.error_count = self.error_count.wrapping_add(1);
                Err(e)
            }
        }
    }

    fn push_inner<I>(&mut self, transfer: Transfer<&[u8], I>) -> Result<(), TransmitError>
    where
        Q: FrameSink<I>,
        I: Clone,
    {
        let mtu = self.presentation_layer_mtu();
        let payload = transfer.payload;
        if transfer.header.is_anonymous() && payload.len() > mtu {
            return Err(TransmitError::AnonymousMultiFrame);
        }
        let can_id = make_can_id(&transfer.header, payload);
        let stats = FrameStats::calculate(payload.len(), mtu);

        // Build every frame of the transfer before touching the queue, so
        // that an allocation failure cannot leave part of a transfer behind.
        let mut built: Vec<Frame<I>> =
            FallibleVec::try_with_capacity(stats.frames).map_err(OutOfMemoryError::from)?;

        // Run the CRC over the payload bytes and the padding of the last frame
        let mut crc = TransferCrc::new();
        let payload_and_padding = payload
            .iter()
            .cloned()
            .chain(iter::repeat(0u8).take(stats.last_frame_padding))
            .inspect(|&byte| crc.add(byte));

        let mut breakdown = Breakdown::new(self.mtu, transfer.transfer_id);
        for byte in payload_and_padding {
            if let Some(frame_data) = breakdown.add(byte) {
                // Filled up a frame
                built.push(Frame::new(transfer.timestamp.clone(), can_id, &frame_data));
            }
        }
        if stats.frames > 1 {
            // A multi-frame transfer ends with the CRC of the payload and
            // padding, most significant byte first. The CRC may straddle the
            // last two frames.
            for &byte in crc.get().to_be_bytes().iter() {
                if let Some(frame_data) = breakdown.add(byte) {
                    built.push(Frame::new(transfer.timestamp.clone(), can_id, &frame_data));
                }
            }
        }
        let last_frame_data = breakdown.finish();
        built.push(Frame::new(transfer.timestamp.clone(), can_id, &last_frame_data));
        debug_assert_eq!(built.len(), stats.frames);

        // One reservation covers the whole transfer, so the splice cannot
        // fail partway through
        self.frame_queue.try_reserve(built.len())?;
        for frame in built {
            self.frame_queue.push_frame(frame)?;
        }
        Ok(())
    }

    /// Returns a reference to the frame queue, where outgoing frames are stored
    pub fn frame_queue(&self) -> &Q {
        &self.frame_queue
    }

    /// Returns a mutable reference to the frame queue, where outgoing frames
    /// are stored
    pub fn frame_queue_mut(&mut self) -> &mut Q {
        &mut self.frame_queue
    }

    /// Returns the number of transfers successfully transmitted
    ///
    /// Success means that the frames were placed into the frame queue
    /// successfully. CAN bus errors are ignored.
    #[inline]
    pub fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    /// Returns the number of transfers that could not be transmitted
    #[inline]
    pub fn error_count(&self) -> u64 {
        self.error_count
    }
}

/// The number of frames a transfer will occupy and the number of padding
/// bytes in its last frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameStats {
    frames: usize,
    last_frame_padding: usize,
}

impl FrameStats {
    fn calculate(payload_length: usize, mtu: usize) -> FrameStats {
        debug_assert!(mtu >= 7);
        if payload_length <= mtu {
            // Single frame, no CRC
            let frame_length = dlc::round_up_frame_payload(payload_length + 1);
            FrameStats {
                frames: 1,
                last_frame_padding: frame_length - payload_length - 1,
            }
        } else {
            let total = payload_length + CRC_SIZE_BYTES;
            let frames = (total + mtu - 1) / mtu;
            // Padding goes in the last frame only, between the payload and
            // the CRC
            let last_frame_content = total - (frames - 1) * mtu;
            let last_frame_length = dlc::round_up_frame_payload(last_frame_content + 1);
            FrameStats {
                frames,
                last_frame_padding: last_frame_length - last_frame_content - 1,
            }
        }
    }
}

fn make_can_id(header: &TransferHeader, payload: &[u8]) -> CanId {
    let mut bits: u32 = u32::from(u8::from(header.priority)) << OFFSET_PRIORITY;

    match &header.kind {
        TransferKindHeader::Message(message_header) => {
            let source = if message_header.anonymous {
                make_pseudo_id(payload)
            } else {
                header.source
            };
            bits |= u32::from(u8::from(source));
            bits |= u32::from(u16::from(message_header.subject)) << OFFSET_SUBJECT_ID;
            if message_header.anonymous {
                bits |= FLAG_ANONYMOUS_MESSAGE;
            }
        }
        TransferKindHeader::Request(service_header) => {
            bits |= u32::from(u8::from(header.source));
            bits |= service_session_bits(service_header) | FLAG_REQUEST_NOT_RESPONSE;
        }
        TransferKindHeader::Response(service_header) => {
            bits |= u32::from(u8::from(header.source));
            bits |= service_session_bits(service_header);
        }
    }

    CanId::try_from(bits).expect("Bug: Generated CAN ID does not fit into 29 bits")
}

/// Encodes the service ID, destination node ID, and service flag
fn service_session_bits(header: &ServiceHeader) -> u32 {
    (u32::from(u16::from(header.service)) << OFFSET_SERVICE_ID)
        | (u32::from(u8::from(header.destination)) << OFFSET_DST_NODE_ID)
        | FLAG_SERVICE_NOT_MESSAGE
}

/// Generates the source pseudo-ID of an anonymous transfer from its payload
fn make_pseudo_id(payload: &[u8]) -> NodeId {
    let mut crc = TransferCrc::new();
    crc.add_bytes(payload);
    NodeId::from_truncating(crc.get() as u8)
}
