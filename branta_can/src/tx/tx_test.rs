use core::convert::TryFrom;

use branta_core::transfer::{
    MessageHeader, ServiceHeader, Transfer, TransferHeader, TransferKindHeader,
};
use branta_core::{NodeId, Priority, ServiceId, SubjectId, TransferId};

use crate::crc::TransferCrc;
use crate::data::Frame;
use crate::error::{OutOfMemoryError, TransmitError};
use crate::queue::{FrameQueue, FrameQueueSource, FrameSink};
use crate::tx::Transmitter;
use crate::Mtu;

fn message_transfer(
    source: u8,
    priority: Priority,
    subject: u16,
    transfer_id: u8,
    payload: &[u8],
) -> Transfer<&[u8], u64> {
    Transfer {
        timestamp: 0,
        header: TransferHeader {
            source: NodeId::try_from(source).unwrap(),
            priority,
            kind: TransferKindHeader::Message(MessageHeader {
                anonymous: false,
                subject: SubjectId::try_from(subject).unwrap(),
            }),
        },
        transfer_id: TransferId::try_from(transfer_id).unwrap(),
        payload,
    }
}

#[test]
fn single_frame_message() {
    let mut tx = Transmitter::new(Mtu::Can8, FrameQueue::new());
    tx.push(message_transfer(42, Priority::Nominal, 7168, 1, &[0x10, 0x20, 0x30]))
        .unwrap();
    assert_eq!(tx.transfer_count(), 1);

    let queue = tx.frame_queue_mut();
    let frame = queue.pop_frame().unwrap();
    assert_eq!(u32::from(frame.id()), 0x101c_002a);
    // No padding needed; the tail byte has start, end, and toggle set
    assert_eq!(frame.data(), &[0x10, 0x20, 0x30, 0xe1]);
    assert!(queue.pop_frame().is_none());
}

#[test]
fn single_frame_fills_classic_frame() {
    let mut tx = Transmitter::new(Mtu::Can8, FrameQueue::new());
    tx.push(message_transfer(9, Priority::Nominal, 30, 0, &[1, 2, 3, 4, 5, 6, 7]))
        .unwrap();
    let frame = tx.frame_queue_mut().pop_frame().unwrap();
    assert_eq!(frame.data(), &[1, 2, 3, 4, 5, 6, 7, 0xe0]);
}

#[cfg(feature = "can-fd")]
#[test]
fn single_frame_padded_to_valid_length() {
    let mut tx = Transmitter::new(Mtu::CanFd64, FrameQueue::new());
    // 9 payload bytes and a tail byte round up to the next valid length, 12
    tx.push(message_transfer(9, Priority::Nominal, 30, 0, &[0x11; 9]))
        .unwrap();
    let frame = tx.frame_queue_mut().pop_frame().unwrap();
    assert_eq!(frame.data().len(), 12);
    assert!(frame.data()[..9].iter().all(|&byte| byte == 0x11));
    assert_eq!(&frame.data()[9..], &[0, 0, 0xe0]);
}

#[test]
fn empty_payload_is_one_tail_byte() {
    let mut tx = Transmitter::new(Mtu::Can8, FrameQueue::new());
    tx.push(message_transfer(5, Priority::Low, 10, 4, &[])).unwrap();
    let frame = tx.frame_queue_mut().pop_frame().unwrap();
    assert_eq!(frame.data(), &[0xe4]);
}

#[test]
fn anonymous_single_frame_message() {
    let payload = [0xaa, 0xbb];
    let mut expected_pseudo_id = TransferCrc::new();
    expected_pseudo_id.add_bytes(&payload);
    let expected_pseudo_id = u32::from(expected_pseudo_id.get()) & 0x7f;

    let transfer: Transfer<&[u8], u64> = Transfer {
        timestamp: 0,
        header: TransferHeader {
            // The source field is ignored for anonymous transfers
            source: NodeId::try_from(0).unwrap(),
            priority: Priority::Exceptional,
            kind: TransferKindHeader::Message(MessageHeader {
                anonymous: true,
                subject: SubjectId::try_from(100).unwrap(),
            }),
        },
        transfer_id: TransferId::try_from(0).unwrap(),
        payload: &payload,
    };
    let mut tx = Transmitter::new(Mtu::Can8, FrameQueue::new());
    tx.push(transfer).unwrap();

    let frame = tx.frame_queue_mut().pop_frame().unwrap();
    let id_bits = u32::from(frame.id());
    // Anonymous flag set, priority 0, subject 100, payload-derived source
    assert_eq!(id_bits, (1 << 24) | (100 << 8) | expected_pseudo_id);
    assert_eq!(frame.data(), &[0xaa, 0xbb, 0xe0]);
}

#[test]
fn anonymous_multi_frame_rejected() {
    let payload = [0u8; 8];
    let transfer: Transfer<&[u8], u64> = Transfer {
        timestamp: 0,
        header: TransferHeader {
            source: NodeId::try_from(0).unwrap(),
            priority: Priority::Nominal,
            kind: TransferKindHeader::Message(MessageHeader {
                anonymous: true,
                subject: SubjectId::try_from(100).unwrap(),
            }),
        },
        transfer_id: TransferId::try_from(0).unwrap(),
        payload: &payload,
    };
    let mut tx = Transmitter::new(Mtu::Can8, FrameQueue::new());
    assert_eq!(tx.push(transfer), Err(TransmitError::AnonymousMultiFrame));
    assert_eq!(tx.error_count(), 1);
    assert!(tx.frame_queue().is_empty());
}

#[cfg(feature = "can-fd")]
#[test]
fn multi_frame_service_request() {
    let payload = [0x5a; 100];
    let transfer: Transfer<&[u8], u64> = Transfer {
        timestamp: 0,
        header: TransferHeader {
            source: NodeId::try_from(1).unwrap(),
            priority: Priority::Fast,
            kind: TransferKindHeader::Request(ServiceHeader {
                service: ServiceId::try_from(5).unwrap(),
                destination: NodeId::try_from(10).unwrap(),
            }),
        },
        transfer_id: TransferId::try_from(3).unwrap(),
        payload: &payload,
    };
    let mut tx = Transmitter::new(Mtu::CanFd64, FrameQueue::new());
    tx.push(transfer).unwrap();

    let expected_id =
        (2 << 26) | (1 << 25) | (1 << 24) | (5 << 14) | (10 << 7) | 1;

    let queue = tx.frame_queue_mut();
    let first = queue.pop_frame().unwrap();
    assert_eq!(u32::from(first.id()), expected_id);
    assert_eq!(first.data().len(), 64);
    assert!(first.data()[..63].iter().all(|&byte| byte == 0x5a));
    // Start of transfer, toggle 1, transfer ID 3
    assert_eq!(first.data()[63], 0x80 | 0x20 | 3);

    // Second frame: 37 payload bytes, 8 padding bytes, the CRC of the payload
    // and padding, and the tail byte, for 48 bytes total
    let second = queue.pop_frame().unwrap();
    assert_eq!(u32::from(second.id()), expected_id);
    assert_eq!(second.data().len(), 48);
    assert!(second.data()[..37].iter().all(|&byte| byte == 0x5a));
    assert!(second.data()[37..45].iter().all(|&byte| byte == 0));
    let mut crc = TransferCrc::new();
    crc.add_bytes(&payload);
    crc.add_bytes(&[0; 8]);
    assert_eq!(second.data()[45], (crc.get() >> 8) as u8);
    assert_eq!(second.data()[46], crc.get() as u8);
    // End of transfer, toggle 0, transfer ID 3
    assert_eq!(second.data()[47], 0x40 | 3);

    assert!(queue.pop_frame().is_none());
}

#[test]
fn multi_frame_crc_straddles_frames() {
    // 13 payload bytes over classic CAN: 7 + 6 leave exactly one byte of the
    // CRC for a third frame
    let payload: [u8; 13] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];
    let mut tx = Transmitter::new(Mtu::Can8, FrameQueue::new());
    tx.push(message_transfer(7, Priority::Nominal, 20, 0, &payload))
        .unwrap();

    let mut crc = TransferCrc::new();
    crc.add_bytes(&payload);
    let crc = crc.get();

    let queue = tx.frame_queue_mut();
    let first = queue.pop_frame().unwrap();
    assert_eq!(first.data(), &[1, 2, 3, 4, 5, 6, 7, 0x80 | 0x20]);
    let second = queue.pop_frame().unwrap();
    assert_eq!(
        second.data(),
        &[8, 9, 10, 11, 12, 13, (crc >> 8) as u8, 0x00]
    );
    let third = queue.pop_frame().unwrap();
    assert_eq!(third.data(), &[crc as u8, 0x40 | 0x20]);
    assert!(queue.pop_frame().is_none());
}

#[test]
fn frames_ordered_by_priority() {
    let mut tx = Transmitter::new(Mtu::Can8, FrameQueue::new());
    tx.push(message_transfer(3, Priority::Low, 20, 0, &[1])).unwrap();
    tx.push(message_transfer(3, Priority::Exceptional, 20, 0, &[2]))
        .unwrap();
    tx.push(message_transfer(3, Priority::Low, 20, 1, &[3])).unwrap();

    // The higher-priority transfer jumps the queue; equal IDs stay in
    // insertion order
    let queue = tx.frame_queue_mut();
    assert_eq!(queue.pop_frame().unwrap().data()[0], 2);
    assert_eq!(queue.pop_frame().unwrap().data()[0], 1);
    assert_eq!(queue.pop_frame().unwrap().data()[0], 3);
}

/// A frame sink with no room at all
struct RejectingSink {
    frames_accepted: usize,
}

impl FrameSink<u64> for RejectingSink {
    fn try_reserve(&mut self, _additional: usize) -> Result<(), OutOfMemoryError> {
        Err(OutOfMemoryError)
    }
    fn push_frame(&mut self, _frame: Frame<u64>) -> Result<(), OutOfMemoryError> {
        self.frames_accepted += 1;
        Ok(())
    }
}

#[test]
fn allocation_failure_leaves_queue_unchanged() {
    let mut tx = Transmitter::new(
        Mtu::Can8,
        RejectingSink {
            frames_accepted: 0,
        },
    );
    // Three frames on classic CAN
    let payload = [0u8; 13];
    let result = tx.push(message_transfer(1, Priority::Nominal, 6, 0, &payload));
    assert_eq!(result, Err(TransmitError::Memory(OutOfMemoryError)));
    assert_eq!(tx.error_count(), 1);
    assert_eq!(tx.frame_queue().frames_accepted, 0);
}
