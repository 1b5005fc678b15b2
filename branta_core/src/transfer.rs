//! Transfer definitions
//!
//! A transfer is the unit of data exchanged by applications. It crosses the
//! transport layer boundary in both directions: outgoing transfers are split
//! into frames, and incoming frames are reassembled into transfers.

use crate::{NodeId, PortId, Priority, ServiceId, SubjectId, TransferId};

/// The roles a transfer can have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferKind {
    /// A message broadcast on a subject
    Message,
    /// A request sent to a specific node
    Request,
    /// A response sent back to the node that made the request
    Response,
}

/// Header fields specific to message transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MessageHeader {
    /// True if the transfer was (or will be) sent by a node with no ID
    ///
    /// The source of an anonymous transfer is a pseudo-ID derived from the
    /// payload, not a real node ID.
    pub anonymous: bool,
    /// The subject this message is published on
    pub subject: SubjectId,
}

/// Header fields specific to service transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceHeader {
    /// The service being invoked or answered
    pub service: ServiceId,
    /// The node this request or response is addressed to
    pub destination: NodeId,
}

/// The message, request, or response fields of a transfer header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferKindHeader {
    Message(MessageHeader),
    Request(ServiceHeader),
    Response(ServiceHeader),
}

impl TransferKindHeader {
    /// Returns the kind of this transfer
    pub fn kind(&self) -> TransferKind {
        match self {
            TransferKindHeader::Message(_) => TransferKind::Message,
            TransferKindHeader::Request(_) => TransferKind::Request,
            TransferKindHeader::Response(_) => TransferKind::Response,
        }
    }

    /// Returns the subject or service ID
    pub fn port_id(&self) -> PortId {
        match self {
            TransferKindHeader::Message(header) => header.subject.into(),
            TransferKindHeader::Request(header) => header.service.into(),
            TransferKindHeader::Response(header) => header.service.into(),
        }
    }

    /// Returns the service header, if this is a request or response
    pub fn service_header(&self) -> Option<&ServiceHeader> {
        match self {
            TransferKindHeader::Message(_) => None,
            TransferKindHeader::Request(header) => Some(header),
            TransferKindHeader::Response(header) => Some(header),
        }
    }
}

/// The header of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferHeader {
    /// The node that sent this transfer
    ///
    /// For an anonymous message this is the pseudo-ID carried on the wire.
    /// When transmitting an anonymous message the field is ignored and the
    /// pseudo-ID is derived from the payload instead.
    pub source: NodeId,
    /// The priority of this transfer
    pub priority: Priority,
    /// Kind-specific fields
    pub kind: TransferKindHeader,
}

impl TransferHeader {
    /// Returns true if this is an anonymous message transfer
    pub fn is_anonymous(&self) -> bool {
        matches!(
            self.kind,
            TransferKindHeader::Message(MessageHeader {
                anonymous: true,
                ..
            })
        )
    }
}

/// A transfer
///
/// On transmission, the timestamp is the deadline copied into every queued
/// frame; frames whose deadline has passed should be discarded by the
/// application instead of being sent. On reception, the timestamp is the time
/// the first frame of the transfer arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer<P, I> {
    /// The deadline (transmission) or first-frame time (reception)
    pub timestamp: I,
    /// The transfer header
    pub header: TransferHeader,
    /// The ID of this transfer, modulo 32
    pub transfer_id: TransferId,
    /// The payload, with no CRC or tail bytes
    ///
    /// A received multi-frame transfer whose length did not land on a frame
    /// size boundary ends with the zero padding bytes of its last frame.
    pub payload: P,
}
