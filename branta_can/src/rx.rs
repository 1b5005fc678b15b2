//!
//! UAVCAN reception
//!

mod buildup;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::convert::TryFrom;
use core::fmt;

use defmt_or_log::{debug, warn};
use fallible_collections::{FallibleBox, FallibleVec};

use crate::data::{CanId, Frame, TailByte};
use crate::error::OutOfMemoryError;
use crate::rx::buildup::Buildup;
use branta_core::time::Instant;
use branta_core::transfer::{
    MessageHeader, ServiceHeader, Transfer, TransferHeader, TransferKind, TransferKindHeader,
};
use branta_core::{NodeId, PortId, Priority, ServiceId, SubjectId, TransferId};

/// One session per node ID
const RX_SESSIONS_PER_SUBSCRIPTION: usize = NodeId::MAX.to_u8() as usize + 1;

/// Room reserved in reassembly buffers for the transfer CRC
const CRC_SIZE_BYTES: usize = 2;

/// Transfer subscription state. The application can register its interest in a
/// particular kind of data exchanged over the bus by creating such
/// subscription objects. Frames that carry data for which there is no active
/// subscription will be silently dropped by the library.
struct Subscription<I: Instant> {
    /// A session for each node ID
    sessions: [Option<Box<Session<I>>>; RX_SESSIONS_PER_SUBSCRIPTION],
    /// Maximum time between the first frame of a transfer and any frame that
    /// continues it
    timeout: I::Duration,
    /// Maximum number of payload bytes delivered to the application; longer
    /// transfers are truncated
    payload_size_max: usize,
    /// Subject or service ID that this subscription is about
    port_id: PortId,
}

impl<I: Instant> fmt::Debug for Subscription<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("sessions", &DebugSessions(&self.sessions))
            .field("timeout", &self.timeout)
            .field("payload_size_max", &self.payload_size_max)
            .field("port_id", &self.port_id)
            .finish()
    }
}

/// A debug adapter for the session list
struct DebugSessions<'s, I>(&'s [Option<Box<Session<I>>>; RX_SESSIONS_PER_SUBSCRIPTION]);

impl<I: Instant> fmt::Debug for DebugSessions<'_, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display as a set, showing only the non-empty entries
        f.debug_set()
            .entries(self.0.iter().flat_map(Option::as_deref))
            .finish()
    }
}

impl<I: Instant> Subscription<I> {
    /// Creates a subscription
    pub fn new(timeout: I::Duration, payload_size_max: usize, port_id: PortId) -> Self {
        Subscription {
            sessions: init_rx_sessions(),
            timeout,
            payload_size_max,
            port_id,
        }
    }

    /// Returns a reference to the active session for the provided node ID
    pub fn session_mut(&mut self, node: NodeId) -> Option<&mut Session<I>> {
        self.sessions[usize::from(node)].as_deref_mut()
    }

    /// Creates a session, replacing any existing session for the same node,
    /// and returns a reference to it
    ///
    /// Returns an error if memory allocation fails, leaving the slot empty.
    pub fn create_session(
        &mut self,
        node: NodeId,
        transfer_timestamp: I,
        transfer_id: TransferId,
        iface_index: u8,
    ) -> Result<&mut Session<I>, OutOfMemoryError> {
        let buffer_limit = self.payload_size_max + CRC_SIZE_BYTES;
        let slot = &mut self.sessions[usize::from(node)];
        *slot = None;
        *slot = Some(FallibleBox::try_new(Session::new(
            transfer_timestamp,
            transfer_id,
            iface_index,
            buffer_limit,
        ))?);
        Ok(slot.as_deref_mut().expect("Bug: Session was just created"))
    }

    /// Destroys the session for the provided node
    pub fn destroy_session(&mut self, node: NodeId) {
        self.sessions[usize::from(node)] = None;
    }
}

/// A receive session, associated with a particular port ID and source node
///
/// A session exists while a transfer from its source is in progress, and
/// afterwards until the transfer-ID timeout expires, so that duplicates of
/// the most recent transfer (for example from a redundant interface) can be
/// recognized and dropped.
#[derive(Debug)]
struct Session<I> {
    /// Timestamp of the first frame of the current or most recent transfer
    transfer_timestamp: I,
    /// ID of the current or most recent transfer
    transfer_id: TransferId,
    /// The interface the current transfer is arriving on
    iface_index: u8,
    /// Reassembly in progress, or None while idle between transfers
    buildup: Option<Buildup>,
}

impl<I> Session<I> {
    pub fn new(
        transfer_timestamp: I,
        transfer_id: TransferId,
        iface_index: u8,
        buffer_limit: usize,
    ) -> Self {
        Session {
            transfer_timestamp,
            transfer_id,
            iface_index,
            buildup: Some(Buildup::new(buffer_limit)),
        }
    }

    /// Begins reassembling a new transfer, discarding any unfinished one
    pub fn restart(
        &mut self,
        transfer_timestamp: I,
        transfer_id: TransferId,
        iface_index: u8,
        buffer_limit: usize,
    ) {
        self.transfer_timestamp = transfer_timestamp;
        self.transfer_id = transfer_id;
        self.iface_index = iface_index;
        self.buildup = Some(Buildup::new(buffer_limit));
    }
}

/// Handles subscriptions and assembles incoming frames into transfers
#[derive(Debug)]
pub struct Receiver<I: Instant> {
    /// Subscriptions for messages
    subscriptions_message: Vec<Subscription<I>>,
    /// Subscriptions for service responses
    subscriptions_response: Vec<Subscription<I>>,
    /// Subscriptions for service requests
    subscriptions_request: Vec<Subscription<I>>,
    /// The ID of this node, or None if this node is anonymous
    ///
    /// An anonymous node can receive messages but not service transfers.
    id: Option<NodeId>,
    /// Number of transfers successfully received
    transfer_count: u64,
    /// Number of transfers that could not be received
    ///
    /// Errors include failure to allocate memory (when handling incoming
    /// frames only), missing frames, and malformed frames.
    error_count: u64,
}

impl<I: Instant> Receiver<I> {
    /// Creates a receiver
    ///
    /// id: The ID of this node, used to filter incoming service requests and
    /// responses. Pass None for a node that has not been assigned an ID.
    pub fn new(id: Option<NodeId>) -> Self {
        Receiver {
            subscriptions_message: Vec::new(),
            subscriptions_response: Vec::new(),
            subscriptions_request: Vec::new(),
            id,
            transfer_count: 0,
            error_count: 0,
        }
    }

    /// Returns the ID of this node
    pub fn id(&self) -> Option<NodeId> {
        self.id
    }

    /// Changes the ID of this node
    ///
    /// This takes effect on the next call to accept().
    pub fn set_id(&mut self, id: Option<NodeId>) {
        self.id = id;
    }

    /// Handles an incoming CAN or CAN FD frame
    ///
    /// If this frame completes a transfer, the transfer is returned. The
    /// returned transfer owns its payload buffer, which contains no CRC or
    /// tail bytes. The zero padding of the last frame of a multi-frame
    /// transfer is delivered as part of the payload: padding is covered by
    /// the transfer CRC but cannot be told apart from trailing zero payload
    /// bytes, so it is left for the payload consumer to ignore.
    ///
    /// This function returns an error only if memory allocation fails. Other
    /// unexpected situations, such as duplicate or malformed frames, cause the
    /// frame to be ignored and the error counter to be incremented. Valid
    /// frames on ports that this receiver is not subscribed to are silently
    /// ignored.
    pub fn accept(&mut self, frame: Frame<I>) -> Result<Option<Transfer<Vec<u8>, I>>, OutOfMemoryError> {
        self.accept_on_interface(frame, 0)
    }

    /// Handles an incoming frame from one of several redundant interfaces
    ///
    /// While a transfer is being reassembled, frames from interfaces other
    /// than the one it started on are ignored. Once the session times out,
    /// any interface may start a transfer.
    pub fn accept_on_interface(
        &mut self,
        frame: Frame<I>,
        iface_index: u8,
    ) -> Result<Option<Transfer<Vec<u8>, I>>, OutOfMemoryError> {
        // The current time is equal to or greater than the frame timestamp.
        // Use that timestamp to clean up expired sessions.
        self.clean_expired_sessions(frame.timestamp());

        // Part 1: basic frame checks
        let (header, tail) = match Self::frame_sanity_check(self.id, &frame) {
            Some(data) => data,
            None => {
                debug!("Frame failed sanity checks, ignoring");
                self.increment_error_count();
                return Ok(None);
            }
        };

        // Part 2: check for a subscription for this subject or service
        let subscriptions = self.subscriptions_for_kind(header.kind.kind());
        let subscription = match subscriptions
            .iter_mut()
            .find(|sub| sub.port_id == header.kind.port_id())
        {
            Some(subscription) => subscription,
            None => {
                debug!("Frame does not match any subscription, ignoring");
                return Ok(None);
            }
        };

        // Get everything needed from the subscription before borrowing it
        // again to get the session
        let payload_size_max = subscription.payload_size_max;
        let transfer_timeout = subscription.timeout.clone();
        let buffer_limit = payload_size_max + CRC_SIZE_BYTES;

        if header.is_anonymous() {
            // Anonymous transfers are stateless; deliver straight from the
            // frame. The sanity check has already required single-frame.
            let body = &frame.data()[..frame.data().len() - 1];
            let store = body.len().min(payload_size_max);
            let mut payload: Vec<u8> = match FallibleVec::try_with_capacity(store) {
                Ok(payload) => payload,
                Err(_) => {
                    self.increment_error_count();
                    return Err(OutOfMemoryError);
                }
            };
            payload.extend_from_slice(&body[..store]);
            let transfer = Transfer {
                timestamp: frame.timestamp(),
                header,
                transfer_id: tail.transfer_id,
                payload,
            };
            self.increment_transfer_count();
            return Ok(Some(transfer));
        }

        let source = header.source;

        // Part 3: find or create the session for this source node. A session
        // is created only for a start-of-transfer frame; without one the rest
        // of the transfer could never be reassembled anyway.
        if subscription.session_mut(source).is_none() {
            if !tail.start {
                debug!("Frame is not the start of a transfer and no session exists, ignoring");
                return Ok(None);
            }
            debug!("Creating a new session");
            match subscription.create_session(
                source,
                frame.timestamp(),
                tail.transfer_id,
                iface_index,
            ) {
                Ok(_) => {}
                Err(e) => {
                    self.increment_error_count();
                    return Err(e);
                }
            }
        }
        let session = subscription
            .session_mut(source)
            .expect("Bug: Session was just checked or created");

        // Part 4: advance the session state machine
        let timestamp = frame.timestamp();
        let timed_out = timestamp.duration_since(&session.transfer_timestamp) > transfer_timeout;

        match session.buildup.as_ref().map(Buildup::expected_toggle) {
            None => {
                // Idle: only a start-of-transfer frame that is not a duplicate
                // of the most recently accepted transfer begins reassembly
                if !tail.start {
                    return Ok(None);
                }
                if !timed_out && tail.transfer_id == session.transfer_id {
                    debug!("Duplicate transfer, ignoring");
                    return Ok(None);
                }
                session.restart(timestamp, tail.transfer_id, iface_index, buffer_limit);
            }
            Some(expected_toggle) => {
                // Reassembling: frames from other interfaces are duplicates
                // until the session times out
                if session.iface_index != iface_index && !timed_out {
                    debug!("Frame from a different interface mid-transfer, ignoring");
                    return Ok(None);
                }
                if timed_out
                    || tail.transfer_id != session.transfer_id
                    || tail.toggle != expected_toggle
                {
                    if tail.start {
                        // A new transfer has begun; drop the unfinished one
                        session.restart(timestamp, tail.transfer_id, iface_index, buffer_limit);
                    } else {
                        debug!("Transfer-ID or toggle mismatch, dropping transfer");
                        session.buildup = None;
                        self.increment_error_count();
                        return Ok(None);
                    }
                }
            }
        }

        // Part 5: the frame belongs to the session's current transfer
        let buildup = session
            .buildup
            .as_mut()
            .expect("Bug: Session is not reassembling");
        let body = &frame.data()[..frame.data().len() - 1];
        if buildup.push(body).is_err() {
            // The transfer is lost; release the slot so a later transfer can
            // allocate again
            subscription.destroy_session(source);
            self.increment_error_count();
            return Err(OutOfMemoryError);
        }
        if !tail.end {
            // Processed, transfer not yet done. Keep the session around.
            return Ok(None);
        }

        // Part 6: end of transfer, verify and deliver
        let buildup = session
            .buildup
            .take()
            .expect("Bug: Session is not reassembling");
        let multi_frame = buildup.frames() > 1;
        if multi_frame && buildup.crc_value() != 0 {
            warn!("Transfer CRC mismatch, discarding transfer");
            self.increment_error_count();
            return Ok(None);
        }
        let crc_bytes = if multi_frame { CRC_SIZE_BYTES } else { 0 };
        let payload_length = buildup
            .total_length()
            .saturating_sub(crc_bytes)
            .min(payload_size_max);
        let mut payload = buildup.into_payload();
        payload.truncate(payload_length);

        let transfer = Transfer {
            // The timestamp of the first frame
            timestamp: session.transfer_timestamp,
            header,
            transfer_id: session.transfer_id,
            payload,
        };
        self.increment_transfer_count();
        Ok(Some(transfer))
    }

    /// Runs basic sanity checks on an incoming frame. Returns the header and
    /// tail byte if the frame is valid.
    fn frame_sanity_check(
        local_id: Option<NodeId>,
        frame: &Frame<I>,
    ) -> Option<(TransferHeader, TailByte)> {
        // Frame must have a tail byte to be valid
        let tail = TailByte::parse(*frame.data().last()?);

        let header = parse_can_id(frame.id()).ok()?;

        if header
            .kind
            .service_header()
            .map(|service_header| Some(service_header.destination) != local_id)
            .unwrap_or(false)
        {
            // This frame is a service request or response going to some other
            // node (or this node has no ID and cannot take part in services)
            return None;
        }

        // Protocol version check: the first frame must have the toggle set
        if tail.start && !tail.toggle {
            return None;
        }

        if header.is_anonymous() && !(tail.start && tail.end) {
            // Anonymous message transfers must always fit into one frame
            return None;
        }

        Some((header, tail))
    }

    /// Subscribes to messages on a subject
    ///
    /// This will enable incoming transfers from all nodes on the specified
    /// subject ID.
    ///
    /// subject: The subject ID to subscribe to
    ///
    /// payload_size_max: The maximum number of payload bytes expected on this
    /// subject (longer transfers will be truncated)
    ///
    /// timeout: The maximum time between the first and last frames in a
    /// transfer (transfers that do not finish within this time will be
    /// dropped)
    ///
    /// If all transfers fit into one frame, the timeout has no meaning and
    /// may be zero.
    ///
    /// Returns true if this is a new subscription, or false if an existing
    /// subscription for the same subject was replaced (dropping its sessions).
    pub fn subscribe_message(
        &mut self,
        subject: SubjectId,
        payload_size_max: usize,
        timeout: I::Duration,
    ) -> Result<bool, OutOfMemoryError> {
        self.subscribe(
            TransferKind::Message,
            PortId::from(subject),
            payload_size_max,
            timeout,
        )
    }

    /// Unsubscribes from messages on a subject
    ///
    /// Returns true if a subscription was removed. All of its reassembly
    /// sessions are released.
    pub fn unsubscribe_message(&mut self, subject: SubjectId) -> bool {
        self.unsubscribe(TransferKind::Message, PortId::from(subject))
    }

    /// Subscribes to requests for a service
    ///
    /// The parameters and return value are as for subscribe_message.
    pub fn subscribe_request(
        &mut self,
        service: ServiceId,
        payload_size_max: usize,
        timeout: I::Duration,
    ) -> Result<bool, OutOfMemoryError> {
        self.subscribe(
            TransferKind::Request,
            PortId::from(service),
            payload_size_max,
            timeout,
        )
    }

    /// Unsubscribes from requests for a service
    pub fn unsubscribe_request(&mut self, service: ServiceId) -> bool {
        self.unsubscribe(TransferKind::Request, PortId::from(service))
    }

    /// Subscribes to responses for a service
    ///
    /// The parameters and return value are as for subscribe_message.
    pub fn subscribe_response(
        &mut self,
        service: ServiceId,
        payload_size_max: usize,
        timeout: I::Duration,
    ) -> Result<bool, OutOfMemoryError> {
        self.subscribe(
            TransferKind::Response,
            PortId::from(service),
            payload_size_max,
            timeout,
        )
    }

    /// Unsubscribes from responses for a service
    pub fn unsubscribe_response(&mut self, service: ServiceId) -> bool {
        self.unsubscribe(TransferKind::Response, PortId::from(service))
    }

    fn subscribe(
        &mut self,
        kind: TransferKind,
        port_id: PortId,
        payload_size_max: usize,
        timeout: I::Duration,
    ) -> Result<bool, OutOfMemoryError> {
        // Remove any existing subscription first. This is critical because
        // the new payload size limit may differ from the old one, and any
        // existing reassembly buffers were sized for the old limit.
        let replaced = self.unsubscribe(kind, port_id);

        let new_subscription = Subscription::new(timeout, payload_size_max, port_id);

        // Add this subscription to the list for this transfer kind.
        // Logical safety: if a subscription previously existed and was
        // removed, this Vec must have space for it. Therefore, this function
        // cannot remove a subscription and fail to add its replacement.
        let subscriptions = self.subscriptions_for_kind(kind);
        FallibleVec::try_push(subscriptions, new_subscription)?;
        Ok(!replaced)
    }

    fn unsubscribe(&mut self, kind: TransferKind, port_id: PortId) -> bool {
        let subscriptions = self.subscriptions_for_kind(kind);
        let length_before = subscriptions.len();
        subscriptions.retain(|sub| sub.port_id != port_id);
        subscriptions.len() != length_before
    }

    fn subscriptions_for_kind(&mut self, kind: TransferKind) -> &mut Vec<Subscription<I>> {
        match kind {
            TransferKind::Message => &mut self.subscriptions_message,
            TransferKind::Response => &mut self.subscriptions_response,
            TransferKind::Request => &mut self.subscriptions_request,
        }
    }

    /// Returns the number of transfers successfully received
    pub fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    /// Returns the number of transfers that could not be received correctly
    ///
    /// Errors include failure to allocate memory (when handling incoming
    /// frames only), missing frames, and malformed frames.
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    fn increment_transfer_count(&mut self) {
        self.transfer_count = self.transfer_count.wrapping_add(1)
    }

    fn increment_error_count(&mut self) {
        self.error_count = self.error_count.wrapping_add(1)
    }

    fn clean_expired_sessions(&mut self, now: I) {
        clean_sessions_from_subscriptions(&mut self.subscriptions_message, &now);
        clean_sessions_from_subscriptions(&mut self.subscriptions_request, &now);
        clean_sessions_from_subscriptions(&mut self.subscriptions_response, &now);
    }
}

fn clean_sessions_from_subscriptions<I: Instant>(
    subscriptions: &mut Vec<Subscription<I>>,
    now: &I,
) {
    for subscription in subscriptions {
        for slot in subscription.sessions.iter_mut() {
            if let Some(session) = slot.as_deref_mut() {
                let time_since_first_frame = now.duration_since(&session.transfer_timestamp);
                if time_since_first_frame > subscription.timeout {
                    // This session has timed out, delete it.
                    *slot = None;
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum CanIdParseError {
    /// Reserved bit 23 was set
    Bit23Set,
    /// On a message header, reserved bit 7 was set
    Bit7Set,
}

fn parse_can_id(id: CanId) -> core::result::Result<TransferHeader, CanIdParseError> {
    let bits = u32::from(id);

    if bits.bit_set(23) {
        return Err(CanIdParseError::Bit23Set);
    }
    // Ignore bits 22 and 21

    let priority = Priority::try_from(bits.get_u8(26) & 0x7).expect("Bug: Invalid priority");
    let source_id = NodeId::try_from(bits.get_u8(0) & 0x7f).expect("Bug: Invalid source node ID");

    let header_kind = if bits.bit_set(25) {
        // Service
        let service_header = ServiceHeader {
            service: ServiceId::try_from(bits.get_u16(14) & 0x1ff)
                .expect("Bug: Invalid service ID"),
            destination: NodeId::try_from(bits.get_u8(7) & 0x7f)
                .expect("Bug: Invalid destination node ID"),
        };
        if bits.bit_set(24) {
            // Request
            TransferKindHeader::Request(service_header)
        } else {
            // Response
            TransferKindHeader::Response(service_header)
        }
    } else {
        // Message
        if bits.bit_set(7) {
            return Err(CanIdParseError::Bit7Set);
        }
        let message_header = MessageHeader {
            anonymous: bits.bit_set(24),
            // Subject ID is 13 bits, 0..=8191
            subject: SubjectId::try_from(bits.get_u16(8) & 0x1fff)
                .expect("Bug: Invalid subject ID"),
        };
        TransferKindHeader::Message(message_header)
    };

    Ok(TransferHeader {
        source: source_id,
        priority,
        kind: header_kind,
    })
}

/// Returns 128 Nones
fn init_rx_sessions<I>() -> [Option<Box<Session<I>>>; RX_SESSIONS_PER_SUBSCRIPTION] {
    [
        None, None, None, None, None, None, None, None, None, None, None, None, None, None, None,
        None, None, None, None, None, None, None, None, None, None, None, None, None, None, None,
        None, None, None, None, None, None, None, None, None, None, None, None, None, None, None,
        None, None, None, None, None, None, None, None, None, None, None, None, None, None, None,
        None, None, None, None, None, None, None, None, None, None, None, None, None, None, None,
        None, None, None, None, None, None, None, None, None, None, None, None, None, None, None,
        None, None, None, None, None, None, None, None, None, None, None, None, None, None, None,
        None, None, None, None, None, None, None, None, None, None, None, None, None, None, None,
        None, None, None, None, None, None, None, None,
    ]
}

/// Basic extension trait for extracting bits from a CAN ID
trait GetBits {
    fn bit_set(self, offset: u32) -> bool;
    fn get_u8(self, offset: u32) -> u8;
    fn get_u16(self, offset: u32) -> u16;
}

impl GetBits for u32 {
    fn bit_set(self, offset: u32) -> bool {
        ((self >> offset) & 1) == 1
    }
    fn get_u8(self, offset: u32) -> u8 {
        (self >> offset) as u8
    }
    fn get_u16(self, offset: u32) -> u16 {
        (self >> offset) as u16
    }
}
