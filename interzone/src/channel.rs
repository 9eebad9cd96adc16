//! Envelope channel manager
//!
//! Everything a framed transport needs above its byte stream: per-channel
//! monotonic sequence numbers, a pending-transmit registry that routes
//! replies back to their waiters, a receive pump that dispatches inbound
//! requests into the local service, per-operation timeouts, and the
//! cooperative close handshake (`CloseConnectionSend` /
//! `CloseConnectionReceived`) whose two independent bits —
//! `cancel_sent` and `peer_cancel_received` — establish symmetric
//! teardown. Pending waiters on a closing channel resolve with
//! `CallCancelled`; timed-out waiters resolve with `TransportError`.
//!
//! The [`WireLink`] byte duplex is deliberately minimal; the in-memory
//! pair built by [`memory_link_pair`] stands in for a socket in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::codec::Encoding;
use crate::error::{code_of, result_from_code, ErrorCode, RpcResult, OK};
use crate::protocol::{
    self, AddRefReceive, AddRefSend, CallReceive, CallSend, CloseConnectionReceived, CloseConnectionSend,
    EnvelopePayload, EnvelopePrefix, InitClientChannelResponse, InitClientChannelSend, MessageDirection, PostSend,
    ReleaseReceive, ReleaseSend, TryCastReceive, TryCastSend, WirePayload,
};
use crate::service::Service;
use crate::service_proxy::ProxyChannel;
use crate::transport::{BackChannel, BackChannelEntry, Marshaller};
use crate::types::{
    AddRefOptions, CallerChannelZone, CallerZone, DestinationChannelZone, DestinationZone, InterfaceDescriptor,
    InterfaceOrdinal, KnownDirectionZone, MethodId, ObjectId, PostOptions, ReleaseOptions, Zone,
};
use crate::version;

/// A frame-oriented byte duplex.
pub trait WireLink: Send + Sync {
    /// Queue one frame; fails with `TransportError` once the link closed.
    fn send_frame(&self, frame: Vec<u8>) -> RpcResult<()>;

    /// Wait up to `timeout` for a frame. `Ok(None)` means the wait timed
    /// out with the link still up.
    fn recv_frame(&self, timeout: Duration) -> RpcResult<Option<Vec<u8>>>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

struct PipeState {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
}

struct Pipe {
    state: Mutex<PipeState>,
    available: Condvar,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeState { frames: VecDeque::new(), closed: false }),
            available: Condvar::new(),
        })
    }

    fn push(&self, frame: Vec<u8>) -> RpcResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(ErrorCode::TransportError);
        }
        state.frames.push_back(frame);
        self.available.notify_one();
        Ok(())
    }

    fn pop(&self, timeout: Duration) -> RpcResult<Option<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Ok(Some(frame));
            }
            if state.closed {
                return Err(ErrorCode::TransportError);
            }
            let (next, wait) = self.available.wait_timeout(state, timeout).unwrap();
            state = next;
            if wait.timed_out() {
                if let Some(frame) = state.frames.pop_front() {
                    return Ok(Some(frame));
                }
                return if state.closed { Err(ErrorCode::TransportError) } else { Ok(None) };
            }
        }
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.available.notify_all();
    }
}

/// One endpoint of an in-memory frame duplex.
pub struct MemoryLink {
    outgoing: Arc<Pipe>,
    incoming: Arc<Pipe>,
}

/// Two connected in-memory endpoints.
pub fn memory_link_pair() -> (Arc<MemoryLink>, Arc<MemoryLink>) {
    let a_to_b = Pipe::new();
    let b_to_a = Pipe::new();
    let a = Arc::new(MemoryLink { outgoing: a_to_b.clone(), incoming: b_to_a.clone() });
    let b = Arc::new(MemoryLink { outgoing: b_to_a, incoming: a_to_b });
    (a, b)
}

impl std::fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLink").field("closed", &self.is_closed()).finish()
    }
}

impl WireLink for MemoryLink {
    fn send_frame(&self, frame: Vec<u8>) -> RpcResult<()> {
        self.outgoing.push(frame)
    }

    fn recv_frame(&self, timeout: Duration) -> RpcResult<Option<Vec<u8>>> {
        self.incoming.pop(timeout)
    }

    fn close(&self) {
        self.outgoing.close();
        self.incoming.close();
    }

    fn is_closed(&self) -> bool {
        self.incoming.state.lock().unwrap().closed
    }
}

enum SlotState {
    Waiting,
    Done(EnvelopePrefix, EnvelopePayload),
    Failed(ErrorCode),
}

struct PendingSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl PendingSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(SlotState::Waiting), ready: Condvar::new() })
    }

    fn resolve(&self, prefix: EnvelopePrefix, payload: EnvelopePayload) {
        *self.state.lock().unwrap() = SlotState::Done(prefix, payload);
        self.ready.notify_all();
    }

    fn fail(&self, err: ErrorCode) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, SlotState::Waiting) {
            *state = SlotState::Failed(err);
            self.ready.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> RpcResult<(EnvelopePrefix, EnvelopePayload)> {
        let mut state = self.state.lock().unwrap();
        loop {
            match std::mem::replace(&mut *state, SlotState::Waiting) {
                SlotState::Done(prefix, payload) => return Ok((prefix, payload)),
                SlotState::Failed(err) => return Err(err),
                SlotState::Waiting => {}
            }
            let (next, wait) = self.ready.wait_timeout(state, timeout).unwrap();
            state = next;
            if wait.timed_out() {
                match std::mem::replace(&mut *state, SlotState::Waiting) {
                    SlotState::Done(prefix, payload) => return Ok((prefix, payload)),
                    SlotState::Failed(err) => return Err(err),
                    SlotState::Waiting => return Err(ErrorCode::TransportError),
                }
            }
        }
    }
}

type InitHandler =
    dyn Fn(&Arc<ChannelManager>, InitClientChannelSend) -> InitClientChannelResponse + Send + Sync;

/// Channel state shared by the send side and the receive pump.
pub struct ChannelManager {
    link: Arc<dyn WireLink>,
    service: Arc<Service>,
    timeout: Duration,
    sequence_number: AtomicU64,
    pending_transmits: Mutex<HashMap<u64, Arc<PendingSlot>>>,
    // both frames of one message must leave back-to-back
    send_gate: Mutex<()>,
    cancel_sent: AtomicBool,
    peer_cancel_received: AtomicBool,
    stopped: AtomicBool,
    keep_alive: Mutex<Option<Arc<ChannelManager>>>,
    init_handler: Mutex<Option<Box<InitHandler>>>,
}

impl ChannelManager {
    pub fn new(link: Arc<dyn WireLink>, service: Arc<Service>, timeout: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            link,
            service,
            timeout,
            sequence_number: AtomicU64::new(0),
            pending_transmits: Mutex::new(HashMap::new()),
            send_gate: Mutex::new(()),
            cancel_sent: AtomicBool::new(false),
            peer_cancel_received: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            keep_alive: Mutex::new(None),
            init_handler: Mutex::new(None),
        });
        *manager.keep_alive.lock().unwrap() = Some(manager.clone());
        manager
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Install the acceptor-side handler for `InitClientChannelSend`.
    pub fn set_init_handler(
        &self,
        handler: impl Fn(&Arc<ChannelManager>, InitClientChannelSend) -> InitClientChannelResponse + Send + Sync + 'static,
    ) {
        *self.init_handler.lock().unwrap() = Some(Box::new(handler));
    }

    /// Spawn the receive pump.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        std::thread::Builder::new()
            .name(format!("interzone-pump-{}", self.service.zone_id()))
            .spawn(move || manager.pump_messages())
            .expect("spawning the channel pump");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn peer_cancel_received(&self) -> bool {
        self.peer_cancel_received.load(Ordering::Acquire)
    }

    fn send_message<T: WirePayload>(
        &self,
        protocol_version: u64,
        direction: MessageDirection,
        sequence_number: u64,
        payload: &T,
    ) -> RpcResult<()> {
        let envelope = protocol::encode_payload(protocol_version, payload)?;
        let payload_bytes = protocol::encode_payload_segment(&envelope)?;
        let prefix = EnvelopePrefix {
            version: protocol_version,
            direction,
            sequence_number,
            payload_size: payload_bytes.len() as u64,
        };
        let prefix_bytes = protocol::encode_prefix(&prefix)?;
        let _gate = self.send_gate.lock().unwrap();
        self.link.send_frame(prefix_bytes)?;
        self.link.send_frame(payload_bytes)
    }

    /// Send a request and wait for its reply payload.
    pub fn call_peer<S: WirePayload, R: WirePayload>(&self, protocol_version: u64, payload: &S) -> RpcResult<R> {
        let sequence_number = self.sequence_number.fetch_add(1, Ordering::AcqRel) + 1;
        let slot = PendingSlot::new();
        {
            let mut pending = self.pending_transmits.lock().unwrap();
            pending.insert(sequence_number, slot.clone());
        }
        if let Err(err) = self.send_message(protocol_version, MessageDirection::Send, sequence_number, payload) {
            self.pending_transmits.lock().unwrap().remove(&sequence_number);
            return Err(err);
        }
        let outcome = slot.wait(self.timeout);
        self.pending_transmits.lock().unwrap().remove(&sequence_number);
        let (prefix, envelope) = outcome?;
        protocol::decode_payload(prefix.version, &envelope)
    }

    /// Fire-and-forget message; sequence 0, no waiter.
    pub fn post_peer<S: WirePayload>(&self, protocol_version: u64, payload: &S) -> RpcResult<()> {
        self.send_message(protocol_version, MessageDirection::OneWay, 0, payload)
    }

    fn fail_all_pending(&self, err: ErrorCode) {
        let pending = std::mem::take(&mut *self.pending_transmits.lock().unwrap());
        for slot in pending.into_values() {
            slot.fail(err);
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.link.close();
        let keep_alive = self.keep_alive.lock().unwrap().take();
        drop(keep_alive);
    }

    /// Initiate (or join) the cooperative shutdown handshake.
    pub fn shutdown(&self) {
        if self.cancel_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.peer_cancel_received.load(Ordering::Acquire) {
            match self.call_peer::<CloseConnectionSend, CloseConnectionReceived>(
                version::current_version(),
                &CloseConnectionSend {},
            ) {
                Ok(CloseConnectionReceived {}) => {}
                Err(err) => log::debug!("close handshake ended early: {err}"),
            }
        }
        self.fail_all_pending(ErrorCode::CallCancelled);
        self.stop();
    }

    fn pump_messages(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            let prefix_frame = match self.link.recv_frame(self.timeout) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(_) => {
                    self.fail_all_pending(ErrorCode::CallCancelled);
                    break;
                }
            };
            let prefix = match protocol::decode_prefix(&prefix_frame) {
                Ok(prefix) => prefix,
                Err(err) => {
                    log::error!("malformed envelope prefix, closing channel: {err}");
                    self.fail_all_pending(ErrorCode::TransportError);
                    break;
                }
            };
            let payload_frame = match self.link.recv_frame(self.timeout) {
                Ok(Some(frame)) => frame,
                _ => {
                    log::error!("envelope payload missing, closing channel");
                    self.fail_all_pending(ErrorCode::TransportError);
                    break;
                }
            };
            if payload_frame.len() as u64 != prefix.payload_size {
                log::error!("envelope payload size mismatch, closing channel");
                self.fail_all_pending(ErrorCode::TransportError);
                break;
            }
            let envelope = match protocol::decode_payload_segment(&payload_frame) {
                Ok(envelope) => envelope,
                Err(err) => {
                    log::error!("malformed envelope payload, closing channel: {err}");
                    self.fail_all_pending(ErrorCode::TransportError);
                    break;
                }
            };

            match prefix.direction {
                MessageDirection::Receive => {
                    let slot = self.pending_transmits.lock().unwrap().get(&prefix.sequence_number).cloned();
                    match slot {
                        Some(slot) => slot.resolve(prefix, envelope),
                        None => log::warn!("reply for unknown sequence {}", prefix.sequence_number),
                    }
                }
                MessageDirection::Send => {
                    if protocol::payload_is::<CloseConnectionSend>(prefix.version, &envelope) {
                        self.peer_cancel_received.store(true, Ordering::Release);
                        let _ = self.send_message(
                            prefix.version,
                            MessageDirection::Receive,
                            prefix.sequence_number,
                            &CloseConnectionReceived {},
                        );
                        self.fail_all_pending(ErrorCode::CallCancelled);
                        self.stop();
                        break;
                    }
                    let manager = self.clone();
                    std::thread::spawn(move || manager.handle_request(prefix, envelope));
                }
                MessageDirection::OneWay => {
                    if let Err(err) = self.handle_one_way(prefix, envelope) {
                        log::warn!("one-way message dropped: {err}");
                    }
                }
            }
        }
        self.stop();
    }

    fn handle_one_way(&self, prefix: EnvelopePrefix, envelope: EnvelopePayload) -> RpcResult<()> {
        if protocol::payload_is::<PostSend>(prefix.version, &envelope) {
            let msg: PostSend = protocol::decode_payload(prefix.version, &envelope)?;
            self.service.post(
                prefix.version,
                msg.encoding,
                msg.tag,
                msg.caller_channel_zone_id,
                msg.caller_zone_id,
                msg.destination_zone_id,
                msg.object_id,
                msg.interface_id,
                msg.method_id,
                msg.options,
                &msg.payload,
                &[],
            );
            return Ok(());
        }
        Err(ErrorCode::InvalidData)
    }

    fn handle_request(self: Arc<Self>, prefix: EnvelopePrefix, envelope: EnvelopePayload) {
        let protocol_version = prefix.version;
        let sequence_number = prefix.sequence_number;
        let result: RpcResult<()> = if protocol::payload_is::<CallSend>(protocol_version, &envelope) {
            protocol::decode_payload::<CallSend>(protocol_version, &envelope).map(|msg| {
                let mut back_out = BackChannel::new();
                let outcome = self.service.send(
                    protocol_version,
                    msg.encoding,
                    msg.tag,
                    msg.caller_channel_zone_id,
                    msg.caller_zone_id,
                    msg.destination_zone_id,
                    msg.object_id,
                    msg.interface_id,
                    msg.method_id,
                    &msg.payload,
                    &[],
                    &mut back_out,
                );
                let reply = CallReceive {
                    err_code: code_of(&outcome),
                    payload: outcome.unwrap_or_default(),
                };
                self.reply(protocol_version, sequence_number, &reply);
            })
        } else if protocol::payload_is::<TryCastSend>(protocol_version, &envelope) {
            protocol::decode_payload::<TryCastSend>(protocol_version, &envelope).map(|msg| {
                let mut back_out = BackChannel::new();
                let outcome = self.service.try_cast(
                    protocol_version,
                    msg.destination_zone_id,
                    msg.object_id,
                    msg.interface_id,
                    &[],
                    &mut back_out,
                );
                self.reply(protocol_version, sequence_number, &TryCastReceive { err_code: code_of(&outcome) });
            })
        } else if protocol::payload_is::<AddRefSend>(protocol_version, &envelope) {
            protocol::decode_payload::<AddRefSend>(protocol_version, &envelope).map(|msg| {
                let mut back_out = BackChannel::new();
                let outcome = self.service.add_ref(
                    protocol_version,
                    msg.destination_channel_zone_id,
                    msg.destination_zone_id,
                    msg.object_id,
                    msg.caller_channel_zone_id,
                    msg.caller_zone_id,
                    msg.known_direction_zone_id,
                    msg.build_out_param_channel,
                    &[],
                    &mut back_out,
                );
                let reply = AddRefReceive {
                    ref_count: *outcome.as_ref().unwrap_or(&0),
                    err_code: code_of(&outcome),
                };
                self.reply(protocol_version, sequence_number, &reply);
            })
        } else if protocol::payload_is::<ReleaseSend>(protocol_version, &envelope) {
            protocol::decode_payload::<ReleaseSend>(protocol_version, &envelope).map(|msg| {
                let mut back_out = BackChannel::new();
                let outcome = self.service.release(
                    protocol_version,
                    msg.destination_zone_id,
                    msg.object_id,
                    msg.caller_zone_id,
                    msg.options,
                    &[],
                    &mut back_out,
                );
                let reply = ReleaseReceive {
                    ref_count: *outcome.as_ref().unwrap_or(&0),
                    err_code: code_of(&outcome),
                };
                self.reply(protocol_version, sequence_number, &reply);
            })
        } else if protocol::payload_is::<InitClientChannelSend>(protocol_version, &envelope) {
            protocol::decode_payload::<InitClientChannelSend>(protocol_version, &envelope).map(|msg| {
                let handler = self.init_handler.lock().unwrap().take();
                let reply = match handler {
                    Some(handler) => {
                        let response = handler(&self, msg);
                        *self.init_handler.lock().unwrap() = Some(handler);
                        response
                    }
                    None => InitClientChannelResponse {
                        err_code: ErrorCode::ZoneNotSupported.code(),
                        destination_zone_id: 0,
                        destination_object_id: 0,
                        reserved: 0,
                    },
                };
                self.reply(protocol_version, sequence_number, &reply);
            })
        } else {
            Err(ErrorCode::InvalidData)
        };
        if let Err(err) = result {
            log::error!("inbound request could not be decoded: {err}");
        }
    }

    fn reply<T: WirePayload>(&self, protocol_version: u64, sequence_number: u64, payload: &T) {
        if let Err(err) = self.send_message(protocol_version, MessageDirection::Receive, sequence_number, payload) {
            log::warn!("reply for sequence {sequence_number} lost: {err}");
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.link.close();
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("zone", &self.service.zone_id())
            .field("timeout", &self.timeout)
            .field("stopped", &self.is_stopped())
            .field("cancel_sent", &self.cancel_sent.load(Ordering::Acquire))
            .field("peer_cancel_received", &self.peer_cancel_received())
            .finish_non_exhaustive()
    }
}

/// A [`ProxyChannel`] speaking the wire envelope over a [`ChannelManager`].
pub struct WireProxyChannel {
    manager: Arc<ChannelManager>,
    local_zone_id: Zone,
    destination_zone_id: DestinationZone,
}

impl WireProxyChannel {
    pub fn new(manager: Arc<ChannelManager>, destination_zone_id: DestinationZone) -> Arc<Self> {
        let local_zone_id = manager.service().zone_id();
        Arc::new(Self { manager, local_zone_id, destination_zone_id })
    }

    pub fn manager(&self) -> &Arc<ChannelManager> {
        &self.manager
    }

    fn check_open(&self) -> RpcResult<()> {
        if self.manager.is_stopped() {
            return Err(ErrorCode::ServiceProxyLostConnection);
        }
        Ok(())
    }
}

impl std::fmt::Debug for WireProxyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireProxyChannel")
            .field("zone", &self.local_zone_id)
            .field("destination_zone", &self.destination_zone_id)
            .finish_non_exhaustive()
    }
}

impl Marshaller for WireProxyChannel {
    fn send(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        caller_channel_zone_id: CallerChannelZone,
        caller_zone_id: CallerZone,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        method_id: MethodId,
        in_buf: &[u8],
        _back_in: &[BackChannelEntry],
        _back_out: &mut BackChannel,
    ) -> RpcResult<Vec<u8>> {
        self.check_open()?;
        let reply: CallReceive = self.manager.call_peer(
            protocol_version,
            &CallSend {
                encoding,
                tag,
                caller_channel_zone_id,
                caller_zone_id,
                destination_zone_id,
                object_id,
                interface_id,
                method_id,
                payload: in_buf.to_vec(),
            },
        )?;
        if reply.err_code != OK {
            return Err(ErrorCode::from_code(reply.err_code).unwrap_or(ErrorCode::Exception));
        }
        Ok(reply.payload)
    }

    fn post(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        caller_channel_zone_id: CallerChannelZone,
        caller_zone_id: CallerZone,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        method_id: MethodId,
        options: PostOptions,
        in_buf: &[u8],
        _back_in: &[BackChannelEntry],
    ) {
        if self.check_open().is_err() {
            return;
        }
        let message = PostSend {
            encoding,
            tag,
            caller_channel_zone_id,
            caller_zone_id,
            destination_zone_id,
            object_id,
            interface_id,
            method_id,
            options,
            payload: in_buf.to_vec(),
        };
        if let Err(err) = self.manager.post_peer(protocol_version, &message) {
            log::debug!("post dropped on closing channel: {err}");
        }
    }

    fn try_cast(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        _back_in: &[BackChannelEntry],
        _back_out: &mut BackChannel,
    ) -> RpcResult<()> {
        self.check_open()?;
        let reply: TryCastReceive = self
            .manager
            .call_peer(protocol_version, &TryCastSend { destination_zone_id, object_id, interface_id })?;
        result_from_code(reply.err_code)
    }

    fn add_ref(
        &self,
        protocol_version: u64,
        destination_channel_zone_id: DestinationChannelZone,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        caller_channel_zone_id: CallerChannelZone,
        caller_zone_id: CallerZone,
        known_direction_zone_id: KnownDirectionZone,
        options: AddRefOptions,
        _back_in: &[BackChannelEntry],
        _back_out: &mut BackChannel,
    ) -> RpcResult<u64> {
        self.check_open()?;
        let reply: AddRefReceive = self.manager.call_peer(
            protocol_version,
            &AddRefSend {
                destination_channel_zone_id,
                destination_zone_id,
                object_id,
                caller_channel_zone_id,
                caller_zone_id,
                known_direction_zone_id,
                build_out_param_channel: options,
            },
        )?;
        result_from_code(reply.err_code)?;
        Ok(reply.ref_count)
    }

    fn release(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        caller_zone_id: CallerZone,
        options: ReleaseOptions,
        _back_in: &[BackChannelEntry],
        _back_out: &mut BackChannel,
    ) -> RpcResult<u64> {
        self.check_open()?;
        let reply: ReleaseReceive = self.manager.call_peer(
            protocol_version,
            &ReleaseSend { destination_zone_id, object_id, caller_zone_id, options },
        )?;
        result_from_code(reply.err_code)?;
        Ok(reply.ref_count)
    }
}

impl ProxyChannel for WireProxyChannel {
    fn connect(&self, input_descr: InterfaceDescriptor) -> RpcResult<InterfaceDescriptor> {
        self.check_open()?;
        let response: InitClientChannelResponse = self.manager.call_peer(
            version::current_version(),
            &InitClientChannelSend {
                caller_zone_id: self.local_zone_id.get(),
                caller_object_id: input_descr.object_id.get(),
                destination_zone_id: self.destination_zone_id.get(),
            },
        )?;
        result_from_code(response.err_code)?;
        Ok(InterfaceDescriptor::new(
            ObjectId::new(response.destination_object_id),
            DestinationZone::new(response.destination_zone_id),
        ))
    }
}
