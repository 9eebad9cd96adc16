//! Shared fixtures for the end-to-end tests
//!
//! The runtime consumes generated bindings; the interfaces here are
//! written the way the binding generator would emit them: a user trait, a
//! marker type implementing [`Interface`], a stub that demarshals method
//! ids, and a proxy that marshals them.

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use interzone::bindings::{proxy_bind_in_param, proxy_bind_out_param, stub_bind_in_param, stub_bind_out_param};
use interzone::channel::{memory_link_pair, ChannelManager, WireProxyChannel};
use interzone::codec;
use interzone::local::ChildChannel;
use interzone::protocol::InitClientChannelResponse;
use interzone::service_proxy::ProxyChannel;
use interzone::transport::{BackChannel, BackChannelEntry, Marshaller, Transport, TransportStatus};
use interzone::types::interface_ordinal;
use interzone::{
    AddRefOptions, CallContext, CallerChannelZone, CallerZone, CastingInterface, DestinationChannelZone,
    DestinationZone, Encoding, ErrorCode, Interface, InterfaceDescriptor, InterfaceOrdinal, InterfaceStub,
    KnownDirectionZone, MethodId, ObjectId, ObjectProxy, PostOptions, ProxyBase, RefMode, ReleaseOptions, RpcResult,
    Service, Zone,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------
// i_arithmetic
// ---------------------------------------------------------------------

pub trait Arithmetic: std::fmt::Debug + Send + Sync + 'static {
    fn transform(&self, values: Vec<u64>) -> RpcResult<Vec<u64>>;
    fn describe(&self) -> RpcResult<String>;
    fn as_casting(self: Arc<Self>) -> Arc<dyn CastingInterface>;
}

pub struct IArithmetic;

impl Interface for IArithmetic {
    type Handle = Arc<dyn Arithmetic>;

    const NAME: &'static str = "i_arithmetic";

    fn interface_id(protocol_version: u64) -> InterfaceOrdinal {
        interface_ordinal(Self::NAME, protocol_version)
    }

    fn as_casting(handle: &Self::Handle) -> Arc<dyn CastingInterface> {
        handle.clone().as_casting()
    }

    fn make_stub(handle: &Self::Handle) -> Arc<dyn InterfaceStub> {
        Arc::new(ArithmeticStub { target: Arc::downgrade(handle) })
    }

    fn make_proxy(object_proxy: &Arc<ObjectProxy>, mode: RefMode) -> RpcResult<Self::Handle> {
        Ok(Arc::new(ArithmeticProxy { base: ProxyBase::new(object_proxy.clone(), mode)? }))
    }
}

const ARITHMETIC_TRANSFORM: u64 = 1;
const ARITHMETIC_DESCRIBE: u64 = 2;

pub struct ArithmeticStub {
    target: Weak<dyn Arithmetic>,
}

impl InterfaceStub for ArithmeticStub {
    fn interface_id(&self, protocol_version: u64) -> InterfaceOrdinal {
        IArithmetic::interface_id(protocol_version)
    }

    fn call(&self, context: &CallContext, method_id: MethodId, in_buf: &[u8]) -> RpcResult<Vec<u8>> {
        let target = self.target.upgrade().ok_or(ErrorCode::ObjectNotFound)?;
        match method_id.get() {
            ARITHMETIC_TRANSFORM => {
                let values: Vec<u64> = codec::deserialise(context.encoding, in_buf)?;
                let transformed = target.transform(values)?;
                codec::serialise(&transformed, context.encoding)
            }
            ARITHMETIC_DESCRIBE => {
                let description = target.describe()?;
                codec::serialise(&description, context.encoding)
            }
            _ => Err(ErrorCode::InvalidMethodId),
        }
    }
}

pub struct ArithmeticProxy {
    base: ProxyBase,
}

impl std::fmt::Debug for ArithmeticProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArithmeticProxy").finish()
    }
}

impl Arithmetic for ArithmeticProxy {
    fn transform(&self, values: Vec<u64>) -> RpcResult<Vec<u64>> {
        let in_buf = codec::serialise(&values, Encoding::Binary)?;
        let out_buf = self.base.send(
            Encoding::Binary,
            0,
            &IArithmetic::interface_id,
            MethodId::new(ARITHMETIC_TRANSFORM),
            &in_buf,
        )?;
        codec::deserialise(Encoding::Binary, &out_buf)
    }

    fn describe(&self) -> RpcResult<String> {
        let out_buf = self.base.send(
            Encoding::Binary,
            0,
            &IArithmetic::interface_id,
            MethodId::new(ARITHMETIC_DESCRIBE),
            &[],
        )?;
        codec::deserialise(Encoding::Binary, &out_buf)
    }

    fn as_casting(self: Arc<Self>) -> Arc<dyn CastingInterface> {
        self
    }
}

impl CastingInterface for ArithmeticProxy {
    fn query_interface(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<Box<dyn Any + Send + Sync>> {
        if IArithmetic::matches(interface_id) {
            return Some(Box::new(self as Arc<dyn Arithmetic>));
        }
        None
    }

    fn is_local(&self) -> bool {
        false
    }

    fn remote_descriptor(&self) -> Option<InterfaceDescriptor> {
        Some(self.base.descriptor())
    }

    fn object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        Some(self.base.object_proxy().clone())
    }
}

// ---------------------------------------------------------------------
// i_probe — a second interface view used by the cast tests
// ---------------------------------------------------------------------

pub trait Probe: Send + Sync + 'static {
    fn ping(&self) -> RpcResult<u64>;
    fn as_casting(self: Arc<Self>) -> Arc<dyn CastingInterface>;
}

pub struct IProbe;

impl Interface for IProbe {
    type Handle = Arc<dyn Probe>;

    const NAME: &'static str = "i_probe";

    fn interface_id(protocol_version: u64) -> InterfaceOrdinal {
        interface_ordinal(Self::NAME, protocol_version)
    }

    fn as_casting(handle: &Self::Handle) -> Arc<dyn CastingInterface> {
        handle.clone().as_casting()
    }

    fn make_stub(handle: &Self::Handle) -> Arc<dyn InterfaceStub> {
        Arc::new(ProbeStub { target: Arc::downgrade(handle) })
    }

    fn make_proxy(object_proxy: &Arc<ObjectProxy>, mode: RefMode) -> RpcResult<Self::Handle> {
        Ok(Arc::new(ProbeProxy { base: ProxyBase::new(object_proxy.clone(), mode)? }))
    }
}

const PROBE_PING: u64 = 1;

pub struct ProbeStub {
    target: Weak<dyn Probe>,
}

impl InterfaceStub for ProbeStub {
    fn interface_id(&self, protocol_version: u64) -> InterfaceOrdinal {
        IProbe::interface_id(protocol_version)
    }

    fn call(&self, context: &CallContext, method_id: MethodId, _in_buf: &[u8]) -> RpcResult<Vec<u8>> {
        let target = self.target.upgrade().ok_or(ErrorCode::ObjectNotFound)?;
        match method_id.get() {
            PROBE_PING => codec::serialise(&target.ping()?, context.encoding),
            _ => Err(ErrorCode::InvalidMethodId),
        }
    }
}

pub struct ProbeProxy {
    base: ProxyBase,
}

impl Probe for ProbeProxy {
    fn ping(&self) -> RpcResult<u64> {
        let out_buf = self.base.send(Encoding::Binary, 0, &IProbe::interface_id, MethodId::new(PROBE_PING), &[])?;
        codec::deserialise(Encoding::Binary, &out_buf)
    }

    fn as_casting(self: Arc<Self>) -> Arc<dyn CastingInterface> {
        self
    }
}

impl CastingInterface for ProbeProxy {
    fn query_interface(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<Box<dyn Any + Send + Sync>> {
        if IProbe::matches(interface_id) {
            return Some(Box::new(self as Arc<dyn Probe>));
        }
        None
    }

    fn is_local(&self) -> bool {
        false
    }

    fn remote_descriptor(&self) -> Option<InterfaceDescriptor> {
        Some(self.base.descriptor())
    }

    fn object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        Some(self.base.object_proxy().clone())
    }
}

// ---------------------------------------------------------------------
// i_factory
// ---------------------------------------------------------------------

pub trait Factory: std::fmt::Debug + Send + Sync + 'static {
    fn create_child(&self) -> RpcResult<Option<Arc<dyn Arithmetic>>>;
    fn adopt(&self, child: Option<Arc<dyn Arithmetic>>) -> RpcResult<u64>;
    fn as_casting(self: Arc<Self>) -> Arc<dyn CastingInterface>;
}

pub struct IFactory;

impl Interface for IFactory {
    type Handle = Arc<dyn Factory>;

    const NAME: &'static str = "i_factory";

    fn interface_id(protocol_version: u64) -> InterfaceOrdinal {
        interface_ordinal(Self::NAME, protocol_version)
    }

    fn as_casting(handle: &Self::Handle) -> Arc<dyn CastingInterface> {
        handle.clone().as_casting()
    }

    fn make_stub(handle: &Self::Handle) -> Arc<dyn InterfaceStub> {
        Arc::new(FactoryStub { target: Arc::downgrade(handle) })
    }

    fn make_proxy(object_proxy: &Arc<ObjectProxy>, mode: RefMode) -> RpcResult<Self::Handle> {
        Ok(Arc::new(FactoryProxy { base: ProxyBase::new(object_proxy.clone(), mode)? }))
    }
}

const FACTORY_CREATE_CHILD: u64 = 1;
const FACTORY_ADOPT: u64 = 2;

pub struct FactoryStub {
    target: Weak<dyn Factory>,
}

impl InterfaceStub for FactoryStub {
    fn interface_id(&self, protocol_version: u64) -> InterfaceOrdinal {
        IFactory::interface_id(protocol_version)
    }

    fn call(&self, context: &CallContext, method_id: MethodId, in_buf: &[u8]) -> RpcResult<Vec<u8>> {
        let target = self.target.upgrade().ok_or(ErrorCode::ObjectNotFound)?;
        let service = Service::current().ok_or(ErrorCode::ZoneNotInitialised)?;
        match method_id.get() {
            FACTORY_CREATE_CHILD => {
                let child = target.create_child()?;
                let descriptor = stub_bind_out_param::<IArithmetic>(
                    &service,
                    context.protocol_version,
                    context.caller_channel_zone_id,
                    context.caller_zone_id,
                    child.as_ref(),
                )?;
                codec::serialise(&descriptor, context.encoding)
            }
            FACTORY_ADOPT => {
                let descriptor: InterfaceDescriptor = codec::deserialise(context.encoding, in_buf)?;
                let child = stub_bind_in_param::<IArithmetic>(
                    context.protocol_version,
                    &service,
                    context.caller_channel_zone_id,
                    context.caller_zone_id,
                    descriptor,
                )?;
                codec::serialise(&target.adopt(child)?, context.encoding)
            }
            _ => Err(ErrorCode::InvalidMethodId),
        }
    }
}

pub struct FactoryProxy {
    base: ProxyBase,
}

impl std::fmt::Debug for FactoryProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryProxy").finish()
    }
}

impl Factory for FactoryProxy {
    fn create_child(&self) -> RpcResult<Option<Arc<dyn Arithmetic>>> {
        let out_buf = self.base.send(
            Encoding::Binary,
            0,
            &IFactory::interface_id,
            MethodId::new(FACTORY_CREATE_CHILD),
            &[],
        )?;
        let descriptor: InterfaceDescriptor = codec::deserialise(Encoding::Binary, &out_buf)?;
        let service_proxy = self.base.object_proxy().service_proxy();
        proxy_bind_out_param::<IArithmetic>(service_proxy, descriptor, service_proxy.zone_id().as_caller())
    }

    fn adopt(&self, child: Option<Arc<dyn Arithmetic>>) -> RpcResult<u64> {
        let service_proxy = self.base.object_proxy().service_proxy();
        let service = service_proxy.operating_zone_service().ok_or(ErrorCode::ZoneNotInitialised)?;
        let (descriptor, marshal_stub) =
            proxy_bind_in_param::<IArithmetic>(&service, interzone::version::current_version(), child.as_ref())?;
        let in_buf = codec::serialise(&descriptor, Encoding::Binary)?;
        let outcome = self.base.send(
            Encoding::Binary,
            0,
            &IFactory::interface_id,
            MethodId::new(FACTORY_ADOPT),
            &in_buf,
        );
        // the marshal reference only spans the call
        if let Some(stub) = marshal_stub {
            service.release_local_stub(&stub, false)?;
        }
        codec::deserialise(Encoding::Binary, &outcome?)
    }

    fn as_casting(self: Arc<Self>) -> Arc<dyn CastingInterface> {
        self
    }
}

impl CastingInterface for FactoryProxy {
    fn query_interface(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<Box<dyn Any + Send + Sync>> {
        if IFactory::matches(interface_id) {
            return Some(Box::new(self as Arc<dyn Factory>));
        }
        None
    }

    fn is_local(&self) -> bool {
        false
    }

    fn remote_descriptor(&self) -> Option<InterfaceDescriptor> {
        Some(self.base.descriptor())
    }

    fn object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        Some(self.base.object_proxy().clone())
    }
}

// ---------------------------------------------------------------------
// implementations
// ---------------------------------------------------------------------

/// Adds a fixed delta to every value; also answers `i_probe`.
#[derive(Debug)]
pub struct Adder {
    pub delta: u64,
    pub label: String,
    pub delay: Option<Duration>,
}

impl Adder {
    pub fn new(delta: u64, label: &str) -> Arc<Self> {
        Arc::new(Self { delta, label: label.to_owned(), delay: None })
    }

    pub fn slow(delta: u64, label: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self { delta, label: label.to_owned(), delay: Some(delay) })
    }
}

impl Arithmetic for Adder {
    fn transform(&self, values: Vec<u64>) -> RpcResult<Vec<u64>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(values.into_iter().map(|value| value + self.delta).collect())
    }

    fn describe(&self) -> RpcResult<String> {
        Ok(self.label.clone())
    }

    fn as_casting(self: Arc<Self>) -> Arc<dyn CastingInterface> {
        self
    }
}

impl Probe for Adder {
    fn ping(&self) -> RpcResult<u64> {
        Ok(self.delta)
    }

    fn as_casting(self: Arc<Self>) -> Arc<dyn CastingInterface> {
        self
    }
}

impl CastingInterface for Adder {
    fn query_interface(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<Box<dyn Any + Send + Sync>> {
        if IArithmetic::matches(interface_id) {
            return Some(Box::new(self.clone() as Arc<dyn Arithmetic>));
        }
        if IProbe::matches(interface_id) {
            return Some(Box::new(self as Arc<dyn Probe>));
        }
        None
    }
}

/// Factory root object: mints `Adder`s, or hands out a stashed handle
/// (possibly a proxy into yet another zone), and keeps what it adopts.
pub struct ChildMaker {
    pub delta: u64,
    stash: Mutex<Option<Arc<dyn Arithmetic>>>,
    adopted: Mutex<Vec<Arc<dyn Arithmetic>>>,
}

impl ChildMaker {
    pub fn new(delta: u64) -> Arc<Self> {
        Arc::new(Self { delta, stash: Mutex::new(None), adopted: Mutex::new(Vec::new()) })
    }

    pub fn stash(&self, handle: Arc<dyn Arithmetic>) {
        *self.stash.lock().unwrap() = Some(handle);
    }

    pub fn adopted_count(&self) -> usize {
        self.adopted.lock().unwrap().len()
    }

    pub fn drop_adopted(&self) {
        self.adopted.lock().unwrap().clear();
    }

    pub fn drop_stash(&self) {
        self.stash.lock().unwrap().take();
    }
}

impl std::fmt::Debug for ChildMaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildMaker").field("delta", &self.delta).finish()
    }
}

impl Factory for ChildMaker {
    fn create_child(&self) -> RpcResult<Option<Arc<dyn Arithmetic>>> {
        if let Some(stashed) = self.stash.lock().unwrap().clone() {
            return Ok(Some(stashed));
        }
        Ok(Some(Adder::new(self.delta, "minted")))
    }

    fn adopt(&self, child: Option<Arc<dyn Arithmetic>>) -> RpcResult<u64> {
        let mut adopted = self.adopted.lock().unwrap();
        if let Some(child) = child {
            adopted.push(child);
        }
        Ok(adopted.len() as u64)
    }

    fn as_casting(self: Arc<Self>) -> Arc<dyn CastingInterface> {
        self
    }
}

impl CastingInterface for ChildMaker {
    fn query_interface(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<Box<dyn Any + Send + Sync>> {
        if IFactory::matches(interface_id) {
            return Some(Box::new(self as Arc<dyn Factory>));
        }
        None
    }
}

// ---------------------------------------------------------------------
// zone assembly helpers
// ---------------------------------------------------------------------

/// A connected parent/child pair: the host service, the channel into the
/// child, the child's factory root proxy, and the concrete root for
/// white-box assertions.
pub struct FactoryZone {
    pub host: Arc<Service>,
    pub channel: Arc<ChildChannel<IFactory, IFactory>>,
    pub root: Arc<dyn Factory>,
    pub maker: Arc<ChildMaker>,
}

/// Stand up `host` plus an in-process child zone whose root is a
/// `ChildMaker` with the given delta.
pub fn factory_zone(host_zone: u64, child_zone: u64, delta: u64) -> RpcResult<FactoryZone> {
    let host = Service::new("host", Zone::new(host_zone));
    factory_zone_on(&host, child_zone, delta)
}

/// Attach an in-process factory child zone to an existing service.
pub fn factory_zone_on(host: &Arc<Service>, child_zone: u64, delta: u64) -> RpcResult<FactoryZone> {
    let maker = ChildMaker::new(delta);
    let maker_for_channel = maker.clone();
    let channel = ChildChannel::<IFactory, IFactory>::new("child", host, Zone::new(child_zone), move |_parent, _svc| {
        Ok(maker_for_channel as Arc<dyn Factory>)
    });
    let root = host
        .connect_to_zone::<IFactory, IFactory>("child", DestinationZone::new(child_zone), None, channel.clone())?
        .ok_or(ErrorCode::ObjectNotFound)?;
    Ok(FactoryZone { host: host.clone(), channel, root, maker })
}

// ---------------------------------------------------------------------
// wire assembly: two services over an in-memory framed link
// ---------------------------------------------------------------------

pub struct WireFixture {
    pub host: Arc<Service>,
    pub target: Arc<Service>,
    pub host_manager: Arc<ChannelManager>,
    pub target_manager: Arc<ChannelManager>,
    pub root: Arc<dyn Factory>,
    pub maker: Arc<ChildMaker>,
    /// The acceptor's reverse route to the caller; owned for the lifetime
    /// of the connection.
    pub reverse: Arc<Mutex<Option<Arc<interzone::ServiceProxy>>>>,
}

/// Connect `host` to `target` over a pair of in-memory framed links, with
/// `maker` as the target's root object.
pub fn wire_fixture(
    host: Arc<Service>,
    target: Arc<Service>,
    maker: Arc<ChildMaker>,
    timeout: Duration,
) -> RpcResult<WireFixture> {
    let (host_link, target_link) = memory_link_pair();
    let host_manager = ChannelManager::new(host_link, host.clone(), timeout);
    let target_manager = ChannelManager::new(target_link, target.clone(), timeout);

    let reverse = Arc::new(Mutex::new(None));
    let accept_root = maker.clone();
    let accept_reverse = reverse.clone();
    target_manager.set_init_handler(move |manager, init| {
        let caller_dest = DestinationZone::new(init.caller_zone_id);
        let reverse_channel = WireProxyChannel::new(manager.clone(), caller_dest);
        let input = InterfaceDescriptor::new(ObjectId::new(init.caller_object_id), caller_dest);
        let root = accept_root.clone();
        let attached = manager.service().attach_remote_zone::<IFactory, IFactory>(
            "client",
            caller_dest,
            input,
            move |_parent, _service| Ok(root as Arc<dyn Factory>),
            reverse_channel,
        );
        match attached {
            Ok((descriptor, reverse_proxy)) => {
                *accept_reverse.lock().unwrap() = Some(reverse_proxy);
                InitClientChannelResponse {
                    err_code: 0,
                    destination_zone_id: manager.service().zone_id().get(),
                    destination_object_id: descriptor.object_id.get(),
                    reserved: 0,
                }
            }
            Err(err) => InitClientChannelResponse {
                err_code: err.code(),
                destination_zone_id: 0,
                destination_object_id: 0,
                reserved: 0,
            },
        }
    });
    host_manager.start();
    target_manager.start();

    let wire = WireProxyChannel::new(host_manager.clone(), target.zone_id().as_destination());
    let root = host
        .connect_to_zone::<IFactory, IFactory>("wire", target.zone_id().as_destination(), None, wire)?
        .ok_or(ErrorCode::ObjectNotFound)?;
    Ok(WireFixture { host, target, host_manager, target_manager, root, maker, reverse })
}

// ---------------------------------------------------------------------
// a transport capability over an in-process service, for relay tests
// ---------------------------------------------------------------------

pub struct ServiceTransport {
    service: Arc<Service>,
    connected: AtomicBool,
}

impl ServiceTransport {
    pub fn new(service: &Arc<Service>) -> Arc<Self> {
        Arc::new(Self { service: service.clone(), connected: AtomicBool::new(true) })
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

impl Marshaller for ServiceTransport {
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
        back_in: &[BackChannelEntry],
        back_out: &mut BackChannel,
    ) -> RpcResult<Vec<u8>> {
        if self.status() != TransportStatus::Connected {
            return Err(ErrorCode::TransportError);
        }
        self.service.send(
            protocol_version,
            encoding,
            tag,
            caller_channel_zone_id,
            caller_zone_id,
            destination_zone_id,
            object_id,
            interface_id,
            method_id,
            in_buf,
            back_in,
            back_out,
        )
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
        back_in: &[BackChannelEntry],
    ) {
        if self.status() != TransportStatus::Connected {
            return;
        }
        self.service.post(
            protocol_version,
            encoding,
            tag,
            caller_channel_zone_id,
            caller_zone_id,
            destination_zone_id,
            object_id,
            interface_id,
            method_id,
            options,
            in_buf,
            back_in,
        );
    }

    fn try_cast(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        back_in: &[BackChannelEntry],
        back_out: &mut BackChannel,
    ) -> RpcResult<()> {
        if self.status() != TransportStatus::Connected {
            return Err(ErrorCode::TransportError);
        }
        self.service.try_cast(protocol_version, destination_zone_id, object_id, interface_id, back_in, back_out)
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
        back_in: &[BackChannelEntry],
        back_out: &mut BackChannel,
    ) -> RpcResult<u64> {
        if self.status() != TransportStatus::Connected {
            return Err(ErrorCode::TransportError);
        }
        self.service.add_ref(
            protocol_version,
            destination_channel_zone_id,
            destination_zone_id,
            object_id,
            caller_channel_zone_id,
            caller_zone_id,
            known_direction_zone_id,
            options,
            back_in,
            back_out,
        )
    }

    fn release(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        caller_zone_id: CallerZone,
        options: ReleaseOptions,
        back_in: &[BackChannelEntry],
        back_out: &mut BackChannel,
    ) -> RpcResult<u64> {
        if self.status() != TransportStatus::Connected {
            return Err(ErrorCode::TransportError);
        }
        self.service.release(protocol_version, destination_zone_id, object_id, caller_zone_id, options, back_in, back_out)
    }
}

impl Transport for ServiceTransport {
    fn status(&self) -> TransportStatus {
        if self.connected.load(Ordering::Acquire) {
            TransportStatus::Connected
        } else {
            TransportStatus::Disconnected
        }
    }

    fn remove_destination(&self, _destination_zone_id: DestinationZone) {}
}

/// A channel that always refuses to connect; used by the failure tests.
pub struct RefusingChannel;

impl Marshaller for RefusingChannel {
    fn send(
        &self,
        _protocol_version: u64,
        _encoding: Encoding,
        _tag: u64,
        _caller_channel_zone_id: CallerChannelZone,
        _caller_zone_id: CallerZone,
        _destination_zone_id: DestinationZone,
        _object_id: ObjectId,
        _interface_id: InterfaceOrdinal,
        _method_id: MethodId,
        _in_buf: &[u8],
        _back_in: &[BackChannelEntry],
        _back_out: &mut BackChannel,
    ) -> RpcResult<Vec<u8>> {
        Err(ErrorCode::TransportError)
    }

    fn post(
        &self,
        _protocol_version: u64,
        _encoding: Encoding,
        _tag: u64,
        _caller_channel_zone_id: CallerChannelZone,
        _caller_zone_id: CallerZone,
        _destination_zone_id: DestinationZone,
        _object_id: ObjectId,
        _interface_id: InterfaceOrdinal,
        _method_id: MethodId,
        _options: PostOptions,
        _in_buf: &[u8],
        _back_in: &[BackChannelEntry],
    ) {
    }

    fn try_cast(
        &self,
        _protocol_version: u64,
        _destination_zone_id: DestinationZone,
        _object_id: ObjectId,
        _interface_id: InterfaceOrdinal,
        _back_in: &[BackChannelEntry],
        _back_out: &mut BackChannel,
    ) -> RpcResult<()> {
        Err(ErrorCode::TransportError)
    }

    fn add_ref(
        &self,
        _protocol_version: u64,
        _destination_channel_zone_id: DestinationChannelZone,
        _destination_zone_id: DestinationZone,
        _object_id: ObjectId,
        _caller_channel_zone_id: CallerChannelZone,
        _caller_zone_id: CallerZone,
        _known_direction_zone_id: KnownDirectionZone,
        _options: AddRefOptions,
        _back_in: &[BackChannelEntry],
        _back_out: &mut BackChannel,
    ) -> RpcResult<u64> {
        Err(ErrorCode::TransportError)
    }

    fn release(
        &self,
        _protocol_version: u64,
        _destination_zone_id: DestinationZone,
        _object_id: ObjectId,
        _caller_zone_id: CallerZone,
        _options: ReleaseOptions,
        _back_in: &[BackChannelEntry],
        _back_out: &mut BackChannel,
    ) -> RpcResult<u64> {
        Err(ErrorCode::TransportError)
    }
}

impl ProxyChannel for RefusingChannel {
    fn connect(&self, _input_descr: InterfaceDescriptor) -> RpcResult<InterfaceDescriptor> {
        Err(ErrorCode::ServiceProxyLostConnection)
    }
}
