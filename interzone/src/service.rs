//! Per-zone registry and inbound dispatcher
//!
//! A [`Service`] owns every object lifetime created within its zone: it
//! allocates object ids, wraps implementations in stubs on first marshal,
//! dispatches inbound calls into them, and keeps the route table that maps
//! `(destination zone, caller zone)` pairs onto service proxies for
//! everything that is not local.
//!
//! Locking follows one pattern throughout: take a registry lock, mutate
//! the in-memory state, capture strong references to whatever must outlive
//! the critical section, release the lock, then perform I/O or run user
//! code.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use scoped_tls::scoped_thread_local;

use crate::bindings::{self, Interface};
use crate::codec::Encoding;
use crate::error::{code_of, ErrorCode, RpcResult};
use crate::service_proxy::{apply_back_channel, ObjectProxyCreationRule, ProxyChannel, ServiceProxy};
use crate::stub::{CallContext, CastingInterface, InterfaceStub, ObjectStub};
use crate::transport::{BackChannel, BackChannelEntry, Marshaller};
use crate::types::{
    AddRefOptions, CallerChannelZone, CallerZone, DestinationChannelZone, DestinationZone, InterfaceDescriptor,
    InterfaceOrdinal, KnownDirectionZone, MethodId, ObjectId, PostOptions, ReleaseOptions, Zone, DUMMY_OBJECT_ID,
};
use crate::version;

scoped_thread_local!(static CURRENT_SERVICE: Arc<Service>);

static ZONE_ID_GENERATOR: AtomicU64 = AtomicU64::new(1);

/// Per-service observer of dispatched calls.
pub trait ServiceLogger: Send + Sync {
    fn before_send(
        &self,
        caller_zone_id: CallerZone,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        method_id: MethodId,
        in_buf: &[u8],
    );
    fn after_send(
        &self,
        caller_zone_id: CallerZone,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        method_id: MethodId,
        err_code: i32,
        out_buf: &[u8],
    );
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct ZoneRoute {
    dest: DestinationZone,
    source: CallerZone,
}

struct StubRegistry {
    stubs: HashMap<ObjectId, Weak<ObjectStub>>,
    // wrapped implementation identity → stub, for marshal-out de-duping
    wrapped_object_to_stub: HashMap<usize, Weak<ObjectStub>>,
}

type StubFactoryFn = dyn Fn(&Arc<dyn CastingInterface>) -> Option<Arc<dyn InterfaceStub>> + Send + Sync;

/// Responsible for all object lifetimes created within its zone.
pub struct Service {
    name: String,
    zone_id: Zone,
    parent_zone_id: DestinationZone,
    max_protocol_version: u64,
    object_id_generator: AtomicU64,
    self_weak: Weak<Service>,
    stub_control: Mutex<StubRegistry>,
    stub_factories: Mutex<HashMap<InterfaceOrdinal, Arc<StubFactoryFn>>>,
    zone_control: Mutex<BTreeMap<ZoneRoute, Weak<ServiceProxy>>>,
    parent: Mutex<Option<Arc<ServiceProxy>>>,
    service_loggers: Mutex<Vec<Arc<dyn ServiceLogger>>>,
}

impl Service {
    /// A root service for `zone_id`.
    pub fn new(name: &str, zone_id: Zone) -> Arc<Self> {
        Self::build(name, zone_id, DestinationZone::default(), version::HIGHEST_SUPPORTED_VERSION)
    }

    /// A service for a zone that hangs off a parent zone; the parent
    /// channel is pinned until teardown (see [`Service::set_parent_proxy`]).
    pub fn new_child(name: &str, zone_id: Zone, parent_zone_id: DestinationZone) -> Arc<Self> {
        Self::build(name, zone_id, parent_zone_id, version::HIGHEST_SUPPORTED_VERSION)
    }

    /// A service that refuses protocol versions above `max_protocol_version`;
    /// lets mixed-version topologies be assembled in one process.
    pub fn with_version_ceiling(name: &str, zone_id: Zone, max_protocol_version: u64) -> Arc<Self> {
        Self::build(name, zone_id, DestinationZone::default(), version::clamp(max_protocol_version))
    }

    fn build(name: &str, zone_id: Zone, parent_zone_id: DestinationZone, max_protocol_version: u64) -> Arc<Self> {
        debug_assert!(zone_id.is_set(), "a service needs a nonzero zone id");
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_service_creation(name, zone_id.get(), parent_zone_id.get());
        }
        Arc::new_cyclic(|self_weak| Self {
            name: name.to_owned(),
            zone_id,
            parent_zone_id,
            max_protocol_version,
            object_id_generator: AtomicU64::new(0),
            self_weak: self_weak.clone(),
            stub_control: Mutex::new(StubRegistry {
                stubs: HashMap::new(),
                wrapped_object_to_stub: HashMap::new(),
            }),
            stub_factories: Mutex::new(HashMap::new()),
            zone_control: Mutex::new(BTreeMap::new()),
            parent: Mutex::new(None),
            service_loggers: Mutex::new(Vec::new()),
        })
    }

    /// Process-unique zone id allocator for embeddings that do not assign
    /// their own.
    pub fn generate_zone_id() -> Zone {
        Zone::new(ZONE_ID_GENERATOR.fetch_add(1, Ordering::Relaxed))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zone_id(&self) -> Zone {
        self.zone_id
    }

    pub fn parent_zone_id(&self) -> DestinationZone {
        self.parent_zone_id
    }

    pub fn max_protocol_version(&self) -> u64 {
        self.max_protocol_version
    }

    pub fn get_parent(&self) -> Option<Arc<ServiceProxy>> {
        self.parent.lock().unwrap().clone()
    }

    /// Pin `proxy` as the parent channel of this zone.
    pub fn set_parent_proxy(&self, proxy: Arc<ServiceProxy>) -> bool {
        let mut parent = self.parent.lock().unwrap();
        if parent.is_some() {
            return false;
        }
        *parent = Some(proxy);
        true
    }

    fn strong(&self) -> Arc<Service> {
        self.self_weak.upgrade().expect("service used during destruction")
    }

    /// The service currently dispatching on this thread, if any.
    ///
    /// Set for the duration of every inbound dispatch so that interface
    /// stubs can find their owning service while demarshalling nested
    /// interface parameters. Library users must not set it themselves.
    pub fn current() -> Option<Arc<Service>> {
        if CURRENT_SERVICE.is_set() {
            Some(CURRENT_SERVICE.with(Clone::clone))
        } else {
            None
        }
    }

    fn enter_dispatch<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> R {
        CURRENT_SERVICE.set(self, f)
    }

    /// Allocate an object id; never 0 and never the dummy sentinel.
    pub fn generate_new_object_id(&self) -> ObjectId {
        loop {
            let id = self.object_id_generator.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 && id != u64::MAX {
                return ObjectId::new(id);
            }
        }
    }

    /// Not thread safe with respect to in-flight casts; register factories
    /// before putting the service into operation.
    pub fn add_interface_stub_factory<I: Interface>(&self) {
        let factory: Arc<StubFactoryFn> = Arc::new(|casting: &Arc<dyn CastingInterface>| {
            let handle = I::from_casting(casting)?;
            Some(I::make_stub(&handle))
        });
        let mut factories = self.stub_factories.lock().unwrap();
        for protocol_version in version::LOWEST_SUPPORTED_VERSION..=version::HIGHEST_SUPPORTED_VERSION {
            factories.insert(I::interface_id(protocol_version), factory.clone());
        }
    }

    pub fn add_service_logger(&self, logger: Arc<dyn ServiceLogger>) {
        self.service_loggers.lock().unwrap().push(logger);
    }

    // ------------------------------------------------------------------
    // stub registry
    // ------------------------------------------------------------------

    pub fn get_object(&self, object_id: ObjectId) -> Option<Arc<ObjectStub>> {
        self.stub_control.lock().unwrap().stubs.get(&object_id).and_then(Weak::upgrade)
    }

    /// The object id under which `casting` is currently marshalled, if any.
    pub fn object_id_of(&self, casting: &Arc<dyn CastingInterface>) -> Option<ObjectId> {
        let key = impl_key_of(casting);
        self.stub_control
            .lock()
            .unwrap()
            .wrapped_object_to_stub
            .get(&key)
            .and_then(Weak::upgrade)
            .map(|stub| stub.object_id())
    }

    pub(crate) fn unregister_stub(&self, object_id: ObjectId, impl_key: usize) {
        let mut registry = self.stub_control.lock().unwrap();
        if let Some(weak) = registry.stubs.get(&object_id) {
            if weak.strong_count() == 0 {
                registry.stubs.remove(&object_id);
            }
        }
        if let Some(weak) = registry.wrapped_object_to_stub.get(&impl_key) {
            if weak.strong_count() == 0 {
                registry.wrapped_object_to_stub.remove(&impl_key);
            }
        }
    }

    /// Wrap `casting` in a stub (or find the existing one), apply the
    /// interface view factory, and account one reference for
    /// `caller_zone_id`. This is the single egress point for local
    /// implementations.
    pub fn get_proxy_stub_descriptor(
        &self,
        _protocol_version: u64,
        _caller_channel_zone_id: CallerChannelZone,
        caller_zone_id: CallerZone,
        casting: Arc<dyn CastingInterface>,
        add_interface_view: &dyn Fn(&Arc<ObjectStub>),
        optimistic: bool,
    ) -> RpcResult<(InterfaceDescriptor, Arc<ObjectStub>)> {
        let impl_key = impl_key_of(&casting);
        let (stub, created) = {
            let mut registry = self.stub_control.lock().unwrap();
            match registry.wrapped_object_to_stub.get(&impl_key).and_then(Weak::upgrade) {
                Some(existing) => (existing, false),
                None => {
                    let object_id = self.generate_new_object_id();
                    let stub = ObjectStub::new(object_id, self.self_weak.clone(), casting, impl_key);
                    registry.stubs.insert(object_id, Arc::downgrade(&stub));
                    registry.wrapped_object_to_stub.insert(impl_key, Arc::downgrade(&stub));
                    (stub, true)
                }
            }
        };
        if created {
            if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
                telemetry.on_stub_creation(self.zone_id.get(), stub.object_id().get());
            }
        }
        add_interface_view(&stub);
        stub.add_ref(caller_zone_id, optimistic)?;
        let descriptor = InterfaceDescriptor::new(stub.object_id(), self.zone_id.as_destination());
        Ok((descriptor, stub))
    }

    /// Release one marshal-out reference the local zone granted itself.
    pub fn release_local_stub(&self, stub: &Arc<ObjectStub>, optimistic: bool) -> RpcResult<u64> {
        let options = if optimistic { ReleaseOptions::OPTIMISTIC } else { ReleaseOptions::NORMAL };
        let (count, lifetime) = stub.release(self.zone_id.as_caller(), options)?;
        drop(lifetime);
        Ok(count)
    }

    /// Typed lookup of a local object's interface view.
    pub fn get_local_interface<I: Interface>(&self, protocol_version: u64, object_id: ObjectId) -> Option<I::Handle> {
        let stub = self.get_object(object_id)?;
        if !stub.has_interface(I::interface_id(protocol_version)) {
            return None;
        }
        let casting = stub.castable()?;
        I::from_casting(&casting)
    }

    // ------------------------------------------------------------------
    // routing
    // ------------------------------------------------------------------

    pub fn add_zone_proxy(&self, proxy: &Arc<ServiceProxy>) {
        let mut table = self.zone_control.lock().unwrap();
        Self::inner_add_zone_proxy(&mut table, proxy);
    }

    fn inner_add_zone_proxy(table: &mut BTreeMap<ZoneRoute, Weak<ServiceProxy>>, proxy: &Arc<ServiceProxy>) {
        let route = ZoneRoute { dest: proxy.destination_zone_id(), source: proxy.caller_zone_id() };
        match table.entry(route) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(proxy));
                proxy.set_responsible_for_cleanup(true);
            }
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                if entry.get().strong_count() == 0 {
                    entry.insert(Arc::downgrade(proxy));
                    proxy.set_responsible_for_cleanup(true);
                } else {
                    log::warn!(
                        "route {}→{} already registered; keeping the live proxy",
                        route.source,
                        route.dest
                    );
                }
            }
        }
    }

    /// Route lookup with on-demand cloning.
    ///
    /// Tried in order: exact `(destination, new caller)`; exact
    /// `(destination, caller)` relabelled; the parent channel; any proxy
    /// already pointing down the channel the request arrived through.
    /// Returns `None` when nothing matches — the caller surfaces
    /// `ObjectNotFound`.
    pub fn get_zone_proxy(
        &self,
        caller_channel_zone_id: CallerChannelZone,
        caller_zone_id: CallerZone,
        destination_zone_id: DestinationZone,
        new_caller_zone_id: CallerZone,
        new_proxy_added: &mut bool,
    ) -> Option<Arc<ServiceProxy>> {
        *new_proxy_added = false;
        let mut table = self.zone_control.lock().unwrap();

        let wanted = ZoneRoute { dest: destination_zone_id, source: new_caller_zone_id };
        if let Some(found) = table.get(&wanted).and_then(Weak::upgrade) {
            return Some(found);
        }

        let relabel = ZoneRoute { dest: destination_zone_id, source: caller_zone_id };
        if let Some(found) = table.get(&relabel).and_then(Weak::upgrade) {
            let clone = found.clone_for_zone(destination_zone_id, new_caller_zone_id);
            Self::inner_add_zone_proxy(&mut table, &clone);
            *new_proxy_added = true;
            return Some(clone);
        }

        // a proxy already reaching the destination for some other caller
        // beats forwarding through the parent
        let direct = table
            .range(ZoneRoute { dest: destination_zone_id, source: CallerZone::new(0) }..)
            .take_while(|(route, _)| route.dest == destination_zone_id)
            .find_map(|(_, weak)| weak.upgrade());
        if let Some(found) = direct {
            let clone = found.clone_for_zone(destination_zone_id, new_caller_zone_id);
            Self::inner_add_zone_proxy(&mut table, &clone);
            *new_proxy_added = true;
            return Some(clone);
        }

        if let Some(parent) = self.parent.lock().unwrap().clone() {
            if parent.destination_zone_id() == destination_zone_id && parent.caller_zone_id() == new_caller_zone_id {
                return Some(parent);
            }
            let clone = parent.clone_for_zone(destination_zone_id, new_caller_zone_id);
            Self::inner_add_zone_proxy(&mut table, &clone);
            *new_proxy_added = true;
            return Some(clone);
        }

        if caller_channel_zone_id.is_set() {
            let channel_clone = table.values().filter_map(Weak::upgrade).find(|candidate| {
                candidate.destination_zone_id() == caller_channel_zone_id.as_destination()
                    || candidate.destination_channel_zone() == caller_channel_zone_id.as_destination_channel()
            });
            if let Some(found) = channel_clone {
                let clone = found.clone_for_zone(destination_zone_id, new_caller_zone_id);
                Self::inner_add_zone_proxy(&mut table, &clone);
                *new_proxy_added = true;
                return Some(clone);
            }
        }

        None
    }

    pub fn remove_zone_proxy(&self, destination_zone_id: DestinationZone, caller_zone_id: CallerZone) {
        let mut table = self.zone_control.lock().unwrap();
        let route = ZoneRoute { dest: destination_zone_id, source: caller_zone_id };
        if let Some(weak) = table.get(&route) {
            if weak.strong_count() == 0 {
                table.remove(&route);
            }
        }
    }

    pub fn remove_zone_proxy_if_not_used(&self, destination_zone_id: DestinationZone, caller_zone_id: CallerZone) {
        self.remove_zone_proxy(destination_zone_id, caller_zone_id)
    }

    /// Exact route lookup without cloning.
    pub fn lookup_zone_proxy(
        &self,
        destination_zone_id: DestinationZone,
        caller_zone_id: CallerZone,
    ) -> Option<Arc<ServiceProxy>> {
        let table = self.zone_control.lock().unwrap();
        table.get(&ZoneRoute { dest: destination_zone_id, source: caller_zone_id }).and_then(Weak::upgrade)
    }

    pub fn has_service_proxies(&self) -> bool {
        self.zone_control.lock().unwrap().values().any(|weak| weak.strong_count() > 0)
    }

    /// Live routes in the table.
    pub fn route_count(&self) -> usize {
        self.zone_control.lock().unwrap().values().filter(|weak| weak.strong_count() > 0).count()
    }

    /// Live stubs in the registry.
    pub fn stub_count(&self) -> usize {
        self.stub_control.lock().unwrap().stubs.values().filter(|weak| weak.strong_count() > 0).count()
    }

    /// `(shared, optimistic)` ledger totals of a stub, for diagnostics.
    pub fn stub_totals(&self, object_id: ObjectId) -> Option<(u64, u64)> {
        self.get_object(object_id).map(|stub| stub.totals())
    }

    /// Whether every registry is drained: no live stubs, no wrapped
    /// implementations, and no live routes other than the pinned parent
    /// channel (which only goes at service teardown).
    pub fn check_is_empty(&self) -> bool {
        let registry = self.stub_control.lock().unwrap();
        let stubs_live = registry.stubs.values().any(|weak| weak.strong_count() > 0);
        let wrapped_live = registry.wrapped_object_to_stub.values().any(|weak| weak.strong_count() > 0);
        drop(registry);
        if stubs_live || wrapped_live {
            return false;
        }
        let parent = self.parent.lock().unwrap().clone();
        let table = self.zone_control.lock().unwrap();
        table.values().filter_map(Weak::upgrade).all(|proxy| match &parent {
            Some(parent_proxy) => Arc::ptr_eq(&proxy, parent_proxy),
            None => false,
        })
    }

    // ------------------------------------------------------------------
    // inbound dispatch and the reference-count protocol
    // ------------------------------------------------------------------

    fn check_version(&self, protocol_version: u64) -> RpcResult<()> {
        if protocol_version < version::LOWEST_SUPPORTED_VERSION || protocol_version > self.max_protocol_version {
            return Err(ErrorCode::InvalidVersion);
        }
        Ok(())
    }

    fn drain_back_channel(&self, back_in: &[BackChannelEntry]) {
        if back_in.is_empty() {
            return;
        }
        apply_back_channel(&self.strong(), back_in);
    }
}

impl Marshaller for Service {
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
        self.check_version(protocol_version)?;
        self.drain_back_channel(back_in);

        if destination_zone_id != self.zone_id.as_destination() {
            let mut new_proxy_added = false;
            let proxy = self
                .get_zone_proxy(
                    caller_channel_zone_id,
                    caller_zone_id,
                    destination_zone_id,
                    caller_zone_id,
                    &mut new_proxy_added,
                )
                .ok_or(ErrorCode::ZoneNotFound)?;
            return proxy.channel().send(
                protocol_version,
                encoding,
                tag,
                self.zone_id.as_caller_channel(),
                caller_zone_id,
                destination_zone_id,
                object_id,
                interface_id,
                method_id,
                in_buf,
                &[],
                back_out,
            );
        }

        let stub = self.get_object(object_id).ok_or(ErrorCode::ObjectNotFound)?;
        let context = CallContext {
            protocol_version,
            encoding,
            tag,
            caller_channel_zone_id,
            caller_zone_id,
        };
        let loggers = self.service_loggers.lock().unwrap().clone();
        for logger in &loggers {
            logger.before_send(caller_zone_id, object_id, interface_id, method_id, in_buf);
        }
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_stub_send(self.zone_id.get(), object_id.get(), interface_id.get(), method_id.get());
        }
        let service = self.strong();
        let result = service.enter_dispatch(|| stub.call(&context, interface_id, method_id, in_buf));
        for logger in &loggers {
            logger.after_send(
                caller_zone_id,
                object_id,
                interface_id,
                method_id,
                code_of(&result),
                result.as_deref().unwrap_or(&[]),
            );
        }
        result
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
        if self.check_version(protocol_version).is_err() {
            log::warn!("post at unsupported version {protocol_version} dropped (zone={})", self.zone_id);
            return;
        }
        self.drain_back_channel(back_in);

        if destination_zone_id != self.zone_id.as_destination() {
            let mut new_proxy_added = false;
            match self.get_zone_proxy(
                caller_channel_zone_id,
                caller_zone_id,
                destination_zone_id,
                caller_zone_id,
                &mut new_proxy_added,
            ) {
                Some(proxy) => proxy.channel().post(
                    protocol_version,
                    encoding,
                    tag,
                    self.zone_id.as_caller_channel(),
                    caller_zone_id,
                    destination_zone_id,
                    object_id,
                    interface_id,
                    method_id,
                    options,
                    in_buf,
                    &[],
                ),
                None => log::warn!(
                    "post dropped, no route: zone={} dest={destination_zone_id}",
                    self.zone_id
                ),
            }
            return;
        }

        if options.contains(PostOptions::RELEASE_OPTIMISTIC) {
            if let Some(stub) = self.get_object(object_id) {
                match stub.release(caller_zone_id, ReleaseOptions::OPTIMISTIC) {
                    Ok((_, lifetime)) => drop(lifetime),
                    Err(err) => log::warn!(
                        "posted optimistic release failed: zone={} object={object_id} err={err}",
                        self.zone_id
                    ),
                }
            }
        }
        if options.contains(PostOptions::ZONE_TERMINATING) {
            // the caller zone is going away; any routes towards it are dead
            let mut table = self.zone_control.lock().unwrap();
            table.retain(|route, weak| {
                !(route.dest == caller_zone_id.as_destination() && weak.strong_count() == 0)
            });
            log::debug!("zone {caller_zone_id} terminating; routes pruned (zone={})", self.zone_id);
        }
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
        self.check_version(protocol_version)?;
        self.drain_back_channel(back_in);

        if destination_zone_id != self.zone_id.as_destination() {
            let mut new_proxy_added = false;
            let proxy = self
                .get_zone_proxy(
                    CallerChannelZone::default(),
                    self.zone_id.as_caller(),
                    destination_zone_id,
                    self.zone_id.as_caller(),
                    &mut new_proxy_added,
                )
                .ok_or(ErrorCode::ZoneNotFound)?;
            return proxy.channel().try_cast(protocol_version, destination_zone_id, object_id, interface_id, &[], back_out);
        }

        let stub = self.get_object(object_id).ok_or(ErrorCode::ObjectNotFound)?;
        if stub.has_interface(interface_id) {
            return Ok(());
        }
        // lazily extend the stub with another interface view
        let factory = self.stub_factories.lock().unwrap().get(&interface_id).cloned();
        let factory = factory.ok_or(ErrorCode::InvalidInterfaceId)?;
        let casting = stub.castable().ok_or(ErrorCode::ObjectNotFound)?;
        let view = factory(&casting).ok_or(ErrorCode::InvalidInterfaceId)?;
        stub.add_interface(view);
        Ok(())
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
        self.check_version(protocol_version)?;
        self.drain_back_channel(back_in);
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_service_add_ref(
                self.zone_id.get(),
                destination_zone_id.get(),
                object_id.get(),
                caller_zone_id.get(),
                options.bits(),
            );
        }

        if destination_zone_id == self.zone_id.as_destination() {
            if object_id == DUMMY_OBJECT_ID {
                // channel-scoped reference back towards the caller
                let mut new_proxy_added = false;
                match self.get_zone_proxy(
                    caller_channel_zone_id,
                    caller_zone_id,
                    caller_zone_id.as_destination(),
                    self.zone_id.as_caller(),
                    &mut new_proxy_added,
                ) {
                    Some(proxy) => return Ok(proxy.add_external_ref()),
                    None => {
                        log::debug!(
                            "dummy add_ref with no reverse channel: zone={} caller={caller_zone_id}",
                            self.zone_id
                        );
                        return Ok(0);
                    }
                }
            }
            let stub = self.get_object(object_id).ok_or(ErrorCode::ObjectNotFound)?;
            let count = stub.add_ref(caller_zone_id, options.is_optimistic())?;
            if options.contains(AddRefOptions::BUILD_CALLER_ROUTE) {
                log::debug!(
                    "caller route requested: zone={} caller={caller_zone_id} via channel {caller_channel_zone_id}",
                    self.zone_id
                );
            }
            return Ok(count);
        }

        // not for us; forward towards the destination, building the route
        // so a later release can walk back through this zone
        let mut new_proxy_added = false;
        let proxy = self
            .get_zone_proxy(
                caller_channel_zone_id,
                caller_zone_id,
                destination_zone_id,
                caller_zone_id,
                &mut new_proxy_added,
            )
            .ok_or(ErrorCode::ObjectNotFound)?;
        if destination_channel_zone_id.is_set() && destination_channel_zone_id != proxy.destination_channel_zone() {
            log::debug!(
                "add_ref channel hint {destination_channel_zone_id} differs from route hop {} (zone={})",
                proxy.destination_channel_zone(),
                self.zone_id
            );
        }
        proxy.add_external_ref();
        let forwarded = proxy.channel().add_ref(
            protocol_version,
            proxy.destination_channel_zone(),
            destination_zone_id,
            object_id,
            self.zone_id.as_caller_channel(),
            caller_zone_id,
            known_direction_zone_id,
            options,
            &[],
            back_out,
        );
        match forwarded {
            Ok(count) => Ok(count),
            Err(err) => {
                proxy.release_external_ref();
                self.remove_zone_proxy_if_not_used(destination_zone_id, caller_zone_id);
                Err(err)
            }
        }
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
        self.check_version(protocol_version)?;
        self.drain_back_channel(back_in);
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_service_release(
                self.zone_id.get(),
                destination_zone_id.get(),
                object_id.get(),
                caller_zone_id.get(),
                options.bits(),
            );
        }

        if destination_zone_id == self.zone_id.as_destination() {
            if object_id == DUMMY_OBJECT_ID {
                match self.lookup_zone_proxy(caller_zone_id.as_destination(), self.zone_id.as_caller()) {
                    Some(proxy) => {
                        let count = proxy.release_external_ref();
                        if count == 0 {
                            self.remove_zone_proxy_if_not_used(
                                caller_zone_id.as_destination(),
                                self.zone_id.as_caller(),
                            );
                        }
                        return Ok(count);
                    }
                    None => return Ok(0),
                }
            }
            let stub = self.get_object(object_id).ok_or(ErrorCode::ObjectNotFound)?;
            let (count, lifetime) = stub.release(caller_zone_id, options)?;
            drop(stub);
            // the last reference; the stub destroys once in-flight calls drain
            drop(lifetime);
            return Ok(count);
        }

        // releases walk existing routes only; a missing route means the
        // add_ref/release pairing has been corrupted
        let proxy = self
            .lookup_zone_proxy(destination_zone_id, caller_zone_id)
            .ok_or(ErrorCode::ObjectNotFound)?;
        let forwarded = proxy.channel().release(
            protocol_version,
            destination_zone_id,
            object_id,
            caller_zone_id,
            options,
            &[],
            back_out,
        )?;
        let remaining = proxy.release_external_ref();
        drop(proxy);
        if remaining == 0 {
            self.remove_zone_proxy_if_not_used(destination_zone_id, caller_zone_id);
        }
        Ok(forwarded)
    }
}

impl Service {
    // ------------------------------------------------------------------
    // connection lifecycle
    // ------------------------------------------------------------------

    /// Connect this zone to a new destination zone over `channel`,
    /// optionally marshalling `input_interface` to the peer and
    /// demarshalling the peer's root interface back.
    pub fn connect_to_zone<I: Interface, O: Interface>(
        self: &Arc<Self>,
        name: &str,
        new_zone_id: DestinationZone,
        input_interface: Option<I::Handle>,
        channel: Arc<dyn ProxyChannel>,
    ) -> RpcResult<Option<O::Handle>> {
        let proxy = ServiceProxy::new(name, new_zone_id, self, channel);
        self.add_zone_proxy(&proxy);

        let mut input_descr = InterfaceDescriptor::null();
        let mut input_stub = None;
        let mut remote_input: Option<(InterfaceDescriptor, CallerZone)> = None;
        if let Some(handle) = &input_interface {
            let casting = I::as_casting(handle);
            if casting.is_local() {
                // the grant lands on the new zone's ledger; its release
                // balances it
                let (descr, stub) = self.get_proxy_stub_descriptor(
                    version::current_version(),
                    CallerChannelZone::default(),
                    new_zone_id.as_caller(),
                    casting,
                    &bindings::interface_view_factory::<I>(handle),
                    false,
                )?;
                input_descr = descr;
                input_stub = Some((stub, new_zone_id.as_caller()));
            } else {
                input_descr = self.prepare_remote_input_interface(
                    CallerChannelZone::default(),
                    new_zone_id.as_caller(),
                    &casting,
                )?;
                remote_input = Some((input_descr, new_zone_id.as_caller()));
            }
        }

        let output_descr = match proxy.connect(input_descr) {
            Ok(descr) => descr,
            Err(err) => {
                self.clean_up_on_failed_connection(input_stub, remote_input);
                self.remove_zone_proxy_if_not_used(new_zone_id, self.zone_id.as_caller());
                return Err(err);
            }
        };

        if output_descr.is_null() {
            self.remove_zone_proxy_if_not_used(new_zone_id, self.zone_id.as_caller());
            return Ok(None);
        }
        bindings::demarshall_interface_proxy::<O>(
            version::current_version(),
            &proxy,
            output_descr,
            self.zone_id.as_caller(),
        )
    }

    /// Marshal an already-remote interface as an in-parameter for a new
    /// peering: the descriptor keeps pointing at its origin zone and the
    /// reference accounting flows through the origin's route.
    pub fn prepare_remote_input_interface(
        self: &Arc<Self>,
        caller_channel_zone_id: CallerChannelZone,
        caller_zone_id: CallerZone,
        casting: &Arc<dyn CastingInterface>,
    ) -> RpcResult<InterfaceDescriptor> {
        let descriptor = casting.remote_descriptor().ok_or(ErrorCode::InvalidData)?;
        let mut back_out = BackChannel::new();
        self.add_ref(
            version::current_version(),
            DestinationChannelZone::default(),
            descriptor.destination_zone_id,
            descriptor.object_id,
            caller_channel_zone_id,
            caller_zone_id,
            KnownDirectionZone::default(),
            AddRefOptions::BUILD_CALLER_ROUTE,
            &[],
            &mut back_out,
        )?;
        Ok(descriptor)
    }

    /// Undo the in-parameter accounting after a failed connect.
    pub fn clean_up_on_failed_connection(
        self: &Arc<Self>,
        input_stub: Option<(Arc<ObjectStub>, CallerZone)>,
        remote_input: Option<(InterfaceDescriptor, CallerZone)>,
    ) {
        if let Some((stub, caller_zone_id)) = input_stub {
            match stub.release(caller_zone_id, ReleaseOptions::NORMAL) {
                Ok((_, lifetime)) => drop(lifetime),
                Err(err) => log::error!("failed to release stub after failed connection: {err}"),
            }
        }
        if let Some((descriptor, caller_zone_id)) = remote_input {
            let mut back_out = BackChannel::new();
            if let Err(err) = self.release(
                version::current_version(),
                descriptor.destination_zone_id,
                descriptor.object_id,
                caller_zone_id,
                ReleaseOptions::NORMAL,
                &[],
                &mut back_out,
            ) {
                log::error!("failed to release remote input after failed connection: {err}");
            }
        }
    }

    /// Accepting-side counterpart of `connect_to_zone`: bring up a proxy
    /// pointing back at the caller, demarshal the caller's interface,
    /// produce a local child object through `factory` and bind it as the
    /// returned descriptor.
    ///
    /// The returned proxy is the reverse route to the caller; the
    /// acceptor owns it for the lifetime of the connection.
    pub fn attach_remote_zone<P: Interface, C: Interface>(
        self: &Arc<Self>,
        name: &str,
        caller_zone_id: DestinationZone,
        input_descr: InterfaceDescriptor,
        factory: impl FnOnce(Option<P::Handle>, &Arc<Service>) -> RpcResult<C::Handle>,
        channel: Arc<dyn ProxyChannel>,
    ) -> RpcResult<(InterfaceDescriptor, Arc<ServiceProxy>)> {
        let proxy = ServiceProxy::new(name, caller_zone_id, self, channel);
        self.add_zone_proxy(&proxy);

        let parent_handle = if input_descr.is_null() {
            None
        } else {
            bindings::demarshall_interface_proxy::<P>(
                version::current_version(),
                &proxy,
                input_descr,
                self.zone_id.as_caller(),
            )?
        };
        let child = factory(parent_handle, self)?;
        if !C::as_casting(&child).is_local() {
            log::error!("attach factories must produce local implementations");
            return Err(ErrorCode::UnableToCreateServiceProxy);
        }
        let descriptor = bindings::create_interface_stub_for::<C>(self, &child, caller_zone_id.as_caller())?;
        Ok((descriptor, proxy))
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        // unpin the parent channel so its self-reference cannot outlive us
        if let Some(parent) = self.parent.get_mut().unwrap().take() {
            parent.set_parent_channel(false);
        }
        if !self.check_is_empty() {
            log::warn!(
                "service for zone {} destroyed with live stubs or routes (stubs={}, routes={})",
                self.zone_id,
                self.stub_count(),
                self.route_count()
            );
        }
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_service_deletion(self.zone_id.get());
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("zone", &self.zone_id)
            .field("stubs", &self.stub_count())
            .field("routes", &self.route_count())
            .finish()
    }
}

pub(crate) fn impl_key_of(casting: &Arc<dyn CastingInterface>) -> usize {
    Arc::as_ptr(casting) as *const () as usize
}

/// Bootstrap a child zone behind a freshly accepted channel: create the
/// child service, pin its parent proxy, demarshal the parent-supplied
/// interface, and bind the factory-produced root object as the output
/// descriptor.
pub fn create_child_zone<P: Interface, C: Interface>(
    name: &str,
    zone_id: Zone,
    parent_zone_id: DestinationZone,
    input_descr: InterfaceDescriptor,
    factory: impl FnOnce(Option<P::Handle>, &Arc<Service>) -> RpcResult<C::Handle>,
    parent_channel: Arc<dyn ProxyChannel>,
) -> RpcResult<(Arc<Service>, InterfaceDescriptor)> {
    let child = Service::new_child(name, zone_id, parent_zone_id);
    let parent_proxy = ServiceProxy::new("parent", parent_zone_id, &child, parent_channel);
    child.add_zone_proxy(&parent_proxy);
    if !child.set_parent_proxy(parent_proxy.clone()) {
        return Err(ErrorCode::UnableToCreateServiceProxy);
    }
    parent_proxy.set_parent_channel(true);

    let parent_handle = if input_descr.is_null() {
        None
    } else {
        bindings::demarshall_interface_proxy::<P>(
            version::current_version(),
            &parent_proxy,
            input_descr,
            child.zone_id().as_caller(),
        )?
    };
    let root = factory(parent_handle, &child)?;
    if !C::as_casting(&root).is_local() {
        log::error!("child zone roots must be local implementations");
        return Err(ErrorCode::UnableToCreateServiceProxy);
    }
    // the grant belongs to the parent zone asking for the connection
    let output_descr = bindings::create_interface_stub_for::<C>(&child, &root, parent_zone_id.as_caller())?;
    Ok((child, output_descr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_ids_are_unique() {
        let first = Service::generate_zone_id();
        let second = Service::generate_zone_id();
        assert_ne!(first, second);
    }

    #[test]
    fn object_ids_skip_reserved_values() {
        let service = Service::new("test", Zone::new(900));
        for _ in 0..64 {
            let id = service.generate_new_object_id();
            assert!(id.is_set());
            assert_ne!(id, DUMMY_OBJECT_ID);
        }
    }

    #[test]
    fn no_current_service_outside_dispatch() {
        assert!(Service::current().is_none());
    }

    #[test]
    fn fresh_service_is_empty() {
        let service = Service::new("test", Zone::new(901));
        assert!(service.check_is_empty());
        assert_eq!(service.stub_count(), 0);
        assert_eq!(service.route_count(), 0);
        assert!(!service.has_service_proxies());
    }

    #[test]
    fn version_ceiling_rejects_newer_callers() {
        let service = Service::with_version_ceiling("old", Zone::new(902), 2);
        let mut back = BackChannel::new();
        let err = service
            .try_cast(
                3,
                service.zone_id().as_destination(),
                ObjectId::new(1),
                InterfaceOrdinal::new(1),
                &[],
                &mut back,
            )
            .unwrap_err();
        assert_eq!(err, ErrorCode::InvalidVersion);
    }
}
