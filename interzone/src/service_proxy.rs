//! Per-peer outbound channel
//!
//! A [`ServiceProxy`] is the client side of one `(destination zone, caller
//! zone)` peering: it caches object proxies, negotiates the protocol
//! version downward, and pins itself alive — via the external-ref gate —
//! for as long as its zone owns any remote reference reachable through it.
//!
//! The transport-specific behaviour lives behind the [`ProxyChannel`]
//! trait; cloning a proxy for another route shares the channel and only
//! relabels the addressing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::codec::Encoding;
use crate::error::{ErrorCode, RpcResult};
use crate::object_proxy::ObjectProxy;
use crate::service::Service;
use crate::transport::{BackChannel, BackChannelEntry, Marshaller};
use crate::types::{
    AddRefOptions, CallerChannelZone, CallerZone, DestinationChannelZone, DestinationZone, InterfaceDescriptor,
    InterfaceOrdinal, KnownDirectionZone, MethodId, ObjectId, ReleaseOptions, Zone,
};
use crate::version;

/// The transport-facing half of a service proxy.
///
/// Implementations deliver the five marshalling operations to the peer
/// zone; `connect` bootstraps a fresh channel and is only invoked on
/// proxies created by `connect_to_zone`.
pub trait ProxyChannel: Marshaller {
    fn connect(&self, input_descr: InterfaceDescriptor) -> RpcResult<InterfaceDescriptor> {
        let _ = input_descr;
        Err(ErrorCode::ZoneNotSupported)
    }
}

/// How `get_or_create_object_proxy` balances remote reference counts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectProxyCreationRule {
    /// The caller is marshalling an in-parameter: a freshly created proxy
    /// must acquire its own remote reference.
    AddRefIfNew,
    /// The caller is demarshalling an out-parameter the remote already
    /// add-ref'd for it: a fresh proxy inherits that grant, an existing
    /// one releases the duplicate to rebalance.
    ReleaseIfNotNew,
    /// Plain demarshalling with the grant implied (connect bootstrap); no
    /// wire traffic either way.
    DoNothing,
}

/// Remote references a collapsing object proxy still has to answer for.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct PendingReleases {
    /// The proxy's own baseline shared reference (0 or 1).
    pub normal: u64,
    /// The proxy's own optimistic reference (0 or 1).
    pub optimistic: u64,
    /// Shared references inherited from a predecessor.
    pub inherited_shared: u64,
    /// Optimistic references inherited from a predecessor.
    pub inherited_optimistic: u64,
}

impl PendingReleases {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

struct ProxyState {
    proxies: HashMap<ObjectId, Weak<ObjectProxy>>,
    external_ref_count: u64,
    // strong self-reference held while the gate is open or the channel is
    // pinned as a parent channel
    lifetime_lock: Option<Arc<ServiceProxy>>,
    is_parent_channel: bool,
    is_responsible_for_cleaning_up_service: bool,
}

/// Client-side state for one `(destination zone, caller zone)` peering.
pub struct ServiceProxy {
    name: String,
    zone_id: Zone,
    destination_zone_id: DestinationZone,
    destination_channel_zone: DestinationChannelZone,
    caller_zone_id: CallerZone,
    version: AtomicU64,
    service: Weak<Service>,
    channel: Arc<dyn ProxyChannel>,
    state: Mutex<ProxyState>,
}

impl ServiceProxy {
    pub fn new(
        name: &str,
        destination_zone_id: DestinationZone,
        service: &Arc<Service>,
        channel: Arc<dyn ProxyChannel>,
    ) -> Arc<Self> {
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_service_proxy_creation(
                name,
                service.zone_id().get(),
                destination_zone_id.get(),
                service.zone_id().get(),
            );
        }
        Arc::new(Self {
            name: name.to_owned(),
            zone_id: service.zone_id(),
            destination_zone_id,
            destination_channel_zone: DestinationChannelZone::default(),
            caller_zone_id: service.zone_id().as_caller(),
            version: AtomicU64::new(version::current_version()),
            service: Arc::downgrade(service),
            channel,
            state: Mutex::new(ProxyState {
                proxies: HashMap::new(),
                external_ref_count: 0,
                lifetime_lock: None,
                is_parent_channel: false,
                is_responsible_for_cleaning_up_service: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zone_id(&self) -> Zone {
        self.zone_id
    }

    pub fn destination_zone_id(&self) -> DestinationZone {
        self.destination_zone_id
    }

    pub fn destination_channel_zone(&self) -> DestinationChannelZone {
        self.destination_channel_zone
    }

    pub fn caller_zone_id(&self) -> CallerZone {
        self.caller_zone_id
    }

    /// The service operating in this proxy's own zone.
    pub fn operating_zone_service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    pub(crate) fn channel(&self) -> &Arc<dyn ProxyChannel> {
        &self.channel
    }

    /// The channel's currently negotiated protocol version.
    pub fn negotiated_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Clamp the remote version into the supported range (used by channel
    /// bootstrap once the peer announces what it speaks).
    pub fn update_remote_version(&self, remote_version: u64) {
        self.version.store(version::clamp(remote_version), Ordering::Release);
    }

    pub fn is_parent_channel(&self) -> bool {
        self.state.lock().unwrap().is_parent_channel
    }

    pub fn external_ref_count(&self) -> u64 {
        self.state.lock().unwrap().external_ref_count
    }

    /// Number of live object proxies in the cache.
    pub fn proxy_count(&self) -> usize {
        self.state.lock().unwrap().proxies.values().filter(|weak| weak.strong_count() > 0).count()
    }

    /// Pin (or unpin) this proxy as the zone's parent channel. Parent
    /// channels stay alive until explicit teardown even with the gate at
    /// zero.
    pub fn set_parent_channel(self: &Arc<Self>, pinned: bool) {
        let unlock = {
            let mut state = self.state.lock().unwrap();
            state.is_parent_channel = pinned;
            if pinned {
                if state.lifetime_lock.is_none() {
                    state.lifetime_lock = Some(self.clone());
                }
                None
            } else if state.external_ref_count == 0 {
                state.lifetime_lock.take()
            } else {
                None
            }
        };
        drop(unlock);
    }

    pub(crate) fn set_responsible_for_cleanup(&self, responsible: bool) {
        self.state.lock().unwrap().is_responsible_for_cleaning_up_service = responsible;
    }

    /// Open the gate: while the count is positive the proxy holds a strong
    /// reference to itself and cannot be reaped.
    pub fn add_external_ref(self: &Arc<Self>) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.external_ref_count += 1;
        let count = state.external_ref_count;
        if count == 1 && state.lifetime_lock.is_none() {
            state.lifetime_lock = Some(self.clone());
        }
        drop(state);
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_service_proxy_add_external_ref(
                self.zone_id.get(),
                self.destination_zone_id.get(),
                self.caller_zone_id.get(),
                count,
            );
        }
        count
    }

    /// Close the gate by one. At zero (and not parent-pinned) the
    /// self-reference is dropped and the proxy may be reaped.
    pub fn release_external_ref(&self) -> u64 {
        let (count, unlock) = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.external_ref_count > 0, "external ref underflow");
            state.external_ref_count = state.external_ref_count.saturating_sub(1);
            let count = state.external_ref_count;
            let unlock = if count == 0 && !state.is_parent_channel { state.lifetime_lock.take() } else { None };
            (count, unlock)
        };
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_service_proxy_release_external_ref(
                self.zone_id.get(),
                self.destination_zone_id.get(),
                self.caller_zone_id.get(),
                count,
            );
        }
        // the self-reference may be the last one; drop it outside the lock
        drop(unlock);
        count
    }

    /// Bootstrap the channel; only meaningful on freshly created proxies.
    pub fn connect(&self, input_descr: InterfaceDescriptor) -> RpcResult<InterfaceDescriptor> {
        self.channel.connect(input_descr)
    }

    /// Structural clone re-targeting this proxy at another route over the
    /// same channel.
    pub fn clone_for_zone(
        self: &Arc<Self>,
        destination_zone_id: DestinationZone,
        caller_zone_id: CallerZone,
    ) -> Arc<Self> {
        debug_assert!(
            !(self.destination_zone_id == destination_zone_id && self.caller_zone_id == caller_zone_id),
            "cloning a proxy onto its own route"
        );
        let destination_channel_zone = if self.destination_zone_id == destination_zone_id {
            self.destination_channel_zone
        } else if self.destination_channel_zone.is_set() {
            self.destination_channel_zone
        } else {
            self.destination_zone_id.as_destination_channel()
        };
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_cloned_service_proxy_creation(
                &self.name,
                self.zone_id.get(),
                destination_zone_id.get(),
                caller_zone_id.get(),
            );
        }
        Arc::new(Self {
            name: self.name.clone(),
            zone_id: self.zone_id,
            destination_zone_id,
            destination_channel_zone,
            caller_zone_id,
            version: AtomicU64::new(self.negotiated_version()),
            service: self.service.clone(),
            channel: self.channel.clone(),
            state: Mutex::new(ProxyState {
                proxies: HashMap::new(),
                external_ref_count: 0,
                lifetime_lock: None,
                is_parent_channel: false,
                is_responsible_for_cleaning_up_service: false,
            }),
        })
    }

    /// Version-clamped outbound call: above the agreed version fails, below
    /// it ratchets the channel down.
    #[allow(clippy::too_many_arguments)]
    pub fn send_from_this_zone(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        method_id: MethodId,
        in_buf: &[u8],
    ) -> RpcResult<Vec<u8>> {
        if protocol_version < version::LOWEST_SUPPORTED_VERSION || protocol_version > version::HIGHEST_SUPPORTED_VERSION {
            return Err(ErrorCode::InvalidVersion);
        }
        let current = self.version.load(Ordering::Acquire);
        if protocol_version > current {
            return Err(ErrorCode::InvalidVersion);
        }
        if protocol_version < current {
            self.version.store(protocol_version, Ordering::Release);
        }
        let mut back_out = BackChannel::new();
        self.channel.send(
            protocol_version,
            encoding,
            tag,
            self.zone_id.as_caller_channel(),
            self.caller_zone_id,
            self.destination_zone_id,
            object_id,
            interface_id,
            method_id,
            in_buf,
            &[],
            &mut back_out,
        )
    }

    fn probe<T>(&self, mut attempt: impl FnMut(u64) -> RpcResult<T>) -> RpcResult<T> {
        let floor = version::LOWEST_SUPPORTED_VERSION.max(1);
        let original = self.version.load(Ordering::Acquire);
        let mut probe_version = original;
        loop {
            let result = attempt(probe_version);
            match result {
                Err(ErrorCode::InvalidVersion) | Err(ErrorCode::IncompatibleService) if probe_version > floor => {
                    probe_version -= 1;
                }
                other => {
                    if other.is_ok() && probe_version != original {
                        let _ = self.version.compare_exchange(
                            original,
                            probe_version,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                    return other;
                }
            }
        }
    }

    /// Probing call: retries downward on version mismatch, recomputing the
    /// interface ordinal for each attempted version.
    pub fn sp_send(
        &self,
        encoding: Encoding,
        tag: u64,
        object_id: ObjectId,
        interface_id_for: &dyn Fn(u64) -> InterfaceOrdinal,
        method_id: MethodId,
        in_buf: &[u8],
    ) -> RpcResult<Vec<u8>> {
        self.probe(|probe_version| {
            let mut back_out = BackChannel::new();
            self.channel.send(
                probe_version,
                encoding,
                tag,
                self.zone_id.as_caller_channel(),
                self.caller_zone_id,
                self.destination_zone_id,
                object_id,
                interface_id_for(probe_version),
                method_id,
                in_buf,
                &[],
                &mut back_out,
            )
        })
    }

    /// Probing `try_cast`.
    pub fn sp_try_cast(
        &self,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        interface_id_for: &dyn Fn(u64) -> InterfaceOrdinal,
    ) -> RpcResult<()> {
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_service_try_cast(
                self.zone_id.get(),
                destination_zone_id.get(),
                object_id.get(),
                interface_id_for(self.negotiated_version()).get(),
            );
        }
        self.probe(|probe_version| {
            let mut back_out = BackChannel::new();
            self.channel.try_cast(
                probe_version,
                destination_zone_id,
                object_id,
                interface_id_for(probe_version),
                &[],
                &mut back_out,
            )
        })
    }

    /// Probing `add_ref` along this proxy's route.
    pub fn sp_add_ref(
        &self,
        object_id: ObjectId,
        caller_channel_zone_id: CallerChannelZone,
        options: AddRefOptions,
        known_direction_zone_id: KnownDirectionZone,
    ) -> RpcResult<u64> {
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_service_proxy_add_ref(
                self.zone_id.get(),
                self.destination_zone_id.get(),
                object_id.get(),
                options.bits(),
            );
        }
        self.probe(|probe_version| {
            let mut back_out = BackChannel::new();
            self.channel.add_ref(
                probe_version,
                self.destination_channel_zone,
                self.destination_zone_id,
                object_id,
                caller_channel_zone_id,
                self.caller_zone_id,
                known_direction_zone_id,
                options,
                &[],
                &mut back_out,
            )
        })
    }

    /// Probing `release` along this proxy's route.
    pub fn sp_release(&self, object_id: ObjectId, options: ReleaseOptions) -> RpcResult<u64> {
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_service_proxy_release(
                self.zone_id.get(),
                self.destination_zone_id.get(),
                object_id.get(),
                options.bits(),
            );
        }
        self.probe(|probe_version| {
            let mut back_out = BackChannel::new();
            self.channel.release(
                probe_version,
                self.destination_zone_id,
                object_id,
                self.caller_zone_id,
                options,
                &[],
                &mut back_out,
            )
        })
    }

    /// Acquire one remote reference on behalf of an object proxy and open
    /// the gate for it.
    pub(crate) fn acquire_remote_ref(self: &Arc<Self>, object_id: ObjectId, optimistic: bool) -> RpcResult<()> {
        let options = if optimistic { AddRefOptions::OPTIMISTIC } else { AddRefOptions::NORMAL };
        self.sp_add_ref(object_id, CallerChannelZone::default(), options, KnownDirectionZone::default())?;
        self.add_external_ref();
        Ok(())
    }

    /// Look up an object proxy without creating one.
    pub fn get_object_proxy(&self, object_id: ObjectId) -> Option<Arc<ObjectProxy>> {
        self.state.lock().unwrap().proxies.get(&object_id).and_then(Weak::upgrade)
    }

    /// The critical-section boundary of the client state: resolve or
    /// create the object proxy for `object_id` and settle the remote
    /// reference count according to `rule`.
    ///
    /// The map is manipulated under the lock; the remote call happens
    /// after it is released, with a strong self-reference (the `self` Arc
    /// borrowed by the caller) spanning the call.
    pub fn get_or_create_object_proxy(
        self: &Arc<Self>,
        object_id: ObjectId,
        rule: ObjectProxyCreationRule,
        new_proxy_added: bool,
        known_direction_zone_id: KnownDirectionZone,
    ) -> RpcResult<Arc<ObjectProxy>> {
        let (object_proxy, is_new) = {
            let mut state = self.state.lock().unwrap();
            match state.proxies.get(&object_id).and_then(Weak::upgrade) {
                Some(existing) => (existing, false),
                None => {
                    let created = ObjectProxy::new(object_id, self.clone());
                    state.proxies.insert(object_id, Arc::downgrade(&created));
                    (created, true)
                }
            }
        };

        match rule {
            ObjectProxyCreationRule::AddRefIfNew if is_new => {
                log::debug!(
                    "new object proxy acquiring baseline: zone={} dest={} object={} fresh_route={new_proxy_added}",
                    self.zone_id,
                    self.destination_zone_id,
                    object_id
                );
                match self.sp_add_ref(
                    object_id,
                    CallerChannelZone::default(),
                    AddRefOptions::NORMAL,
                    known_direction_zone_id,
                ) {
                    Ok(_) => {
                        object_proxy.assume_baseline();
                        self.add_external_ref();
                    }
                    Err(err) => {
                        log::error!(
                            "add_ref for new object proxy failed: zone={} dest={} object={} err={err}",
                            self.zone_id,
                            self.destination_zone_id,
                            object_id
                        );
                        let mut state = self.state.lock().unwrap();
                        if let Some(weak) = state.proxies.get(&object_id) {
                            if weak.as_ptr() == Arc::as_ptr(&object_proxy) {
                                state.proxies.remove(&object_id);
                            }
                        }
                        return Err(err);
                    }
                }
            }
            ObjectProxyCreationRule::ReleaseIfNotNew if is_new => {
                // inherit the reference the remote added for us
                object_proxy.assume_baseline();
                self.add_external_ref();
            }
            ObjectProxyCreationRule::ReleaseIfNotNew => {
                // the callee add-ref'd an object we already hold; release
                // the duplicate to rebalance
                if let Err(err) = self.sp_release(object_id, ReleaseOptions::NORMAL) {
                    log::error!(
                        "rebalancing release failed: zone={} dest={} object={} err={err}",
                        self.zone_id,
                        self.destination_zone_id,
                        object_id
                    );
                }
            }
            ObjectProxyCreationRule::DoNothing if is_new => {
                // the grant is implied by the descriptor exchange
                object_proxy.assume_baseline();
                self.add_external_ref();
            }
            _ => {}
        }
        Ok(object_proxy)
    }

    /// Settle the books when an object proxy's counter hits zero or its
    /// destructor runs.
    ///
    /// If a recreated live proxy for the same object id exists, the
    /// pending references transfer to it instead of being released
    /// remotely. Otherwise the matching releases are issued in the order
    /// shared-normal → optimistic → inherited, each closing the gate by
    /// one. The 1→0 release reaches the peer before the map entry goes.
    pub(crate) fn on_object_proxy_released(
        self_: &Arc<Self>,
        object_id: ObjectId,
        pending: PendingReleases,
        source: Option<&Arc<ObjectProxy>>,
        keep_in_map: bool,
    ) {
        {
            let state = self_.state.lock().unwrap();
            if let Some(existing) = state.proxies.get(&object_id).and_then(Weak::upgrade) {
                let is_self = source.map(|src| Arc::ptr_eq(&existing, src)).unwrap_or(false);
                if !is_self {
                    // recreated after this one went weak; hand everything over
                    log::debug!(
                        "transferring {:?} for object {} to recreated proxy (zone={} dest={})",
                        pending,
                        object_id,
                        self_.zone_id,
                        self_.destination_zone_id
                    );
                    existing.inherit(
                        pending.normal + pending.inherited_shared,
                        pending.optimistic + pending.inherited_optimistic,
                    );
                    drop(state);
                    drop(existing);
                    return;
                }
            }
        }

        self_.issue_releases(object_id, pending);

        let mut state = self_.state.lock().unwrap();
        match state.proxies.get(&object_id) {
            Some(weak) => {
                let still_self = match source {
                    Some(src) => weak.as_ptr() == Arc::as_ptr(src),
                    // destructor: the entry is ours iff it no longer upgrades
                    None => weak.strong_count() == 0,
                };
                if still_self && !keep_in_map {
                    state.proxies.remove(&object_id);
                }
            }
            None => {}
        }
    }

    /// Destructor-path entry point; see `on_object_proxy_released`.
    pub(crate) fn on_object_proxy_destroyed(&self, object_id: ObjectId, pending: PendingReleases) {
        {
            let state = self.state.lock().unwrap();
            if let Some(existing) = state.proxies.get(&object_id).and_then(Weak::upgrade) {
                // a recreated proxy took the slot; it answers for the rest
                existing.inherit(
                    pending.normal + pending.inherited_shared,
                    pending.optimistic + pending.inherited_optimistic,
                );
                return;
            }
        }

        if !pending.is_empty() {
            self.issue_releases(object_id, pending);
        }

        let mut state = self.state.lock().unwrap();
        if let Some(weak) = state.proxies.get(&object_id) {
            if weak.strong_count() == 0 {
                state.proxies.remove(&object_id);
            }
        }
    }

    fn issue_releases(&self, object_id: ObjectId, pending: PendingReleases) {
        let plan = [
            (pending.normal, ReleaseOptions::NORMAL),
            (pending.optimistic, ReleaseOptions::OPTIMISTIC),
            (pending.inherited_optimistic, ReleaseOptions::OPTIMISTIC),
            (pending.inherited_shared, ReleaseOptions::NORMAL),
        ];
        for (count, options) in plan {
            for _ in 0..count {
                match self.sp_release(object_id, options) {
                    Ok(_) => {
                        self.release_external_ref();
                    }
                    Err(err) => {
                        log::error!(
                            "release failed during object proxy cleanup: zone={} dest={} object={} err={err}",
                            self.zone_id,
                            self.destination_zone_id,
                            object_id
                        );
                        debug_assert!(
                            matches!(
                                err,
                                ErrorCode::TransportError
                                    | ErrorCode::ServiceProxyLostConnection
                                    | ErrorCode::CallCancelled
                            ),
                            "accounting failure in cleanup: {err}"
                        );
                        return;
                    }
                }
            }
        }
    }
}

impl Drop for ServiceProxy {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        if !state.proxies.is_empty() {
            let live = state.proxies.values().filter(|weak| weak.strong_count() > 0).count();
            if live > 0 {
                log::warn!(
                    "service proxy dropped with {live} live object proxies: zone={} dest={} caller={}",
                    self.zone_id,
                    self.destination_zone_id,
                    self.caller_zone_id
                );
            }
        }
        if state.is_responsible_for_cleaning_up_service {
            if let Some(service) = self.service.upgrade() {
                service.remove_zone_proxy(self.destination_zone_id, self.caller_zone_id);
            }
        }
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_service_proxy_deletion(
                self.zone_id.get(),
                self.destination_zone_id.get(),
                self.caller_zone_id.get(),
            );
        }
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("name", &self.name)
            .field("zone", &self.zone_id)
            .field("destination_zone", &self.destination_zone_id)
            .field("destination_channel_zone", &self.destination_channel_zone)
            .field("caller_zone", &self.caller_zone_id)
            .field("version", &self.negotiated_version())
            .finish_non_exhaustive()
    }
}

/// Forward a drained back-channel entry into the local service.
pub(crate) fn apply_back_channel(service: &Arc<Service>, entries: &[BackChannelEntry]) {
    for entry in entries {
        let mut back_out = BackChannel::new();
        if let Err(err) = service.release(
            version::current_version(),
            entry.destination_zone_id,
            entry.object_id,
            entry.caller_zone_id,
            entry.options,
            &[],
            &mut back_out,
        ) {
            log::warn!(
                "piggybacked release failed: dest={} object={} caller={} err={err}",
                entry.destination_zone_id,
                entry.object_id,
                entry.caller_zone_id
            );
        }
    }
}
