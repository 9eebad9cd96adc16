//! Client-side handle for one remote object
//!
//! An [`ObjectProxy`] owns exactly one remote shared reference (its
//! baseline, established by whichever creation rule built it) plus one
//! remote optimistic reference per outstanding optimistic view. Local
//! handles are counted in two atomics; the 1→0 transition of either
//! counter notifies the owning service proxy so the peer's stub ledger
//! stays in lock-step, and the destructor surfaces whatever the proxy
//! still owns (its unreleased baseline and any references inherited from
//! a collapsed predecessor).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::bindings::Interface;
use crate::codec::Encoding;
use crate::error::{ErrorCode, RpcResult};
use crate::service_proxy::{PendingReleases, ServiceProxy};
use crate::stub::CastingInterface;
use crate::types::{DestinationZone, InterfaceDescriptor, InterfaceOrdinal, MethodId, ObjectId};
use crate::version;

/// Client-side state for one `(service proxy, object id)` pair.
pub struct ObjectProxy {
    object_id: ObjectId,
    service_proxy: Arc<ServiceProxy>,
    shared_count: AtomicU64,
    optimistic_count: AtomicU64,
    // remote references taken over from a predecessor proxy that collapsed
    // while this one was already live
    inherited_shared: AtomicU64,
    inherited_optimistic: AtomicU64,
    baseline_released: AtomicBool,
    interfaces: Mutex<HashMap<InterfaceOrdinal, Weak<dyn CastingInterface>>>,
}

impl ObjectProxy {
    pub(crate) fn new(object_id: ObjectId, service_proxy: Arc<ServiceProxy>) -> Arc<Self> {
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_object_proxy_creation(
                service_proxy.zone_id().get(),
                service_proxy.destination_zone_id().get(),
                object_id.get(),
            );
        }
        Arc::new(Self {
            object_id,
            service_proxy,
            shared_count: AtomicU64::new(0),
            optimistic_count: AtomicU64::new(0),
            inherited_shared: AtomicU64::new(0),
            inherited_optimistic: AtomicU64::new(0),
            // owns nothing until a creation rule grants or acquires the baseline
            baseline_released: AtomicBool::new(true),
            interfaces: Mutex::new(HashMap::new()),
        })
    }

    /// Record that this proxy now owns its remote baseline reference.
    pub(crate) fn assume_baseline(&self) {
        self.baseline_released.store(false, Ordering::Release);
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn service_proxy(&self) -> &Arc<ServiceProxy> {
        &self.service_proxy
    }

    pub fn destination_zone_id(&self) -> DestinationZone {
        self.service_proxy.destination_zone_id()
    }

    pub fn descriptor(&self) -> InterfaceDescriptor {
        InterfaceDescriptor::new(self.object_id, self.destination_zone_id())
    }

    /// `(shared, optimistic)` local handle counts.
    pub fn counts(&self) -> (u64, u64) {
        (self.shared_count.load(Ordering::Acquire), self.optimistic_count.load(Ordering::Acquire))
    }

    /// Invoke a method on the remote object.
    ///
    /// The interface ordinal is supplied as a version-indexed getter so the
    /// channel can probe downward when the peer rejects the current
    /// protocol version.
    pub fn send(
        &self,
        encoding: Encoding,
        tag: u64,
        interface_id_for: &dyn Fn(u64) -> InterfaceOrdinal,
        method_id: MethodId,
        in_buf: &[u8],
    ) -> RpcResult<Vec<u8>> {
        self.service_proxy.sp_send(encoding, tag, self.object_id, interface_id_for, method_id, in_buf)
    }

    /// Ask the remote zone whether the object supports another interface.
    pub fn try_cast(&self, interface_id_for: &dyn Fn(u64) -> InterfaceOrdinal) -> RpcResult<()> {
        self.service_proxy.sp_try_cast(self.destination_zone_id(), self.object_id, interface_id_for)
    }

    /// Resolve (or lazily create) the typed interface view for `I`.
    ///
    /// With `do_remote_check` the remote zone is consulted via `try_cast`
    /// before a view for a previously unseen interface is materialised.
    pub fn query_interface<I: Interface>(self: &Arc<Self>, do_remote_check: bool) -> RpcResult<I::Handle> {
        let ordinal = I::interface_id(version::current_version());
        {
            let cache = self.interfaces.lock().unwrap();
            if let Some(live) = cache.get(&ordinal).and_then(Weak::upgrade) {
                return I::from_casting(&live).ok_or(ErrorCode::InvalidInterfaceId);
            }
        }
        if do_remote_check {
            self.try_cast(&I::interface_id)?;
        }
        // building the proxy may acquire a remote reference; keep the
        // cache lock out of that
        let handle = I::make_proxy(self, RefMode::Shared)?;
        let mut cache = self.interfaces.lock().unwrap();
        if let Some(live) = cache.get(&ordinal).and_then(Weak::upgrade) {
            drop(cache);
            return I::from_casting(&live).ok_or(ErrorCode::InvalidInterfaceId);
        }
        cache.insert(ordinal, Arc::downgrade(&I::as_casting(&handle)));
        Ok(handle)
    }

    /// Count one more local handle.
    ///
    /// The first shared handle rides on the proxy's baseline; a shared
    /// revival after the baseline was released, and every first optimistic
    /// handle, acquire a fresh remote reference.
    pub(crate) fn add_local_ref(self: &Arc<Self>, mode: RefMode) -> RpcResult<()> {
        match mode {
            RefMode::Shared => {
                let previous = self.shared_count.fetch_add(1, Ordering::AcqRel);
                if previous == 0 && self.baseline_released.load(Ordering::Acquire) {
                    match self.service_proxy.acquire_remote_ref(self.object_id, false) {
                        Ok(()) => self.baseline_released.store(false, Ordering::Release),
                        Err(err) => {
                            self.shared_count.fetch_sub(1, Ordering::AcqRel);
                            return Err(err);
                        }
                    }
                }
            }
            RefMode::Optimistic => {
                let previous = self.optimistic_count.fetch_add(1, Ordering::AcqRel);
                if previous == 0 {
                    if let Err(err) = self.service_proxy.acquire_remote_ref(self.object_id, true) {
                        self.optimistic_count.fetch_sub(1, Ordering::AcqRel);
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop one local handle; the 1→0 transition hands the matching remote
    /// reference back through the owning service proxy.
    pub(crate) fn release_local_ref(self: &Arc<Self>, mode: RefMode) {
        match mode {
            RefMode::Shared => {
                let previous = self.shared_count.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(previous > 0, "shared handle count underflow");
                if previous == 1 && !self.baseline_released.swap(true, Ordering::AcqRel) {
                    let still_optimistic = self.optimistic_count.load(Ordering::Acquire) > 0;
                    ServiceProxy::on_object_proxy_released(
                        &self.service_proxy,
                        self.object_id,
                        PendingReleases { normal: 1, ..PendingReleases::default() },
                        Some(self),
                        still_optimistic,
                    );
                }
            }
            RefMode::Optimistic => {
                let previous = self.optimistic_count.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(previous > 0, "optimistic handle count underflow");
                if previous == 1 {
                    let still_shared = self.shared_count.load(Ordering::Acquire) > 0;
                    ServiceProxy::on_object_proxy_released(
                        &self.service_proxy,
                        self.object_id,
                        PendingReleases { optimistic: 1, ..PendingReleases::default() },
                        Some(self),
                        still_shared,
                    );
                }
            }
        }
    }

    /// Take over remote references from a collapsing predecessor.
    pub(crate) fn inherit(&self, shared: u64, optimistic: u64) {
        self.inherited_shared.fetch_add(shared, Ordering::AcqRel);
        self.inherited_optimistic.fetch_add(optimistic, Ordering::AcqRel);
    }

    pub(crate) fn mark_baseline_released(&self) -> bool {
        !self.baseline_released.swap(true, Ordering::AcqRel)
    }
}

impl Drop for ObjectProxy {
    fn drop(&mut self) {
        let pending = PendingReleases {
            normal: u64::from(!self.baseline_released.load(Ordering::Acquire)),
            optimistic: 0,
            inherited_shared: self.inherited_shared.load(Ordering::Acquire),
            inherited_optimistic: self.inherited_optimistic.load(Ordering::Acquire),
        };
        self.service_proxy.on_object_proxy_destroyed(self.object_id, pending);
        if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
            telemetry.on_object_proxy_deletion(
                self.service_proxy.zone_id().get(),
                self.service_proxy.destination_zone_id().get(),
                self.object_id.get(),
            );
        }
    }
}

impl std::fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (shared, optimistic) = self.counts();
        f.debug_struct("ObjectProxy")
            .field("object_id", &self.object_id)
            .field("destination_zone", &self.destination_zone_id())
            .field("shared", &shared)
            .field("optimistic", &optimistic)
            .finish()
    }
}

/// Whether a handle keeps the remote object alive or merely observes it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefMode {
    Shared,
    Optimistic,
}

/// The counted core every typed interface proxy embeds.
///
/// Construction counts a local handle on the object proxy (acquiring a
/// remote reference where the mode requires one); dropping it releases the
/// same handle. A shared-mode base keeps the remote object alive, an
/// optimistic-mode base only observes it.
pub struct ProxyBase {
    object_proxy: Arc<ObjectProxy>,
    mode: RefMode,
}

impl ProxyBase {
    pub fn new(object_proxy: Arc<ObjectProxy>, mode: RefMode) -> RpcResult<Self> {
        object_proxy.add_local_ref(mode)?;
        Ok(Self { object_proxy, mode })
    }

    pub fn object_proxy(&self) -> &Arc<ObjectProxy> {
        &self.object_proxy
    }

    pub fn mode(&self) -> RefMode {
        self.mode
    }

    pub fn descriptor(&self) -> InterfaceDescriptor {
        self.object_proxy.descriptor()
    }

    /// Convenience passthrough for generated proxy methods.
    pub fn send(
        &self,
        encoding: Encoding,
        tag: u64,
        interface_id_for: &dyn Fn(u64) -> InterfaceOrdinal,
        method_id: MethodId,
        in_buf: &[u8],
    ) -> RpcResult<Vec<u8>> {
        self.object_proxy.send(encoding, tag, interface_id_for, method_id, in_buf)
    }
}

impl Drop for ProxyBase {
    fn drop(&mut self) {
        self.object_proxy.release_local_ref(self.mode);
    }
}

impl std::fmt::Debug for ProxyBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyBase")
            .field("object", &self.object_proxy.object_id())
            .field("mode", &self.mode)
            .finish()
    }
}
