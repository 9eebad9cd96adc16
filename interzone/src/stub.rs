//! Server-side object wrappers
//!
//! A local implementation becomes remotely addressable the first time it is
//! marshalled out: the service wraps it in an [`ObjectStub`] carrying the
//! per-caller reference ledger and a table of [`InterfaceStub`] views, one
//! per interface ordinal the callers have asked for.
//!
//! The object stub is the single ownership point for the implementation.
//! Interface views hold weak handles; while the shared total is positive
//! the stub pins the implementation, and when the shared total reaches zero
//! the pin is downgraded so that optimistic references can observe
//! liveness without preventing destruction.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use downcast_rs::{impl_downcast, DowncastSync};

use crate::codec::Encoding;
use crate::error::{ErrorCode, RpcResult};
use crate::object_proxy::ObjectProxy;
use crate::service::Service;
use crate::types::{
    CallerChannelZone, CallerZone, InterfaceDescriptor, InterfaceOrdinal, MethodId, ObjectId, ReleaseOptions,
};
use crate::version;

/// The type-erased face of every marshallable object, local or remote.
///
/// Implementations answer [`query_interface`](Self::query_interface) for
/// each interface they expose, returning a boxed typed handle (an
/// `Arc<dyn YourTrait>`); proxies answer with typed proxy handles and
/// report themselves as non-local.
pub trait CastingInterface: DowncastSync {
    /// A type-erased strong handle to this object's view for
    /// `interface_id`, or `None` if the interface is not supported.
    fn query_interface(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<Box<dyn Any + Send + Sync>>;

    /// True for in-zone implementations, false for proxies.
    fn is_local(&self) -> bool {
        true
    }

    /// For proxies: the wire capability this handle stands for.
    fn remote_descriptor(&self) -> Option<InterfaceDescriptor> {
        None
    }

    /// For proxies: the object proxy behind this handle.
    fn object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        None
    }
}

impl_downcast!(sync CastingInterface);

/// Per-dispatch context handed to interface stubs.
#[derive(Clone, Copy, Debug)]
pub struct CallContext {
    pub protocol_version: u64,
    pub encoding: Encoding,
    pub tag: u64,
    pub caller_channel_zone_id: CallerChannelZone,
    pub caller_zone_id: CallerZone,
}

/// One interface view of an object stub: demarshals a method id, invokes
/// the implementation, marshals the return.
///
/// Views hold weak handles to the implementation; the owning
/// [`ObjectStub`] is the only strong holder, so a view whose target is
/// gone surfaces `ObjectNotFound`.
pub trait InterfaceStub: Send + Sync {
    /// The ordinal of this view at a protocol version.
    fn interface_id(&self, protocol_version: u64) -> InterfaceOrdinal;

    /// Dispatch one method.
    fn call(&self, context: &CallContext, method_id: MethodId, in_buf: &[u8]) -> RpcResult<Vec<u8>>;
}

enum ImplHold {
    Strong(Arc<dyn CastingInterface>),
    Weakened(Weak<dyn CastingInterface>),
}

impl ImplHold {
    fn upgrade(&self) -> Option<Arc<dyn CastingInterface>> {
        match self {
            Self::Strong(arc) => Some(arc.clone()),
            Self::Weakened(weak) => weak.upgrade(),
        }
    }
}

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
struct CallerTally {
    shared: u64,
    optimistic: u64,
}

struct StubInner {
    implementation: ImplHold,
    interfaces: HashMap<InterfaceOrdinal, Arc<dyn InterfaceStub>>,
    ledger: HashMap<CallerZone, CallerTally>,
    shared_total: u64,
    optimistic_total: u64,
    // lifetime lock; cleared when both totals reach zero
    self_ref: Option<Arc<ObjectStub>>,
}

/// Server-side state for one remotely addressable object.
pub struct ObjectStub {
    object_id: ObjectId,
    service: Weak<Service>,
    // identity of the wrapped implementation, for marshal-out de-duping
    impl_key: usize,
    inner: Mutex<StubInner>,
}

impl ObjectStub {
    pub(crate) fn new(
        object_id: ObjectId,
        service: Weak<Service>,
        implementation: Arc<dyn CastingInterface>,
        impl_key: usize,
    ) -> Arc<Self> {
        let stub = Arc::new(Self {
            object_id,
            service,
            impl_key,
            inner: Mutex::new(StubInner {
                implementation: ImplHold::Strong(implementation),
                interfaces: HashMap::new(),
                ledger: HashMap::new(),
                shared_total: 0,
                optimistic_total: 0,
                self_ref: None,
            }),
        });
        stub.inner.lock().unwrap().self_ref = Some(stub.clone());
        stub
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub(crate) fn impl_key(&self) -> usize {
        self.impl_key
    }

    pub(crate) fn service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    /// The wrapped implementation, if it is still alive.
    pub fn castable(&self) -> Option<Arc<dyn CastingInterface>> {
        self.inner.lock().unwrap().implementation.upgrade()
    }

    /// Register an interface view under its ordinal at every supported
    /// protocol version.
    pub fn add_interface(&self, view: Arc<dyn InterfaceStub>) {
        let mut inner = self.inner.lock().unwrap();
        for protocol_version in version::LOWEST_SUPPORTED_VERSION..=version::HIGHEST_SUPPORTED_VERSION {
            let id = view.interface_id(protocol_version);
            inner.interfaces.entry(id).or_insert_with(|| view.clone());
        }
    }

    pub fn get_interface(&self, interface_id: InterfaceOrdinal) -> Option<Arc<dyn InterfaceStub>> {
        self.inner.lock().unwrap().interfaces.get(&interface_id).cloned()
    }

    pub fn has_interface(&self, interface_id: InterfaceOrdinal) -> bool {
        self.inner.lock().unwrap().interfaces.contains_key(&interface_id)
    }

    /// Dispatch a call to one of the interface views.
    ///
    /// The view is resolved under the lock, the call runs outside it so
    /// re-entrant cross-zone calls can nest.
    pub fn call(
        &self,
        context: &CallContext,
        interface_id: InterfaceOrdinal,
        method_id: MethodId,
        in_buf: &[u8],
    ) -> RpcResult<Vec<u8>> {
        let view = self.get_interface(interface_id).ok_or(ErrorCode::InvalidInterfaceId)?;
        view.call(context, method_id, in_buf)
    }

    /// Increment the ledger for `caller_zone_id`. Returns the
    /// post-increment total of the affected counter.
    pub fn add_ref(&self, caller_zone_id: CallerZone, optimistic: bool) -> RpcResult<u64> {
        let count = {
            let mut inner = self.inner.lock().unwrap();
            if optimistic {
                inner.ledger.entry(caller_zone_id).or_default().optimistic += 1;
                inner.optimistic_total += 1;
                inner.optimistic_total
            } else {
                if inner.shared_total == 0 {
                    // revive the pin; fails if the implementation is gone
                    let alive = match inner.implementation.upgrade() {
                        Some(arc) => arc,
                        None => return Err(ErrorCode::ObjectNotFound),
                    };
                    inner.implementation = ImplHold::Strong(alive);
                }
                inner.ledger.entry(caller_zone_id).or_default().shared += 1;
                inner.shared_total += 1;
                inner.shared_total
            }
        };
        if let (Some(telemetry), Some(service)) = (interzone_telemetry::get_telemetry_service(), self.service.upgrade())
        {
            let options = if optimistic { crate::types::AddRefOptions::OPTIMISTIC } else { crate::types::AddRefOptions::NORMAL };
            telemetry.on_stub_add_ref(
                service.zone_id().get(),
                self.object_id.get(),
                caller_zone_id.get(),
                count,
                options.bits(),
            );
        }
        Ok(count)
    }

    /// Decrement the ledger for `caller_zone_id`.
    ///
    /// Returns the post-decrement total of the affected counter and, when
    /// both totals reached zero, the taken lifetime lock. The caller must
    /// drop that lock outside any registry lock; doing so runs the stub
    /// destructor once in-flight calls drain.
    pub fn release(
        &self,
        caller_zone_id: CallerZone,
        options: ReleaseOptions,
    ) -> RpcResult<(u64, Option<Arc<ObjectStub>>)> {
        let (count, lock) = self.inner_release(caller_zone_id, options)?;
        if let (Some(telemetry), Some(service)) = (interzone_telemetry::get_telemetry_service(), self.service.upgrade())
        {
            telemetry.on_stub_release(
                service.zone_id().get(),
                self.object_id.get(),
                caller_zone_id.get(),
                count,
                options.bits(),
            );
        }
        Ok((count, lock))
    }

    fn inner_release(
        &self,
        caller_zone_id: CallerZone,
        options: ReleaseOptions,
    ) -> RpcResult<(u64, Option<Arc<ObjectStub>>)> {
        let mut inner = self.inner.lock().unwrap();
        let tally = inner.ledger.get_mut(&caller_zone_id).ok_or(ErrorCode::ReferenceCountError)?;
        let count = if options.is_optimistic() {
            if tally.optimistic == 0 {
                return Err(ErrorCode::ReferenceCountError);
            }
            tally.optimistic -= 1;
            if *tally == CallerTally::default() {
                inner.ledger.remove(&caller_zone_id);
            }
            inner.optimistic_total -= 1;
            inner.optimistic_total
        } else {
            if tally.shared == 0 {
                return Err(ErrorCode::ReferenceCountError);
            }
            tally.shared -= 1;
            if *tally == CallerTally::default() {
                inner.ledger.remove(&caller_zone_id);
            }
            inner.shared_total -= 1;
            if inner.shared_total == 0 {
                // stop pinning the implementation; optimistic holders can
                // still observe it while something else keeps it alive
                if let ImplHold::Strong(arc) = &inner.implementation {
                    let unpinned = ImplHold::Weakened(Arc::downgrade(arc));
                    inner.implementation = unpinned;
                }
            }
            inner.shared_total
        };
        let lock = if inner.shared_total == 0 && inner.optimistic_total == 0 {
            inner.self_ref.take()
        } else {
            None
        };
        Ok((count, lock))
    }

    /// Ledger entry for one caller zone, `(shared, optimistic)`.
    pub fn counts_for(&self, caller_zone_id: CallerZone) -> Option<(u64, u64)> {
        let inner = self.inner.lock().unwrap();
        inner.ledger.get(&caller_zone_id).map(|tally| (tally.shared, tally.optimistic))
    }

    /// `(shared_total, optimistic_total)`.
    pub fn totals(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.shared_total, inner.optimistic_total)
    }
}

impl Drop for ObjectStub {
    fn drop(&mut self) {
        if let Some(service) = self.service.upgrade() {
            service.unregister_stub(self.object_id, self.impl_key);
            if let Some(telemetry) = interzone_telemetry::get_telemetry_service() {
                telemetry.on_stub_deletion(service.zone_id().get(), self.object_id.get());
            }
        }
    }
}

impl std::fmt::Debug for ObjectStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (shared, optimistic) = self.totals();
        f.debug_struct("ObjectStub")
            .field("object_id", &self.object_id)
            .field("shared", &shared)
            .field("optimistic", &optimistic)
            .finish_non_exhaustive()
    }
}
