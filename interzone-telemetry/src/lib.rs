//! Telemetry hooks for the interzone runtime
//!
//! The runtime reports lifecycle and reference-count events through the
//! [`TelemetryService`] trait. Implementations are pure observers and must
//! not call back into the runtime. All identifiers arrive as raw `u64`
//! values so that this crate does not depend on the runtime itself.

use std::sync::{Arc, OnceLock};

/// Process-wide telemetry sink.
static TELEMETRY: OnceLock<Arc<dyn TelemetryService>> = OnceLock::new();

/// Install the process-wide telemetry sink.
///
/// Returns `false` if a sink was already installed; the first installation
/// wins for the lifetime of the process.
pub fn set_telemetry_service(service: Arc<dyn TelemetryService>) -> bool {
    TELEMETRY.set(service).is_ok()
}

/// The currently installed telemetry sink, if any.
pub fn get_telemetry_service() -> Option<&'static Arc<dyn TelemetryService>> {
    TELEMETRY.get()
}

/// Observer interface for runtime events.
///
/// Every method has a no-op default so sinks only implement what they care
/// about. Zone, object, interface and method identifiers are raw `u64`s;
/// `0` means unset.
#[allow(unused_variables)]
pub trait TelemetryService: Send + Sync {
    fn on_service_creation(&self, name: &str, zone_id: u64, parent_zone_id: u64) {}
    fn on_service_deletion(&self, zone_id: u64) {}
    fn on_service_try_cast(&self, zone_id: u64, destination_zone_id: u64, object_id: u64, interface_id: u64) {}
    fn on_service_add_ref(&self, zone_id: u64, destination_zone_id: u64, object_id: u64, caller_zone_id: u64, options: u8) {
    }
    fn on_service_release(&self, zone_id: u64, destination_zone_id: u64, object_id: u64, caller_zone_id: u64, options: u8) {
    }

    fn on_service_proxy_creation(&self, name: &str, zone_id: u64, destination_zone_id: u64, caller_zone_id: u64) {}
    fn on_cloned_service_proxy_creation(&self, name: &str, zone_id: u64, destination_zone_id: u64, caller_zone_id: u64) {
    }
    fn on_service_proxy_deletion(&self, zone_id: u64, destination_zone_id: u64, caller_zone_id: u64) {}
    fn on_service_proxy_add_ref(&self, zone_id: u64, destination_zone_id: u64, object_id: u64, options: u8) {}
    fn on_service_proxy_release(&self, zone_id: u64, destination_zone_id: u64, object_id: u64, options: u8) {}
    fn on_service_proxy_add_external_ref(&self, zone_id: u64, destination_zone_id: u64, caller_zone_id: u64, count: u64) {
    }
    fn on_service_proxy_release_external_ref(
        &self,
        zone_id: u64,
        destination_zone_id: u64,
        caller_zone_id: u64,
        count: u64,
    ) {
    }

    fn on_stub_creation(&self, zone_id: u64, object_id: u64) {}
    fn on_stub_deletion(&self, zone_id: u64, object_id: u64) {}
    fn on_stub_send(&self, zone_id: u64, object_id: u64, interface_id: u64, method_id: u64) {}
    fn on_stub_add_ref(&self, zone_id: u64, object_id: u64, caller_zone_id: u64, count: u64, options: u8) {}
    fn on_stub_release(&self, zone_id: u64, object_id: u64, caller_zone_id: u64, count: u64, options: u8) {}

    fn on_object_proxy_creation(&self, zone_id: u64, destination_zone_id: u64, object_id: u64) {}
    fn on_object_proxy_deletion(&self, zone_id: u64, destination_zone_id: u64, object_id: u64) {}

    /// Free-form diagnostic from the runtime.
    fn message(&self, level: log::Level, message: &str) {}
}

/// A telemetry sink that renders every event through the [`log`] facade.
#[derive(Debug, Default)]
pub struct ConsoleTelemetryService;

impl ConsoleTelemetryService {
    pub fn new() -> Self {
        Self
    }
}

impl TelemetryService for ConsoleTelemetryService {
    fn on_service_creation(&self, name: &str, zone_id: u64, parent_zone_id: u64) {
        log::debug!("service created: name={name} zone={zone_id} parent={parent_zone_id}");
    }

    fn on_service_deletion(&self, zone_id: u64) {
        log::debug!("service deleted: zone={zone_id}");
    }

    fn on_service_try_cast(&self, zone_id: u64, destination_zone_id: u64, object_id: u64, interface_id: u64) {
        log::debug!("try_cast: zone={zone_id} dest={destination_zone_id} object={object_id} interface={interface_id:#x}");
    }

    fn on_service_add_ref(&self, zone_id: u64, destination_zone_id: u64, object_id: u64, caller_zone_id: u64, options: u8) {
        log::debug!(
            "service add_ref: zone={zone_id} dest={destination_zone_id} object={object_id} caller={caller_zone_id} options={options:#04b}"
        );
    }

    fn on_service_release(&self, zone_id: u64, destination_zone_id: u64, object_id: u64, caller_zone_id: u64, options: u8) {
        log::debug!(
            "service release: zone={zone_id} dest={destination_zone_id} object={object_id} caller={caller_zone_id} options={options:#04b}"
        );
    }

    fn on_service_proxy_creation(&self, name: &str, zone_id: u64, destination_zone_id: u64, caller_zone_id: u64) {
        log::debug!("service proxy created: name={name} zone={zone_id} dest={destination_zone_id} caller={caller_zone_id}");
    }

    fn on_cloned_service_proxy_creation(&self, name: &str, zone_id: u64, destination_zone_id: u64, caller_zone_id: u64) {
        log::debug!("service proxy cloned: name={name} zone={zone_id} dest={destination_zone_id} caller={caller_zone_id}");
    }

    fn on_service_proxy_deletion(&self, zone_id: u64, destination_zone_id: u64, caller_zone_id: u64) {
        log::debug!("service proxy deleted: zone={zone_id} dest={destination_zone_id} caller={caller_zone_id}");
    }

    fn on_service_proxy_add_ref(&self, zone_id: u64, destination_zone_id: u64, object_id: u64, options: u8) {
        log::debug!("proxy add_ref: zone={zone_id} dest={destination_zone_id} object={object_id} options={options:#04b}");
    }

    fn on_service_proxy_release(&self, zone_id: u64, destination_zone_id: u64, object_id: u64, options: u8) {
        log::debug!("proxy release: zone={zone_id} dest={destination_zone_id} object={object_id} options={options:#04b}");
    }

    fn on_service_proxy_add_external_ref(&self, zone_id: u64, destination_zone_id: u64, caller_zone_id: u64, count: u64) {
        log::debug!("external ref +1: zone={zone_id} dest={destination_zone_id} caller={caller_zone_id} count={count}");
    }

    fn on_service_proxy_release_external_ref(
        &self,
        zone_id: u64,
        destination_zone_id: u64,
        caller_zone_id: u64,
        count: u64,
    ) {
        log::debug!("external ref -1: zone={zone_id} dest={destination_zone_id} caller={caller_zone_id} count={count}");
    }

    fn on_stub_creation(&self, zone_id: u64, object_id: u64) {
        log::debug!("stub created: zone={zone_id} object={object_id}");
    }

    fn on_stub_deletion(&self, zone_id: u64, object_id: u64) {
        log::debug!("stub deleted: zone={zone_id} object={object_id}");
    }

    fn on_stub_send(&self, zone_id: u64, object_id: u64, interface_id: u64, method_id: u64) {
        log::debug!("stub send: zone={zone_id} object={object_id} interface={interface_id:#x} method={method_id}");
    }

    fn on_stub_add_ref(&self, zone_id: u64, object_id: u64, caller_zone_id: u64, count: u64, options: u8) {
        log::debug!(
            "stub add_ref: zone={zone_id} object={object_id} caller={caller_zone_id} count={count} options={options:#04b}"
        );
    }

    fn on_stub_release(&self, zone_id: u64, object_id: u64, caller_zone_id: u64, count: u64, options: u8) {
        log::debug!(
            "stub release: zone={zone_id} object={object_id} caller={caller_zone_id} count={count} options={options:#04b}"
        );
    }

    fn on_object_proxy_creation(&self, zone_id: u64, destination_zone_id: u64, object_id: u64) {
        log::debug!("object proxy created: zone={zone_id} dest={destination_zone_id} object={object_id}");
    }

    fn on_object_proxy_deletion(&self, zone_id: u64, destination_zone_id: u64, object_id: u64) {
        log::debug!("object proxy deleted: zone={zone_id} dest={destination_zone_id} object={object_id}");
    }

    fn message(&self, level: log::Level, message: &str) {
        log::log!(level, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl TelemetryService for Counting {
        fn on_stub_creation(&self, _zone_id: u64, _object_id: u64) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn default_hooks_are_noops() {
        let sink = Counting(AtomicUsize::new(0));
        sink.on_service_creation("svc", 1, 0);
        sink.on_object_proxy_deletion(1, 2, 3);
        assert_eq!(sink.0.load(Ordering::Relaxed), 0);
        sink.on_stub_creation(1, 1);
        assert_eq!(sink.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn first_installation_wins() {
        assert!(set_telemetry_service(Arc::new(ConsoleTelemetryService)));
        assert!(!set_telemetry_service(Arc::new(ConsoleTelemetryService)));
        assert!(get_telemetry_service().is_some());
    }
}
