//! Reference-count closure measured through the telemetry hooks
//!
//! For every execution trace, the add_ref and release totals per
//! `(object, caller, kind)` must meet at zero by the time the stubs are
//! destroyed, and every stub created must be deleted.

mod helpers;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use helpers::*;
use interzone::bindings::optimistic_view;
use interzone_telemetry::{set_telemetry_service, TelemetryService};

#[derive(Default)]
struct LedgerAudit {
    // (zone, object, caller, optimistic) → outstanding references
    outstanding: Mutex<HashMap<(u64, u64, u64, bool), i64>>,
    live_stubs: AtomicI64,
}

impl LedgerAudit {
    fn balanced(&self) -> bool {
        self.outstanding.lock().unwrap().values().all(|count| *count == 0)
    }
}

impl TelemetryService for LedgerAudit {
    fn on_stub_creation(&self, _zone_id: u64, _object_id: u64) {
        self.live_stubs.fetch_add(1, Ordering::AcqRel);
    }

    fn on_stub_deletion(&self, _zone_id: u64, _object_id: u64) {
        self.live_stubs.fetch_sub(1, Ordering::AcqRel);
    }

    fn on_stub_add_ref(&self, zone_id: u64, object_id: u64, caller_zone_id: u64, _count: u64, options: u8) {
        let key = (zone_id, object_id, caller_zone_id, options != 0);
        *self.outstanding.lock().unwrap().entry(key).or_default() += 1;
    }

    fn on_stub_release(&self, zone_id: u64, object_id: u64, caller_zone_id: u64, _count: u64, options: u8) {
        let key = (zone_id, object_id, caller_zone_id, options != 0);
        *self.outstanding.lock().unwrap().entry(key).or_default() -= 1;
    }
}

#[test]
fn every_add_ref_meets_its_release() {
    init_logging();
    let audit = Arc::new(LedgerAudit::default());
    assert!(set_telemetry_service(audit.clone()));

    {
        let zone = factory_zone(1, 2, 3).unwrap();

        // out-parameter traffic
        let child = zone.root.create_child().unwrap().unwrap();
        assert_eq!(child.transform(vec![1, 2, 3]).unwrap(), vec![4, 5, 6]);

        // optimistic traffic, split counters
        let optimistic = optimistic_view::<IArithmetic>(&child).unwrap();
        drop(child);
        drop(optimistic);

        // in-parameter traffic
        let gift = Adder::new(1, "gift");
        zone.root.adopt(Some(gift.clone() as Arc<dyn Arithmetic>)).unwrap();
        zone.maker.drop_adopted();

        drop(zone.root);
        assert!(zone.host.check_is_empty());
        assert!(zone.channel.child_service().unwrap().check_is_empty());
    }

    assert!(audit.balanced(), "some add_ref was never matched by a release");
    assert_eq!(audit.live_stubs.load(Ordering::Acquire), 0, "a stub outlived its references");
}
