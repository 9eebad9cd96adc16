//! Test aggregate for the interzone workspace.
//!
//! The runtime lives in the `interzone` crate and the observer hooks in
//! `interzone-telemetry`; this package only hosts the cross-zone
//! end-to-end scenarios under `tests/`.

pub use interzone;
pub use interzone_telemetry;
