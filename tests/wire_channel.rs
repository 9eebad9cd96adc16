//! The wire envelope end to end: calls, reference traffic, cooperative
//! close, and cancellation of in-flight work

mod helpers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use helpers::*;
use interzone::{ErrorCode, RpcResult, Service, Zone};

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn calls_and_references_flow_over_the_wire() -> RpcResult<()> {
    init_logging();
    let host = Service::new("host", Zone::new(1));
    let target = Service::new("target", Zone::new(2));
    let fixture = wire_fixture(host, target, ChildMaker::new(4), Duration::from_secs(5))?;

    let child = fixture.root.create_child()?.expect("minted over the wire");
    assert_eq!(child.transform(vec![1, 2, 3])?, vec![5, 6, 7]);
    assert_eq!(child.describe()?, "minted");

    // in-parameters work over the wire too: the target adopts a
    // host-local object and calls come back the other way
    let gift = Adder::new(9, "gift");
    assert_eq!(fixture.root.adopt(Some(gift.clone() as Arc<dyn Arithmetic>))?, 1);
    assert_eq!(fixture.maker.adopted_count(), 1);
    fixture.maker.drop_adopted();

    // release everything and confirm both ledgers drained across the link
    drop(child);
    drop(fixture.root);
    wait_until("host ledgers to drain", || fixture.host.check_is_empty());
    fixture.reverse.lock().unwrap().take();
    assert!(fixture.target.check_is_empty());

    // cooperative close: both pumps stop, both flags meet
    fixture.host_manager.shutdown();
    wait_until("both pumps to stop", || {
        fixture.host_manager.is_stopped() && fixture.target_manager.is_stopped()
    });
    assert!(fixture.target_manager.peer_cancel_received());
    Ok(())
}

#[test]
fn closed_channels_fail_fast() -> RpcResult<()> {
    init_logging();
    let host = Service::new("host", Zone::new(3));
    let target = Service::new("target", Zone::new(4));
    let fixture = wire_fixture(host, target, ChildMaker::new(1), Duration::from_secs(5))?;

    let child = fixture.root.create_child()?.unwrap();
    fixture.host_manager.shutdown();
    wait_until("pumps to stop", || fixture.host_manager.is_stopped());

    // every call after teardown fails without hanging
    let err = child.transform(vec![1]).unwrap_err();
    assert!(
        matches!(err, ErrorCode::ServiceProxyLostConnection | ErrorCode::TransportError),
        "unexpected error after close: {err}"
    );
    Ok(())
}

#[test]
fn pending_calls_resolve_with_call_cancelled_on_close() -> RpcResult<()> {
    init_logging();
    let host = Service::new("host", Zone::new(5));
    let target = Service::new("target", Zone::new(6));
    let fixture = wire_fixture(host, target, ChildMaker::new(1), Duration::from_secs(5))?;

    // park a slow call on the target, then close the channel under it
    fixture.maker.stash(Adder::slow(1, "slow", Duration::from_millis(600)) as Arc<dyn Arithmetic>);
    let child = fixture.root.create_child()?.unwrap();

    let pending = {
        let child = child.clone();
        std::thread::spawn(move || child.transform(vec![1]))
    };
    std::thread::sleep(Duration::from_millis(50));
    fixture.host_manager.shutdown();

    match pending.join().unwrap() {
        Err(ErrorCode::CallCancelled) => {}
        Ok(_) => {} // the reply won the race with the close
        Err(other) => panic!("pending call resolved with unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn timeouts_surface_transport_error() -> RpcResult<()> {
    init_logging();
    let host = Service::new("host", Zone::new(7));
    let target = Service::new("target", Zone::new(8));
    // a timeout far shorter than the slow method
    let fixture = wire_fixture(host, target, ChildMaker::new(1), Duration::from_millis(100))?;

    let slow = Adder::slow(1, "slow", Duration::from_millis(500));
    fixture.maker.stash(slow.clone() as Arc<dyn Arithmetic>);
    let child = fixture.root.create_child()?.unwrap();

    let err = child.transform(vec![1]).unwrap_err();
    assert_eq!(err, ErrorCode::TransportError);
    Ok(())
}
