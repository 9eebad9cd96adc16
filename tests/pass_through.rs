//! The relay between two transports for non-endpoint zones

mod helpers;

use std::sync::Arc;

use helpers::*;
use interzone::bindings::create_interface_stub;
use interzone::transport::{BackChannel, Marshaller};
use interzone::{
    AddRefOptions, CallerChannelZone, DestinationChannelZone, Encoding, ErrorCode, Interface,
    InterfaceOrdinal, KnownDirectionZone, MethodId, PassThrough, PostOptions, ReleaseOptions, RpcResult,
    Service, Zone,
};

struct RelayFixture {
    relay: Arc<PassThrough>,
    left: Arc<Service>,
    right: Arc<Service>,
    left_transport: Arc<ServiceTransport>,
    left_root: Arc<dyn Arithmetic>,
    left_descriptor: interzone::InterfaceDescriptor,
}

fn relay_fixture(middle_zone: u64, left_zone: u64, right_zone: u64) -> RpcResult<RelayFixture> {
    init_logging();
    let middle = Service::new("middle", Zone::new(middle_zone));
    let left = Service::new("left", Zone::new(left_zone));
    let right = Service::new("right", Zone::new(right_zone));

    let left_root = Adder::new(5, "left-root");
    let left_descriptor = create_interface_stub::<IArithmetic>(&left, &(left_root.clone() as Arc<dyn Arithmetic>))?;

    let left_transport = ServiceTransport::new(&left);
    let right_transport = ServiceTransport::new(&right);
    let relay = PassThrough::new(
        left_transport.clone(),
        right_transport,
        middle,
        left.zone_id().as_destination(),
        right.zone_id().as_destination(),
    );
    Ok(RelayFixture { relay, left, right, left_transport, left_root: left_root as Arc<dyn Arithmetic>, left_descriptor })
}

fn relay_call(fixture: &RelayFixture, values: Vec<u64>) -> RpcResult<Vec<u64>> {
    let mut back_out = BackChannel::new();
    let in_buf = interzone::codec::serialise(&values, Encoding::Binary)?;
    let out_buf = fixture.relay.send(
        interzone::version::current_version(),
        Encoding::Binary,
        0,
        CallerChannelZone::default(),
        fixture.right.zone_id().as_caller(),
        fixture.left.zone_id().as_destination(),
        fixture.left_descriptor.object_id,
        IArithmetic::interface_id(interzone::version::current_version()),
        MethodId::new(1),
        &in_buf,
        &[],
        &mut back_out,
    )?;
    interzone::codec::deserialise(Encoding::Binary, &out_buf)
}

fn relay_add_ref(fixture: &RelayFixture, options: AddRefOptions) -> RpcResult<u64> {
    let mut back_out = BackChannel::new();
    fixture.relay.add_ref(
        interzone::version::current_version(),
        DestinationChannelZone::default(),
        fixture.left.zone_id().as_destination(),
        fixture.left_descriptor.object_id,
        CallerChannelZone::default(),
        fixture.right.zone_id().as_caller(),
        KnownDirectionZone::default(),
        options,
        &[],
        &mut back_out,
    )
}

fn relay_release(fixture: &RelayFixture, options: ReleaseOptions) -> RpcResult<u64> {
    let mut back_out = BackChannel::new();
    fixture.relay.release(
        interzone::version::current_version(),
        fixture.left.zone_id().as_destination(),
        fixture.left_descriptor.object_id,
        fixture.right.zone_id().as_caller(),
        options,
        &[],
        &mut back_out,
    )
}

#[test]
fn relay_mirrors_reference_counts_and_drains() -> RpcResult<()> {
    let fixture = relay_fixture(10, 11, 12)?;

    assert_eq!(relay_add_ref(&fixture, AddRefOptions::NORMAL)?, 2);
    assert_eq!(relay_add_ref(&fixture, AddRefOptions::OPTIMISTIC)?, 1);
    assert_eq!(fixture.relay.counts(), (1, 1));

    assert_eq!(relay_call(&fixture, vec![1, 2, 3])?, vec![6, 7, 8]);

    // shared drains first; the relay stays for the optimistic holder
    assert_eq!(relay_release(&fixture, ReleaseOptions::NORMAL)?, 1);
    assert!(fixture.relay.is_live());
    // the optimistic release empties the mirror and the relay dismantles
    relay_release(&fixture, ReleaseOptions::OPTIMISTIC)?;
    assert!(!fixture.relay.is_live());

    // a dead relay has no routes
    let err = relay_call(&fixture, vec![1]).unwrap_err();
    assert_eq!(err, ErrorCode::ZoneNotFound);
    Ok(())
}

#[test]
fn route_building_add_refs_count_as_shared() -> RpcResult<()> {
    let fixture = relay_fixture(19, 20, 21)?;

    // a route-building add_ref without the optimistic bit still carries a
    // shared reference through the relay
    assert_eq!(relay_add_ref(&fixture, AddRefOptions::BUILD_CALLER_ROUTE)?, 2);
    assert_eq!(fixture.relay.counts(), (1, 0));
    assert_eq!(relay_add_ref(&fixture, AddRefOptions::BUILD_DESTINATION_ROUTE | AddRefOptions::BUILD_CALLER_ROUTE)?, 3);
    assert_eq!(fixture.relay.counts(), (2, 0));

    // the matching normal releases drain the mirror without underflow
    assert_eq!(relay_release(&fixture, ReleaseOptions::NORMAL)?, 2);
    assert_eq!(fixture.relay.counts(), (1, 0));
    assert!(fixture.relay.is_live());
    relay_release(&fixture, ReleaseOptions::NORMAL)?;
    assert_eq!(fixture.relay.counts(), (0, 0));
    assert!(!fixture.relay.is_live());
    Ok(())
}

#[test]
fn transport_failure_dismantles_the_relay() -> RpcResult<()> {
    let fixture = relay_fixture(13, 14, 15)?;
    assert!(fixture.relay.is_live());

    fixture.left_transport.disconnect();
    let err = relay_call(&fixture, vec![1]).unwrap_err();
    assert_eq!(err, ErrorCode::TransportError);
    assert!(!fixture.relay.is_live());

    // subsequent calls fail fast
    let err = relay_call(&fixture, vec![1]).unwrap_err();
    assert_eq!(err, ErrorCode::ZoneNotFound);
    Ok(())
}

#[test]
fn zone_terminating_post_dismantles_the_relay() -> RpcResult<()> {
    let fixture = relay_fixture(16, 17, 18)?;
    assert!(fixture.relay.is_live());

    fixture.relay.post(
        interzone::version::current_version(),
        Encoding::Binary,
        0,
        CallerChannelZone::default(),
        fixture.right.zone_id().as_caller(),
        fixture.left.zone_id().as_destination(),
        fixture.left_descriptor.object_id,
        InterfaceOrdinal::new(0),
        MethodId::new(0),
        PostOptions::ZONE_TERMINATING,
        &[],
        &[],
    );
    assert!(!fixture.relay.is_live());

    // the left zone still owns its object; release it directly
    let root_stub = fixture.left.get_object(fixture.left_descriptor.object_id).unwrap();
    let (_, lifetime) = root_stub.release(fixture.left.zone_id().as_caller(), ReleaseOptions::NORMAL)?;
    drop(root_stub);
    drop(lifetime);
    drop(fixture.left_root);
    assert!(fixture.left.check_is_empty());
    Ok(())
}
