//! Identifier newtypes used throughout the runtime
//!
//! Zones, objects, interfaces and methods are all 64-bit ids on the wire,
//! but mixing them up (or mixing the direction-tagged views of the zone id
//! space) is the classic source of routing bugs. Each id therefore gets its
//! own type, and the conversions between the zone views are explicit: they
//! carry intent, never a change of value.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            /// `0` is reserved as "unset/none".
            pub const fn is_set(self) -> bool {
                self.0 != 0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

id_type! {
    /// A unit of isolation owning a service.
    Zone
}
id_type! {
    /// The zone a call or reference operation is addressed to.
    DestinationZone
}
id_type! {
    /// The next hop towards the destination when the route is not direct.
    DestinationChannelZone
}
id_type! {
    /// The zone that originated a call or reference operation.
    CallerZone
}
id_type! {
    /// The adjacent zone an inbound operation arrived through.
    CallerChannelZone
}
id_type! {
    /// A zone known to lie on the route being built during `add_ref`;
    /// transports that cannot reconstruct one pass the unset value.
    KnownDirectionZone
}
id_type! {
    /// An object id, unique within its owning zone.
    ObjectId
}
id_type! {
    /// A 64-bit hash identifying an interface at a specific protocol version.
    InterfaceOrdinal
}
id_type! {
    /// A method ordinal within an interface.
    MethodId
}

/// Reserved in-band marker used when ref-counting a whole channel rather
/// than a specific object. Never returned by object-id allocation.
pub const DUMMY_OBJECT_ID: ObjectId = ObjectId(u64::MAX);

impl Zone {
    pub const fn as_destination(self) -> DestinationZone {
        DestinationZone(self.0)
    }
    pub const fn as_destination_channel(self) -> DestinationChannelZone {
        DestinationChannelZone(self.0)
    }
    pub const fn as_caller(self) -> CallerZone {
        CallerZone(self.0)
    }
    pub const fn as_caller_channel(self) -> CallerChannelZone {
        CallerChannelZone(self.0)
    }
}

impl DestinationZone {
    pub const fn as_zone(self) -> Zone {
        Zone(self.0)
    }
    pub const fn as_destination_channel(self) -> DestinationChannelZone {
        DestinationChannelZone(self.0)
    }
    pub const fn as_caller(self) -> CallerZone {
        CallerZone(self.0)
    }
    pub const fn as_caller_channel(self) -> CallerChannelZone {
        CallerChannelZone(self.0)
    }
}

impl DestinationChannelZone {
    pub const fn as_destination(self) -> DestinationZone {
        DestinationZone(self.0)
    }
    pub const fn as_caller_channel(self) -> CallerChannelZone {
        CallerChannelZone(self.0)
    }
}

impl CallerZone {
    pub const fn as_zone(self) -> Zone {
        Zone(self.0)
    }
    pub const fn as_caller_channel(self) -> CallerChannelZone {
        CallerChannelZone(self.0)
    }
    pub const fn as_destination(self) -> DestinationZone {
        DestinationZone(self.0)
    }
    pub const fn as_destination_channel(self) -> DestinationChannelZone {
        DestinationChannelZone(self.0)
    }
    pub const fn as_known_direction(self) -> KnownDirectionZone {
        KnownDirectionZone(self.0)
    }
}

impl CallerChannelZone {
    pub const fn as_destination(self) -> DestinationZone {
        DestinationZone(self.0)
    }
    pub const fn as_destination_channel(self) -> DestinationChannelZone {
        DestinationChannelZone(self.0)
    }
}

impl KnownDirectionZone {
    pub const fn as_destination(self) -> DestinationZone {
        DestinationZone(self.0)
    }
}

/// A wire-level capability reference: `{object, destination_zone}`.
///
/// Zero in either field means "null"; a default-constructed descriptor is
/// the null descriptor.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub object_id: ObjectId,
    pub destination_zone_id: DestinationZone,
}

impl InterfaceDescriptor {
    pub const fn new(object_id: ObjectId, destination_zone_id: DestinationZone) -> Self {
        Self { object_id, destination_zone_id }
    }

    pub const fn null() -> Self {
        Self { object_id: ObjectId(0), destination_zone_id: DestinationZone(0) }
    }

    pub const fn is_null(&self) -> bool {
        !self.object_id.is_set() || !self.destination_zone_id.is_set()
    }
}

impl fmt::Display for InterfaceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.object_id, self.destination_zone_id)
    }
}

macro_rules! option_bits {
    ($(#[$doc:meta])* $name:ident { $($(#[$fdoc:meta])* $flag:ident = $bit:expr;)* }) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u8);

        impl $name {
            pub const NORMAL: Self = Self(0);
            $($(#[$fdoc])* pub const $flag: Self = Self($bit);)*

            pub const fn from_bits(bits: u8) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> u8 {
                self.0
            }

            /// True when every bit of `other` is set (and `other` is not empty).
            pub const fn contains(self, other: Self) -> bool {
                other.0 != 0 && self.0 & other.0 == other.0
            }

            pub const fn is_normal(self) -> bool {
                self.0 == 0
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#04b})"), self.0)
            }
        }
    };
}

option_bits! {
    /// Options carried by `add_ref`.
    AddRefOptions {
        /// Also create the service proxies towards the destination so a
        /// later release can walk the same route.
        BUILD_DESTINATION_ROUTE = 1;
        /// Also create the service proxies back towards the caller,
        /// preparing the reverse ref-count route.
        BUILD_CALLER_ROUTE = 2;
        /// The reference being added is optimistic (weak-like).
        OPTIMISTIC = 4;
    }
}

option_bits! {
    /// Options carried by `release`.
    ReleaseOptions {
        /// The reference being released is optimistic.
        OPTIMISTIC = 1;
    }
}

option_bits! {
    /// Options carried by `post`.
    PostOptions {
        /// The posting zone is going away; relays drop their routes after
        /// forwarding.
        ZONE_TERMINATING = 1;
        /// The post carries an optimistic release that must not block.
        RELEASE_OPTIMISTIC = 2;
    }
}

impl AddRefOptions {
    pub const fn is_optimistic(self) -> bool {
        self.contains(Self::OPTIMISTIC)
    }

    pub const fn as_release(self) -> ReleaseOptions {
        if self.is_optimistic() {
            ReleaseOptions::OPTIMISTIC
        } else {
            ReleaseOptions::NORMAL
        }
    }
}

impl ReleaseOptions {
    pub const fn is_optimistic(self) -> bool {
        self.contains(Self::OPTIMISTIC)
    }
}

/// Derive the ordinal of an interface at a protocol version.
///
/// This is what the binding generator bakes into generated code: a 64-bit
/// FNV-1a hash over the interface name and the protocol version, so that
/// two zones agree on ordinals without a registry.
pub const fn interface_ordinal(name: &str, protocol_version: u64) -> InterfaceOrdinal {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    let version_bytes = protocol_version.to_le_bytes();
    let mut j = 0;
    while j < version_bytes.len() {
        hash ^= version_bytes[j] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        j += 1;
    }
    // 0 means "unset"; remap the pathological hash
    if hash == 0 {
        InterfaceOrdinal(1)
    } else {
        InterfaceOrdinal(hash)
    }
}
