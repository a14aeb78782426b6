//! The event catalogue and the process-wide event-name registry.
//!
//! Asterisk exposes hundreds of event types; the core only needs to know their names.
//! Each class is described by a static [`EventSpec`], and the registry maps wire names
//! back to those statics so inbound events can be recognised. Applications with
//! private catalogues can add their own specs through [`register`].

use std::{
    collections::HashMap,
    sync::{OnceLock, PoisonError, RwLock},
};

use crate::manager::aggregate::AggregateSpec;

/// Describes a class of manager event.
#[derive(Debug)]
pub struct EventSpec {
    /// The value of the `Event` header identifying this class on the wire.
    pub name: &'static str,
}

fn registry() -> &'static RwLock<HashMap<&'static str, &'static EventSpec>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, &'static EventSpec>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        for spec in BUILTIN {
            map.insert(spec.name, *spec);
        }
        RwLock::new(map)
    })
}

/// Adds an event class to the registry, replacing any earlier entry with the same name.
pub fn register(spec: &'static EventSpec) {
    registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(spec.name, spec);
}

/// Looks up the event class registered under `name`.
pub fn lookup(name: &str) -> Option<&'static EventSpec> {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .copied()
}

// Core catalogue. Names match the `Event` headers Asterisk emits.

pub static CORE_SHOW_CHANNEL: EventSpec = EventSpec {
    name: "CoreShowChannel",
};
pub static CORE_SHOW_CHANNELS_COMPLETE: EventSpec = EventSpec {
    name: "CoreShowChannelsComplete",
};
pub static FULLY_BOOTED: EventSpec = EventSpec {
    name: "FullyBooted",
};
pub static HANGUP: EventSpec = EventSpec { name: "Hangup" };
pub static NEWCHANNEL: EventSpec = EventSpec { name: "Newchannel" };
pub static NEWSTATE: EventSpec = EventSpec { name: "Newstate" };
pub static PARKED_CALL: EventSpec = EventSpec { name: "ParkedCall" };
pub static PARKED_CALLS_COMPLETE: EventSpec = EventSpec {
    name: "ParkedCallsComplete",
};
pub static PEER_ENTRY: EventSpec = EventSpec { name: "PeerEntry" };
pub static PEERLIST_COMPLETE: EventSpec = EventSpec {
    name: "PeerlistComplete",
};
pub static PEER_STATUS: EventSpec = EventSpec { name: "PeerStatus" };
pub static STATUS: EventSpec = EventSpec { name: "Status" };
pub static STATUS_COMPLETE: EventSpec = EventSpec {
    name: "StatusComplete",
};

const BUILTIN: &[&EventSpec] = &[
    &CORE_SHOW_CHANNEL,
    &CORE_SHOW_CHANNELS_COMPLETE,
    &FULLY_BOOTED,
    &HANGUP,
    &NEWCHANNEL,
    &NEWSTATE,
    &PARKED_CALL,
    &PARKED_CALLS_COMPLETE,
    &PEER_ENTRY,
    &PEERLIST_COMPLETE,
    &PEER_STATUS,
    &STATUS,
    &STATUS_COMPLETE,
];

// Aggregates produced by the list-style core actions. The finaliser of each carries a
// self-reported item count under a header that, regrettably, differs per action.

pub static CORE_SHOW_CHANNELS_AGGREGATE: AggregateSpec = AggregateSpec {
    name: "CoreShowChannels_Aggregate",
    members: &[&CORE_SHOW_CHANNEL],
    finalisers: &[&CORE_SHOW_CHANNELS_COMPLETE],
    count_header: Some("ListItems"),
};

pub static PARKED_CALLS_AGGREGATE: AggregateSpec = AggregateSpec {
    name: "ParkedCalls_Aggregate",
    members: &[&PARKED_CALL],
    finalisers: &[&PARKED_CALLS_COMPLETE],
    count_header: Some("Total"),
};

pub static SIP_PEERS_AGGREGATE: AggregateSpec = AggregateSpec {
    name: "SIPpeers_Aggregate",
    members: &[&PEER_ENTRY],
    finalisers: &[&PEERLIST_COMPLETE],
    count_header: Some("ListItems"),
};

pub static STATUS_AGGREGATE: AggregateSpec = AggregateSpec {
    name: "Status_Aggregate",
    members: &[&STATUS],
    finalisers: &[&STATUS_COMPLETE],
    count_header: Some("Items"),
};
