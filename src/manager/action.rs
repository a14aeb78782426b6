//! Action value-objects and the bookkeeping `send_action` needs around them.

use std::{
    sync::{Mutex, OnceLock, PoisonError},
    time::Duration,
};

use rand::{distributions::Alphanumeric, Rng};

use crate::{
    manager::{aggregate::AggregateSpec, events::EventSpec, ManagerError},
    message::{Message, KEY_RESPONSE},
};

/// How long a request waits for its response and follow-up events by default.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(5);

/// The value of one request header.
///
/// Most headers carry a single value; a `List` emits one wire line per value under
/// the same name, the way `Variable` repeats on `Originate`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderValue {
    Value(String),
    List(Vec<String>),
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Value(value.to_owned())
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(values: Vec<String>) -> Self {
        Self::List(values)
    }
}

/// A request that can be placed with the manager.
///
/// Implementations describe their wire form and, for synchronous and list-style
/// requests, the event classes the engine has to collect on their behalf. The
/// catalogue in [`actions`](crate::manager::actions) covers the core set; applications
/// add their own by implementing this trait.
pub trait ManagerAction {
    /// The value of the `Action` header.
    fn name(&self) -> &str;

    /// Headers beyond `Action` and `ActionID`.
    fn headers(&self) -> Vec<(String, HeaderValue)> {
        Vec::new()
    }

    /// How long the caller is willing to block on this request.
    fn timeout(&self) -> Duration {
        DEFAULT_ACTION_TIMEOUT
    }

    /// When true, the caller blocks until every finaliser event has been collected
    /// and the follow-up events are delivered on the outcome instead of through
    /// callbacks. Mutually exclusive with aggregate construction.
    fn synchronous(&self) -> bool {
        false
    }

    /// Aggregates to build when this request is sent asynchronously.
    fn aggregates(&self) -> &[&'static AggregateSpec] {
        &[]
    }

    /// Event classes of which at most one instance is expected per request.
    fn unique_events(&self) -> &[&'static EventSpec] {
        &[]
    }

    /// Event classes collected into lists.
    fn list_events(&self) -> &[&'static EventSpec] {
        &[]
    }

    /// Event classes that must all arrive before a synchronous request is complete.
    fn finaliser_events(&self) -> &[&'static EventSpec] {
        &[]
    }

    /// Called immediately before the encoded request is written to the wire.
    fn note_transmission(&self) {}

    /// Reacts to the response before it is returned to the caller.
    ///
    /// The default marks the response successful when its disposition is `Success`
    /// or `Follows`.
    fn process_response(&self, response: &mut Message) -> Result<bool, ManagerError> {
        Ok(matches!(
            response.get(KEY_RESPONSE),
            Some("Success") | Some("Follows")
        ))
    }
}

/// The serviced form of a request.
#[derive(Debug)]
pub struct ActionOutcome {
    /// The response, after the action's own processing ran over it.
    pub response: Message,
    /// The correlation token the request was sent with.
    pub action_id: String,
    /// Whether the request was met with success.
    pub success: bool,
    /// How long servicing took.
    pub time: Duration,
    /// Follow-up events, present for synchronous requests only.
    pub events: Option<EventsMap>,
    /// Set when a synchronous request gave up waiting for its finalisers.
    pub events_timeout: bool,
}

/// Follow-up events collected for a synchronous request.
///
/// Slots are indexable both by event class and by event-name string; both views
/// reach the same storage.
#[derive(Clone, Debug, Default)]
pub struct EventsMap {
    slots: Vec<(String, Slot)>,
}

#[derive(Clone, Debug)]
enum Slot {
    Unique(Option<Message>),
    List(Vec<Message>),
}

impl EventsMap {
    pub(crate) fn allocate(
        uniques: &[&'static EventSpec],
        lists: &[&'static EventSpec],
        finalisers: &[&'static EventSpec],
    ) -> Self {
        let mut slots = Vec::new();
        for spec in uniques.iter().chain(finalisers) {
            slots.push((spec.name.to_owned(), Slot::Unique(None)));
        }
        for spec in lists {
            slots.push((spec.name.to_owned(), Slot::List(Vec::new())));
        }
        Self { slots }
    }

    /// Files an event under its class slot. Undeclared classes get a fresh unique
    /// slot rather than being dropped.
    pub(crate) fn store(&mut self, event: Message) {
        let name = event.name().to_owned();
        match self.slots.iter_mut().find(|(n, _)| *n == name) {
            Some((_, Slot::List(list))) => list.push(event),
            Some((_, Slot::Unique(slot))) => *slot = Some(event),
            None => self.slots.push((name, Slot::Unique(Some(event)))),
        }
    }

    /// The unique (or finaliser) event of the given class, if it arrived.
    pub fn get(&self, spec: &EventSpec) -> Option<&Message> {
        self.get_named(spec.name)
    }

    pub fn get_named(&self, name: &str) -> Option<&Message> {
        match self.slots.iter().find(|(n, _)| *n == name) {
            Some((_, Slot::Unique(slot))) => slot.as_ref(),
            Some((_, Slot::List(list))) => list.first(),
            None => None,
        }
    }

    /// The list of events collected for the given class.
    pub fn list(&self, spec: &EventSpec) -> &[Message] {
        self.list_named(spec.name)
    }

    pub fn list_named(&self, name: &str) -> &[Message] {
        match self.slots.iter().find(|(n, _)| *n == name) {
            Some((_, Slot::List(list))) => list.as_slice(),
            _ => &[],
        }
    }
}

/// Issues session-unique correlation tokens.
///
/// The counter is 32 bits wide and wraps to 1, never 0. Formatted tokens carry the
/// hostname and a per-process random suffix so that several clients on one host do
/// not collide.
#[derive(Debug, Default)]
pub(crate) struct ActionIdGenerator {
    counter: Mutex<u32>,
}

impl ActionIdGenerator {
    pub fn next(&self) -> u32 {
        let mut counter = self.counter.lock().unwrap_or_else(PoisonError::into_inner);
        *counter = counter.checked_add(1).unwrap_or(1);
        *counter
    }

    pub fn next_host_id(&self) -> String {
        format!(
            "{}-{}-{:08x}",
            hostname(),
            process_token(),
            self.next()
        )
    }
}

fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| gethostname::gethostname().to_string_lossy().into_owned())
}

/// Five random alphanumeric characters, fixed for the lifetime of the process.
fn process_token() -> &'static str {
    static TOKEN: OnceLock<String> = OnceLock::new();
    TOKEN.get_or_init(|| {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(5)
            .map(char::from)
            .collect()
    })
}
