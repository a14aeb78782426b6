//! Callback registration and matching.

use std::sync::Arc;

use crate::{
    manager::{aggregate::Aggregate, aggregate::AggregateSpec, events::EventSpec, Manager},
    message::Message,
};

/// A value published to callbacks: a raw wire event or a finalised aggregate.
///
/// Orphan handlers also receive this type, wrapping the unmatched response.
#[derive(Clone, Debug)]
pub enum Event {
    Message(Message),
    Aggregate(Aggregate),
}

impl Event {
    pub fn name(&self) -> &str {
        match self {
            Self::Message(message) => message.name(),
            Self::Aggregate(aggregate) => aggregate.name(),
        }
    }

    pub fn action_id(&self) -> Option<&str> {
        match self {
            Self::Message(message) => message.action_id(),
            Self::Aggregate(aggregate) => Some(aggregate.action_id()),
        }
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Message(message) => Some(message),
            Self::Aggregate(_) => None,
        }
    }

    pub fn aggregate(&self) -> Option<&Aggregate> {
        match self {
            Self::Message(_) => None,
            Self::Aggregate(aggregate) => Some(aggregate),
        }
    }
}

/// The function type invoked by the dispatcher.
///
/// Callbacks run one at a time on the dispatcher task and must be short, or hand
/// their work to another executor. Identity, for deduplication and unregistration,
/// is the `Arc` allocation: register the same `Arc` twice and the first binding is
/// replaced.
pub type EventCallback = Arc<dyn Fn(&Event, &Manager) + Send + Sync>;

/// What a callback is bound to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKey {
    /// Exact event-name match.
    Event(String),
    /// Every event; suitable for logging.
    Universal,
    /// Responses that matched no outstanding request.
    Orphans,
}

impl From<&str> for EventKey {
    fn from(name: &str) -> Self {
        if name.is_empty() {
            Self::Universal
        } else {
            Self::Event(name.to_owned())
        }
    }
}

impl From<String> for EventKey {
    fn from(name: String) -> Self {
        if name.is_empty() {
            Self::Universal
        } else {
            Self::Event(name)
        }
    }
}

impl From<&'static EventSpec> for EventKey {
    fn from(spec: &'static EventSpec) -> Self {
        Self::Event(spec.name.to_owned())
    }
}

impl From<&'static AggregateSpec> for EventKey {
    fn from(spec: &'static AggregateSpec) -> Self {
        Self::Event(spec.name.to_owned())
    }
}

struct Entry {
    key: EventKey,
    callback: EventCallback,
}

/// The ordered list of callback bindings.
///
/// A single list, rather than one per kind, keeps registration order observable
/// across kinds. Callbacks are copied out under the lock and invoked without it.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    entries: Vec<Entry>,
}

impl CallbackRegistry {
    /// Appends a binding, removing any earlier equal one first so the new
    /// registration sits at the end of the order.
    pub fn register(&mut self, key: EventKey, callback: EventCallback) {
        self.remove(&key, &callback);
        self.entries.push(Entry { key, callback });
    }

    /// Removes exactly one matching binding. Returns whether anything was removed.
    pub fn remove(&mut self, key: &EventKey, callback: &EventCallback) -> bool {
        match self
            .entries
            .iter()
            .position(|entry| entry.key == *key && Arc::ptr_eq(&entry.callback, callback))
        {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Callbacks to run for an event of the given name, in registration order.
    pub fn matching(&self, event_name: &str) -> Vec<EventCallback> {
        self.entries
            .iter()
            .filter(|entry| match &entry.key {
                EventKey::Event(name) => name == event_name,
                EventKey::Universal => true,
                EventKey::Orphans => false,
            })
            .map(|entry| Arc::clone(&entry.callback))
            .collect()
    }

    pub fn orphan_handlers(&self) -> Vec<EventCallback> {
        self.entries
            .iter()
            .filter(|entry| entry.key == EventKey::Orphans)
            .map(|entry| Arc::clone(&entry.callback))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::events::NEWCHANNEL;

    fn callback() -> EventCallback {
        Arc::new(|_: &Event, _: &Manager| {})
    }

    #[test]
    fn matching_respects_registration_order_across_kinds() {
        let mut registry = CallbackRegistry::default();
        let a = callback();
        let b = callback();
        let universal = callback();

        registry.register(EventKey::from("Newchannel"), Arc::clone(&a));
        registry.register(EventKey::Universal, Arc::clone(&universal));
        registry.register(EventKey::from(&NEWCHANNEL), Arc::clone(&b));

        let matched = registry.matching("Newchannel");
        assert_eq!(matched.len(), 3);
        assert!(Arc::ptr_eq(&matched[0], &a));
        assert!(Arc::ptr_eq(&matched[1], &universal));
        assert!(Arc::ptr_eq(&matched[2], &b));

        assert!(registry.matching("Hangup").len() == 1);
    }

    #[test]
    fn reregistration_moves_a_binding_to_the_end() {
        let mut registry = CallbackRegistry::default();
        let a = callback();
        let b = callback();

        registry.register(EventKey::from("Newchannel"), Arc::clone(&a));
        registry.register(EventKey::from("Newchannel"), Arc::clone(&b));
        registry.register(EventKey::from("Newchannel"), Arc::clone(&a));

        let matched = registry.matching("Newchannel");
        assert_eq!(matched.len(), 2);
        assert!(Arc::ptr_eq(&matched[0], &b));
        assert!(Arc::ptr_eq(&matched[1], &a));
    }

    #[test]
    fn remove_takes_exactly_one_binding() {
        let mut registry = CallbackRegistry::default();
        let a = callback();
        let b = callback();

        registry.register(EventKey::from("Newchannel"), Arc::clone(&a));
        registry.register(EventKey::from("Newchannel"), Arc::clone(&b));

        assert!(registry.remove(&EventKey::from("Newchannel"), &b));
        assert!(!registry.remove(&EventKey::from("Newchannel"), &b));
        let matched = registry.matching("Newchannel");
        assert_eq!(matched.len(), 1);
        assert!(Arc::ptr_eq(&matched[0], &a));
    }

    #[test]
    fn orphan_handlers_never_match_events() {
        let mut registry = CallbackRegistry::default();
        let handler = callback();
        registry.register(EventKey::Orphans, Arc::clone(&handler));

        assert!(registry.matching("Newchannel").is_empty());
        assert_eq!(registry.orphan_handlers().len(), 1);
    }
}
