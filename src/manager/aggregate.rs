//! Aggregation of list-response events.
//!
//! List-style actions answer with a burst of member events followed by one or more
//! terminator events, all tied together by the request's `ActionID`. An [`Aggregate`]
//! collects that burst into a single composite value that is published through the
//! event dispatcher once every declared finaliser has arrived.

use std::time::Instant;

use crate::{manager::events::EventSpec, message::Message, transforms};

/// Static description of an aggregate: which event classes it collects and which
/// complete it.
#[derive(Debug)]
pub struct AggregateSpec {
    /// The name under which the finished aggregate is published to callbacks.
    pub name: &'static str,
    /// Event classes collected into per-class lists.
    pub members: &'static [&'static EventSpec],
    /// Event classes that must all be received for the aggregate to be complete.
    pub finalisers: &'static [&'static EventSpec],
    /// Finaliser header carrying the server's own count of emitted members, if any.
    pub count_header: Option<&'static str>,
}

/// What [`Aggregate::evaluate_event`] did with an event.
#[derive(Debug)]
pub(crate) enum Evaluation {
    /// The event does not belong to this aggregate; it is handed back untouched.
    Unrelated(Message),
    /// The event was folded in, but finalisers are still outstanding.
    Absorbed,
    /// The event was folded in and was the last pending finaliser.
    Finalised,
}

/// A composite message accumulating the member events of one list request.
///
/// Member lists are stored once and reachable both through the class object and
/// through the event-name string.
#[derive(Clone, Debug)]
pub struct Aggregate {
    spec: &'static AggregateSpec,
    action_id: String,
    deadline: Instant,
    members: Vec<(&'static str, Vec<Message>)>,
    finalisers: Vec<(&'static str, Option<Message>)>,
    pending: Vec<&'static str>,
    valid: bool,
    error_message: Option<String>,
}

impl Aggregate {
    pub(crate) fn new(spec: &'static AggregateSpec, action_id: String, deadline: Instant) -> Self {
        Self {
            spec,
            action_id,
            deadline,
            members: spec.members.iter().map(|s| (s.name, Vec::new())).collect(),
            finalisers: spec.finalisers.iter().map(|s| (s.name, None)).collect(),
            pending: spec.finalisers.iter().map(|s| s.name).collect(),
            valid: true,
            error_message: None,
        }
    }

    pub fn spec(&self) -> &'static AggregateSpec {
        self.spec
    }

    /// The name the aggregate is published under.
    pub fn name(&self) -> &str {
        self.spec.name
    }

    /// The correlation token this aggregate collects events for.
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// Whether the collected members are consistent with the finaliser's own count.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Explains a failed validation.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn members(&self, spec: &EventSpec) -> &[Message] {
        self.members_named(spec.name)
    }

    pub fn members_named(&self, name: &str) -> &[Message] {
        self.members
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, list)| list.as_slice())
            .unwrap_or_default()
    }

    pub fn finaliser(&self, spec: &EventSpec) -> Option<&Message> {
        self.finaliser_named(spec.name)
    }

    pub fn finaliser_named(&self, name: &str) -> Option<&Message> {
        self.finalisers
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, slot)| slot.as_ref())
    }

    /// Total number of member events collected so far, across all classes.
    pub fn len(&self) -> usize {
        self.members.iter().map(|(_, list)| list.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }

    /// Folds `event` into the aggregate if it belongs here.
    ///
    /// Only events whose `ActionID` matches the aggregate's own may be consumed; a
    /// class match alone is not enough.
    pub(crate) fn evaluate_event(&mut self, event: Message) -> Evaluation {
        let is_member = self.spec.members.iter().any(|s| s.name == event.name());
        let is_finaliser = self.spec.finalisers.iter().any(|s| s.name == event.name());
        if !is_member && !is_finaliser {
            return Evaluation::Unrelated(event);
        }
        if event.action_id() != Some(self.action_id.as_str()) {
            return Evaluation::Unrelated(event);
        }

        if is_member {
            let name = event.name().to_owned();
            if let Some((_, list)) = self.members.iter_mut().find(|(n, _)| *n == name) {
                list.push(event);
            }
            return Evaluation::Absorbed;
        }

        self.validate_count(&event);
        let name = event.name().to_owned();
        if let Some((_, slot)) = self.finalisers.iter_mut().find(|(n, _)| *n == name) {
            *slot = Some(event);
        }
        self.pending.retain(|n| *n != name);
        if self.pending.is_empty() {
            Evaluation::Finalised
        } else {
            Evaluation::Absorbed
        }
    }

    /// Checks the finaliser's self-reported item count against the members received.
    /// Finalisers without the count header skip validation.
    fn validate_count(&mut self, finaliser: &Message) {
        let Some(header) = self.spec.count_header else {
            return;
        };
        let Some(value) = finaliser.get(header) else {
            return;
        };
        let declared = transforms::to_int(Some(value), -1);
        let received = self.len() as i64;
        if declared != received {
            self.valid = false;
            self.error_message = Some(format!(
                "Expected {declared} list-items; received {received}"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        manager::events::{
            CORE_SHOW_CHANNEL, CORE_SHOW_CHANNELS_AGGREGATE, CORE_SHOW_CHANNELS_COMPLETE,
        },
        message::{KEY_ACTION_ID, KEY_EVENT},
    };

    fn event(name: &str, action_id: &str) -> Message {
        let mut message = Message::new();
        message.set_header(KEY_EVENT, name);
        message.set_header(KEY_ACTION_ID, action_id);
        message
    }

    fn aggregate() -> Aggregate {
        Aggregate::new(
            &CORE_SHOW_CHANNELS_AGGREGATE,
            "host-abcde-00000003".to_owned(),
            Instant::now() + Duration::from_secs(5),
        )
    }

    #[test]
    fn collects_members_and_finalises() {
        let mut aggregate = aggregate();

        let mut first = event("CoreShowChannel", "host-abcde-00000003");
        first.set_header("Channel", "SIP/1001-00000001");
        assert!(matches!(
            aggregate.evaluate_event(first),
            Evaluation::Absorbed
        ));

        let mut second = event("CoreShowChannel", "host-abcde-00000003");
        second.set_header("Channel", "SIP/1002-00000002");
        assert!(matches!(
            aggregate.evaluate_event(second),
            Evaluation::Absorbed
        ));

        let mut complete = event("CoreShowChannelsComplete", "host-abcde-00000003");
        complete.set_header("ListItems", "2");
        assert!(matches!(
            aggregate.evaluate_event(complete),
            Evaluation::Finalised
        ));

        assert!(aggregate.valid());
        assert_eq!(aggregate.members(&CORE_SHOW_CHANNEL).len(), 2);
        assert_eq!(aggregate.members_named("CoreShowChannel").len(), 2);
        assert!(aggregate.finaliser(&CORE_SHOW_CHANNELS_COMPLETE).is_some());
    }

    #[test]
    fn rejects_foreign_action_ids() {
        let mut aggregate = aggregate();
        let stray = event("CoreShowChannel", "other-fghij-00000009");

        match aggregate.evaluate_event(stray) {
            Evaluation::Unrelated(returned) => {
                assert_eq!(returned.action_id(), Some("other-fghij-00000009"));
            }
            other => panic!("expected Unrelated, got {other:?}"),
        }
        assert!(aggregate.is_empty());
    }

    #[test]
    fn rejects_unrelated_classes() {
        let mut aggregate = aggregate();
        let stray = event("Newchannel", "host-abcde-00000003");
        assert!(matches!(
            aggregate.evaluate_event(stray),
            Evaluation::Unrelated(_)
        ));
    }

    #[test]
    fn count_mismatch_marks_the_aggregate_invalid() {
        let mut aggregate = aggregate();
        let member = event("CoreShowChannel", "host-abcde-00000003");
        aggregate.evaluate_event(member);

        let mut complete = event("CoreShowChannelsComplete", "host-abcde-00000003");
        complete.set_header("ListItems", "3");
        assert!(matches!(
            aggregate.evaluate_event(complete),
            Evaluation::Finalised
        ));

        assert!(!aggregate.valid());
        assert_eq!(
            aggregate.error_message(),
            Some("Expected 3 list-items; received 1")
        );
    }

    #[test]
    fn finaliser_without_count_header_skips_validation() {
        let mut aggregate = aggregate();
        let complete = event("CoreShowChannelsComplete", "host-abcde-00000003");
        assert!(matches!(
            aggregate.evaluate_event(complete),
            Evaluation::Finalised
        ));
        assert!(aggregate.valid());
    }

    #[test]
    fn expiry_is_deadline_based() {
        let aggregate = Aggregate::new(
            &CORE_SHOW_CHANNELS_AGGREGATE,
            "x".to_owned(),
            Instant::now() - Duration::from_millis(1),
        );
        assert!(aggregate.expired(Instant::now()));
    }
}
