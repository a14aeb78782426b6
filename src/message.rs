//! The manager message model.
//!
//! Everything received from Asterisk over the manager interface is a [`Message`]: an
//! ordered collection of `Header: Value` pairs plus an optional free-form data payload
//! (used by commands that stream multi-line output). Responses and events share this
//! representation and are told apart by which of the `Response`/`Event` headers is set.

/// The header that identifies an action being requested of Asterisk.
pub const KEY_ACTION: &str = "Action";
/// The header that carries the correlation token of a request.
pub const KEY_ACTION_ID: &str = "ActionID";
/// The header that carries the name of an unsolicited event.
pub const KEY_EVENT: &str = "Event";
/// The header that carries the disposition of a response.
pub const KEY_RESPONSE: &str = "Response";

/// Surrogate name given to responses that could not be identified.
pub const RESPONSE_GENERIC: &str = "Generic Response";
/// Surrogate name given to unidentifiable unsolicited events.
pub const EVENT_GENERIC: &str = "Generic Event";

/// An ordered mapping from header name to header value.
///
/// Header names are case-sensitive ASCII words. Lookup returns the first entry with a
/// matching name; [`Headers::push`] always appends, which produces one wire line per
/// value for headers that repeat.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of the first header named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces the first header named `name`, or appends a new entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Appends an entry without replacing earlier ones with the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A structured record received from Asterisk: headers plus a data payload.
///
/// Every message decoded from the wire has either an `Event` or a `Response` header.
/// When the server sent neither, one is synthesised: a message carrying an `ActionID`
/// becomes a [`RESPONSE_GENERIC`] response, anything else a [`EVENT_GENERIC`] event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    headers: Headers,
    data: Vec<String>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(headers: Headers, data: Vec<String>) -> Self {
        Self { headers, data }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the value of the first header named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// The data payload: raw lines following the headers, stripped of terminators.
    pub fn data(&self) -> &[String] {
        &self.data
    }

    /// The name of the event or response.
    pub fn name(&self) -> &str {
        self.headers
            .get(KEY_EVENT)
            .or_else(|| self.headers.get(KEY_RESPONSE))
            .unwrap_or_default()
    }

    /// The correlation token associated with this message, if any.
    pub fn action_id(&self) -> Option<&str> {
        self.headers.get(KEY_ACTION_ID)
    }

    pub fn is_event(&self) -> bool {
        self.headers.contains(KEY_EVENT)
    }

    pub fn is_response(&self) -> bool {
        self.headers.contains(KEY_RESPONSE)
    }

    /// Fills in a surrogate `Response`/`Event` header when the server sent neither.
    pub(crate) fn synthesise_name(&mut self) {
        if !self.is_event() && !self.is_response() {
            if self.action_id().is_some() {
                self.headers.set(KEY_RESPONSE, RESPONSE_GENERIC);
            } else {
                self.headers.set(KEY_EVENT, EVENT_GENERIC);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_keep_insertion_order_and_first_wins() {
        let mut headers = Headers::new();
        headers.push("Variable", "a=1");
        headers.push("Variable", "b=2");
        headers.push("Channel", "SIP/1001");

        assert_eq!(headers.get("Variable"), Some("a=1"));
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![
                ("Variable", "a=1"),
                ("Variable", "b=2"),
                ("Channel", "SIP/1001")
            ]
        );
    }

    #[test]
    fn set_replaces_first_entry_only() {
        let mut headers = Headers::new();
        headers.push("Variable", "a=1");
        headers.push("Variable", "b=2");
        headers.set("Variable", "c=3");

        assert_eq!(headers.get("Variable"), Some("c=3"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn name_prefers_event_over_response() {
        let mut message = Message::new();
        message.set_header(KEY_RESPONSE, "Success");
        assert_eq!(message.name(), "Success");
        message.set_header(KEY_EVENT, "Newchannel");
        assert_eq!(message.name(), "Newchannel");
    }

    #[test]
    fn synthesis_depends_on_action_id() {
        let mut response = Message::new();
        response.set_header(KEY_ACTION_ID, "host-abcde-00000001");
        response.synthesise_name();
        assert_eq!(response.get(KEY_RESPONSE), Some(RESPONSE_GENERIC));

        let mut event = Message::new();
        event.set_header("Channel", "SIP/1001-00000001");
        event.synthesise_name();
        assert_eq!(event.get(KEY_EVENT), Some(EVENT_GENERIC));
    }
}
