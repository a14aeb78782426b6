//! The core action catalogue.
//!
//! Each type builds one manager request and knows how to interpret its response.
//! List-style actions can be driven two ways: asynchronously, producing an
//! aggregate event through the dispatcher, or synchronously, blocking the caller
//! until the member and finaliser events have been collected.

use std::{cell::Cell, time::Instant};

use crate::{
    manager::{
        action::{HeaderValue, ManagerAction},
        aggregate::AggregateSpec,
        events::{self, EventSpec},
        ManagerError,
    },
    message::{Message, KEY_RESPONSE},
};

const AUTH_TYPE_MD5: &str = "MD5";

/// Asks the server for a challenge token used to hash the login secret.
///
/// Pass the returned `Challenge` header to [`Login::with_challenge`].
#[derive(Debug)]
pub struct Challenge {
    auth_type: String,
}

impl Challenge {
    pub fn new() -> Self {
        Self {
            auth_type: AUTH_TYPE_MD5.to_owned(),
        }
    }
}

impl Default for Challenge {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerAction for Challenge {
    fn name(&self) -> &str {
        "Challenge"
    }

    fn headers(&self) -> Vec<(String, HeaderValue)> {
        vec![("AuthType".to_owned(), self.auth_type.as_str().into())]
    }
}

/// Authenticates to the manager.
///
/// With a challenge token the secret is never sent: the `Key` header carries
/// `md5(challenge + secret)` instead. An `Error` response surfaces as
/// [`ManagerError::AuthFailed`].
#[derive(Debug)]
pub struct Login {
    username: String,
    secret: String,
    challenge: Option<String>,
    events: bool,
}

impl Login {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            challenge: None,
            events: true,
        }
    }

    /// Answers a previously requested [`Challenge`].
    pub fn with_challenge(mut self, challenge: impl Into<String>) -> Self {
        self.challenge = Some(challenge.into());
        self
    }

    /// Set to `false` to suppress unsolicited events on this connection.
    pub fn events(mut self, events: bool) -> Self {
        self.events = events;
        self
    }
}

impl ManagerAction for Login {
    fn name(&self) -> &str {
        "Login"
    }

    fn headers(&self) -> Vec<(String, HeaderValue)> {
        let mut headers = vec![("Username".to_owned(), self.username.as_str().into())];
        match &self.challenge {
            Some(challenge) => {
                let key = md5::compute(format!("{}{}", challenge, self.secret));
                headers.push(("AuthType".to_owned(), AUTH_TYPE_MD5.into()));
                headers.push(("Key".to_owned(), format!("{key:x}").into()));
            }
            None => headers.push(("Secret".to_owned(), self.secret.as_str().into())),
        }
        if !self.events {
            headers.push(("Events".to_owned(), "off".into()));
        }
        headers
    }

    fn process_response(&self, response: &mut Message) -> Result<bool, ManagerError> {
        if response.get(KEY_RESPONSE) == Some("Error") {
            let message = response.get("Message").unwrap_or("login rejected").to_owned();
            return Err(ManagerError::AuthFailed(message));
        }
        Ok(matches!(
            response.get(KEY_RESPONSE),
            Some("Success") | Some("Follows")
        ))
    }
}

/// Ends the manager session, permitting reauthentication.
#[derive(Debug, Default)]
pub struct Logoff;

impl Logoff {
    pub fn new() -> Self {
        Self
    }
}

impl ManagerAction for Logoff {
    fn name(&self) -> &str {
        "Logoff"
    }
}

/// Pings the manager.
///
/// A `Pong` response gains an `RTT` header holding the round trip in seconds as a
/// float; any other response gets `RTT: -1`.
#[derive(Debug, Default)]
pub struct Ping {
    started: Cell<Option<Instant>>,
}

impl Ping {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ManagerAction for Ping {
    fn name(&self) -> &str {
        "Ping"
    }

    fn note_transmission(&self) {
        self.started.set(Some(Instant::now()));
    }

    fn process_response(&self, response: &mut Message) -> Result<bool, ManagerError> {
        if response.get(KEY_RESPONSE) == Some("Pong") {
            let elapsed = self
                .started
                .get()
                .map(|started| started.elapsed().as_secs_f64())
                .unwrap_or(-1.0);
            response.set_header("RTT", format!("{elapsed:.6}"));
            return Ok(true);
        }
        response.set_header("RTT", "-1");
        Ok(matches!(
            response.get(KEY_RESPONSE),
            Some("Success") | Some("Follows")
        ))
    }
}

/// Runs an arbitrary CLI command; the output arrives as the response's data lines.
#[derive(Debug)]
pub struct Command {
    command: String,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl ManagerAction for Command {
    fn name(&self) -> &str {
        "Command"
    }

    fn headers(&self) -> Vec<(String, HeaderValue)> {
        vec![("Command".to_owned(), self.command.as_str().into())]
    }
}

/// Changes which unsolicited events the server sends on this connection.
///
/// `mask` is `on`, `off`, or a comma-joined combination of `call`, `log`, and
/// `system`.
#[derive(Debug)]
pub struct Events {
    mask: String,
}

impl Events {
    pub fn new(mask: impl Into<String>) -> Self {
        Self { mask: mask.into() }
    }
}

impl ManagerAction for Events {
    fn name(&self) -> &str {
        "Events"
    }

    fn headers(&self) -> Vec<(String, HeaderValue)> {
        vec![("EventMask".to_owned(), self.mask.as_str().into())]
    }

    fn process_response(&self, response: &mut Message) -> Result<bool, ManagerError> {
        // This action answers with its own disposition vocabulary.
        Ok(matches!(
            response.get(KEY_RESPONSE),
            Some("Success") | Some("Events On") | Some("Events Off")
        ))
    }
}

/// Reads a channel or global variable; the value comes back under the `Value` header.
#[derive(Debug)]
pub struct Getvar {
    variable: String,
    channel: Option<String>,
}

impl Getvar {
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            channel: None,
        }
    }

    /// Scopes the lookup to a channel instead of the global namespace.
    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

impl ManagerAction for Getvar {
    fn name(&self) -> &str {
        "Getvar"
    }

    fn headers(&self) -> Vec<(String, HeaderValue)> {
        let mut headers = vec![("Variable".to_owned(), self.variable.as_str().into())];
        if let Some(channel) = &self.channel {
            headers.push(("Channel".to_owned(), channel.as_str().into()));
        }
        headers
    }
}

/// Sets a channel or global variable.
#[derive(Debug)]
pub struct Setvar {
    variable: String,
    value: String,
    channel: Option<String>,
}

impl Setvar {
    pub fn new(variable: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            value: value.into(),
            channel: None,
        }
    }

    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

impl ManagerAction for Setvar {
    fn name(&self) -> &str {
        "Setvar"
    }

    fn headers(&self) -> Vec<(String, HeaderValue)> {
        let mut headers = vec![
            ("Variable".to_owned(), self.variable.as_str().into()),
            ("Value".to_owned(), self.value.as_str().into()),
        ];
        if let Some(channel) = &self.channel {
            headers.push(("Channel".to_owned(), channel.as_str().into()));
        }
        headers
    }
}

/// Hangs up a channel. A `Hangup` event confirms the teardown; sending this action
/// synchronously blocks until that event arrives.
#[derive(Debug)]
pub struct Hangup {
    channel: String,
    synchronous: bool,
}

impl Hangup {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            synchronous: false,
        }
    }

    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }
}

impl ManagerAction for Hangup {
    fn name(&self) -> &str {
        "Hangup"
    }

    fn headers(&self) -> Vec<(String, HeaderValue)> {
        vec![("Channel".to_owned(), self.channel.as_str().into())]
    }

    fn synchronous(&self) -> bool {
        self.synchronous
    }

    fn finaliser_events(&self) -> &[&'static EventSpec] {
        static EVENTS: &[&EventSpec] = &[&events::HANGUP];
        EVENTS
    }
}

macro_rules! list_action {
    (
        $(#[$doc:meta])*
        $name:ident, $wire:literal, $aggregate:path, $member:path, $finaliser:path
    ) => {
        $(#[$doc])*
        #[derive(Debug, Default)]
        pub struct $name {
            synchronous: bool,
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            /// Blocks the caller until the member and finaliser events are in,
            /// instead of producing an aggregate.
            pub fn synchronous(mut self) -> Self {
                self.synchronous = true;
                self
            }
        }

        impl ManagerAction for $name {
            fn name(&self) -> &str {
                $wire
            }

            fn synchronous(&self) -> bool {
                self.synchronous
            }

            fn aggregates(&self) -> &[&'static AggregateSpec] {
                static AGGREGATES: &[&AggregateSpec] = &[&$aggregate];
                AGGREGATES
            }

            fn list_events(&self) -> &[&'static EventSpec] {
                static EVENTS: &[&EventSpec] = &[&$member];
                EVENTS
            }

            fn finaliser_events(&self) -> &[&'static EventSpec] {
                static FINALISERS: &[&EventSpec] = &[&$finaliser];
                FINALISERS
            }
        }
    };
}

list_action!(
    /// Lists all active channels as a burst of `CoreShowChannel` events.
    CoreShowChannels,
    "CoreShowChannels",
    events::CORE_SHOW_CHANNELS_AGGREGATE,
    events::CORE_SHOW_CHANNEL,
    events::CORE_SHOW_CHANNELS_COMPLETE
);

list_action!(
    /// Lists calls sitting in parking lots.
    ParkedCalls,
    "ParkedCalls",
    events::PARKED_CALLS_AGGREGATE,
    events::PARKED_CALL,
    events::PARKED_CALLS_COMPLETE
);

list_action!(
    /// Lists all SIP peers.
    SIPpeers,
    "SIPpeers",
    events::SIP_PEERS_AGGREGATE,
    events::PEER_ENTRY,
    events::PEERLIST_COMPLETE
);

list_action!(
    /// Reports the status of every active channel.
    Status,
    "Status",
    events::STATUS_AGGREGATE,
    events::STATUS,
    events::STATUS_COMPLETE
);
