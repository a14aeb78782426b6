//! The gateway command catalogue.
//!
//! Each type assembles one AGI command line and digests its response into a native
//! value. Optional arguments that are unset are omitted from the line entirely.

use std::collections::HashMap;

use crate::agi::{quote, AgiAction, AgiError, AgiResponse, ValueData};

/// Builds a command line from a verb and optional arguments, dropping unset ones.
fn command_line(verb: &str, arguments: &[Option<String>]) -> String {
    let mut line = verb.to_owned();
    for argument in arguments.iter().flatten() {
        line.push(' ');
        line.push_str(argument);
    }
    line
}

/// Interprets a result value as a DTMF key press.
fn to_char(value: &str, items: &HashMap<String, ValueData>) -> Result<char, AgiError> {
    value
        .parse::<u32>()
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| AgiError::App {
            message: format!("unable to convert result to a DTMF character: {value:?}"),
            items: items.clone(),
        })
}

/// The millisecond offset reported under `endpos`, or -1 when absent.
fn endpos(items: &HashMap<String, ValueData>) -> i64 {
    items
        .get("endpos")
        .and_then(|pair| pair.value.parse().ok())
        .unwrap_or(-1)
}

/// Answers the call on the channel. A no-op if already answered.
#[derive(Debug, Default)]
pub struct Answer;

impl Answer {
    pub fn new() -> Self {
        Self
    }
}

impl AgiAction for Answer {
    type Response = ();

    fn command(&self) -> String {
        "ANSWER".to_owned()
    }

    fn process_response(&self, _response: AgiResponse) -> Result<(), AgiError> {
        Ok(())
    }
}

/// Reports the state of this channel or, if set, of the named channel.
///
/// The returned integer is one of the documented channel states, 0 through 7;
/// values outside that range are passed along verbatim.
#[derive(Debug, Default)]
pub struct ChannelStatus {
    channel: Option<String>,
}

impl ChannelStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

impl AgiAction for ChannelStatus {
    type Response = i64;

    fn command(&self) -> String {
        command_line("CHANNEL STATUS", &[self.channel.as_deref().map(quote)])
    }

    fn process_response(&self, response: AgiResponse) -> Result<i64, AgiError> {
        let result = response.result().cloned().unwrap_or(ValueData {
            value: String::new(),
            data: None,
        });
        result.value.parse().map_err(|_| AgiError::App {
            message: format!(
                "'result' key-value pair contained a non-numeric value: {:?}",
                result.value
            ),
            items: response.items,
        })
    }
}

/// Runs a dialplan application on the channel, returning its raw result value.
#[derive(Debug)]
pub struct Exec {
    application: String,
    options: Option<String>,
}

impl Exec {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            options: None,
        }
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }
}

impl AgiAction for Exec {
    type Response = String;

    // The application output may legitimately contain the word 'hangup'.
    fn check_hangup(&self) -> bool {
        false
    }

    fn command(&self) -> String {
        command_line(
            "EXEC",
            &[
                Some(self.application.clone()),
                self.options.as_deref().map(quote),
            ],
        )
    }

    fn process_response(&self, response: AgiResponse) -> Result<String, AgiError> {
        Ok(response
            .result()
            .map(|result| result.value.clone())
            .unwrap_or_default())
    }
}

/// Plays a prompt and gathers DTMF digits.
///
/// Resolves to the digits entered and whether collection ended on the inter-digit
/// timeout.
#[derive(Debug)]
pub struct GetData {
    filename: String,
    timeout_ms: u32,
    max_digits: u32,
}

impl GetData {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            timeout_ms: 2000,
            max_digits: 255,
        }
    }

    pub fn timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn max_digits(mut self, max_digits: u32) -> Self {
        self.max_digits = max_digits;
        self
    }
}

impl AgiAction for GetData {
    type Response = (String, bool);

    fn command(&self) -> String {
        command_line(
            "GET DATA",
            &[
                Some(quote(&self.filename)),
                Some(quote(self.timeout_ms)),
                Some(quote(self.max_digits)),
            ],
        )
    }

    fn process_response(&self, response: AgiResponse) -> Result<(String, bool), AgiError> {
        let result = response.result().cloned().unwrap_or(ValueData {
            value: String::new(),
            data: None,
        });
        Ok((result.value, result.data.as_deref() == Some("timeout")))
    }
}

/// Reads a channel variable, resolving to `None` when it is undefined.
#[derive(Debug)]
pub struct GetVariable {
    variable: String,
}

impl GetVariable {
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
        }
    }
}

impl AgiAction for GetVariable {
    type Response = Option<String>;

    // The variable's value may legitimately be the literal string 'hangup'.
    fn check_hangup(&self) -> bool {
        false
    }

    fn command(&self) -> String {
        command_line("GET VARIABLE", &[Some(quote(&self.variable))])
    }

    fn process_response(&self, response: AgiResponse) -> Result<Option<String>, AgiError> {
        match response.result() {
            Some(result) if result.value == "1" => {
                Ok(Some(result.data.clone().unwrap_or_default()))
            }
            _ => Ok(None),
        }
    }
}

/// Hangs up this channel, or the named one.
#[derive(Debug, Default)]
pub struct Hangup {
    channel: Option<String>,
}

impl Hangup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

impl AgiAction for Hangup {
    type Response = ();

    fn command(&self) -> String {
        command_line("HANGUP", &[self.channel.as_deref().map(quote)])
    }

    fn process_response(&self, _response: AgiResponse) -> Result<(), AgiError> {
        Ok(())
    }
}

/// Reads back a string of digits, interruptible by the escape digits.
///
/// Resolves to the interrupting key, or `None` when playback ran to completion.
#[derive(Debug)]
pub struct SayDigits {
    digits: String,
    escape_digits: String,
}

impl SayDigits {
    pub fn new(digits: impl Into<String>) -> Self {
        Self {
            digits: digits.into(),
            escape_digits: String::new(),
        }
    }

    pub fn escape_digits(mut self, escape_digits: impl Into<String>) -> Self {
        self.escape_digits = escape_digits.into();
        self
    }
}

impl AgiAction for SayDigits {
    type Response = Option<char>;

    fn command(&self) -> String {
        command_line(
            "SAY DIGITS",
            &[Some(quote(&self.digits)), Some(quote(&self.escape_digits))],
        )
    }

    fn process_response(&self, response: AgiResponse) -> Result<Option<char>, AgiError> {
        digit_press(&response)
    }
}

/// Sets a variable on this channel.
#[derive(Debug)]
pub struct SetVariable {
    name: String,
    value: String,
}

impl SetVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl AgiAction for SetVariable {
    type Response = ();

    fn command(&self) -> String {
        command_line(
            "SET VARIABLE",
            &[Some(quote(&self.name)), Some(quote(&self.value))],
        )
    }

    fn process_response(&self, _response: AgiResponse) -> Result<(), AgiError> {
        Ok(())
    }
}

/// Plays an audio file, interruptible by the escape digits.
///
/// Resolves to the interrupting key and the millisecond offset where playback
/// stopped, or `None` when it completed on its own.
#[derive(Debug)]
pub struct StreamFile {
    filename: String,
    escape_digits: String,
    sample_offset: u64,
}

impl StreamFile {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            escape_digits: String::new(),
            sample_offset: 0,
        }
    }

    pub fn escape_digits(mut self, escape_digits: impl Into<String>) -> Self {
        self.escape_digits = escape_digits.into();
        self
    }

    pub fn sample_offset(mut self, sample_offset: u64) -> Self {
        self.sample_offset = sample_offset;
        self
    }
}

impl AgiAction for StreamFile {
    type Response = Option<(char, i64)>;

    fn command(&self) -> String {
        command_line(
            "STREAM FILE",
            &[
                Some(quote(&self.filename)),
                Some(quote(&self.escape_digits)),
                Some(quote(self.sample_offset)),
            ],
        )
    }

    fn process_response(&self, response: AgiResponse) -> Result<Option<(char, i64)>, AgiError> {
        match digit_press(&response)? {
            Some(key) => Ok(Some((key, endpos(&response.items)))),
            None => Ok(None),
        }
    }
}

/// Logs a message through Asterisk at the given verbosity level.
#[derive(Debug)]
pub struct Verbose {
    message: String,
    level: u8,
}

impl Verbose {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: 1,
        }
    }

    pub fn level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }
}

impl AgiAction for Verbose {
    type Response = ();

    fn command(&self) -> String {
        command_line(
            "VERBOSE",
            &[Some(quote(&self.message)), Some(quote(self.level))],
        )
    }

    fn process_response(&self, _response: AgiResponse) -> Result<(), AgiError> {
        Ok(())
    }
}

/// Waits up to `timeout_ms` for a DTMF key; -1 blocks indefinitely.
#[derive(Debug)]
pub struct WaitForDigit {
    timeout_ms: i64,
}

impl WaitForDigit {
    pub fn new() -> Self {
        Self { timeout_ms: -1 }
    }

    pub fn timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

impl Default for WaitForDigit {
    fn default() -> Self {
        Self::new()
    }
}

impl AgiAction for WaitForDigit {
    type Response = Option<char>;

    fn command(&self) -> String {
        command_line("WAIT FOR DIGIT", &[Some(quote(self.timeout_ms))])
    }

    fn process_response(&self, response: AgiResponse) -> Result<Option<char>, AgiError> {
        digit_press(&response)
    }
}

/// The shared "result is a key code unless zero" convention.
fn digit_press(response: &AgiResponse) -> Result<Option<char>, AgiError> {
    match response.result() {
        Some(result) if result.value != "0" => {
            to_char(&result.value, &response.items).map(Some)
        }
        _ => Ok(None),
    }
}
