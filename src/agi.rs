//! The Asterisk Gateway Interface line engine.
//!
//! An AGI session speaks a strict request/response protocol over a bidirectional
//! byte stream: standard I/O when Asterisk spawns the script directly, or an
//! accepted TCP connection in FastAGI deployments (port 4573 by convention). The
//! server opens with an environment preamble of `key: value` lines ended by a blank
//! line; afterwards every command written produces exactly one coded response line.
//!
//! ```no_run
//! use asterisk_client::agi::{actions, Agi};
//!
//! # fn main() -> Result<(), asterisk_client::agi::AgiError> {
//! let mut agi = Agi::from_stdio()?;
//! agi.execute(&actions::Answer::new())?;
//! let digit = agi.execute(&actions::StreamFile::new("welcome"))?;
//! println!("pressed: {digit:?}");
//! # Ok(())
//! # }
//! ```

pub mod actions;

use std::{
    collections::HashMap,
    fmt,
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::BytesMut;
use log::debug;
use nom::{
    bytes::complete::{take_until, take_while1},
    character::complete::{char, digit1, multispace1},
    combinator::{map_res, opt},
    sequence::{delimited, preceded},
    IResult,
};
use thiserror::Error;

/// The port FastAGI servers conventionally listen on.
pub const DEFAULT_PORT: u16 = 4573;

const RESULT_KEY: &str = "result";

/// Encapsulates a command argument in ASCII double quotes.
pub fn quote(value: impl fmt::Display) -> String {
    format!("\"{value}\"")
}

/// The value/data pair attached to one response key.
///
/// In `result=0 (timeout)` the value is `0` and the data is `timeout`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueData {
    pub value: String,
    pub data: Option<String>,
}

/// A parsed `200` response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgiResponse {
    /// Key to value/data pairs from the response line.
    pub items: HashMap<String, ValueData>,
    /// The leading decimal code.
    pub code: u16,
    /// The line as received, excluding the code.
    pub raw: String,
}

impl AgiResponse {
    /// The mandatory `result` pair.
    pub fn result(&self) -> Option<&ValueData> {
        self.items.get(RESULT_KEY)
    }
}

/// Why a hangup was reported.
#[derive(Debug, Error)]
pub enum HangupCause {
    /// The server answered a hangup-checking command with a `hangup` result; the
    /// response is attached.
    #[error("the server reported a hangup result")]
    Result(AgiResponse),
    /// The byte stream to the server was severed.
    #[error("the communication pipe was severed: {0}")]
    Pipe(String),
    /// An asynchronous hangup signal was observed.
    #[error("an asynchronous hangup signal was observed")]
    Signal,
}

/// An error executing a gateway command.
#[derive(Debug, Error)]
pub enum AgiError {
    /// A `200` response came without the mandatory `result` pair.
    #[error("no 'result' key-value pair was provided in the response")]
    NoResult { items: HashMap<String, ValueData> },
    /// The command ran and reported failure (`result=-1`).
    #[error("application error: {message}")]
    App {
        message: String,
        items: HashMap<String, ValueData>,
    },
    /// Code `510`: the command is invalid or unknown.
    #[error("invalid or unknown command: {0}")]
    InvalidCommand(String),
    /// Code `511`: the command was attempted on a dead channel.
    #[error("command not permitted on a dead channel: {0}")]
    DeadChannel(String),
    /// Code `520`: bad syntax; carries the full usage diagnostic.
    #[error("invalid command usage:\n{0}")]
    Usage(String),
    #[error("unhandled response code {code}: {line}")]
    UnknownResponse { code: u16, line: String },
    /// The call is over, one way or another.
    #[error("channel hangup detected: {0}")]
    Hangup(HangupCause),
}

/// A command that can be issued over the gateway.
pub trait AgiAction {
    /// What the command resolves to once its response has been processed.
    type Response;

    /// The full command line, without the trailing newline.
    fn command(&self) -> String;

    /// When false, a `hangup` result is handed to [`AgiAction::process_response`]
    /// as an ordinary value. Queries whose legitimate output may be the literal
    /// string `hangup` opt out this way.
    fn check_hangup(&self) -> bool {
        true
    }

    fn process_response(&self, response: AgiResponse) -> Result<Self::Response, AgiError>;
}

/// A gateway session over an arbitrary byte stream.
///
/// Construction consumes the environment preamble. Every [`Agi::execute`] first
/// consults the shared hangup flag, so an embedding application can fail the next
/// command by wiring its signal handling to [`Agi::hangup_signal`].
pub struct Agi<R, W> {
    reader: R,
    writer: W,
    buffer: BytesMut,
    environment: HashMap<String, String>,
    hangup_flag: Arc<AtomicBool>,
    skip_hangup_sentinel: bool,
}

impl<R, W> fmt::Debug for Agi<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agi")
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

impl Agi<io::Stdin, io::Stdout> {
    /// Opens the session Asterisk set up on standard I/O.
    pub fn from_stdio() -> Result<Self, AgiError> {
        Self::new(io::stdin(), io::stdout())
    }
}

impl<R: Read, W: Write> Agi<R, W> {
    /// Wraps an established byte stream and reads the environment preamble.
    pub fn new(reader: R, writer: W) -> Result<Self, AgiError> {
        let mut agi = Self {
            reader,
            writer,
            buffer: BytesMut::new(),
            environment: HashMap::new(),
            hangup_flag: Arc::new(AtomicBool::new(false)),
            skip_hangup_sentinel: false,
        };
        agi.read_environment()?;
        // Unless the dialplan asked for explicit HANGUP notification, a bare
        // HANGUP line is protocol noise to be skipped on read.
        agi.skip_hangup_sentinel = matches!(
            agi.environment.get("AGISIGHUP").map(String::as_str),
            None | Some("no")
        );
        Ok(agi)
    }

    /// Reads `key: value` lines from the stream until a blank line terminates
    /// the preamble, populating [`Agi::environment`].
    fn read_environment(&mut self) -> Result<(), AgiError> {
        loop {
            let line = self.read_raw_line()?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return Ok(());
            }
            if let Some((key, value)) = trimmed.split_once(": ") {
                self.environment.insert(key.to_owned(), value.to_owned());
            }
        }
    }

    /// The environment variables Asterisk announced for this channel.
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    /// A flag that fails the next [`Agi::execute`] with a hangup when set.
    pub fn hangup_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.hangup_flag)
    }

    /// The script path of a FastAGI request, without query arguments.
    pub fn request_path(&self) -> &str {
        let script = self
            .environment
            .get("agi_network_script")
            .map(String::as_str)
            .unwrap_or("/");
        script.split('?').next().unwrap_or("/")
    }

    /// The raw query string of a FastAGI request, if one was supplied.
    pub fn query_string(&self) -> Option<&str> {
        self.environment
            .get("agi_network_script")?
            .split_once('?')
            .map(|(_, query)| query)
    }

    /// The `agi_arg_N` positional arguments, in order.
    pub fn positional_args(&self) -> Vec<&str> {
        let mut args: Vec<(u32, &str)> = self
            .environment
            .iter()
            .filter_map(|(key, value)| {
                let index = key.strip_prefix("agi_arg_")?.parse().ok()?;
                Some((index, value.as_str()))
            })
            .collect();
        args.sort_by_key(|(index, _)| *index);
        args.into_iter().map(|(_, value)| value).collect()
    }

    /// Sends `action` and blocks until its response has been processed.
    pub fn execute<A: AgiAction>(&mut self, action: &A) -> Result<A::Response, AgiError> {
        self.test_hangup()?;
        let command = action.command();
        debug!("gateway execute: {command}");
        self.send_command(&command)?;
        let response = self.read_result(action.check_hangup())?;
        action.process_response(response)
    }

    fn test_hangup(&self) -> Result<(), AgiError> {
        if self.hangup_flag.load(Ordering::Relaxed) {
            return Err(AgiError::Hangup(HangupCause::Signal));
        }
        Ok(())
    }

    fn send_command(&mut self, command: &str) -> Result<(), AgiError> {
        let mut line = command.trim_end().to_owned();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|error| {
                AgiError::Hangup(HangupCause::Pipe(format!("socket link broken: {error}")))
            })
    }

    /// Reads a raw line, blocking until the terminator arrives. Fragments are
    /// reassembled; a severed stream surfaces as a pipe hangup.
    fn read_raw_line(&mut self) -> Result<String, AgiError> {
        loop {
            if let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let line = self.buffer.split_to(position + 1);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            let mut chunk = [0u8; 1024];
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    return Err(AgiError::Hangup(HangupCause::Pipe(
                        "process input pipe closed".to_owned(),
                    )))
                }
                Ok(count) => self.buffer.extend_from_slice(&chunk[..count]),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    return Err(AgiError::Hangup(HangupCause::Pipe(format!(
                        "process input pipe broken: {error}"
                    ))))
                }
            }
        }
    }

    fn read_line(&mut self) -> Result<String, AgiError> {
        loop {
            let line = self.read_raw_line()?;
            if self.skip_hangup_sentinel && line == "HANGUP\n" {
                continue;
            }
            return Ok(line.trim().to_owned());
        }
    }

    fn read_result(&mut self, check_hangup: bool) -> Result<AgiResponse, AgiError> {
        let line = self.read_line()?;
        let (code, remainder) = parse_code_line(&line).unwrap_or((0, ""));

        match code {
            200 => {
                let items = parse_items(remainder);
                let result = match items.get(RESULT_KEY) {
                    Some(result) => result.clone(),
                    None => return Err(AgiError::NoResult { items }),
                };
                if result.value == "-1" {
                    return Err(AgiError::App {
                        message: "the command reported a failure result".to_owned(),
                        items,
                    });
                }
                if check_hangup && result.data.as_deref() == Some("hangup") {
                    // A 'hangup' response usually means the channel went away, but
                    // it is a legal variable value; see `AgiAction::check_hangup`.
                    return Err(AgiError::Hangup(HangupCause::Result(AgiResponse {
                        items,
                        code,
                        raw: remainder.to_owned(),
                    })));
                }
                Ok(AgiResponse {
                    items,
                    code,
                    raw: remainder.to_owned(),
                })
            }
            // No code usually means a signal arrived instead of a response.
            0 => Err(AgiError::Hangup(HangupCause::Signal)),
            510 => Err(AgiError::InvalidCommand(line)),
            511 => Err(AgiError::DeadChannel(line)),
            520 => {
                let mut usage = vec![line];
                loop {
                    let line = self.read_line()?;
                    let done = line.starts_with("520");
                    usage.push(line);
                    if done {
                        break;
                    }
                }
                Err(AgiError::Usage(usage.join("\n")))
            }
            _ => Err(AgiError::UnknownResponse { code, line }),
        }
    }
}

fn parse_code_line(line: &str) -> Option<(u16, &str)> {
    let (rest, code) = code(line).ok()?;
    let rest = rest.trim_start();
    if rest.is_empty() {
        return None;
    }
    Some((code, rest))
}

fn code(input: &str) -> IResult<&str, u16> {
    map_res(digit1, str::parse)(input)
}

fn kv_pair(input: &str) -> IResult<&str, (&str, Option<&str>, Option<&str>)> {
    let (rest, key) = take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)?;
    let (rest, _) = char('=')(rest)?;
    let (rest, value) = opt(take_while1(|c: char| !c.is_whitespace()))(rest)?;
    let (rest, data) = opt(preceded(
        multispace1,
        delimited(char('('), take_until(")"), char(')')),
    ))(rest)?;
    Ok((rest, (key, value, data)))
}

/// Extracts every `key=value` pair, with its optional `(data)` parenthetical, from
/// the remainder of a `200` line. Unparsable stretches are skipped.
fn parse_items(input: &str) -> HashMap<String, ValueData> {
    let mut items = HashMap::new();
    let mut rest = input;
    while !rest.is_empty() {
        match kv_pair(rest) {
            Ok((tail, (key, value, data))) => {
                items.insert(
                    key.to_owned(),
                    ValueData {
                        value: value.unwrap_or_default().to_owned(),
                        data: data.map(str::to_owned),
                    },
                );
                rest = tail;
            }
            Err(_) => {
                let mut chars = rest.chars();
                chars.next();
                rest = chars.as_str();
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::{actions, *};

    const PREAMBLE: &str = "agi_network: yes\n\
        agi_network_script: demo?mode=test\n\
        agi_request: agi://localhost/demo\n\
        agi_channel: SIP/1001-00000001\n\
        agi_arg_1: first\n\
        agi_arg_2: second\n\
        \n";

    /// A reader that yields its input in caller-chosen chunks, so tests can force
    /// fragmented lines.
    struct Chunked {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Chunked {
        fn new(chunks: &[&str]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
            }
        }
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let count = chunk.len().min(buf.len());
                    buf[..count].copy_from_slice(&chunk[..count]);
                    if count < chunk.len() {
                        self.chunks.push_front(chunk[count..].to_vec());
                    }
                    Ok(count)
                }
                None => Ok(0),
            }
        }
    }

    fn session(wire: &str) -> Agi<Chunked, Vec<u8>> {
        let input = format!("{PREAMBLE}{wire}");
        Agi::new(Chunked::new(&[input.as_str()]), Vec::new()).unwrap()
    }

    #[test]
    fn environment_is_parsed_and_exposed() {
        let agi = session("");
        assert_eq!(
            agi.environment().get("agi_channel").map(String::as_str),
            Some("SIP/1001-00000001")
        );
        assert_eq!(agi.request_path(), "demo");
        assert_eq!(agi.query_string(), Some("mode=test"));
        assert_eq!(agi.positional_args(), vec!["first", "second"]);
    }

    #[test]
    fn execute_writes_the_command_and_parses_the_response() {
        let mut agi = session("200 result=0\n");
        agi.execute(&actions::Answer::new()).unwrap();
        assert_eq!(agi.writer, b"ANSWER\n");
    }

    #[test]
    fn get_data_reports_value_and_timeout() {
        let mut agi = session("200 result=42 (timeout)\n");
        let (digits, timed_out) = agi
            .execute(&actions::GetData::new("prompt"))
            .unwrap();
        assert_eq!(digits, "42");
        assert!(timed_out);
    }

    #[test]
    fn hangup_results_raise_on_checking_actions() {
        let mut agi = session("200 result=0 (hangup)\n");
        match agi.execute(&actions::StreamFile::new("welcome")) {
            Err(AgiError::Hangup(HangupCause::Result(response))) => {
                assert_eq!(response.raw, "result=0 (hangup)");
                assert_eq!(response.result().unwrap().data.as_deref(), Some("hangup"));
            }
            other => panic!("expected a result hangup, got {other:?}"),
        }
    }

    #[test]
    fn hangup_safe_queries_return_the_literal_value() {
        let mut agi = session("200 result=1 (hangup)\n");
        let value = agi
            .execute(&actions::GetVariable::new("DIALSTATUS"))
            .unwrap();
        assert_eq!(value.as_deref(), Some("hangup"));
    }

    #[test]
    fn failure_results_are_application_errors() {
        let mut agi = session("200 result=-1\n");
        assert!(matches!(
            agi.execute(&actions::Answer::new()),
            Err(AgiError::App { .. })
        ));
    }

    #[test]
    fn missing_result_is_reported_with_partial_items() {
        let mut agi = session("200 foo=bar\n");
        match agi.execute(&actions::Answer::new()) {
            Err(AgiError::NoResult { items }) => {
                assert_eq!(items.get("foo").unwrap().value, "bar");
            }
            other => panic!("expected NoResult, got {other:?}"),
        }
    }

    #[test]
    fn error_codes_map_to_their_kinds() {
        let mut agi = session("510 Invalid or unknown command\n");
        assert!(matches!(
            agi.execute(&actions::Answer::new()),
            Err(AgiError::InvalidCommand(_))
        ));

        let mut agi = session("511 Command Not Permitted on a dead channel\n");
        assert!(matches!(
            agi.execute(&actions::Answer::new()),
            Err(AgiError::DeadChannel(_))
        ));

        let mut agi = session("418 I'm a teapot\n");
        assert!(matches!(
            agi.execute(&actions::Answer::new()),
            Err(AgiError::UnknownResponse { code: 418, .. })
        ));
    }

    #[test]
    fn usage_errors_collect_the_whole_diagnostic() {
        let mut agi = session(
            "520-Invalid command syntax. Proper usage follows:\n\
             Usage: ANSWER\n\
             Answers channel if not already in answer state.\n\
             520 End of proper usage.\n",
        );
        match agi.execute(&actions::Answer::new()) {
            Err(AgiError::Usage(diagnostic)) => {
                assert!(diagnostic.starts_with("520-Invalid command syntax"));
                assert!(diagnostic.ends_with("520 End of proper usage."));
                assert!(diagnostic.contains("Usage: ANSWER"));
            }
            other => panic!("expected Usage, got {other:?}"),
        }
    }

    #[test]
    fn missing_code_is_treated_as_hangup() {
        let mut agi = session("HANGUP EVERYTHING\n");
        assert!(matches!(
            agi.execute(&actions::Answer::new()),
            Err(AgiError::Hangup(HangupCause::Signal))
        ));
    }

    #[test]
    fn fragmented_lines_are_reassembled() {
        let input = format!("{PREAMBLE}200 res");
        let mut agi = Agi::new(
            Chunked::new(&[input.as_str(), "ult=1", " (dtmf)\n"]),
            Vec::new(),
        )
        .unwrap();

        let response = agi.read_result(true).unwrap();
        assert_eq!(response.result().unwrap().value, "1");
        assert_eq!(response.result().unwrap().data.as_deref(), Some("dtmf"));
    }

    #[test]
    fn severed_pipe_is_a_hangup() {
        let input = format!("{PREAMBLE}200 resul");
        let mut agi = Agi::new(Chunked::new(&[input.as_str()]), Vec::new()).unwrap();
        assert!(matches!(
            agi.execute(&actions::Answer::new()),
            Err(AgiError::Hangup(HangupCause::Pipe(_)))
        ));
    }

    #[test]
    fn bare_hangup_lines_are_skipped_by_default() {
        let mut agi = session("HANGUP\n200 result=1\n");
        let response = agi.read_result(true).unwrap();
        assert_eq!(response.result().unwrap().value, "1");
    }

    #[test]
    fn hangup_sentinel_is_kept_when_sighup_was_requested() {
        let input = "agi_network: yes\nAGISIGHUP: yes\n\nHANGUP\n";
        let mut agi = Agi::new(Chunked::new(&[input]), Vec::new()).unwrap();
        // With AGISIGHUP active the HANGUP line reaches the parser, which finds no
        // code on it.
        assert!(matches!(
            agi.read_result(true),
            Err(AgiError::Hangup(HangupCause::Signal))
        ));
    }

    #[test]
    fn hangup_signal_fails_the_next_execute() {
        let mut agi = session("200 result=0\n");
        agi.hangup_signal().store(true, Ordering::Relaxed);
        assert!(matches!(
            agi.execute(&actions::Answer::new()),
            Err(AgiError::Hangup(HangupCause::Signal))
        ));
    }

    #[test]
    fn items_parser_handles_values_and_data() {
        let items = parse_items("result=1 (speech) endpos=12480 results=1");
        assert_eq!(items.get("result").unwrap().value, "1");
        assert_eq!(items.get("result").unwrap().data.as_deref(), Some("speech"));
        assert_eq!(items.get("endpos").unwrap().value, "12480");
        assert_eq!(items.get("results").unwrap().value, "1");

        let items = parse_items("result= (timeout)");
        assert_eq!(items.get("result").unwrap().value, "");
        assert_eq!(items.get("result").unwrap().data.as_deref(), Some("timeout"));
    }
}
