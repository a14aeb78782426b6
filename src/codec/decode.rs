//! Decoding of inbound manager records.
//!
//! A message is one or more `Header: Value` lines followed by a CRLF-only separator
//! line. Two complications keep this from being a pure split-on-blank-line affair:
//!
//! * A response whose leading line matches `Response: Follows` carries a payload that
//!   runs past CRLFs until a line beginning with `--END COMMAND--`.
//! * Lines that end in `\n\r\n` or `\r\r\n`, that lack a `:` separator, or that follow
//!   any such line are payload fragments and belong to the message data, not to the
//!   headers.

use bytes::BytesMut;
use nom::{
    bytes::complete::{tag, take_until},
    character::complete::{char, multispace0, space0},
    combinator::eof,
    IResult,
};

use crate::{
    codec::{EOC, EOL},
    message::{Headers, Message},
};

/// Line endings that indicate data, not a header boundary.
const EOL_FAKE: [&str; 2] = ["\n\r\n", "\r\r\n"];

/// Splits one terminator-inclusive line off the front of `buffer`.
///
/// Returns `None` until a full line is available. Invalid UTF-8 is replaced rather
/// than rejected; Asterisk occasionally relays channel data verbatim.
pub(crate) fn take_line(buffer: &mut BytesMut) -> Option<String> {
    let position = buffer.iter().position(|byte| *byte == b'\n')?;
    let line = buffer.split_to(position + 1);
    Some(String::from_utf8_lossy(&line).into_owned())
}

fn header_line(input: &str) -> IResult<&str, (&str, &str)> {
    let (rest, name) = take_until(":")(input)?;
    let (value, _) = char(':')(rest)?;
    Ok(("", (name.trim(), value.trim())))
}

fn follows_indicator(input: &str) -> IResult<&str, ()> {
    let (rest, _) = tag("Response:")(input)?;
    let (rest, _) = space0(rest)?;
    let (rest, _) = tag("Follows")(rest)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, _) = eof(rest)?;
    Ok((rest, ()))
}

fn is_follows_indicator(line: &str) -> bool {
    follows_indicator(line).is_ok()
}

fn is_fake_eol(line: &str) -> bool {
    EOL_FAKE.iter().any(|ending| line.ends_with(ending))
}

/// Accumulates terminator-inclusive lines into complete [`Message`] values.
///
/// Feed lines as they come off the stream; a value is returned whenever a message
/// boundary is reached. Empty separator lines between messages are ignored, so the
/// decoder never yields an empty message.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    lines: Vec<String>,
    follows: bool,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one line, returning a message once its final line has been seen.
    pub fn feed(&mut self, line: &str) -> Option<Message> {
        if self.follows {
            if line.starts_with(EOC) {
                return self.finish();
            }
            self.lines.push(line.to_owned());
            return None;
        }

        if line == EOL {
            if self.lines.is_empty() {
                // Asterisk is allowed to send empty lines before and after real data.
                return None;
            }
            return self.finish();
        }

        if is_follows_indicator(line) {
            self.follows = true;
        }
        self.lines.push(line.to_owned());
        None
    }

    fn finish(&mut self) -> Option<Message> {
        self.follows = false;
        parse_message(std::mem::take(&mut self.lines))
    }
}

/// Parses collected lines into a message.
///
/// Headers are consumed until the first payload fragment; everything from there on is
/// data. Whitespace around header names and values is stripped.
fn parse_message(lines: Vec<String>) -> Option<Message> {
    if lines.is_empty() {
        return None;
    }

    let mut headers = Headers::new();
    let mut data = Vec::new();
    let mut in_data = false;

    for line in &lines {
        if !in_data {
            if is_fake_eol(line) || !line.ends_with(EOL) || !line.contains(':') {
                in_data = true;
            } else if let Ok((_, (name, value))) = header_line(line) {
                headers.push(name, value);
                continue;
            } else {
                in_data = true;
            }
        }
        data.push(line.trim().to_owned());
    }

    let mut message = Message::from_parts(headers, data);
    message.synthesise_name();
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EVENT_GENERIC, KEY_EVENT, KEY_RESPONSE, RESPONSE_GENERIC};

    fn decode(lines: &[&str]) -> Vec<Message> {
        let mut decoder = MessageDecoder::new();
        lines
            .iter()
            .filter_map(|line| decoder.feed(line))
            .collect()
    }

    #[test]
    fn take_line_waits_for_terminator() {
        let mut buffer = BytesMut::from(&b"Response: Succ"[..]);
        assert_eq!(take_line(&mut buffer), None);
        buffer.extend_from_slice(b"ess\r\nEvent:");
        assert_eq!(
            take_line(&mut buffer).as_deref(),
            Some("Response: Success\r\n")
        );
        assert_eq!(&buffer[..], b"Event:");
    }

    #[test]
    fn plain_response() {
        let messages = decode(&[
            "Response: Success\r\n",
            "ActionID: host-abcde-00000001\r\n",
            "Challenge: 9821749812\r\n",
            "\r\n",
        ]);

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].name(), "Success");
        assert_eq!(messages[0].action_id(), Some("host-abcde-00000001"));
        assert_eq!(messages[0].get("Challenge"), Some("9821749812"));
        assert!(messages[0].data().is_empty());
    }

    #[test]
    fn blank_lines_around_messages_are_ignored() {
        let messages = decode(&[
            "\r\n",
            "\r\n",
            "Event: Newchannel\r\n",
            "\r\n",
            "\r\n",
            "Event: Hangup\r\n",
            "\r\n",
        ]);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].name(), "Newchannel");
        assert_eq!(messages[1].name(), "Hangup");
    }

    #[test]
    fn follows_payload_runs_until_end_marker() {
        let messages = decode(&[
            "Response: Follows\r\n",
            "ActionID: host-abcde-00000002\r\n",
            "Channel (Context Extension Pri) State\n",
            "0 active channels\n",
            "\r\n",
            "looks: like a header\n",
            "--END COMMAND--\r\n",
            "\r\n",
        ]);

        // The trailing CRLF after the marker is ordinary inter-message padding.
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.name(), "Follows");
        assert_eq!(
            message.data(),
            &[
                "Channel (Context Extension Pri) State",
                "0 active channels",
                "",
                "looks: like a header",
            ]
        );
    }

    #[test]
    fn lines_after_first_data_line_stay_data() {
        let messages = decode(&[
            "Response: Success\r\n",
            "no separator here\r\n",
            "Trailing: header-like\r\n",
            "\r\n",
        ]);

        assert_eq!(
            messages[0].data(),
            &["no separator here", "Trailing: header-like"]
        );
        assert_eq!(messages[0].get("Trailing"), None);
    }

    #[test]
    fn fake_line_endings_are_data() {
        let message = parse_message(vec![
            "Event: Newexten\r\n".to_owned(),
            "AppData: payload\n\r\n".to_owned(),
        ])
        .unwrap();

        assert_eq!(message.get("AppData"), None);
        assert_eq!(message.data(), &["AppData: payload"]);
    }

    #[test]
    fn generic_names_are_synthesised() {
        let response = parse_message(vec!["ActionID: 17\r\n".to_owned()]).unwrap();
        assert_eq!(response.get(KEY_RESPONSE), Some(RESPONSE_GENERIC));

        let event = parse_message(vec!["Channel: SIP/1001-0001\r\n".to_owned()]).unwrap();
        assert_eq!(event.get(KEY_EVENT), Some(EVENT_GENERIC));
    }

    #[test]
    fn follows_indicator_tolerates_spacing() {
        assert!(is_follows_indicator("Response: Follows\r\n"));
        assert!(is_follows_indicator("Response:Follows\r\n"));
        assert!(is_follows_indicator("Response: Follows  \r\n"));
        assert!(!is_follows_indicator("Response: Success\r\n"));
        assert!(!is_follows_indicator("Response: Followsish\r\n"));
    }
}
