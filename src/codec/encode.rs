//! Encoding of outbound manager actions.

use crate::{
    codec::EOL,
    message::{KEY_ACTION, KEY_ACTION_ID},
};

/// Serialises an action into its wire form.
///
/// The `Action` header is always emitted first and the correlation token last; any
/// `Action`/`ActionID` entries smuggled into `headers` are dropped in favour of the
/// explicit arguments. The record ends with an additional CRLF.
pub fn encode_action<'a, I>(name: &str, headers: I, action_id: &str) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = Vec::new();
    push_header(&mut out, KEY_ACTION, name);
    for (header, value) in headers {
        if header == KEY_ACTION || header == KEY_ACTION_ID {
            continue;
        }
        push_header(&mut out, header, value);
    }
    push_header(&mut out, KEY_ACTION_ID, action_id);
    out.extend_from_slice(EOL.as_bytes());
    out
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(EOL.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode::MessageDecoder;

    #[test]
    fn action_header_first_token_last() {
        let encoded = encode_action(
            "Originate",
            [("Channel", "SIP/1001"), ("Context", "default")],
            "host-abcde-00000004",
        );

        assert_eq!(
            encoded,
            b"Action: Originate\r\n\
              Channel: SIP/1001\r\n\
              Context: default\r\n\
              ActionID: host-abcde-00000004\r\n\
              \r\n"
        );
    }

    #[test]
    fn repeated_headers_emit_one_line_each() {
        let encoded = encode_action(
            "Originate",
            [("Variable", "a=1"), ("Variable", "b=2")],
            "1",
        );

        let text = String::from_utf8(encoded).unwrap();
        assert_eq!(text.matches("Variable:").count(), 2);
    }

    #[test]
    fn caller_supplied_action_and_token_headers_are_dropped() {
        let encoded = encode_action("Ping", [("ActionID", "bogus"), ("Action", "Nope")], "real");
        let text = String::from_utf8(encoded).unwrap();

        assert!(!text.contains("bogus"));
        assert!(!text.contains("Nope"));
        assert!(text.contains("ActionID: real\r\n"));
    }

    #[test]
    fn encoded_actions_decode_to_the_same_headers() {
        let encoded = encode_action("Ping", [("Foo", "Bar")], "host-abcde-00000001");
        let mut decoder = MessageDecoder::new();

        let mut decoded = None;
        let text = String::from_utf8(encoded).unwrap();
        let mut rest = text.as_str();
        while let Some(at) = rest.find('\n') {
            let (line, tail) = rest.split_at(at + 1);
            rest = tail;
            if let Some(message) = decoder.feed(line) {
                decoded = Some(message);
            }
        }

        let message = decoded.unwrap();
        assert_eq!(message.get("Action"), Some("Ping"));
        assert_eq!(message.get("Foo"), Some("Bar"));
        assert_eq!(message.action_id(), Some("host-abcde-00000001"));
    }
}
