//! The line-oriented wire codec shared by the manager connection.
//!
//! Inbound bytes are split into CRLF-terminated lines, assembled into messages by
//! [`decode::MessageDecoder`], and parsed into [`Message`](crate::message::Message)
//! values. Outbound actions are serialised by [`encode::encode_action`].

pub mod decode;
pub mod encode;

/// Asterisk ends its lines with CRLF.
pub(crate) const EOL: &str = "\r\n";

/// Marks the end of a `Response: Follows` payload block.
pub(crate) const EOC: &str = "--END COMMAND--";
