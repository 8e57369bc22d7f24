//! Parsed AMI protocol units

use crate::constants::{HEADER_ACTION_ID, HEADER_EVENT, HEADER_RESPONSE};
use std::fmt;

/// Kind of a decoded AMI block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageKind {
    /// Reply to a client action (`Response` header present)
    Response,
    /// Unsolicited server notification (`Event` header present)
    Event,
    /// Block with neither marker header
    Unknown,
}

/// One decoded AMI block: ordered header/value pairs plus derived fields.
///
/// Header lookup is case-insensitive (`response`, `Response` and `RESPONSE`
/// address the same header), but the original names and their wire order are
/// preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct AmiMessage {
    headers: Vec<(String, String)>,
    kind: MessageKind,
    success: bool,
    event_name: Option<String>,
    action_id: Option<String>,
}

impl AmiMessage {
    /// Build a message from ordered header pairs, deriving kind, success
    /// flag, event name and ActionID.
    pub fn from_headers(headers: Vec<(String, String)>) -> Self {
        fn lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        let response = lookup(&headers, HEADER_RESPONSE);
        let event = lookup(&headers, HEADER_EVENT);

        let kind = match (event, response) {
            (Some(_), _) => MessageKind::Event,
            (None, Some(_)) => MessageKind::Response,
            (None, None) => MessageKind::Unknown,
        };

        // `Follows` precedes command output and is a success per the AMI
        // convention; only `Error` (or a non-reply block) is a failure.
        let success = matches!(response, Some("Success") | Some("Follows"));

        let event_name = event.map(|s| s.to_string());
        let action_id = lookup(&headers, HEADER_ACTION_ID).map(|s| s.to_string());

        Self {
            headers,
            kind,
            success,
            event_name,
            action_id,
        }
    }

    /// Look up a header by name, case-insensitively. First match wins when
    /// a header repeats.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All header pairs in wire order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Kind of this block.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// `true` for `Response: Success` or `Response: Follows`.
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Event name for Event-kind messages.
    pub fn event_name(&self) -> Option<&str> {
        self.event_name
            .as_deref()
    }

    /// Echoed `ActionID`, when present.
    pub fn action_id(&self) -> Option<&str> {
        self.action_id
            .as_deref()
    }
}

impl fmt::Display for AmiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.headers {
            writeln!(f, "{}: {}", key, value)?;
        }
        Ok(())
    }
}
