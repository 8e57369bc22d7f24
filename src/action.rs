//! Outgoing AMI actions and wire encoding

use crate::constants::{HEADER_ACTION, HEADER_ACTION_ID, LINE_TERMINATOR};
use crate::error::{AmiError, AmiResult};
use std::fmt;
use uuid::Uuid;

/// Validate that a user-provided string contains no newline characters.
///
/// AMI actions are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol headers.
fn validate_no_newlines(s: &str, context: &str) -> AmiResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(AmiError::InvalidField {
            context: context.to_string(),
        });
    }
    Ok(())
}

/// An outgoing AMI request: ordered fields, a unique ActionID, and a flag
/// marking multi-block (list) responses.
///
/// Every action carries a generated v4 UUID as its `ActionID` unless the
/// caller supplies one via [`field`](Self::field) or
/// [`with_action_id`](Self::with_action_id).
///
/// ```
/// use asterisk_ami_tokio::AmiAction;
///
/// let action = AmiAction::new("Status")
///     .field("Channel", "SIP/100-00000001")
///     .unwrap();
/// assert_eq!(action.name(), "Status");
/// assert!(action.to_wire().starts_with("Action: Status\r\n"));
/// ```
#[derive(Clone)]
pub struct AmiAction {
    fields: Vec<(String, String)>,
    as_list: bool,
}

impl AmiAction {
    /// Start a new action with the given `Action` name and a generated
    /// ActionID.
    pub fn new(name: &str) -> Self {
        Self {
            fields: vec![
                (HEADER_ACTION.to_string(), name.to_string()),
                (
                    HEADER_ACTION_ID.to_string(),
                    Uuid::new_v4().to_string(),
                ),
            ],
            as_list: false,
        }
    }

    /// Add a field, preserving insertion order.
    ///
    /// Setting `ActionID` replaces the generated one. Returns an error if
    /// the name or value contains newline characters.
    pub fn field(mut self, name: &str, value: &str) -> AmiResult<Self> {
        validate_no_newlines(name, "field name")?;
        validate_no_newlines(value, "field value")?;
        if name.eq_ignore_ascii_case(HEADER_ACTION_ID) {
            return Ok(self.with_action_id(value));
        }
        self.fields
            .push((name.to_string(), value.to_string()));
        Ok(self)
    }

    /// Replace the ActionID with a caller-supplied one.
    pub fn with_action_id(mut self, id: &str) -> Self {
        for (name, value) in &mut self.fields {
            if name.eq_ignore_ascii_case(HEADER_ACTION_ID) {
                *value = id.to_string();
                return self;
            }
        }
        self.fields
            .push((HEADER_ACTION_ID.to_string(), id.to_string()));
        self
    }

    /// Mark this action as producing a multi-block response, resolved only
    /// on the terminating `*Complete` event.
    pub fn as_list(mut self) -> Self {
        self.as_list = true;
        self
    }

    /// `Action` field value.
    pub fn name(&self) -> &str {
        self.get(HEADER_ACTION)
            .unwrap_or("")
    }

    /// ActionID of this request.
    pub fn action_id(&self) -> &str {
        self.get(HEADER_ACTION_ID)
            .unwrap_or("")
    }

    /// Whether this action expects a multi-block response.
    pub fn is_list(&self) -> bool {
        self.as_list
    }

    /// Look up a field by name, case-insensitively.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All fields in insertion order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Encode to the wire format: one `Key: Value\r\n` line per field,
    /// terminated by an empty line.
    pub fn to_wire(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (key, value) in &self.fields {
            let _ = write!(out, "{}: {}{}", key, value, LINE_TERMINATOR);
        }
        out.push_str(LINE_TERMINATOR);
        out
    }

    /// Build a `Login` action.
    ///
    /// `events` maps to the `Events: on|off` login key controlling whether
    /// the server pushes unsolicited events on this session.
    pub fn login(username: &str, secret: &str, events: bool) -> AmiResult<Self> {
        Self::new("Login")
            .field("Username", username)?
            .field("Secret", secret)?
            .field("Events", if events { "on" } else { "off" })
    }

    /// Build a keepalive `Ping` action.
    pub fn ping() -> Self {
        Self::new("Ping")
    }

    /// Build a CLI `Command` action. The response text arrives under the
    /// synthetic `Output` header.
    pub fn command(command: &str) -> AmiResult<Self> {
        Self::new("Command").field("Command", command)
    }

    /// Build an `AGI` action targeting a live channel, with a generated
    /// `CommandID`.
    pub fn agi_command(channel: &str, command: &str) -> AmiResult<Self> {
        Self::new("AGI")
            .field("Channel", channel)?
            .field("Command", command)?
            .field("CommandID", &Uuid::new_v4().to_string())
    }
}

impl fmt::Debug for AmiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("AmiAction");
        for (name, value) in &self.fields {
            if name.eq_ignore_ascii_case("Secret") {
                s.field("Secret", &"[REDACTED]");
            } else {
                s.field(name, value);
            }
        }
        s.field("as_list", &self.as_list);
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_unique_action_ids() {
        let a = AmiAction::new("Ping");
        let b = AmiAction::new("Ping");
        assert!(!a
            .action_id()
            .is_empty());
        assert_ne!(a.action_id(), b.action_id());
    }

    #[test]
    fn wire_format_ordered_and_terminated() {
        let action = AmiAction::new("Originate")
            .with_action_id("abc-1")
            .field("Channel", "SIP/100")
            .unwrap()
            .field("Exten", "600")
            .unwrap();
        assert_eq!(
            action.to_wire(),
            "Action: Originate\r\nActionID: abc-1\r\nChannel: SIP/100\r\nExten: 600\r\n\r\n"
        );
    }

    #[test]
    fn caller_supplied_action_id_replaces_generated() {
        let action = AmiAction::new("Status")
            .field("ActionID", "mine")
            .unwrap();
        assert_eq!(action.action_id(), "mine");
        assert_eq!(
            action
                .to_wire()
                .matches("ActionID")
                .count(),
            1
        );
    }

    #[test]
    fn newlines_rejected() {
        assert!(AmiAction::new("Status")
            .field("Channel", "SIP/100\r\nAction: Logoff")
            .is_err());
        assert!(AmiAction::new("Status")
            .field("Bad\nName", "x")
            .is_err());
    }

    #[test]
    fn login_builder() {
        let login = AmiAction::login("admin", "hunter2", true).unwrap();
        assert_eq!(login.name(), "Login");
        assert_eq!(login.get("Username"), Some("admin"));
        assert_eq!(login.get("Events"), Some("on"));
        // Secret must not leak through Debug
        let dbg = format!("{:?}", login);
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("[REDACTED]"));
    }

    #[test]
    fn agi_builder_has_command_id() {
        let agi = AmiAction::agi_command("SIP/100-0001", "GET VARIABLE foo").unwrap();
        assert_eq!(agi.name(), "AGI");
        assert!(agi
            .get("CommandID")
            .is_some());
    }
}
