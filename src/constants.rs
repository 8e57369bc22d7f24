//! Protocol constants and configuration values

/// Default Asterisk Manager Interface port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Socket buffer size for reading from TCP stream (64KB) - standard TCP receive window
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Maximum total decode buffer size (16MB) - safety limit to prevent runaway memory
/// Exceeding it means the peer stopped terminating blocks. Indicates a bug or abuse.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Protocol message terminators. Asterisk emits CRLF; the decoder also
/// accepts bare-LF framing.
pub const LINE_TERMINATOR: &str = "\r\n";
pub const BLOCK_TERMINATOR: &str = "\r\n\r\n";
pub const LF_BLOCK_TERMINATOR: &str = "\n\n";

/// Protocol framing header names.
pub const HEADER_ACTION: &str = "Action";
/// Correlation token linking a Response block to its Action.
pub const HEADER_ACTION_ID: &str = "ActionID";
/// Marks a reply block: `Success`, `Error` or `Follows`.
pub const HEADER_RESPONSE: &str = "Response";
/// Marks an unsolicited notification block; value is the event name.
pub const HEADER_EVENT: &str = "Event";
/// Synthetic header accumulating non-`Key: Value` lines (command output
/// after `Response: Follows`, the connection banner, stray garbage).
pub const HEADER_OUTPUT: &str = "Output";

/// Prefix of the greeting line Asterisk sends on connect. The greeting is
/// not blank-line terminated, so it merges into the first decoded block.
pub const GREETING_PREFIX: &str = "Asterisk Call Manager/";

/// Trailer line closing `Response: Follows` command output.
pub const END_COMMAND_MARKER: &str = "--END COMMAND--";

/// Event name Asterisk fires once fully started; also re-fired after the
/// manager re-authenticates, which is the replay trigger for salvaged actions.
pub const EVENT_FULLY_BOOTED: &str = "FullyBooted";

/// Suffix marking the terminating event of a list-style response
/// (`PeerlistComplete`, `StatusComplete`, ...).
pub const EVENT_COMPLETE_SUFFIX: &str = "Complete";

/// TCP connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Seconds between keepalive Ping actions
pub const DEFAULT_PING_DELAY_SECS: u64 = 10;

/// Initial delay before a reconnection attempt
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Ceiling for the exponential reconnect backoff
pub const MAX_RECONNECT_DELAY_SECS: u64 = 60;
