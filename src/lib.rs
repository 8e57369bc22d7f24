//! Async client for the Asterisk Manager Interface (AMI).
//!
//! The AMI is a line-oriented TCP protocol: the client sends *actions*
//! (`Key: Value` lines ending with a blank line) and the server replies with
//! correlated *responses* interleaved with unsolicited *events*. This crate
//! provides:
//!
//! - [`Manager`]: a persistent client that connects, logs in, keeps the
//!   session alive with periodic pings, and transparently reconnects,
//!   replaying actions that never got an answer.
//! - [`AmiAction`]: a builder for outgoing actions with automatic ActionID
//!   generation and header-injection protection.
//! - [`AmiMessage`] / [`AmiResponse`]: decoded inbound blocks and correlated
//!   action results, including multi-block list responses and
//!   `Response: Follows` command output.
//! - Glob-based event subscription via [`Manager::register`] and
//!   [`Manager::on`].
//!
//! # Example
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AmiAction, Manager, ManagerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), asterisk_ami_tokio::AmiError> {
//!     let manager = Manager::new(ManagerConfig {
//!         host: "pbx.example.net".into(),
//!         username: "admin".into(),
//!         secret: "secret".into(),
//!         ..ManagerConfig::default()
//!     });
//!
//!     manager.register("Hangup", |event| {
//!         println!("hangup on {:?}", event.get("Channel"));
//!     })?;
//!
//!     manager.connect();
//!
//!     // Blocks until the session is authenticated, then resolves with the
//!     // correlated response.
//!     let peers = manager
//!         .send_action(AmiAction::new("SIPpeers").as_list())
//!         .await?;
//!     for entry in peers.messages() {
//!         println!("{:?}", entry.get("ObjectName"));
//!     }
//!
//!     let uptime = manager.send_command("core show uptime").await?;
//!     println!("{}", uptime.message().get("Output").unwrap_or(""));
//!
//!     manager.close().await;
//!     Ok(())
//! }
//! ```

mod action;
mod buffer;
pub mod constants;
mod error;
mod manager;
mod message;
mod protocol;
mod transport;

pub use action::AmiAction;
pub use error::{AmiError, AmiResult};
pub use manager::{EventCallback, EventRegistrar, Manager, ManagerConfig, SessionState};
pub use message::{AmiMessage, MessageKind};
pub use protocol::AmiResponse;
