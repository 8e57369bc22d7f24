//! AMI wire codec and per-connection session state

use crate::{
    action::AmiAction,
    buffer::AmiBuffer,
    constants::{
        BLOCK_TERMINATOR, END_COMMAND_MARKER, EVENT_COMPLETE_SUFFIX, GREETING_PREFIX,
        HEADER_OUTPUT, LF_BLOCK_TERMINATOR,
    },
    error::AmiResult,
    message::{AmiMessage, MessageKind},
    transport::IoStream,
};
use std::collections::{HashMap, HashSet};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace, warn};

/// Resolved result of an action: one message for plain actions, the full
/// block sequence (initial response, list fragments, terminating event) for
/// list actions, in arrival order.
#[derive(Debug, Clone)]
pub struct AmiResponse {
    messages: Vec<AmiMessage>,
}

impl AmiResponse {
    fn new(messages: Vec<AmiMessage>) -> Self {
        Self { messages }
    }

    /// The first message, the `Response` block itself.
    pub fn message(&self) -> &AmiMessage {
        &self.messages[0]
    }

    /// All messages in arrival order.
    pub fn messages(&self) -> &[AmiMessage] {
        &self.messages
    }

    /// Consume into the underlying messages.
    pub fn into_messages(self) -> Vec<AmiMessage> {
        self.messages
    }

    /// Success flag of the initial response block.
    pub fn is_success(&self) -> bool {
        self.message()
            .is_success()
    }
}

/// Incremental decoder for blank-line-delimited `Header: Value` blocks.
///
/// Bytes accumulate across feeds, so a line split between two socket reads
/// decodes identically to one contiguous read. Decoding itself never fails:
/// unparseable lines degrade to the synthetic `Output` header.
#[derive(Debug, Default)]
pub(crate) struct AmiCodec {
    buffer: AmiBuffer,
}

/// `true` for tokens that can be an AMI header name. Anything else
/// (command output, the greeting, garbage) is not split at its colon.
fn is_header_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl AmiCodec {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append raw socket bytes. Only fails when the buffer cap is exceeded,
    /// which is connection-fatal.
    pub(crate) fn feed(&mut self, data: &[u8]) -> AmiResult<()> {
        self.buffer
            .extend_from_slice(data);
        self.buffer
            .check_size_limits()
    }

    /// Decode the next complete block, if one is buffered.
    pub(crate) fn next_message(&mut self) -> Option<AmiMessage> {
        let block = self
            .buffer
            .extract_until_first_of(
                BLOCK_TERMINATOR.as_bytes(),
                LF_BLOCK_TERMINATOR.as_bytes(),
            )?;
        self.buffer
            .compact();

        let text = String::from_utf8_lossy(&block);
        trace!("decoded block of {} bytes", block.len());
        Some(parse_block(&text))
    }
}

/// Parse one terminated block into a message.
///
/// Lines that are not `Header: Value` pairs accumulate under the synthetic
/// `Output` header: command output after `Response: Follows`, and whatever
/// the greeting line drags into the first block. Once a non-header line is
/// seen, the rest of the block is output even if it contains colons.
fn parse_block(text: &str) -> AmiMessage {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut output: Vec<&str> = Vec::new();
    let mut in_output = false;

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(GREETING_PREFIX) {
            debug!("server greeting: {}", line);
            continue;
        }
        if line == END_COMMAND_MARKER {
            in_output = false;
            continue;
        }
        if !in_output {
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim();
                if is_header_name(name) {
                    headers.push((
                        name.to_string(),
                        value
                            .trim()
                            .to_string(),
                    ));
                    continue;
                }
            }
            in_output = true;
        }
        output.push(line);
    }

    if !output.is_empty() {
        headers.push((HEADER_OUTPUT.to_string(), output.join("\n")));
    }

    AmiMessage::from_headers(headers)
}

/// One entry of the outstanding table: the owned action, partial responses,
/// the single-assignment result sender, and the send-order sequence used to
/// keep salvage FIFO.
#[derive(Debug)]
pub(crate) struct PendingAction {
    pub(crate) action: AmiAction,
    pub(crate) responses: Vec<AmiMessage>,
    pub(crate) tx: Option<oneshot::Sender<AmiResponse>>,
    pub(crate) seq: u64,
}

impl PendingAction {
    pub(crate) fn new(action: AmiAction, tx: oneshot::Sender<AmiResponse>, seq: u64) -> Self {
        Self {
            action,
            responses: Vec::new(),
            tx: Some(tx),
            seq,
        }
    }

    /// Deliver the accumulated messages to the awaiting caller. Taking the
    /// sender makes double resolution impossible.
    fn resolve(mut self) {
        if let Some(tx) = self
            .tx
            .take()
        {
            let _ = tx.send(AmiResponse::new(std::mem::take(&mut self.responses)));
        }
    }

    /// `true` once the awaiting caller has gone away or the entry resolved.
    fn is_abandoned(&self) -> bool {
        self.tx
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }
}

/// Per-connection session: the write half plus the outstanding table.
///
/// The table is owned by exactly one session; on disconnect,
/// [`salvage`](Self::salvage) transfers eligible entries out in one step, so
/// pending actions are never shared between two connection generations.
pub(crate) struct AmiSession {
    writer: Mutex<WriteHalf<IoStream>>,
    outstanding: std::sync::Mutex<HashMap<String, PendingAction>>,
}

impl AmiSession {
    pub(crate) fn new(writer: WriteHalf<IoStream>) -> Self {
        Self {
            writer: Mutex::new(writer),
            outstanding: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Register an action in the outstanding table and transmit it.
    /// Returns the receiver for its correlated result.
    pub(crate) async fn send(
        &self,
        action: AmiAction,
        seq: u64,
    ) -> AmiResult<oneshot::Receiver<AmiResponse>> {
        let (tx, rx) = oneshot::channel();
        let id = action
            .action_id()
            .to_string();
        self.register(PendingAction::new(action.clone(), tx, seq));
        if let Err(e) = self
            .transmit(&action)
            .await
        {
            self.outstanding
                .lock()
                .unwrap()
                .remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Insert a pending entry. ActionIDs are unique per table; a duplicate
    /// means the caller reused an id and the older entry is dropped.
    pub(crate) fn register(&self, pending: PendingAction) {
        let id = pending
            .action
            .action_id()
            .to_string();
        if self
            .outstanding
            .lock()
            .unwrap()
            .insert(id.clone(), pending)
            .is_some()
        {
            warn!("duplicate ActionID {}, dropping older pending action", id);
        }
    }

    /// Serialize and write an action without touching the table. Used for
    /// the send path and for replaying salvaged actions.
    pub(crate) async fn transmit(&self, action: &AmiAction) -> AmiResult<()> {
        let wire = action.to_wire();
        match action.name() {
            "Login" => debug!("sending action: Login [REDACTED]"),
            name => debug!("sending action: {} ({})", name, action.action_id()),
        }
        self.writer
            .lock()
            .await
            .write_all(wire.as_bytes())
            .await?;
        Ok(())
    }

    /// Route one decoded message.
    ///
    /// Responses and list fragments resolve or grow their outstanding entry;
    /// a correlation miss is dropped with a warning. Event-kind messages are
    /// returned so the caller can dispatch them, including the ones that
    /// also fed a list accumulation.
    pub(crate) fn handle_message(&self, message: AmiMessage) -> Option<AmiMessage> {
        match message.kind() {
            MessageKind::Response => {
                self.correlate(message);
                None
            }
            MessageKind::Event => {
                self.accumulate_list_fragment(&message);
                Some(message)
            }
            MessageKind::Unknown => {
                debug!("dropping block without Response/Event marker");
                None
            }
        }
    }

    fn correlate(&self, message: AmiMessage) {
        let Some(id) = message
            .action_id()
            .map(|s| s.to_string())
        else {
            warn!("response without ActionID, dropping");
            return;
        };

        let mut table = self
            .outstanding
            .lock()
            .unwrap();
        let Some(pending) = table.get_mut(&id) else {
            warn!("response with unknown ActionID {}, dropping", id);
            return;
        };

        // A list action stays open after its initial Success block; the
        // terminating *Complete event closes it. An Error reply closes it
        // immediately; nothing will follow.
        let closes = !pending
            .action
            .is_list()
            || !message.is_success();
        pending
            .responses
            .push(message);
        if closes {
            if let Some(pending) = table.remove(&id) {
                pending.resolve();
            }
        }
    }

    fn accumulate_list_fragment(&self, message: &AmiMessage) {
        let Some(id) = message.action_id() else {
            return;
        };
        let mut table = self
            .outstanding
            .lock()
            .unwrap();
        let Some(pending) = table.get_mut(id) else {
            return;
        };
        if !pending
            .action
            .is_list()
        {
            return;
        }

        pending
            .responses
            .push(message.clone());
        let complete = message
            .event_name()
            .is_some_and(|name| name.ends_with(EVENT_COMPLETE_SUFFIX));
        if complete {
            let id = id.to_string();
            if let Some(pending) = table.remove(&id) {
                pending.resolve();
            }
        }
    }

    /// Transfer replayable entries out of the table, in send order.
    ///
    /// Skipped (and thereby dropped): actions whose name is in the
    /// forgetable set, entries whose awaiter is gone, and list actions that
    /// already accumulated partial responses, since replaying those delivers
    /// a torn result.
    pub(crate) fn salvage(&self, forgetable_actions: &HashSet<String>) -> Vec<PendingAction> {
        let drained: Vec<PendingAction> = self
            .outstanding
            .lock()
            .unwrap()
            .drain()
            .map(|(_, pending)| pending)
            .collect();

        let mut kept: Vec<PendingAction> = Vec::new();
        for pending in drained {
            let name = pending
                .action
                .name()
                .to_ascii_lowercase();
            if forgetable_actions.contains(&name) {
                debug!("dropping forgetable action {} on disconnect", name);
                continue;
            }
            if pending.is_abandoned() {
                continue;
            }
            if !pending
                .responses
                .is_empty()
            {
                warn!(
                    "dropping partially answered action {} ({}) on disconnect",
                    name,
                    pending
                        .action
                        .action_id()
                );
                continue;
            }
            kept.push(pending);
        }
        kept.sort_by_key(|p| p.seq);
        kept
    }

    /// Drop every outstanding entry, failing its awaiter.
    ///
    /// Final teardown only: after this, nothing from this session will be
    /// salvaged or replayed. Awaiters observe the dropped sender as a closed
    /// channel.
    pub(crate) fn fail_all(&self) {
        let dropped = self
            .outstanding
            .lock()
            .unwrap()
            .drain()
            .count();
        if dropped > 0 {
            debug!("dropping {} outstanding actions at shutdown", dropped);
        }
    }

    /// Shut down the write half; read-loop teardown follows from the EOF.
    pub(crate) async fn shutdown(&self) {
        let _ = self
            .writer
            .lock()
            .await
            .shutdown()
            .await;
    }
}
