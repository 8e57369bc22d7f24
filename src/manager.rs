//! Session lifecycle orchestration
//!
//! [`Manager`] owns at most one live [`AmiSession`] at a time and drives the
//! connect → login → ping cycle, salvaging undelivered actions across
//! reconnects and dispatching unsolicited events to glob-matched subscribers.

use crate::{
    action::AmiAction,
    constants::{
        DEFAULT_AMI_PORT, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_PING_DELAY_SECS,
        DEFAULT_RECONNECT_DELAY_MS, EVENT_FULLY_BOOTED, MAX_RECONNECT_DELAY_SECS, SOCKET_BUF_SIZE,
    },
    error::{AmiError, AmiResult},
    message::{AmiMessage, MessageKind},
    protocol::{AmiCodec, AmiResponse, AmiSession, PendingAction},
    transport::{self, IoStream},
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of the managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionState {
    /// No transport (initial state, or between reconnect attempts)
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Transport up, Login in flight
    AwaitingAuth,
    /// Login accepted; actions flow freely
    Authenticated,
    /// Login rejected; reconnection has stopped
    AuthFailed,
    /// [`Manager::close`] was called
    Closed,
}

/// Immutable configuration, constructed once per [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// AMI host. Default `127.0.0.1`.
    pub host: String,
    /// AMI port. Default 5038.
    pub port: u16,
    /// Manager account username.
    pub username: String,
    /// Manager account secret.
    pub secret: String,
    /// `Events: on|off` at login, controlling whether the server pushes
    /// unsolicited events on this session. Default on.
    pub events: bool,
    /// Wrap the TCP stream in TLS.
    pub tls: bool,
    /// PEM bundle of CA certificates trusted for the TLS handshake.
    /// Required when `tls` is set.
    pub tls_ca_file: Option<PathBuf>,
    /// TCP connect timeout. Default 2 s.
    pub connect_timeout: Duration,
    /// Interval between keepalive Ping actions. Default 10 s.
    pub ping_delay: Duration,
    /// Initial delay between reconnection attempts. Default 1 s.
    pub reconnect_delay: Duration,
    /// Ceiling for the exponential reconnect backoff. Default 60 s.
    pub reconnect_max_delay: Duration,
    /// Give up after this many consecutive failed connection attempts.
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Lower-cased action names exempt from replay after a reconnect.
    /// Default `ping` and `login`.
    pub forgetable_actions: HashSet<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_AMI_PORT,
            username: String::new(),
            secret: String::new(),
            events: true,
            tls: false,
            tls_ca_file: None,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            ping_delay: Duration::from_secs(DEFAULT_PING_DELAY_SECS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            reconnect_max_delay: Duration::from_secs(MAX_RECONNECT_DELAY_SECS),
            max_reconnect_attempts: None,
            forgetable_actions: ["ping", "login"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// An event subscriber.
///
/// `Sync` callbacks run inline on the read loop and must return quickly;
/// `Deferred` callbacks produce a future that is spawned onto the runtime,
/// so a slow subscriber never blocks dispatch of the next one.
#[derive(Clone)]
pub enum EventCallback {
    /// Runs inline during dispatch.
    Sync(Arc<dyn Fn(AmiMessage) + Send + Sync>),
    /// Spawned onto the runtime, never awaited inline.
    Deferred(Arc<dyn Fn(AmiMessage) -> BoxFuture<'static, ()> + Send + Sync>),
}

impl EventCallback {
    /// Wrap a synchronous callback.
    pub fn sync<F>(callback: F) -> Self
    where
        F: Fn(AmiMessage) + Send + Sync + 'static,
    {
        EventCallback::Sync(Arc::new(callback))
    }

    /// Wrap an async callback.
    pub fn deferred<F, Fut>(callback: F) -> Self
    where
        F: Fn(AmiMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        EventCallback::Deferred(Arc::new(move |message| callback(message).boxed()))
    }
}

impl fmt::Debug for EventCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCallback::Sync(_) => f.write_str("EventCallback::Sync"),
            EventCallback::Deferred(_) => f.write_str("EventCallback::Deferred"),
        }
    }
}

/// Translate a shell glob (`*`, `?`, `[...]`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> AmiResult<Regex> {
    let mut re = String::from("^");
    let mut chars = pattern
        .chars()
        .peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next == ']' && !class.is_empty() {
                        closed = true;
                        break;
                    }
                    class.push(next);
                }
                if closed {
                    re.push('[');
                    let body = class
                        .strip_prefix('!')
                        .map(|rest| {
                            re.push('^');
                            rest
                        })
                        .unwrap_or(&class);
                    for c in body.chars() {
                        if matches!(c, '\\' | '^' | ']' | '[') {
                            re.push('\\');
                        }
                        re.push(c);
                    }
                    re.push(']');
                } else {
                    // Unclosed bracket matches literally, like fnmatch
                    re.push_str(&regex::escape("["));
                    re.push_str(&regex::escape(&class));
                }
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|source| AmiError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Pattern-matched subscriber registry.
///
/// Patterns keep registration order and each literal pattern string is
/// compiled exactly once; callback lists per pattern are FIFO.
#[derive(Debug, Default)]
struct EventRegistry {
    patterns: Vec<(String, Regex)>,
    callbacks: HashMap<String, Vec<EventCallback>>,
}

impl EventRegistry {
    fn register(&mut self, pattern: &str, callback: EventCallback) -> AmiResult<()> {
        if !self
            .patterns
            .iter()
            .any(|(p, _)| p == pattern)
        {
            let regex = glob_to_regex(pattern)?;
            self.patterns
                .push((pattern.to_string(), regex));
        }
        self.callbacks
            .entry(pattern.to_string())
            .or_default()
            .push(callback);
        Ok(())
    }

    /// Matching patterns with their callback lists, in registration order.
    fn matches(&self, event_name: &str) -> Vec<(String, Vec<EventCallback>)> {
        self.patterns
            .iter()
            .filter(|(_, regex)| regex.is_match(event_name))
            .map(|(pattern, _)| {
                (
                    pattern.clone(),
                    self.callbacks
                        .get(pattern)
                        .cloned()
                        .unwrap_or_default(),
                )
            })
            .collect()
    }

    #[cfg(test)]
    fn pattern_count(&self) -> usize {
        self.patterns
            .len()
    }
}

struct ManagerInner {
    config: ManagerConfig,
    state_tx: watch::Sender<SessionState>,
    session: std::sync::Mutex<Option<Arc<AmiSession>>>,
    awaiting_actions: std::sync::Mutex<VecDeque<PendingAction>>,
    registry: std::sync::Mutex<EventRegistry>,
    pinger: std::sync::Mutex<Option<JoinHandle<()>>>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
    seq: AtomicU64,
}

impl ManagerInner {
    fn set_state(&self, state: SessionState) {
        self.state_tx
            .send_replace(state);
    }

    fn state(&self) -> SessionState {
        *self
            .state_tx
            .borrow()
    }

    fn current_session(&self) -> Option<Arc<AmiSession>> {
        self.session
            .lock()
            .unwrap()
            .clone()
    }

    fn next_seq(&self) -> u64 {
        self.seq
            .fetch_add(1, Ordering::Relaxed)
    }

    fn abort_pinger(&self) {
        if let Some(handle) = self
            .pinger
            .lock()
            .unwrap()
            .take()
        {
            handle.abort();
        }
    }
}

/// Persistent, auto-reconnecting AMI client.
///
/// ```rust,no_run
/// use asterisk_ami_tokio::{AmiAction, Manager, ManagerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), asterisk_ami_tokio::AmiError> {
///     let manager = Manager::new(ManagerConfig {
///         username: "admin".into(),
///         secret: "secret".into(),
///         ..ManagerConfig::default()
///     });
///     manager.register("Meetme*", |event| {
///         println!("conference event: {:?}", event.event_name());
///     })?;
///     manager.connect();
///
///     let response = manager.send_action(AmiAction::new("Status")).await?;
///     println!("status: {}", response.is_success());
///     manager.close().await;
///     Ok(())
/// }
/// ```
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("state", &self.state())
            .finish()
    }
}

impl Manager {
    /// Create a manager. No I/O happens until [`connect`](Self::connect).
    pub fn new(config: ManagerConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                state_tx,
                session: std::sync::Mutex::new(None),
                awaiting_actions: std::sync::Mutex::new(VecDeque::new()),
                registry: std::sync::Mutex::new(EventRegistry::default()),
                pinger: std::sync::Mutex::new(None),
                supervisor: std::sync::Mutex::new(None),
                closing: AtomicBool::new(false),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &ManagerConfig {
        &self
            .inner
            .config
    }

    /// Current lifecycle state snapshot.
    pub fn state(&self) -> SessionState {
        self.inner
            .state()
    }

    /// Watch lifecycle state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner
            .state_tx
            .subscribe()
    }

    /// Start the connection supervisor. Idempotent: calling it again while
    /// the supervisor is alive is a no-op. Must be called within a Tokio
    /// runtime.
    pub fn connect(&self) {
        if self
            .inner
            .closing
            .load(Ordering::SeqCst)
        {
            return;
        }
        let mut guard = self
            .inner
            .supervisor
            .lock()
            .unwrap();
        if guard
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        let inner = self
            .inner
            .clone();
        *guard = Some(tokio::spawn(supervisor_loop(inner)));
    }

    /// Block until a login attempt completes.
    ///
    /// Resolves `Ok` once authenticated; errors if login was rejected or the
    /// manager was closed.
    pub async fn wait_authenticated(&self) -> AmiResult<()> {
        let mut rx = self.subscribe_state();
        loop {
            match *rx.borrow_and_update() {
                SessionState::Authenticated => return Ok(()),
                SessionState::AuthFailed => {
                    return Err(AmiError::auth_failed("login rejected by server"))
                }
                SessionState::Closed => return Err(AmiError::NotConnected),
                _ => {}
            }
            if rx
                .changed()
                .await
                .is_err()
            {
                return Err(AmiError::NotConnected);
            }
        }
    }

    /// Send an action and await its correlated result.
    ///
    /// Non-Login actions wait for authentication first. There is no internal
    /// deadline: the call resolves when the response arrives (possibly after
    /// a transparent reconnect and replay), or errors when the action was
    /// dropped during a disconnect or the manager closed. Wrap in
    /// [`tokio::time::timeout`] for a hard bound.
    pub async fn send_action(&self, action: AmiAction) -> AmiResult<AmiResponse> {
        // Login bypasses the auth gate: it may go out while merely connected.
        if action.name() != "Login" {
            self.wait_authenticated()
                .await?;
        }
        let session = self
            .inner
            .current_session()
            .ok_or(AmiError::NotConnected)?;
        let rx = session
            .send(
                action,
                self.inner
                    .next_seq(),
            )
            .await?;
        rx.await
            .map_err(|_| AmiError::ConnectionClosed)
    }

    /// Run a CLI command; its output arrives under the `Output` header of
    /// the response.
    pub async fn send_command(&self, command: &str) -> AmiResult<AmiResponse> {
        self.send_action(AmiAction::command(command)?)
            .await
    }

    /// Run an AGI command on a live channel.
    pub async fn send_agi_command(&self, channel: &str, command: &str) -> AmiResult<AmiResponse> {
        self.send_action(AmiAction::agi_command(channel, command)?)
            .await
    }

    /// Register a callback for events whose name matches a shell glob.
    /// The primitive behind [`register`](Self::register) and
    /// [`on`](Self::on).
    ///
    /// A literal pattern string is compiled once, on first registration;
    /// callbacks per pattern fire in registration order.
    pub fn register_callback(&self, pattern: &str, callback: EventCallback) -> AmiResult<()> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .register(pattern, callback)
    }

    /// Register a synchronous callback for events matching `pattern`.
    pub fn register<F>(&self, pattern: &str, callback: F) -> AmiResult<()>
    where
        F: Fn(AmiMessage) + Send + Sync + 'static,
    {
        self.register_callback(pattern, EventCallback::sync(callback))
    }

    /// Pattern-first registration: returns a registrar taking the callback
    /// as its single argument.
    ///
    /// ```rust,no_run
    /// # use asterisk_ami_tokio::{EventCallback, Manager, ManagerConfig};
    /// # fn example(manager: &Manager) -> Result<(), asterisk_ami_tokio::AmiError> {
    /// manager
    ///     .on("Hangup")
    ///     .callback(EventCallback::sync(|event| {
    ///         println!("hangup: {:?}", event.get("Channel"));
    ///     }))?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn on(&self, pattern: &str) -> EventRegistrar<'_> {
        EventRegistrar {
            manager: self,
            pattern: pattern.to_string(),
        }
    }

    /// Dispatch an Event-kind message to all matching subscribers, returning
    /// the patterns that matched.
    ///
    /// Patterns are tried in registration order and every match fires.
    /// Deferred callbacks are spawned onto the runtime; a panicking or slow
    /// subscriber never prevents the remaining ones from running. Non-event
    /// messages match nothing.
    pub fn dispatch(&self, message: &AmiMessage) -> Vec<String> {
        dispatch_message(&self.inner, message)
    }

    /// Shut the session down and stop reconnecting. Idempotent; wakes any
    /// callers blocked on authentication and drops queued salvaged actions.
    pub async fn close(&self) {
        if self
            .inner
            .closing
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        info!("manager close requested");
        self.inner
            .set_state(SessionState::Closed);
        self.inner
            .abort_pinger();
        if let Some(handle) = self
            .inner
            .supervisor
            .lock()
            .unwrap()
            .take()
        {
            handle.abort();
        }
        let session = self
            .inner
            .session
            .lock()
            .unwrap()
            .take();
        if let Some(session) = session {
            session
                .shutdown()
                .await;
            // The supervisor is gone, so nothing salvages this table; fail
            // the in-flight awaiters instead of stranding them.
            session.fail_all();
        }
        self.inner
            .awaiting_actions
            .lock()
            .unwrap()
            .clear();
    }
}

/// Single-argument registrar returned by [`Manager::on`].
#[derive(Debug)]
pub struct EventRegistrar<'a> {
    manager: &'a Manager,
    pattern: String,
}

impl EventRegistrar<'_> {
    /// Attach the callback to the pattern this registrar was created for.
    pub fn callback(self, callback: EventCallback) -> AmiResult<()> {
        self.manager
            .register_callback(&self.pattern, callback)
    }
}

fn dispatch_message(inner: &ManagerInner, message: &AmiMessage) -> Vec<String> {
    if message.kind() != MessageKind::Event {
        return Vec::new();
    }
    let event_name = message
        .event_name()
        .unwrap_or("");
    // Clone the matching callbacks out so user code never runs under the
    // registry lock.
    let matched = inner
        .registry
        .lock()
        .unwrap()
        .matches(event_name);

    let mut patterns = Vec::with_capacity(matched.len());
    for (pattern, callbacks) in matched {
        for callback in callbacks {
            match callback {
                EventCallback::Sync(f) => {
                    let event = message.clone();
                    if std::panic::catch_unwind(AssertUnwindSafe(|| f(event))).is_err() {
                        warn!("event subscriber for '{}' panicked", pattern);
                    }
                }
                EventCallback::Deferred(f) => {
                    tokio::spawn(f(message.clone()));
                }
            }
        }
        patterns.push(pattern);
    }
    patterns
}

/// Top-level supervisor task: one per manager, restarted only by
/// [`Manager::connect`].
async fn supervisor_loop(inner: Arc<ManagerInner>) {
    let run = AssertUnwindSafe(supervisor_inner(inner.clone())).catch_unwind();
    if run
        .await
        .is_err()
    {
        tracing::error!("manager supervisor panicked");
        inner.set_state(SessionState::Disconnected);
    }
}

async fn supervisor_inner(inner: Arc<ManagerInner>) {
    let mut backoff = inner
        .config
        .reconnect_delay;
    let mut attempts: u32 = 0;

    loop {
        if inner
            .closing
            .load(Ordering::SeqCst)
        {
            return;
        }
        inner.set_state(SessionState::Connecting);

        let stream = match transport::connect(&inner.config).await {
            Ok(stream) => stream,
            Err(e) => {
                attempts += 1;
                if let Some(max) = inner
                    .config
                    .max_reconnect_attempts
                {
                    if attempts >= max {
                        warn!("giving up after {} failed connection attempts: {}", attempts, e);
                        inner.set_state(SessionState::Disconnected);
                        return;
                    }
                }
                warn!(
                    "connection attempt {} failed: {}, retrying in {:?}",
                    attempts, e, backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(
                    inner
                        .config
                        .reconnect_max_delay,
                );
                continue;
            }
        };
        attempts = 0;
        backoff = inner
            .config
            .reconnect_delay;

        let (reader, writer) = tokio::io::split(stream);
        let session = Arc::new(AmiSession::new(writer));
        *inner
            .session
            .lock()
            .unwrap() = Some(session.clone());
        inner.set_state(SessionState::AwaitingAuth);
        info!(
            "connected to {}:{}, logging in",
            inner
                .config
                .host,
            inner
                .config
                .port
        );

        match login(&inner, &session).await {
            Ok(login_rx) => {
                tokio::spawn(watch_login(inner.clone(), session.clone(), login_rx));
            }
            Err(e) => {
                warn!("failed to send Login: {}", e);
            }
        }

        run_read_loop(&inner, &session, reader).await;

        // Transport lost: tear down this generation and decide what survives.
        inner.abort_pinger();
        let salvaged = session.salvage(
            &inner
                .config
                .forgetable_actions,
        );
        if !salvaged.is_empty() {
            info!("salvaged {} pending actions for replay", salvaged.len());
            inner
                .awaiting_actions
                .lock()
                .unwrap()
                .extend(salvaged);
        }
        *inner
            .session
            .lock()
            .unwrap() = None;

        match inner.state() {
            // Credential errors do not heal by retrying. Nothing will
            // replay the salvaged backlog, so release its awaiters.
            SessionState::AuthFailed => {
                inner
                    .awaiting_actions
                    .lock()
                    .unwrap()
                    .clear();
                return;
            }
            SessionState::Closed => return,
            _ => {}
        }
        inner.set_state(SessionState::Disconnected);
        tokio::time::sleep(
            inner
                .config
                .reconnect_delay,
        )
        .await;
    }
}

/// Send the Login action on a fresh session, bypassing the auth gate.
async fn login(
    inner: &Arc<ManagerInner>,
    session: &Arc<AmiSession>,
) -> AmiResult<tokio::sync::oneshot::Receiver<AmiResponse>> {
    let action = AmiAction::login(
        &inner
            .config
            .username,
        &inner
            .config
            .secret,
        inner
            .config
            .events,
    )?;
    session
        .send(action, inner.next_seq())
        .await
}

/// Await the Login response and complete (or fail) authentication.
///
/// Runs as its own task so the read loop that delivers the response is never
/// blocked on it. A dropped receiver means the connection died mid-login;
/// the reconnect path owns that case.
async fn watch_login(
    inner: Arc<ManagerInner>,
    session: Arc<AmiSession>,
    login_rx: tokio::sync::oneshot::Receiver<AmiResponse>,
) {
    match login_rx.await {
        Ok(response) if response.is_success() => {
            info!("authentication accepted");
            start_pinger(&inner, &session);
            inner.set_state(SessionState::Authenticated);
        }
        Ok(response) => {
            let reason = response
                .message()
                .get("Message")
                .unwrap_or("login rejected")
                .to_string();
            warn!("authentication failed: {}", reason);
            inner.set_state(SessionState::AuthFailed);
            session
                .shutdown()
                .await;
        }
        Err(_) => {}
    }
}

/// One keepalive pinger per connection generation; starting a new one
/// aborts the previous so a rapid reconnect never leaks a duplicate timer.
fn start_pinger(inner: &Arc<ManagerInner>, session: &Arc<AmiSession>) {
    let mut guard = inner
        .pinger
        .lock()
        .unwrap();
    if let Some(old) = guard.take() {
        old.abort();
    }
    let inner = inner.clone();
    let session = session.clone();
    *guard = Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(
            inner
                .config
                .ping_delay,
        );
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; we just authenticated.
        interval
            .tick()
            .await;
        loop {
            interval
                .tick()
                .await;
            // Best-effort: the Pong clears the table entry, errors are only
            // logged. An unanswered Ping is dropped as forgetable on loss.
            match session
                .send(AmiAction::ping(), inner.next_seq())
                .await
            {
                Ok(_rx) => {}
                Err(e) => debug!("keepalive ping failed: {}", e),
            }
        }
    }));
}

/// Per-connection read loop: bytes → codec → correlation → dispatch.
async fn run_read_loop(
    inner: &Arc<ManagerInner>,
    session: &Arc<AmiSession>,
    mut reader: ReadHalf<IoStream>,
) {
    let mut codec = AmiCodec::new();
    let mut read_buffer = [0u8; SOCKET_BUF_SIZE];

    loop {
        while let Some(message) = codec.next_message() {
            if let Some(event) = session.handle_message(message) {
                handle_event(inner, session, &event).await;
            }
        }

        match reader
            .read(&mut read_buffer)
            .await
        {
            Ok(0) => {
                info!("connection closed (EOF)");
                return;
            }
            Ok(n) => {
                if let Err(e) = codec.feed(&read_buffer[..n]) {
                    warn!("decode buffer overrun: {}", e);
                    return;
                }
            }
            Err(e) => {
                warn!("read error: {}", e);
                return;
            }
        }
    }
}

/// Replay trigger plus subscriber dispatch for one unsolicited event.
async fn handle_event(inner: &Arc<ManagerInner>, session: &Arc<AmiSession>, event: &AmiMessage) {
    // FullyBooted re-fires after each successful login; it is the signal
    // that the server is ready to take the salvaged backlog.
    if event.event_name() == Some(EVENT_FULLY_BOOTED) {
        replay_awaiting(inner, session).await;
    }
    dispatch_message(inner, event);
}

/// Drain the salvage queue FIFO onto a fresh session.
///
/// Each action is re-registered with its original result sender and
/// retransmitted; responses are not awaited here, they resolve through the
/// read loop like any other action.
async fn replay_awaiting(inner: &Arc<ManagerInner>, session: &Arc<AmiSession>) {
    let drained: Vec<PendingAction> = inner
        .awaiting_actions
        .lock()
        .unwrap()
        .drain(..)
        .collect();
    if drained.is_empty() {
        return;
    }
    info!("replaying {} salvaged actions", drained.len());
    for pending in drained {
        let action = pending
            .action
            .clone();
        session.register(pending);
        if let Err(e) = session
            .transmit(&action)
            .await
        {
            // Entry stays registered; the next disconnect salvages it again
            warn!(
                "replay of action {} failed: {}",
                action.action_id(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn event(name: &str) -> AmiMessage {
        AmiMessage::from_headers(vec![("Event".to_string(), name.to_string())])
    }

    #[test]
    fn glob_star_and_question() {
        assert!(glob_to_regex("Meetme*")
            .unwrap()
            .is_match("MeetmeJoin"));
        assert!(!glob_to_regex("Meetme*")
            .unwrap()
            .is_match("Hangup"));
        assert!(glob_to_regex("D?al")
            .unwrap()
            .is_match("Dial"));
        // Anchored: a substring match is not enough
        assert!(!glob_to_regex("Join")
            .unwrap()
            .is_match("MeetmeJoin"));
    }

    #[test]
    fn glob_character_class() {
        let re = glob_to_regex("Peer[SU]tatus").unwrap();
        assert!(re.is_match("PeerStatus"));
        assert!(!re.is_match("PeerXtatus"));
        let negated = glob_to_regex("Peer[!S]tatus").unwrap();
        assert!(!negated.is_match("PeerStatus"));
        assert!(negated.is_match("PeerUtatus"));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        // A dot in the pattern is literal, not "any char"
        assert!(!glob_to_regex("A.B")
            .unwrap()
            .is_match("AxB"));
        assert!(glob_to_regex("A.B")
            .unwrap()
            .is_match("A.B"));
    }

    #[test]
    fn registry_compiles_literal_pattern_once() {
        let mut registry = EventRegistry::default();
        registry
            .register("Meetme*", EventCallback::sync(|_| {}))
            .unwrap();
        registry
            .register("Meetme*", EventCallback::sync(|_| {}))
            .unwrap();
        assert_eq!(registry.pattern_count(), 1);
        let matched = registry.matches("MeetmeJoin");
        assert_eq!(matched.len(), 1);
        assert_eq!(
            matched[0]
                .1
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn dispatch_fires_only_matching_patterns() {
        let manager = Manager::new(ManagerConfig::default());
        let fired = Arc::new(Mutex::new(Vec::new()));

        for pattern in ["Meetme*", "Other*"] {
            let fired = fired.clone();
            let tag = pattern.to_string();
            manager
                .register(pattern, move |_| {
                    fired
                        .lock()
                        .unwrap()
                        .push(tag.clone());
                })
                .unwrap();
        }

        let matched = manager.dispatch(&event("MeetmeJoin"));
        assert_eq!(matched, ["Meetme*"]);
        assert_eq!(&*fired.lock().unwrap(), &["Meetme*"]);
    }

    #[tokio::test]
    async fn dispatch_preserves_registration_order() {
        let manager = Manager::new(ManagerConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = order.clone();
            manager
                .register("Status", move |_| {
                    order
                        .lock()
                        .unwrap()
                        .push(tag);
                })
                .unwrap();
        }

        manager.dispatch(&event("Status"));
        assert_eq!(&*order.lock().unwrap(), &[0, 1, 2]);
    }

    #[tokio::test]
    async fn dispatch_ignores_non_events() {
        let manager = Manager::new(ManagerConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            manager
                .register("*", move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let response =
            AmiMessage::from_headers(vec![("Response".to_string(), "Success".to_string())]);
        assert!(manager
            .dispatch(&response)
            .is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_stop_dispatch() {
        let manager = Manager::new(ManagerConfig::default());
        manager
            .register("*", |_| panic!("subscriber bug"))
            .unwrap();
        let reached = Arc::new(AtomicUsize::new(0));
        {
            let reached = reached.clone();
            manager
                .register("*", move |_| {
                    reached.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        let matched = manager.dispatch(&event("Hangup"));
        assert_eq!(matched, ["*"]);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deferred_callbacks_are_spawned_not_awaited() {
        let manager = Manager::new(ManagerConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager
            .on("Newchannel")
            .callback(EventCallback::deferred(move |event| {
                let tx = tx.clone();
                async move {
                    // A deliberate yield: dispatch must already have returned
                    tokio::task::yield_now().await;
                    let _ = tx.send(
                        event
                            .event_name()
                            .unwrap_or("")
                            .to_string(),
                    );
                }
            }))
            .unwrap();

        let matched = manager.dispatch(&event("Newchannel"));
        assert_eq!(matched, ["Newchannel"]);
        assert_eq!(
            rx.recv()
                .await
                .as_deref(),
            Some("Newchannel")
        );
    }

    #[test]
    fn config_defaults_match_conventions() {
        let config = ManagerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5038);
        assert_eq!(config.connect_timeout, Duration::from_millis(2000));
        assert_eq!(config.ping_delay, Duration::from_secs(10));
        assert!(config
            .forgetable_actions
            .contains("ping"));
        assert!(config
            .forgetable_actions
            .contains("login"));
    }

    #[tokio::test]
    async fn send_action_without_connect_waits_then_errors_on_close() {
        let manager = Manager::new(ManagerConfig::default());
        let send = {
            let manager = Manager {
                inner: manager
                    .inner
                    .clone(),
            };
            tokio::spawn(async move {
                manager
                    .send_action(AmiAction::new("Status"))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(!send.is_finished());

        manager
            .close()
            .await;
        let result = send
            .await
            .unwrap();
        assert!(matches!(result, Err(AmiError::NotConnected)));
    }
}
