//! Per-device session engine.
//!
//! A [`Session`] owns one transport, one credential bundle and the full
//! per-device state machine:
//!
//! ```text
//! Disconnected ──> Connecting ──> Connected ──┬──> Disconnected
//!                                             └──> Error(reason)
//! ```
//!
//! Terminal states are `Disconnected` and `Error`; recovery means building
//! a new session.
//!
//! # Task model
//!
//! Each connected session runs two background tasks:
//!
//! - the **inbound pump** reads notification payloads, feeds the
//!   reassembly buffer and routes every extracted frame — to the pending
//!   command promise, or (TT-Series heartbeats and alarms) to the
//!   asynchronous event handler;
//! - the **status poller** re-queries the lock state on a fixed interval
//!   and swallows errors; observable state moves only on successful
//!   parses.
//!
//! Commands execute on the caller's task. At most one command is in flight
//! at a time: a per-session mutex serializes the pipeline, a single-slot
//! oneshot carries the correlated response, and the slot is always cleared
//! on timeout or cancellation so the next inbound frame cannot be routed
//! to a dead waiter.

use crate::config::SessionConfig;
use crate::select;
use blelock_core::{
    BcdTimestamp, ConnectionState, Credentials, DeviceStatus, Error, LockId, LockState,
    ProtocolKind, Result,
};
use blelock_protocol::gseries::{self, AckStatus, GSeriesCodec, GSeriesResponse};
use blelock_protocol::reassembly::Assembler;
use blelock_protocol::ttseries::{self, CommandOutcome, EventKind, TtMessage};
use blelock_transport::{LinkEvent, Transport, WriteMode};
use chrono::Utc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, MutexGuard};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, trace, warn};

/// Cached observations driving debounce and probe fallback.
#[derive(Debug, Default)]
struct StateCache {
    /// Last definite state seen, from a command or a successful query.
    last_valid: Option<(LockState, Instant)>,
    /// Last state a lock/unlock command confirmed.
    last_commanded: Option<(LockState, Instant)>,
}

/// Shared engine behind a [`Session`] and its background tasks.
struct Engine<T: Transport> {
    address: String,
    protocol: ProtocolKind,
    credentials: Credentials,
    config: SessionConfig,
    codec: GSeriesCodec,
    transport: Mutex<T>,
    /// Serializes the command pipeline: one command in flight at a time.
    command_gate: Mutex<()>,
    /// Single-slot pending-response promise.
    pending: StdMutex<Option<oneshot::Sender<Vec<u8>>>>,
    cache: StdMutex<StateCache>,
    last_write: StdMutex<Option<Instant>>,
    /// Consecutive parse failures; past the cap the poller stops itself.
    failures: AtomicU32,
    poll_active: AtomicBool,
    detected_lock_id: StdMutex<Option<LockId>>,
    battery: StdMutex<Option<u8>>,
    lock_state_tx: watch::Sender<LockState>,
    connection_tx: watch::Sender<ConnectionState>,
}

fn guard<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Transport> Engine<T> {
    fn unsupported(&self) -> Error {
        Error::UnsupportedProtocol {
            name: self.address.clone(),
        }
    }

    fn is_link_down(&self) -> bool {
        matches!(
            &*self.connection_tx.borrow(),
            ConnectionState::Disconnected | ConnectionState::Error(_)
        )
    }

    fn set_connection_state(&self, state: ConnectionState) {
        let changed = *self.connection_tx.borrow() != state;
        if changed {
            debug!(address = %self.address, %state, "connection state");
            self.connection_tx.send_replace(state);
        }
    }

    fn note_parse_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(failures, "frame parse failure");
    }

    fn store_battery(&self, raw: u8) {
        let value = if raw <= 100 {
            Some(raw)
        } else {
            warn!(raw, "battery report out of range");
            None
        };
        *guard(&self.battery) = value;
    }

    /// Adopt a device-reported lock id, but only when the credentials
    /// asked for auto-detection: an explicit lock id always wins.
    fn adopt_lock_id(&self, reported: &LockId) {
        if reported.is_auto_detect() {
            return;
        }
        let Credentials::TtSeries { lock_id, .. } = &self.credentials else {
            return;
        };
        if !lock_id.is_auto_detect() {
            return;
        }
        let mut detected = guard(&self.detected_lock_id);
        if detected.as_ref() != Some(reported) {
            info!(lock_id = %reported, "detected lock id");
            *detected = Some(reported.clone());
        }
    }

    fn effective_lock_id(&self, configured: &LockId) -> LockId {
        if configured.is_auto_detect() {
            guard(&self.detected_lock_id)
                .clone()
                .unwrap_or_else(LockId::auto_detect)
        } else {
            configured.clone()
        }
    }

    fn commit_commanded(&self, state: LockState) {
        let now = Instant::now();
        {
            let mut cache = guard(&self.cache);
            cache.last_commanded = Some((state, now));
            cache.last_valid = Some((state, now));
        }
        self.lock_state_tx.send_replace(state);
    }

    /// Replace an UNKNOWN probe with the commanded state while the device
    /// is still transitioning; it reports transient garbage mid-motion.
    fn debounced(&self, observed: LockState) -> LockState {
        if observed.is_known() {
            return observed;
        }
        let cache = guard(&self.cache);
        if let Some((commanded, at)) = cache.last_commanded
            && at.elapsed() <= self.config.debounce_window
        {
            debug!(%commanded, "unknown probe within debounce window, echoing commanded state");
            return commanded;
        }
        observed
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut transport = self.transport.lock().await;
        match timeout(
            self.config.write_completion_timeout,
            transport.write(frame, WriteMode::WithResponse),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Error::NotConnected)) => Err(Error::NotConnected),
            Ok(Err(err)) => Err(Error::command_failed(None, format!("write failed: {err}"))),
            Err(_) => Err(Error::timeout("write completion")),
        }
    }

    /// Run one command: serialize, pace, install the pending promise,
    /// write, await the correlated response.
    async fn execute(&self, frame: Vec<u8>, operation: &'static str) -> Result<Vec<u8>> {
        let _gate = self.command_gate.lock().await;
        if self.is_link_down() {
            return Err(Error::NotConnected);
        }

        if !self.config.command_pacing.is_zero() {
            let pause = guard(&self.last_write)
                .map(|at| self.config.command_pacing.saturating_sub(at.elapsed()));
            if let Some(pause) = pause
                && !pause.is_zero()
            {
                trace!(?pause, "pacing before command");
                sleep(pause).await;
            }
        }

        let (tx, rx) = oneshot::channel();
        if guard(&self.pending).replace(tx).is_some() {
            warn!("replacing stale pending-response slot");
        }

        debug!(operation, bytes = frame.len(), "sending command frame");
        if let Err(err) = self.write_frame(&frame).await {
            guard(&self.pending).take();
            return Err(err);
        }
        *guard(&self.last_write) = Some(Instant::now());

        match timeout(self.config.response_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // The promise was completed with a drop: either a link loss or
            // an explicit disconnect cancelled the wait.
            Ok(Err(_)) => {
                if self.is_link_down() {
                    Err(Error::NotConnected)
                } else {
                    Err(Error::Cancelled)
                }
            }
            Err(_) => {
                guard(&self.pending).take();
                warn!(operation, "response wait timed out");
                Err(Error::timeout(operation))
            }
        }
    }

    fn complete_pending(&self, frame: Vec<u8>) {
        match guard(&self.pending).take() {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    warn!("pending receiver dropped before delivery");
                }
            }
            None => debug!("frame arrived with no pending command"),
        }
    }

    // ── inbound pump ────────────────────────────────────────────

    fn spawn_pump(
        self: Arc<Self>,
        inbound: mpsc::Receiver<Vec<u8>>,
        events: mpsc::Receiver<LinkEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_pump(inbound, events).await })
    }

    async fn run_pump(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        mut events: mpsc::Receiver<LinkEvent>,
    ) {
        let mut assembler = Assembler::for_protocol(self.protocol);
        loop {
            tokio::select! {
                payload = inbound.recv() => match payload {
                    Some(bytes) => {
                        trace!(len = bytes.len(), "notification");
                        assembler.feed(&bytes);
                        while let Some(frame) = assembler.next_frame() {
                            self.dispatch_frame(frame).await;
                        }
                    }
                    None => {
                        self.on_link_down(Some("notification stream closed"));
                        break;
                    }
                },
                event = events.recv() => match event {
                    Some(LinkEvent::Disconnected { error }) => {
                        self.on_link_down(error.as_deref());
                        break;
                    }
                    Some(LinkEvent::Connected) => {}
                    None => {
                        self.on_link_down(None);
                        break;
                    }
                },
            }
        }
        debug!("inbound pump stopped");
    }

    async fn dispatch_frame(&self, frame: Vec<u8>) {
        match self.protocol {
            // Every extracted frame (short ACK or full response) satisfies
            // the pending command.
            ProtocolKind::GSeries => self.complete_pending(frame),
            // Device-initiated messages never satisfy the pending command.
            ProtocolKind::TtSeries => {
                let key = match &self.credentials {
                    Credentials::TtSeries { key, .. } => key.clone(),
                    Credentials::GSeries { .. } => None,
                };
                match ttseries::parse_frame(&frame, key.as_ref()) {
                    Ok(parsed) if parsed.is_event() => self.handle_tt_event(&parsed.business).await,
                    Ok(_) => self.complete_pending(frame),
                    Err(err) => {
                        // Let the waiting command fail fast on the broken
                        // frame instead of timing out.
                        warn!(%err, "undecodable frame");
                        self.complete_pending(frame);
                    }
                }
            }
        }
    }

    async fn handle_tt_event(&self, business: &[u8]) {
        let Ok(TtMessage::Event(event)) = ttseries::interpret(business) else {
            warn!("event frame failed to interpret");
            return;
        };
        if let Some(id) = &event.lock_id {
            self.adopt_lock_id(id);
        }
        match event.kind {
            EventKind::Heartbeat => self.reply_heartbeat().await,
            EventKind::Opened => {
                warn!(address = %self.address, "device reports opened");
                guard(&self.cache).last_valid = Some((LockState::Unlocked, Instant::now()));
                self.lock_state_tx.send_replace(LockState::Unlocked);
            }
            EventKind::Broke | EventKind::RodCut => {
                warn!(address = %self.address, kind = ?event.kind, "tamper alarm");
            }
        }
    }

    async fn reply_heartbeat(&self) {
        let Credentials::TtSeries { lock_id, key, .. } = &self.credentials else {
            return;
        };
        let id = self.effective_lock_id(lock_id);
        let frame = ttseries::build_heartbeat_reply(&id, BcdTimestamp::now(), key.as_ref());
        match timeout(self.config.heartbeat_reply_timeout, self.write_frame(&frame)).await {
            Ok(Ok(())) => trace!("heartbeat reply sent"),
            Ok(Err(err)) => warn!(%err, "heartbeat reply failed"),
            Err(_) => warn!("heartbeat reply timed out"),
        }
    }

    fn on_link_down(&self, error: Option<&str>) {
        info!(address = %self.address, error = ?error, "link down");
        self.poll_active.store(false, Ordering::SeqCst);
        // State flips before the pending promise is dropped so the waiter
        // maps the drop to NotConnected.
        self.set_connection_state(match error {
            Some(reason) => ConnectionState::Error(reason.to_string()),
            None => ConnectionState::Disconnected,
        });
        guard(&self.pending).take();
    }

    // ── status polling ──────────────────────────────────────────

    fn spawn_poller(self: Arc<Self>) -> JoinHandle<()> {
        self.poll_active.store(true, Ordering::SeqCst);
        tokio::spawn(async move { self.run_poller().await })
    }

    async fn run_poller(self: Arc<Self>) {
        debug!(interval = ?self.config.poll_interval, "status poller started");
        loop {
            sleep(self.config.poll_interval).await;
            if !self.poll_active.load(Ordering::SeqCst) || self.is_link_down() {
                break;
            }
            let mut polled_ok = false;
            for attempt in 1..=self.config.poll_query_attempts {
                match self.query_lock_state_once().await {
                    Ok(state) => {
                        trace!(%state, "poll");
                        polled_ok = true;
                        break;
                    }
                    Err(err) => debug!(attempt, %err, "poll query failed"),
                }
            }
            if !polled_ok && self.failures.load(Ordering::SeqCst) > self.config.max_consecutive_failures
            {
                warn!("poller stopping after repeated parse failures; commands remain available");
                break;
            }
        }
        debug!("status poller stopped");
    }

    // ── queries ─────────────────────────────────────────────────

    /// One status probe: build, send, parse, debounce, publish.
    async fn query_lock_state_once(&self) -> Result<LockState> {
        let observed = match self.protocol {
            ProtocolKind::GSeries => self.g_query().await?,
            ProtocolKind::TtSeries => self.tt_query().await?,
        };
        self.failures.store(0, Ordering::SeqCst);

        let state = self.debounced(observed);
        if state.is_known() {
            guard(&self.cache).last_valid = Some((state, Instant::now()));
        }
        self.lock_state_tx.send_replace(state);
        Ok(state)
    }

    async fn g_query(&self) -> Result<LockState> {
        let Credentials::GSeries { key, .. } = &self.credentials else {
            return Err(self.unsupported());
        };
        let frame = self.codec.build_query_status(key);
        let raw = self.execute(frame, "status query").await?;
        let parsed = gseries::parse_response(&raw, Some(key))
            .inspect_err(|_| self.note_parse_failure())?;
        Ok(match parsed {
            GSeriesResponse::Ack(status) => {
                debug!(?status, "short ACK for a status query");
                LockState::Unknown
            }
            GSeriesResponse::Frame(resp) => {
                if let Some(battery) = gseries::extract_battery(&resp.content) {
                    self.store_battery(battery);
                }
                gseries::extract_lock_state(&resp.content)
            }
        })
    }

    async fn tt_query(&self) -> Result<LockState> {
        let Credentials::TtSeries { lock_id, pin, key, .. } = &self.credentials else {
            return Err(self.unsupported());
        };
        let id = self.effective_lock_id(lock_id);
        let frame = ttseries::build_check_status(&id, pin, BcdTimestamp::now(), key.as_ref());
        let raw = self.execute(frame, "status query").await?;
        let parsed = ttseries::parse_frame(&raw, key.as_ref())
            .inspect_err(|_| self.note_parse_failure())?;
        match ttseries::interpret(&parsed.business) {
            Ok(TtMessage::Status(reply)) => {
                self.adopt_lock_id(&reply.lock_id);
                self.store_battery(reply.battery);
                Ok(reply.status.lock_state())
            }
            Ok(other) => {
                debug!(?other, "non-status reply to a status query");
                Ok(LockState::Unknown)
            }
            Err(err) => {
                self.note_parse_failure();
                Err(err)
            }
        }
    }

    // ── commands ────────────────────────────────────────────────

    async fn apply_lock_state(&self, target: LockState) -> Result<bool> {
        match self.protocol {
            ProtocolKind::GSeries => self.g_apply(target).await,
            ProtocolKind::TtSeries => self.tt_apply(target).await,
        }
    }

    async fn g_apply(&self, target: LockState) -> Result<bool> {
        let Credentials::GSeries { key, .. } = &self.credentials else {
            return Err(self.unsupported());
        };
        let (frame, operation) = match target {
            LockState::Locked => (self.codec.build_lock(key), "lock"),
            _ => (self.codec.build_unlock(key), "unlock"),
        };
        let raw = self.execute(frame, operation).await?;
        let parsed = gseries::parse_response(&raw, Some(key))
            .inspect_err(|_| self.note_parse_failure())?;
        self.failures.store(0, Ordering::SeqCst);

        let code = match parsed {
            GSeriesResponse::Ack(AckStatus::Ok) => gseries::RESULT_OK,
            GSeriesResponse::Ack(AckStatus::Fail) => gseries::RESULT_FAIL,
            GSeriesResponse::Ack(AckStatus::ShackleDisconnected) => {
                return Err(Error::command_failed(0x02, "shackle disconnected"));
            }
            GSeriesResponse::Ack(AckStatus::Reserved(code)) => {
                return Err(Error::command_failed(code, "reserved ACK code"));
            }
            GSeriesResponse::Frame(resp) => resp.result_code().unwrap_or(gseries::RESULT_FAIL),
        };

        match code {
            gseries::RESULT_OK => {
                self.commit_commanded(target);
                Ok(true)
            }
            gseries::RESULT_VERIFY_NEEDED => {
                // Some firmware answers a set with 0x11; the state may
                // still have been applied. Re-query to find out.
                debug!(operation, "device returned 0x11, verifying by re-query");
                sleep(self.config.verify_retry_delay).await;
                let state = self.query_lock_state_once().await?;
                if state == target {
                    self.commit_commanded(target);
                    Ok(true)
                } else {
                    Err(Error::command_failed(
                        gseries::RESULT_VERIFY_NEEDED,
                        format!("{operation} unconfirmed after re-query"),
                    ))
                }
            }
            other => Err(Error::command_failed(other, g_result_message(other))),
        }
    }

    async fn tt_apply(&self, target: LockState) -> Result<bool> {
        let Credentials::TtSeries { lock_id, pin, key, .. } = &self.credentials else {
            return Err(self.unsupported());
        };
        let id = self.effective_lock_id(lock_id);
        let (frame, operation) = match target {
            LockState::Locked => (
                ttseries::build_lock(&id, pin, BcdTimestamp::now(), key.as_ref()),
                "lock",
            ),
            _ => (
                ttseries::build_unlock(&id, pin, BcdTimestamp::now(), key.as_ref()),
                "unlock",
            ),
        };
        let raw = self.execute(frame, operation).await?;
        let parsed = ttseries::parse_frame(&raw, key.as_ref())
            .inspect_err(|_| self.note_parse_failure())?;
        let message =
            ttseries::interpret(&parsed.business).inspect_err(|_| self.note_parse_failure())?;
        let TtMessage::Status(reply) = message else {
            return Err(Error::decoding(format!("unexpected reply to {operation}")));
        };
        self.adopt_lock_id(&reply.lock_id);
        self.store_battery(reply.battery);
        self.failures.store(0, Ordering::SeqCst);

        match reply.outcome() {
            CommandOutcome::Locked { again } if target == LockState::Locked => {
                self.commit_commanded(target);
                Ok(!again)
            }
            CommandOutcome::Unlocked { again } if target == LockState::Unlocked => {
                self.commit_commanded(target);
                Ok(!again)
            }
            CommandOutcome::WrongPassword => Err(Error::AuthenticationFailed),
            CommandOutcome::Failed(code) => Err(Error::command_failed(
                code,
                format!("device rejected {operation}"),
            )),
            other => Err(Error::command_failed(
                reply.code,
                format!("unexpected outcome {other:?} for {operation}"),
            )),
        }
    }

    async fn tt_calibrate(&self) -> Result<()> {
        let Credentials::TtSeries { key, .. } = &self.credentials else {
            return Err(self.unsupported());
        };
        let frame = ttseries::build_calibrate_time(BcdTimestamp::now(), key.as_ref());
        // Any correlated reply counts as acknowledgement.
        self.execute(frame, "time calibration").await?;
        Ok(())
    }

    async fn tt_version(&self) -> Result<String> {
        let Credentials::TtSeries { key, .. } = &self.credentials else {
            return Err(self.unsupported());
        };
        let frame = ttseries::build_check_version(BcdTimestamp::now(), key.as_ref());
        let raw = self.execute(frame, "version query").await?;
        let parsed = ttseries::parse_frame(&raw, key.as_ref())
            .inspect_err(|_| self.note_parse_failure())?;
        match ttseries::interpret(&parsed.business)? {
            TtMessage::Version(text) => Ok(text),
            other => Err(Error::decoding(format!(
                "unexpected reply to version query: {other:?}"
            ))),
        }
    }

    async fn tt_set_work_mode(&self, sleep_mode: bool) -> Result<()> {
        let Credentials::TtSeries { lock_id, key, .. } = &self.credentials else {
            return Err(self.unsupported());
        };
        let id = self.effective_lock_id(lock_id);
        let frame = ttseries::build_set_work_mode(&id, sleep_mode, key.as_ref());
        let raw = self.execute(frame, "work mode").await?;
        let parsed = ttseries::parse_frame(&raw, key.as_ref())
            .inspect_err(|_| self.note_parse_failure())?;
        if let Ok(TtMessage::Status(reply)) = ttseries::interpret(&parsed.business)
            && let CommandOutcome::Failed(code) = reply.outcome()
        {
            return Err(Error::command_failed(code, "device rejected work mode"));
        }
        Ok(())
    }

    async fn g_authenticate(&self) -> Result<()> {
        let Credentials::GSeries {
            key,
            password: Some(password),
            ..
        } = &self.credentials
        else {
            return Ok(());
        };
        let frame = self.codec.build_auth(password, Some(key));
        let raw = self.execute(frame, "authentication").await?;
        let accepted = match gseries::parse_response(&raw, Some(key))? {
            GSeriesResponse::Ack(status) => status.is_success(),
            GSeriesResponse::Frame(resp) => resp.result_code() == Some(gseries::RESULT_OK),
        };
        if accepted {
            Ok(())
        } else {
            Err(Error::AuthenticationFailed)
        }
    }
}

fn g_result_message(code: u8) -> String {
    match code {
        gseries::RESULT_FAIL => "device reported failure".to_string(),
        gseries::RESULT_BAD_SERIAL => "device rejected the frame serial".to_string(),
        gseries::RESULT_BAD_CRC => "device rejected the content CRC".to_string(),
        gseries::RESULT_OTHER => "device reported an unspecified error".to_string(),
        other => format!("unrecognized result code {other:#04x}"),
    }
}

/// Handle to one lock over one GATT link.
///
/// # Example
///
/// ```no_run
/// use blelock_core::{AesKey, Credentials};
/// use blelock_session::Session;
/// use blelock_transport::MockTransport;
///
/// # async fn example() -> blelock_core::Result<()> {
/// let (transport, _handle) = MockTransport::new();
/// let key = AesKey::new(b"0123456789abcdef")?;
/// let mut session = Session::new(transport, Credentials::g_series(key, None));
///
/// session.connect().await?;
/// session.unlock().await?;
/// let state = session.query_lock_status().await?;
/// println!("lock is {state}");
/// session.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct Session<T: Transport> {
    engine: Arc<Engine<T>>,
    tasks: StdMutex<TaskHandles>,
    started: bool,
}

#[derive(Default)]
struct TaskHandles {
    pump: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

impl TaskHandles {
    fn abort_all(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl<T: Transport> Session<T> {
    /// Build a session with per-protocol default timing.
    #[must_use]
    pub fn new(transport: T, credentials: Credentials) -> Self {
        let config = SessionConfig::for_protocol(credentials.protocol());
        Self::with_config(transport, credentials, config)
    }

    /// Build a session with explicit timing configuration.
    #[must_use]
    pub fn with_config(transport: T, credentials: Credentials, config: SessionConfig) -> Self {
        let address = transport.address().to_string();
        let protocol = credentials.protocol();
        let (lock_state_tx, _) = watch::channel(LockState::Unknown);
        let (connection_tx, _) = watch::channel(ConnectionState::Disconnected);

        Session {
            engine: Arc::new(Engine {
                address,
                protocol,
                credentials,
                config,
                codec: GSeriesCodec::new(),
                transport: Mutex::new(transport),
                command_gate: Mutex::new(()),
                pending: StdMutex::new(None),
                cache: StdMutex::new(StateCache::default()),
                last_write: StdMutex::new(None),
                failures: AtomicU32::new(0),
                poll_active: AtomicBool::new(false),
                detected_lock_id: StdMutex::new(None),
                battery: StdMutex::new(None),
                lock_state_tx,
                connection_tx,
            }),
            tasks: StdMutex::new(TaskHandles::default()),
            started: false,
        }
    }

    /// Seed auto-detection from the advertised device name (TT-Series
    /// locks advertise their lock id as the name).
    #[must_use]
    pub fn advertised_name(self, name: &str) -> Self {
        if let Some(id) = select::lock_id_from_name(name) {
            self.engine.adopt_lock_id(&id);
        }
        self
    }

    /// Protocol family this session speaks.
    #[must_use]
    pub fn protocol(&self) -> ProtocolKind {
        self.engine.protocol
    }

    /// Subscribe to connection state transitions. The receiver starts at
    /// the current value.
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.engine.connection_tx.subscribe()
    }

    /// Subscribe to lock state transitions. The receiver starts at the
    /// current value.
    #[must_use]
    pub fn lock_state(&self) -> watch::Receiver<LockState> {
        self.engine.lock_state_tx.subscribe()
    }

    /// Run the connect sequence: GATT connect and service discovery,
    /// notification enablement, protocol warm-up (TT time calibration /
    /// G-Series password), initial status query with retry, poller start.
    ///
    /// # Errors
    /// Returns the underlying failure and parks the session in the
    /// terminal `Error` state; build a new session to retry.
    pub async fn connect(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::ConnectionFailed {
                reason: "session already started; create a new session to reconnect".to_string(),
            });
        }
        self.started = true;

        info!(address = %self.engine.address, protocol = %self.engine.protocol, "connecting");
        self.engine.set_connection_state(ConnectionState::Connecting);

        match self.establish().await {
            Ok(()) => {
                self.engine.set_connection_state(ConnectionState::Connected);
                info!(address = %self.engine.address, "connected");
                Ok(())
            }
            Err(err) => {
                error!(address = %self.engine.address, %err, "connect failed");
                guard(&self.tasks).abort_all();
                self.engine.transport.lock().await.disconnect().await;
                self.engine
                    .set_connection_state(ConnectionState::Error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn establish(&mut self) -> Result<()> {
        let engine = &self.engine;

        let (inbound, events) = {
            let mut transport = engine.transport.lock().await;
            let profile = timeout(engine.config.connect_timeout, transport.connect())
                .await
                .map_err(|_| Error::timeout("connect"))??;
            debug!(
                service = %profile.service,
                write = %profile.write_characteristic,
                notify = %profile.notify_characteristic,
                "GATT profile selected"
            );
            timeout(
                engine.config.descriptor_write_timeout,
                transport.enable_notifications(),
            )
            .await
            .map_err(|_| Error::timeout("descriptor write"))??;
            (transport.take_inbound()?, transport.take_events()?)
        };
        guard(&self.tasks).pump = Some(engine.clone().spawn_pump(inbound, events));
        sleep(engine.config.settle_delay).await;

        if engine.protocol == ProtocolKind::TtSeries {
            if let Err(err) = engine.tt_calibrate().await {
                warn!(%err, "time calibration failed, continuing");
            }
        } else if let Err(err) = engine.g_authenticate().await {
            warn!(%err, "password authentication failed, continuing");
        }
        sleep(engine.config.settle_delay).await;

        let mut attempt = 1;
        loop {
            match engine.query_lock_state_once().await {
                Ok(state) => {
                    debug!(%state, "initial lock state");
                    break;
                }
                Err(err) if attempt < engine.config.connect_query_attempts => {
                    debug!(attempt, %err, "initial status query failed, retrying");
                    attempt += 1;
                    sleep(engine.config.connect_query_retry_delay).await;
                }
                Err(err) => {
                    warn!(%err, "initial status query failed, starting with unknown state");
                    break;
                }
            }
        }

        guard(&self.tasks).poller = Some(engine.clone().spawn_poller());
        Ok(())
    }

    /// Engage the lock.
    ///
    /// Returns `Ok(true)` on confirmed success and `Ok(false)` when the
    /// device reports an idempotent re-apply (it was already locked).
    pub async fn lock(&self) -> Result<bool> {
        self.engine.apply_lock_state(LockState::Locked).await
    }

    /// Release the lock. Same return convention as [`lock`](Session::lock).
    pub async fn unlock(&self) -> Result<bool> {
        self.engine.apply_lock_state(LockState::Unlocked).await
    }

    /// Probe the current lock state.
    ///
    /// Falls back to the last valid cached state when the probe fails and
    /// the cache is younger than the configured validity window; polling
    /// reconciles later.
    pub async fn query_lock_status(&self) -> Result<LockState> {
        match self.engine.query_lock_state_once().await {
            Ok(state) => Ok(state),
            Err(err) => {
                let cached = {
                    let cache = guard(&self.engine.cache);
                    cache.last_valid
                };
                if let Some((state, at)) = cached
                    && at.elapsed() <= self.engine.config.cached_state_validity
                {
                    debug!(%err, %state, "probe failed, returning cached state");
                    Ok(state)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Snapshot the device status from current observables plus a live
    /// RSSI read.
    pub async fn query_device_status(&self) -> Result<DeviceStatus> {
        let engine = &self.engine;
        let is_connected = engine.connection_tx.borrow().is_connected();
        let rssi = if is_connected {
            let mut transport = engine.transport.lock().await;
            transport.read_rssi().await.unwrap_or_default()
        } else {
            None
        };
        Ok(DeviceStatus {
            lock_state: *engine.lock_state_tx.borrow(),
            battery_percent: *guard(&engine.battery),
            is_connected,
            rssi,
            updated_at: Utc::now(),
        })
    }

    /// Push the current wall-clock time to the device (TT-Series only).
    pub async fn calibrate_time(&self) -> Result<()> {
        self.engine.tt_calibrate().await
    }

    /// Read the firmware version string (TT-Series only).
    pub async fn get_version(&self) -> Result<String> {
        self.engine.tt_version().await
    }

    /// Switch between sleep and realtime work modes (TT-Series only).
    pub async fn set_work_mode(&self, sleep_mode: bool) -> Result<()> {
        self.engine.tt_set_work_mode(sleep_mode).await
    }

    /// Lock id learned from the device or its advertised name, when the
    /// credentials asked for auto-detection (TT-Series only).
    #[must_use]
    pub fn detected_lock_id(&self) -> Option<String> {
        guard(&self.engine.detected_lock_id)
            .as_ref()
            .map(|id| id.as_str().to_string())
    }

    /// Battery percentage from the most recent device report.
    #[must_use]
    pub fn battery_level(&self) -> Option<u8> {
        *guard(&self.engine.battery)
    }

    /// Tear the session down: stop polling, cancel any in-flight command
    /// wait, disconnect the transport and publish `Disconnected`.
    pub async fn disconnect(&self) {
        info!(address = %self.engine.address, "disconnecting");
        self.engine.poll_active.store(false, Ordering::SeqCst);
        // Cancel the in-flight wait while the state still reads Connected
        // so the waiter observes Cancelled, not NotConnected.
        guard(&self.engine.pending).take();
        guard(&self.tasks).abort_all();
        self.engine.transport.lock().await.disconnect().await;
        if !matches!(
            &*self.engine.connection_tx.borrow(),
            ConnectionState::Error(_)
        ) {
            self.engine
                .set_connection_state(ConnectionState::Disconnected);
        }
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.engine.poll_active.store(false, Ordering::SeqCst);
        guard(&self.engine.pending).take();
        guard(&self.tasks).abort_all();
        debug!(address = %self.engine.address, "session dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blelock_core::{AesKey, Pin};
    use blelock_transport::MockTransport;

    fn g_credentials() -> Credentials {
        Credentials::g_series(AesKey::new(b"1234567890123456").unwrap(), None)
    }

    #[tokio::test]
    async fn test_tt_surface_rejected_on_g_sessions() {
        let (transport, _handle) = MockTransport::new();
        let session = Session::new(transport, g_credentials());

        assert!(matches!(
            session.calibrate_time().await,
            Err(Error::UnsupportedProtocol { .. })
        ));
        assert!(matches!(
            session.get_version().await,
            Err(Error::UnsupportedProtocol { .. })
        ));
        assert!(matches!(
            session.set_work_mode(true).await,
            Err(Error::UnsupportedProtocol { .. })
        ));
        assert_eq!(session.detected_lock_id(), None);
    }

    #[tokio::test]
    async fn test_commands_refused_before_connect() {
        let (transport, _handle) = MockTransport::new();
        let session = Session::new(transport, g_credentials());
        assert!(matches!(session.lock().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_initial_observables() {
        let (transport, _handle) = MockTransport::new();
        let session = Session::new(transport, g_credentials());
        assert_eq!(*session.lock_state().borrow(), LockState::Unknown);
        assert_eq!(
            *session.connection_state().borrow(),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_advertised_name_seeds_detection() {
        let (transport, _handle) = MockTransport::new();
        let credentials = Credentials::tt_series(
            LockId::auto_detect(),
            Pin::new("123456").unwrap(),
            None,
        );
        let session = Session::new(transport, credentials).advertised_name("83181001");
        assert_eq!(session.detected_lock_id(), Some("83181001".to_string()));
    }

    #[tokio::test]
    async fn test_explicit_lock_id_wins_over_name() {
        let (transport, _handle) = MockTransport::new();
        let credentials = Credentials::tt_series(
            LockId::new("00000042").unwrap(),
            Pin::new("123456").unwrap(),
            None,
        );
        let session = Session::new(transport, credentials).advertised_name("83181001");
        assert_eq!(session.detected_lock_id(), None);
    }
}
