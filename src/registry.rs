// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Process-wide call state
//!
//! Everything shared across calls lives in [`Core`], owned by `main` and
//! passed explicitly to the components; there are no globals.

use crate::ari::AriClient;
use crate::mailer::Mailer;
use crate::media::{PortPool, RtpReceiver, RtpSender};
use crate::openai::SessionHandle;
use crate::settings::Settings;
use crate::transcript::TranscriptWriter;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// How long a hung-up external leg keeps suppressing late events
const IGNORE_EXPIRY: Duration = Duration::from_secs(10);

/// Why a call was torn down
#[derive(Debug, Clone)]
pub enum CleanupReason {
    BothEnded,
    GraceTimeout,
    BridgeDestroyed,
    DurationLimit,
    Shutdown,
    SetupError,
    AssistantTerminate(String),
    RedirectCleanup,
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupReason::BothEnded => write!(f, "both-ended"),
            CleanupReason::GraceTimeout => write!(f, "grace-timeout"),
            CleanupReason::BridgeDestroyed => write!(f, "bridge-destroyed"),
            CleanupReason::DurationLimit => write!(f, "duration-limit"),
            CleanupReason::Shutdown => write!(f, "shutdown"),
            CleanupReason::SetupError => write!(f, "stasisstart-error"),
            CleanupReason::AssistantTerminate(phrase) => {
                write!(f, "assistant-terminate:{phrase}")
            }
            CleanupReason::RedirectCleanup => write!(f, "redirect-cleanup"),
        }
    }
}

/// Everything the bridge holds for one live call
pub struct Call {
    /// Channel id of the SIP leg, assigned by the PBX
    pub id: String,
    pub caller_identity: String,
    pub bridge_id: String,
    pub rtp_port: u16,

    pub receiver: RtpReceiver,
    pub sender: Arc<RtpSender>,
    pub transcript: Arc<TranscriptWriter>,

    pub external_leg_id: Mutex<Option<String>>,
    pub session: Mutex<Option<SessionHandle>>,

    pub sip_ended: AtomicBool,
    pub ext_ended: AtomicBool,
    /// Queue handoff has begun, locks out hangup of the SIP leg and mail
    pub redirecting: AtomicBool,
    /// Farewell matched, cleanup runs after the drain edge
    pub terminate_armed: AtomicBool,
    pub ws_closed: AtomicBool,
    port_released: AtomicBool,

    /// Running count of realtime audio bytes received
    pub total_delta_bytes: AtomicU64,

    pub duration_timer: Mutex<Option<JoinHandle<()>>>,
    pub grace_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Call {
    pub fn new(
        id: String,
        caller_identity: String,
        bridge_id: String,
        rtp_port: u16,
        receiver: RtpReceiver,
        sender: Arc<RtpSender>,
        transcript: Arc<TranscriptWriter>,
    ) -> Self {
        Self {
            id,
            caller_identity,
            bridge_id,
            rtp_port,
            receiver,
            sender,
            transcript,
            external_leg_id: Mutex::new(None),
            session: Mutex::new(None),
            sip_ended: AtomicBool::new(false),
            ext_ended: AtomicBool::new(false),
            redirecting: AtomicBool::new(false),
            terminate_armed: AtomicBool::new(false),
            ws_closed: AtomicBool::new(false),
            port_released: AtomicBool::new(false),
            total_delta_bytes: AtomicU64::new(0),
            duration_timer: Mutex::new(None),
            grace_timer: Mutex::new(None),
        }
    }

    pub fn external_leg(&self) -> Option<String> {
        self.external_leg_id.lock().clone()
    }

    pub fn set_external_leg(&self, leg_id: String) {
        *self.external_leg_id.lock() = Some(leg_id);
    }

    pub fn set_session(&self, session: SessionHandle) {
        *self.session.lock() = Some(session);
    }

    pub fn take_session(&self) -> Option<SessionHandle> {
        self.session.lock().take()
    }

    pub fn is_redirecting(&self) -> bool {
        self.redirecting.load(Ordering::Acquire)
    }

    pub fn is_terminate_armed(&self) -> bool {
        self.terminate_armed.load(Ordering::Acquire)
    }

    /// Cancel the duration and grace timers if armed
    pub fn abort_timers(&self) {
        if let Some(timer) = self.duration_timer.lock().take() {
            timer.abort();
        }
        if let Some(timer) = self.grace_timer.lock().take() {
            timer.abort();
        }
    }
}

/// Shared state of the bridge process
pub struct Core {
    pub settings: Arc<Settings>,
    pub ari: AriClient,
    pub port_pool: PortPool,
    pub mailer: Mailer,

    pub pbx_connected: AtomicBool,
    pub started: DateTime<Utc>,
    started_at: Instant,

    calls: Mutex<HashMap<String, Arc<Call>>>,
    /// external media leg id -> call id, populated before origination
    external_to_call: Mutex<HashMap<String, String>>,
    /// External legs whose late events are suppressed
    ignored_legs: Mutex<HashSet<String>>,
    /// Call ids whose cleanup has completed
    cleaned: Mutex<HashSet<String>>,
    /// At-most-one cleanup per call, joiners await the first
    cleanup_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Core {
    pub fn new(settings: Arc<Settings>) -> Self {
        let ari = AriClient::new(&settings);
        let port_pool = PortPool::new(settings.rtp_port_start, settings.max_concurrent_calls);
        let mailer = Mailer::new(settings.clone());

        Self {
            settings,
            ari,
            port_pool,
            mailer,
            pbx_connected: AtomicBool::new(false),
            started: Utc::now(),
            started_at: Instant::now(),
            calls: Mutex::new(HashMap::new()),
            external_to_call: Mutex::new(HashMap::new()),
            ignored_legs: Mutex::new(HashSet::new()),
            cleaned: Mutex::new(HashSet::new()),
            cleanup_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn insert_call(&self, call: Arc<Call>) {
        self.calls.lock().insert(call.id.clone(), call);
    }

    pub fn get_call(&self, call_id: &str) -> Option<Arc<Call>> {
        self.calls.lock().get(call_id).cloned()
    }

    pub fn remove_call(&self, call_id: &str) -> Option<Arc<Call>> {
        self.calls.lock().remove(call_id)
    }

    pub fn is_registered(&self, call_id: &str) -> bool {
        self.calls.lock().contains_key(call_id)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn live_calls(&self) -> Vec<Arc<Call>> {
        self.calls.lock().values().cloned().collect()
    }

    pub fn find_call_by_bridge(&self, bridge_id: &str) -> Option<Arc<Call>> {
        self.calls
            .lock()
            .values()
            .find(|call| call.bridge_id == bridge_id)
            .cloned()
    }

    pub fn map_external(&self, leg_id: &str, call_id: &str) {
        self.external_to_call
            .lock()
            .insert(leg_id.to_string(), call_id.to_string());
    }

    pub fn resolve_external(&self, leg_id: &str) -> Option<String> {
        self.external_to_call.lock().get(leg_id).cloned()
    }

    pub fn unmap_external(&self, leg_id: &str) {
        self.external_to_call.lock().remove(leg_id);
    }

    /// Suppress events for the given leg for the next [`IGNORE_EXPIRY`]
    pub fn ignore_leg(self: &Arc<Self>, leg_id: &str) {
        self.ignore_leg_for(leg_id, IGNORE_EXPIRY);
    }

    pub fn ignore_leg_for(self: &Arc<Self>, leg_id: &str, expiry: Duration) {
        self.ignored_legs.lock().insert(leg_id.to_string());

        let core = self.clone();
        let leg_id = leg_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            core.ignored_legs.lock().remove(&leg_id);
        });
    }

    pub fn is_ignored(&self, leg_id: &str) -> bool {
        self.ignored_legs.lock().contains(leg_id)
    }

    pub fn mark_cleaned(&self, call_id: &str) {
        self.cleaned.lock().insert(call_id.to_string());
    }

    pub fn is_cleaned(&self, call_id: &str) -> bool {
        self.cleaned.lock().contains(call_id)
    }

    /// Get or create the per-call cleanup serialization lock
    pub fn cleanup_lock(&self, call_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.cleanup_locks
            .lock()
            .entry(call_id.to_string())
            .or_default()
            .clone()
    }

    pub fn drop_cleanup_lock(&self, call_id: &str) {
        self.cleanup_locks.lock().remove(call_id);
    }

    /// Return the call's RTP port to the pool exactly once
    ///
    /// Both the redirect teardown and the final cleanup release the port;
    /// the second release must not free a port that has meanwhile been
    /// handed to another call.
    pub fn release_port_once(&self, call: &Call) {
        if !call.port_released.swap(true, Ordering::AcqRel) {
            self.port_pool.release(call.rtp_port);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::RtpSender;
    use tokio::sync::{mpsc, watch};

    fn test_core() -> Arc<Core> {
        let settings = Arc::new(Settings::load("/nonexistent-config.toml").unwrap());
        Arc::new(Core::new(settings))
    }

    async fn test_call(core: &Core, call_id: &str) -> Arc<Call> {
        let (sink, _sink_rx) = mpsc::unbounded_channel();
        let (receiver, _source) = RtpReceiver::spawn(0, sink).await.unwrap();
        let (_remote_tx, remote_rx) = watch::channel(None);
        let sender = Arc::new(
            RtpSender::spawn(call_id.to_string(), remote_rx)
                .await
                .unwrap(),
        );
        let port = core.port_pool.acquire().unwrap();

        Arc::new(Call::new(
            call_id.to_string(),
            "+491234".into(),
            format!("bridge-{call_id}"),
            port,
            receiver,
            sender,
            Arc::new(TranscriptWriter::new("/tmp", "+491234", call_id)),
        ))
    }

    #[tokio::test]
    async fn tracks_calls_and_external_legs() {
        let core = test_core();
        let call = test_call(&core, "c1").await;

        core.insert_call(call.clone());
        assert!(core.is_registered("c1"));
        assert_eq!(core.call_count(), 1);

        core.map_external("e1", "c1");
        assert_eq!(core.resolve_external("e1").as_deref(), Some("c1"));

        assert!(core.find_call_by_bridge("bridge-c1").is_some());
        assert!(core.find_call_by_bridge("bridge-zz").is_none());

        core.unmap_external("e1");
        assert!(core.resolve_external("e1").is_none());

        core.remove_call("c1");
        assert!(!core.is_registered("c1"));
    }

    #[tokio::test]
    async fn ignored_legs_expire() {
        let core = test_core();

        core.ignore_leg_for("e1", Duration::from_millis(50));
        assert!(core.is_ignored("e1"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!core.is_ignored("e1"));
    }

    #[tokio::test]
    async fn port_released_exactly_once() {
        let core = test_core();
        let call = test_call(&core, "c1").await;

        assert_eq!(core.port_pool.in_use(), 1);

        core.release_port_once(&call);
        assert_eq!(core.port_pool.in_use(), 0);

        // Another call grabs the same port; a second release must not
        // free it underneath them
        let reused = core.port_pool.acquire().unwrap();
        assert_eq!(reused, call.rtp_port);

        core.release_port_once(&call);
        assert_eq!(core.port_pool.in_use(), 1);
    }
}
