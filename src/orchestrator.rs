// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! The per-call lifecycle state machine
//!
//! Consumes the ARI event stream, sets calls up (bridge, RTP, realtime
//! session), reacts to trigger phrases (queue handoff, terminate after
//! playback) and owns the idempotent teardown of every call resource.

use crate::ari::{AriEvent, AriEvents, Channel};
use crate::mailer::TranscriptMail;
use crate::media::{RtpReceiver, RtpSender};
use crate::openai::{self, TriggerEvent};
use crate::registry::{Call, CleanupReason, Core};
use crate::transcript::TranscriptWriter;
use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Bounded wait for the external leg to appear in the external->call map
const EXTERNAL_MAP_POLLS: u32 = 10;
const EXTERNAL_MAP_POLL_DELAY: Duration = Duration::from_millis(50);

/// How long a closing realtime session gets to settle
const WS_CLOSE_SETTLE: Duration = Duration::from_millis(300);

const ARI_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Application main loop
///
/// Runs until SIGINT or SIGTERM, then cleans up all live calls in parallel.
pub async fn run(core: Arc<Core>) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("received SIGINT"),
            _ = sigterm.recv() => log::info!("received SIGTERM"),
        }
    };
    tokio::pin!(shutdown);

    'outer: loop {
        let mut events = tokio::select! {
            connected = AriEvents::connect(&core.settings) => match connected {
                Ok(events) => events,
                Err(e) => {
                    log::error!("failed to connect to ARI: {e:#}");
                    tokio::select! {
                        _ = tokio::time::sleep(ARI_RECONNECT_DELAY) => continue,
                        _ = &mut shutdown => break 'outer,
                    }
                }
            },
            _ = &mut shutdown => break,
        };

        core.pbx_connected.store(true, Ordering::Release);
        log::info!("connected to the ARI event stream as {:?}", core.ari.app());

        loop {
            tokio::select! {
                event = events.receive() => match event {
                    Ok(Some(event)) => {
                        let core = core.clone();
                        tokio::spawn(dispatch_event(core, event));
                    }
                    Ok(None) => {
                        log::warn!("ARI event stream closed, reconnecting");
                        break;
                    }
                    Err(e) => {
                        log::error!("ARI event stream failed: {e:#}, reconnecting");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    let _ = events.close().await;
                    break 'outer;
                }
            }
        }

        core.pbx_connected.store(false, Ordering::Release);
    }

    core.pbx_connected.store(false, Ordering::Release);
    shutdown_all(&core).await;

    Ok(())
}

async fn dispatch_event(core: Arc<Core>, event: AriEvent) {
    match event {
        AriEvent::StasisStart { channel } => {
            if channel.is_external_media() {
                on_external_media_start(core, channel).await;
            } else {
                on_stasis_start(core, channel).await;
            }
        }
        AriEvent::StasisEnd { channel } | AriEvent::ChannelDestroyed { channel } => {
            on_leg_end(core, channel).await;
        }
        AriEvent::BridgeDestroyed { bridge } => {
            on_bridge_destroyed(core, &bridge.id).await;
        }
        AriEvent::Unknown => {}
    }
}

/// A SIP leg entered the application
async fn on_stasis_start(core: Arc<Core>, channel: Channel) {
    if channel.is_local() {
        log::debug!("ignoring Local pseudo-channel {}", channel.name);
        return;
    }

    if core.is_cleaned(&channel.id) || core.is_ignored(&channel.id) {
        log::info!("dropping StasisStart for cleaned channel {}", channel.id);
        return;
    }

    if core.is_registered(&channel.id) {
        log::info!("duplicate StasisStart for call {}", channel.id);
        return;
    }

    log::info!(
        "incoming call {} from {:?}",
        channel.id,
        channel.caller_identity()
    );

    if let Err(e) = setup_call(&core, &channel).await {
        log::error!("failed to set up call {}: {e:#}", channel.id);

        if core.is_registered(&channel.id) {
            cleanup(&core, &channel.id, CleanupReason::SetupError).await;
        } else if let Err(e) = core.ari.hangup(&channel.id).await {
            log::debug!("failed to hang up channel {}: {e:#}", channel.id);
        }
    }
}

async fn setup_call(core: &Arc<Core>, channel: &Channel) -> Result<()> {
    let call_id = channel.id.clone();

    let bridge = core
        .ari
        .create_bridge()
        .await
        .context("failed to create bridge")?;

    // Until the call is registered, failures unwind what exists so far
    let early = |e: anyhow::Error| {
        let core = core.clone();
        let bridge_id = bridge.id.clone();
        tokio::spawn(async move {
            if let Err(e) = core.ari.destroy_bridge(&bridge_id).await {
                log::debug!("failed to destroy bridge {bridge_id}: {e:#}");
            }
        });
        e
    };

    if let Err(e) = core
        .ari
        .add_channel_to_bridge(&bridge.id, &call_id)
        .await
        .context("failed to add SIP leg to bridge")
    {
        return Err(early(e));
    }

    if let Err(e) = core
        .ari
        .answer(&call_id)
        .await
        .context("failed to answer call")
    {
        return Err(early(e));
    }

    let port = match core.port_pool.acquire() {
        Ok(port) => port,
        Err(e) => return Err(early(e.into())),
    };

    let (audio_tx, audio_rx) = mpsc::unbounded_channel();

    let (receiver, source_rx) = match RtpReceiver::spawn(port, audio_tx).await {
        Ok(receiver) => receiver,
        Err(e) => {
            core.port_pool.release(port);
            return Err(early(e));
        }
    };

    let sender = match RtpSender::spawn(call_id.clone(), source_rx).await {
        Ok(sender) => Arc::new(sender),
        Err(e) => {
            receiver.close().await;
            core.port_pool.release(port);
            return Err(early(e));
        }
    };

    let caller_identity = channel.caller_identity();
    let transcript = Arc::new(TranscriptWriter::new(
        &core.settings.recordings_dir,
        &caller_identity,
        &call_id,
    ));

    let call = Arc::new(Call::new(
        call_id.clone(),
        caller_identity,
        bridge.id.clone(),
        port,
        receiver,
        sender,
        transcript,
    ));
    core.insert_call(call.clone());

    // From here on the normal cleanup path releases everything

    let external = core
        .ari
        .external_media(&format!("127.0.0.1:{port}"))
        .await
        .context("failed to originate external media leg")?;

    call.set_external_leg(external.id.clone());
    core.map_external(&external.id, &call_id);

    log::info!(
        "call {call_id}: bridge {} up, external media leg {} -> 127.0.0.1:{port}",
        bridge.id,
        external.id
    );

    let limit = core.settings.call_duration_limit_seconds;
    if limit > 0 {
        let core = core.clone();
        let call_id = call_id.clone();

        *call.duration_timer.lock() = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(limit)).await;
            log::info!("call {call_id}: duration limit of {limit}s reached, hanging up");

            if let Err(e) = core.ari.hangup(&call_id).await {
                log::warn!("call {call_id}: duration-limit hangup failed: {e:#}");
                cleanup(&core, &call_id, CleanupReason::DurationLimit).await;
            }
        }));
    }

    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    spawn_trigger_dispatcher(core.clone(), call_id.clone(), trigger_rx);

    let session = openai::spawn(core.clone(), call.clone(), audio_rx, trigger_tx);
    call.set_session(session);

    Ok(())
}

/// Consume trigger requests of the realtime session for exactly one call
///
/// Requests carrying a foreign call id are dropped.
fn spawn_trigger_dispatcher(
    core: Arc<Core>,
    call_id: String,
    mut triggers: mpsc::UnboundedReceiver<TriggerEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = triggers.recv().await {
            match event {
                TriggerEvent::Redirect { call_id: id, phrase } => {
                    if id != call_id {
                        log::warn!("dropping redirect request for foreign call {id}");
                        continue;
                    }
                    redirect_to_queue(&core, &id, &phrase).await;
                }
                TriggerEvent::Terminate { call_id: id, phrase } => {
                    if id != call_id {
                        log::warn!("dropping terminate request for foreign call {id}");
                        continue;
                    }
                    terminate_after_playback(&core, &id, &phrase).await;
                }
            }
        }
    });
}

/// The externalMedia leg entered the application
async fn on_external_media_start(core: Arc<Core>, channel: Channel) {
    if core.is_ignored(&channel.id) || core.is_cleaned(&channel.id) {
        log::info!("dropping StasisStart for ignored external leg {}", channel.id);
        return;
    }

    // The mapping is written right after origination, allow it a moment
    let mut call_id = None;
    for _ in 0..EXTERNAL_MAP_POLLS {
        call_id = core.resolve_external(&channel.id);
        if call_id.is_some() {
            break;
        }
        tokio::time::sleep(EXTERNAL_MAP_POLL_DELAY).await;
    }

    let Some(call_id) = call_id else {
        log::error!(
            "external media leg {} has no owning call, leaving it to be garbage-collected",
            channel.id
        );
        return;
    };

    let Some(call) = core.get_call(&call_id) else {
        log::info!(
            "external media leg {} belongs to removed call {call_id}",
            channel.id
        );
        return;
    };

    if let Err(e) = core
        .ari
        .add_channel_to_bridge(&call.bridge_id, &channel.id)
        .await
    {
        log::error!(
            "call {call_id}: failed to add external leg {} to bridge {}: {e:#}",
            channel.id,
            call.bridge_id
        );
        return;
    }

    log::info!(
        "call {call_id}: external media leg {} joined bridge {}",
        channel.id,
        call.bridge_id
    );
}

/// StasisEnd or ChannelDestroyed for either leg of a call
async fn on_leg_end(core: Arc<Core>, channel: Channel) {
    if channel.is_local() {
        return;
    }

    if core.is_ignored(&channel.id) {
        log::info!("dropping late event for ignored leg {}", channel.id);
        return;
    }

    let (call, is_sip_leg) = if let Some(call) = core.get_call(&channel.id) {
        (call, true)
    } else if let Some(call_id) = core.resolve_external(&channel.id) {
        match core.get_call(&call_id) {
            Some(call) => (call, false),
            None => {
                log::info!(
                    "dropping event for external leg {} of removed call {call_id}",
                    channel.id
                );
                return;
            }
        }
    } else {
        log::info!("dropping event for unknown channel {}", channel.id);
        return;
    };

    if is_sip_leg {
        log::info!("call {}: SIP leg ended", call.id);
        call.sip_ended.store(true, Ordering::Release);
    } else {
        log::info!("call {}: external media leg ended", call.id);
        call.ext_ended.store(true, Ordering::Release);
    }

    if call.sip_ended.load(Ordering::Acquire) && call.ext_ended.load(Ordering::Acquire) {
        let reason = if call.is_redirecting() {
            CleanupReason::RedirectCleanup
        } else {
            CleanupReason::BothEnded
        };
        cleanup(&core, &call.id, reason).await;
        return;
    }

    // Debounce: the other leg usually follows within the grace window
    let grace = Duration::from_millis(core.settings.cleanup_grace_ms);
    let timer = {
        let core = core.clone();
        let call = call.clone();

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let reason = if call.is_redirecting() {
                CleanupReason::RedirectCleanup
            } else {
                CleanupReason::GraceTimeout
            };
            cleanup(&core, &call.id, reason).await;
        })
    };

    if let Some(previous) = call.grace_timer.lock().replace(timer) {
        previous.abort();
    };
}

async fn on_bridge_destroyed(core: Arc<Core>, bridge_id: &str) {
    let Some(call) = core.find_call_by_bridge(bridge_id) else {
        log::info!("dropping BridgeDestroyed for unknown bridge {bridge_id}");
        return;
    };

    log::warn!("bridge {bridge_id} of call {} destroyed externally", call.id);
    cleanup(&core, &call.id, CleanupReason::BridgeDestroyed).await;
}

/// Hand the SIP leg off into the configured queue
///
/// Tears down the media path (external leg, bridge, RTP, realtime session)
/// and continues the SIP leg in the dialplan; every step is best-effort.
async fn redirect_to_queue(core: &Arc<Core>, call_id: &str, phrase: &str) {
    let Some(queue) = core.settings.redirection_queue.clone() else {
        log::warn!("call {call_id}: redirect requested but REDIRECTION_QUEUE is not configured");
        return;
    };

    let Some(call) = core.get_call(call_id) else {
        return;
    };

    if call.is_terminate_armed() {
        log::info!("call {call_id}: redirect after farewell ignored");
        return;
    }

    if call.redirecting.swap(true, Ordering::AcqRel) {
        log::info!("call {call_id}: redirect already in progress");
        return;
    }

    log::info!("call {call_id}: handing off to queue {queue} (matched {phrase:?})");

    call.sender.end();

    if let Some(session) = call.take_session() {
        session.shutdown(WS_CLOSE_SETTLE).await;
    }

    if let Some(external) = call.external_leg() {
        core.ignore_leg(&external);

        if let Err(e) = core.ari.hangup(&external).await {
            log::debug!("call {call_id}: hangup of external leg {external} failed: {e:#}");
        }
    }

    if let Err(e) = core.ari.destroy_bridge(&call.bridge_id).await {
        log::debug!(
            "call {call_id}: destroying bridge {} failed: {e:#}",
            call.bridge_id
        );
    }

    call.receiver.close().await;
    call.sender.close().await;
    core.release_port_once(&call);

    let mut contexts = Vec::new();
    if let Some(context) = core.settings.redirection_queue_context.as_deref() {
        contexts.push(context);
    }
    contexts.push("ext-queues");
    contexts.push("from-internal");

    for context in contexts {
        match core
            .ari
            .continue_in_dialplan(call_id, context, &queue, 1)
            .await
        {
            Ok(()) => {
                log::info!("call {call_id}: continued in dialplan at {context},{queue},1");
                return;
            }
            Err(e) => {
                log::warn!("call {call_id}: continue in context {context:?} failed: {e:#}");
            }
        }
    }

    log::error!("call {call_id}: every dialplan context failed, hanging up as a last resort");
    if let Err(e) = core.ari.hangup(call_id).await {
        log::debug!("call {call_id}: last-resort hangup failed: {e:#}");
    }
}

/// The assistant said its farewell: let it finish playing, then clean up
async fn terminate_after_playback(core: &Arc<Core>, call_id: &str, phrase: &str) {
    let Some(call) = core.get_call(call_id) else {
        return;
    };

    if call.is_redirecting() {
        log::info!("call {call_id}: terminate skipped, handoff in progress");
        return;
    }

    if call.terminate_armed.swap(true, Ordering::AcqRel) {
        return;
    }

    log::info!("call {call_id}: terminating after playback (matched {phrase:?})");

    // Watchdog in case draining or teardown wedges
    let watchdog = Duration::from_millis(core.settings.termination_watchdog_ms);
    {
        let core = core.clone();
        let call_id = call_id.to_string();
        let phrase = phrase.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(watchdog).await;

            if core.is_registered(&call_id) {
                log::warn!("call {call_id}: termination watchdog fired");
                cleanup(&core, &call_id, CleanupReason::AssistantTerminate(phrase)).await;
            }
        });
    }

    if !call.sender.is_idle() {
        let fallback = Duration::from_millis(core.settings.terminate_fallback_ms);

        tokio::select! {
            _ = call.sender.wait_drained() => {
                log::debug!("call {call_id}: farewell drained");
            }
            _ = tokio::time::sleep(fallback) => {
                log::warn!(
                    "call {call_id}: farewell drain timed out after {}ms",
                    fallback.as_millis()
                );
            }
        }
    }

    cleanup(
        core,
        call_id,
        CleanupReason::AssistantTerminate(phrase.to_string()),
    )
    .await;
}

/// Tear down every resource of a call, exactly once
///
/// Concurrent invocations for the same call join the first one; any later
/// invocation is a no-op. Every step tolerates failure of the previous.
pub async fn cleanup(core: &Arc<Core>, call_id: &str, reason: CleanupReason) {
    let lock = core.cleanup_lock(call_id);
    let _guard = lock.lock().await;

    if core.is_cleaned(call_id) {
        return;
    }

    let Some(call) = core.get_call(call_id) else {
        core.drop_cleanup_lock(call_id);
        return;
    };

    log::info!("call {call_id}: cleaning up ({reason})");

    let external = call.external_leg();
    if let Some(external) = &external {
        core.ignore_leg(external);
    }

    call.abort_timers();

    call.sender.end();

    if let Some(session) = call.take_session() {
        session.shutdown(WS_CLOSE_SETTLE).await;
    }

    if let Some(external) = &external {
        if let Err(e) = core.ari.hangup(external).await {
            log::debug!("call {call_id}: hangup of external leg {external} failed: {e:#}");
        }
    }

    if let Err(e) = core.ari.destroy_bridge(&call.bridge_id).await {
        log::debug!(
            "call {call_id}: destroying bridge {} failed: {e:#}",
            call.bridge_id
        );
    }

    // A redirected SIP leg lives on in the dialplan
    if !call.is_redirecting() {
        if let Err(e) = core.ari.hangup(call_id).await {
            log::debug!("call {call_id}: hangup failed: {e:#}");
        }
    }

    call.receiver.close().await;
    call.sender.close().await;
    core.release_port_once(&call);

    if let Some(external) = &external {
        core.unmap_external(external);
    }

    if core.settings.email_enabled && !call.is_redirecting() {
        let core = core.clone();
        let call = call.clone();
        let reason = reason.to_string();

        tokio::spawn(async move {
            let mail = TranscriptMail {
                call_id: &call.id,
                caller_identity: &call.caller_identity,
                file_path: call.transcript.path(),
                reason: &reason,
            };

            if let Err(e) = core.mailer.send_transcript(mail).await {
                log::warn!("call {}: transcript mail failed: {e:#}", call.id);
            }
        });
    }

    core.remove_call(call_id);
    core.mark_cleaned(call_id);
    core.drop_cleanup_lock(call_id);

    log::info!(
        "call {call_id}: cleaned up, relayed {} bytes of assistant audio",
        call.total_delta_bytes.load(Ordering::Relaxed)
    );
}

/// SIGINT/SIGTERM: clean all live calls in parallel within the grace window
async fn shutdown_all(core: &Arc<Core>) {
    let calls = core.live_calls();

    if calls.is_empty() {
        return;
    }

    log::info!("shutting down, cleaning up {} active call(s)", calls.len());

    let cleanups = calls.into_iter().map(|call| {
        let core = core.clone();
        async move { cleanup(&core, &call.id, CleanupReason::Shutdown).await }
    });

    let grace = Duration::from_millis(core.settings.shutdown_timeout_ms);

    if tokio::time::timeout(grace, futures::future::join_all(cleanups))
        .await
        .is_err()
    {
        log::warn!(
            "shutdown grace of {}ms expired, forcing exit",
            grace.as_millis()
        );
    }
}
