// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Per-call client for the OpenAI realtime audio endpoint
//!
//! Sends the session configuration and the initial prompt, then routes
//! audio deltas into the RTP sender and transcripts into the transcript
//! file, watching assistant transcripts for the configured trigger phrases.

use crate::media::{BYTES_PER_MS, ULAW_SILENCE};
use crate::registry::{Call, Core};
use crate::settings::{normalize_phrase, Settings, TurnDetection};
use crate::transcript::Speaker;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tt::tungstenite::client::IntoClientRequest;
use tt::tungstenite::http::header::AUTHORIZATION;
use tt::tungstenite::http::HeaderValue;
use tt::tungstenite::Message;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Requests from the session into the orchestrator
///
/// Carries the call id so the receiving side can reject events that do not
/// belong to the call it guards.
#[derive(Debug)]
pub enum TriggerEvent {
    Redirect { call_id: String, phrase: String },
    Terminate { call_id: String, phrase: String },
}

enum SessionCommand {
    Close,
}

/// Handle to a running realtime session task
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    closed: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Ask the session to close its WebSocket, wait up to `settle` for the
    /// goodbye to go out, then stop the task
    pub async fn shutdown(&self, settle: Duration) {
        let _ = self.commands.send(SessionCommand::Close);

        let mut closed = self.closed.clone();
        let _ = tokio::time::timeout(settle, async {
            while !*closed.borrow() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Everything the session task needs, snapshotted from the settings
pub struct SessionConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub initial_message: String,
    pub transcription_model: String,
    pub transcription_language: String,
    pub turn_detection: TurnDetection,
    pub silence_padding_ms: u64,
    pub redirect_phrases: Vec<String>,
    pub terminate_phrases: Vec<String>,
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            url: settings.realtime_url.clone(),
            api_key: settings.openai_api_key.clone(),
            model: settings.realtime_model.clone(),
            voice: settings.openai_voice.clone(),
            instructions: settings.system_prompt.clone(),
            initial_message: settings.initial_message.clone(),
            transcription_model: settings.transcription_model.clone(),
            transcription_language: settings.transcription_language.clone(),
            turn_detection: settings.turn_detection(),
            silence_padding_ms: settings.silence_padding_ms,
            redirect_phrases: settings.redirection_phrase_list(),
            terminate_phrases: settings.terminate_phrase_list(),
        }
    }
}

/// Start the realtime session task for a call
pub fn spawn(
    core: Arc<Core>,
    call: Arc<Call>,
    caller_audio: mpsc::UnboundedReceiver<Bytes>,
    triggers: mpsc::UnboundedSender<TriggerEvent>,
) -> SessionHandle {
    let config = SessionConfig::from_settings(&core.settings);

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);

    let task = tokio::spawn(run(
        core,
        call,
        config,
        caller_audio,
        triggers,
        commands_rx,
        closed_tx,
    ));

    SessionHandle {
        commands: commands_tx,
        closed: closed_rx,
        task: Mutex::new(Some(task)),
    }
}

async fn run(
    core: Arc<Core>,
    call: Arc<Call>,
    config: SessionConfig,
    mut caller_audio: mpsc::UnboundedReceiver<Bytes>,
    triggers: mpsc::UnboundedSender<TriggerEvent>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    closed_tx: watch::Sender<bool>,
) {
    let mut attempt = 0;

    loop {
        match run_session(
            &call,
            &config,
            &mut caller_audio,
            &triggers,
            &mut commands,
        )
        .await
        {
            Ok(()) => break,
            Err(e) => {
                attempt += 1;
                log::warn!(
                    "call {}: realtime session failed (attempt {attempt}/{MAX_RETRIES}): {e:#}",
                    call.id
                );

                if attempt >= MAX_RETRIES {
                    log::error!("call {}: giving up on the realtime endpoint", call.id);
                    break;
                }

                tokio::time::sleep(RETRY_DELAY).await;

                // Never reconnect for a call that has been cleaned up
                if !core.is_registered(&call.id) {
                    log::info!(
                        "call {}: no longer registered, suppressing realtime reconnect",
                        call.id
                    );
                    break;
                }
            }
        }
    }

    call.ws_closed.store(true, Ordering::Release);
    let _ = closed_tx.send(true);
}

/// Drive one WebSocket connection until it is deliberately closed
///
/// `Ok(())` means the session ended on purpose (close command, server close
/// or a fatal error event); transport failures come back as `Err` and are
/// retried by the caller.
async fn run_session(
    call: &Arc<Call>,
    config: &SessionConfig,
    caller_audio: &mut mpsc::UnboundedReceiver<Bytes>,
    triggers: &mpsc::UnboundedSender<TriggerEvent>,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> Result<()> {
    let uri = format!("{}?model={}", config.url, config.model);

    let mut request = uri.into_client_request()?;
    request.headers_mut().insert(
        AUTHORIZATION,
        format!("Bearer {}", config.api_key).try_into()?,
    );
    request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    let (mut websocket, _) = tt::connect_async(request)
        .await
        .context("failed to connect to the realtime endpoint")?;

    log::debug!("call {}: realtime session connected", call.id);

    let session_update = serde_json::json!({
        "type": "session.update",
        "session": {
            "modalities": ["audio", "text"],
            "voice": config.voice,
            "instructions": config.instructions,
            "input_audio_format": "g711_ulaw",
            "output_audio_format": "g711_ulaw",
            "input_audio_transcription": {
                "model": config.transcription_model,
                "language": config.transcription_language,
            },
            "turn_detection": turn_detection_json(&config.turn_detection),
        },
    });
    websocket
        .send(Message::Text(session_update.to_string()))
        .await?;

    // Open the conversation so the assistant greets the caller
    let initial_item = serde_json::json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "user",
            "content": [{ "type": "input_text", "text": config.initial_message }],
        },
    });
    websocket.send(Message::Text(initial_item.to_string())).await?;
    websocket
        .send(Message::Text(
            serde_json::json!({ "type": "response.create" }).to_string(),
        ))
        .await?;

    // True between the start of a response and its first usable delta
    let mut awaiting_first_delta = true;
    let mut audio_open = true;

    loop {
        tokio::select! {
            message = websocket.next() => {
                match message {
                    Some(Ok(Message::Ping(data))) => {
                        websocket.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("call {}: realtime endpoint closed the session", call.id);
                        return Ok(());
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if handle_event(call, config, triggers, event, &mut awaiting_first_delta).await {
                                    let _ = websocket.close(None).await;
                                    return Ok(());
                                }
                            }
                            Err(e) => log::warn!("call {}: unparseable realtime event: {e}", call.id),
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
            chunk = caller_audio.recv(), if audio_open => {
                match chunk {
                    Some(chunk) => {
                        let append = serde_json::json!({
                            "type": "input_audio_buffer.append",
                            "audio": BASE64.encode(&chunk),
                        });
                        websocket.send(Message::Text(append.to_string())).await?;
                    }
                    None => audio_open = false,
                }
            }
            command = commands.recv() => {
                match command {
                    Some(SessionCommand::Close) | None => {
                        let _ = websocket.close(None).await;
                        log::debug!("call {}: realtime session closed", call.id);
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// React to one server event; returns true when the session must close
async fn handle_event(
    call: &Arc<Call>,
    config: &SessionConfig,
    triggers: &mpsc::UnboundedSender<TriggerEvent>,
    event: ServerEvent,
    awaiting_first_delta: &mut bool,
) -> bool {
    match event {
        ServerEvent::SessionCreated | ServerEvent::SessionUpdated => {
            log::debug!("call {}: realtime session configured", call.id);
        }
        ServerEvent::ResponseCreated => {
            *awaiting_first_delta = true;
        }
        ServerEvent::ConversationItemCreated { item } => {
            // A user item mid-response is the caller barging in
            if item.role.as_deref() == Some("user") {
                call.sender.stop_playback();
            }
        }
        ServerEvent::ResponseAudioDelta { delta } => {
            let audio = match BASE64.decode(delta) {
                Ok(audio) => audio,
                Err(e) => {
                    log::warn!("call {}: undecodable audio delta: {e}", call.id);
                    return false;
                }
            };

            if is_silence(&audio) {
                return false;
            }

            call.total_delta_bytes
                .fetch_add(audio.len() as u64, Ordering::Relaxed);

            if *awaiting_first_delta {
                *awaiting_first_delta = false;

                // Mask the clipped start after a barge-in flush
                let padding =
                    vec![ULAW_SILENCE; config.silence_padding_ms as usize * BYTES_PER_MS];
                call.sender.push(&padding);
            }

            call.sender.push(&audio);
        }
        ServerEvent::ResponseAudioDone => {
            *awaiting_first_delta = true;

            // The armed flag implies the transcript of this response already
            // matched a farewell phrase, and that match started the
            // drain-and-cleanup waiter. Triggering it again here would
            // double-finalize.
            if call.is_terminate_armed() {
                log::debug!(
                    "call {}: response finished with terminate armed, awaiting drain",
                    call.id
                );
            }
        }
        ServerEvent::ResponseAudioTranscriptDone { transcript } => {
            call.transcript.append(Speaker::Assistant, &transcript).await;

            let normalized = normalize_phrase(&transcript);

            if let Some(phrase) = match_phrase(&normalized, &config.redirect_phrases) {
                log::info!("call {}: assistant offered handoff ({phrase:?})", call.id);
                let _ = triggers.send(TriggerEvent::Redirect {
                    call_id: call.id.clone(),
                    phrase: phrase.to_string(),
                });
            }

            if let Some(phrase) = match_phrase(&normalized, &config.terminate_phrases) {
                log::info!("call {}: assistant said farewell ({phrase:?})", call.id);
                let _ = triggers.send(TriggerEvent::Terminate {
                    call_id: call.id.clone(),
                    phrase: phrase.to_string(),
                });
            }
        }
        ServerEvent::InputAudioTranscriptionCompleted { transcript } => {
            call.transcript.append(Speaker::User, &transcript).await;
        }
        ServerEvent::Error { error } => {
            log::error!("call {}: realtime endpoint error: {error}", call.id);
            return true;
        }
        ServerEvent::Unknown => {}
    }

    false
}

/// Empty deltas and all-0x7f deltas are digital silence and are skipped
fn is_silence(audio: &[u8]) -> bool {
    audio.iter().all(|&b| b == ULAW_SILENCE)
}

/// Substring match over a normalized transcript
fn match_phrase<'a>(normalized: &str, phrases: &'a [String]) -> Option<&'a str> {
    phrases
        .iter()
        .find(|phrase| !phrase.is_empty() && normalized.contains(phrase.as_str()))
        .map(String::as_str)
}

fn turn_detection_json(turn_detection: &TurnDetection) -> serde_json::Value {
    match turn_detection {
        TurnDetection::ServerVad {
            threshold,
            prefix_padding_ms,
            silence_duration_ms,
        } => serde_json::json!({
            "type": "server_vad",
            "threshold": threshold,
            "prefix_padding_ms": prefix_padding_ms,
            "silence_duration_ms": silence_duration_ms,
        }),
        TurnDetection::SemanticVad => serde_json::json!({ "type": "semantic_vad" }),
    }
}

/// Subset of the realtime server events the bridge reacts to
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "response.created")]
    ResponseCreated,
    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated { item: ConversationItem },
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone,
    #[serde(rename = "response.audio_transcript.done")]
    ResponseAudioTranscriptDone { transcript: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputAudioTranscriptionCompleted { transcript: String },
    #[serde(rename = "error")]
    Error { error: serde_json::Value },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ConversationItem {
    #[serde(default)]
    role: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn silence_detection() {
        assert!(is_silence(&[]));
        assert!(is_silence(&[0x7f, 0x7f, 0x7f]));
        assert!(!is_silence(&[0x7f, 0x00, 0x7f]));
    }

    #[test]
    fn phrase_matching_is_substring_based() {
        let phrases = vec!["goodbye".to_string(), "connecting you to".to_string()];

        let normalized = normalize_phrase("Thanks for calling, GOODBYE!");
        assert_eq!(match_phrase(&normalized, &phrases), Some("goodbye"));

        let normalized = normalize_phrase("Okay, Connecting you to the technical department");
        assert_eq!(match_phrase(&normalized, &phrases), Some("connecting you to"));

        let normalized = normalize_phrase("How can I help?");
        assert_eq!(match_phrase(&normalized, &phrases), None);

        // Empty phrases never match
        assert_eq!(match_phrase("anything", &[String::new()]), None);
    }

    #[test]
    fn turn_detection_shapes() {
        let server_vad = turn_detection_json(&TurnDetection::ServerVad {
            threshold: 0.6,
            prefix_padding_ms: 200,
            silence_duration_ms: 600,
        });
        assert_eq!(
            server_vad,
            serde_json::json!({
                "type": "server_vad",
                "threshold": 0.6,
                "prefix_padding_ms": 200,
                "silence_duration_ms": 600,
            })
        );

        let semantic = turn_detection_json(&TurnDetection::SemanticVad);
        assert_eq!(semantic, serde_json::json!({ "type": "semantic_vad" }));
    }

    #[test]
    fn parses_server_events() {
        let raw = r#"{"type": "response.audio.delta", "response_id": "r1", "delta": "f39/"}"#;
        let event = serde_json::from_str::<ServerEvent>(raw).unwrap();
        assert!(matches!(event, ServerEvent::ResponseAudioDelta { delta } if delta == "f39/"));

        let raw = r#"{"type": "conversation.item.created", "item": {"id": "i1", "role": "user"}}"#;
        let event = serde_json::from_str::<ServerEvent>(raw).unwrap();
        let ServerEvent::ConversationItemCreated { item } = event else {
            panic!("expected item event");
        };
        assert_eq!(item.role.as_deref(), Some("user"));

        let raw = r#"{"type": "rate_limits.updated", "rate_limits": []}"#;
        assert!(matches!(
            serde_json::from_str::<ServerEvent>(raw).unwrap(),
            ServerEvent::Unknown
        ));
    }
}
