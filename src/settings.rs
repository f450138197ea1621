// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use unicode_normalization::UnicodeNormalization;

/// Complete configuration bundle of the bridge
///
/// Every key is recognized as a flat environment variable of the same name
/// (upper-cased), e.g. `ARI_URL`, `OPENAI_API_KEY`, `CLEANUP_GRACE_MS`. A
/// `config.toml` may provide the same keys; the environment wins.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // PBX control interface
    #[serde(default = "default_ari_url")]
    pub ari_url: String,
    #[serde(default = "default_ari_username")]
    pub ari_username: String,
    #[serde(default = "default_ari_password")]
    pub ari_password: String,
    #[serde(default = "default_ari_app")]
    pub ari_app: String,

    // Realtime endpoint
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,
    #[serde(default = "default_realtime_model")]
    pub realtime_model: String,
    #[serde(default = "default_voice")]
    pub openai_voice: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_initial_message")]
    pub initial_message: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default = "default_transcription_language")]
    pub transcription_language: String,

    #[serde(default = "default_vad_type")]
    pub vad_type: String,
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f64,
    #[serde(default = "default_vad_prefix_padding_ms")]
    pub vad_prefix_padding_ms: u32,
    #[serde(default = "default_vad_silence_duration_ms")]
    pub vad_silence_duration_ms: u32,

    // RTP
    #[serde(default = "default_rtp_port_start")]
    pub rtp_port_start: u16,
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: u16,
    #[serde(default = "default_silence_padding_ms")]
    pub silence_padding_ms: u64,

    // Lifecycle timeouts; a duration limit of 0 disables the cap
    #[serde(default)]
    pub call_duration_limit_seconds: u64,
    #[serde(default = "default_cleanup_grace_ms")]
    pub cleanup_grace_ms: u64,
    #[serde(default = "default_terminate_fallback_ms")]
    pub terminate_fallback_ms: u64,
    #[serde(default = "default_termination_watchdog_ms")]
    pub termination_watchdog_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    // Queue handoff
    pub redirection_queue: Option<String>,
    pub redirection_queue_context: Option<String>,
    #[serde(default)]
    pub redirection_phrases: String,
    #[serde(default)]
    pub agent_terminate_phrases: String,

    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: String,

    // Transcript mail
    #[serde(default)]
    pub email_enabled: bool,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_secure: bool,
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    #[serde(default = "default_email_from")]
    pub email_from: String,
    /// Comma separated list of recipients
    #[serde(default)]
    pub email_to: String,
    #[serde(default = "default_email_subject_template")]
    pub email_subject_template: String,
    #[serde(default = "default_email_body_template")]
    pub email_body_template: String,

    /// 0 disables the health endpoint
    #[serde(default)]
    pub health_port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Settings {
    pub fn load(file_name: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::new(file_name, FileFormat::Toml).required(false))
            .add_source(Environment::default())
            .build()?
            .try_deserialize()
    }

    pub fn turn_detection(&self) -> TurnDetection {
        match self.vad_type.as_str() {
            "semantic_vad" => TurnDetection::SemanticVad,
            other => {
                if other != "server_vad" {
                    log::warn!("unknown VAD_TYPE {other:?}, falling back to server_vad");
                }

                let threshold = if self.vad_threshold.is_finite() {
                    self.vad_threshold
                } else {
                    default_vad_threshold()
                };

                TurnDetection::ServerVad {
                    threshold,
                    prefix_padding_ms: self.vad_prefix_padding_ms,
                    silence_duration_ms: self.vad_silence_duration_ms,
                }
            }
        }
    }

    pub fn redirection_phrase_list(&self) -> Vec<String> {
        parse_phrase_list(&self.redirection_phrases)
    }

    pub fn terminate_phrase_list(&self) -> Vec<String> {
        parse_phrase_list(&self.agent_terminate_phrases)
    }
}

/// Turn detection mode sent to the realtime endpoint, normalized
/// to the two shapes the endpoint accepts
#[derive(Debug, Clone, PartialEq)]
pub enum TurnDetection {
    ServerVad {
        threshold: f64,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
    SemanticVad,
}

/// NFKC-fold and lower-case a phrase or transcript for matching
pub fn normalize_phrase(s: &str) -> String {
    s.nfkc().collect::<String>().to_lowercase()
}

/// Parse a phrase list of single-quoted, comma-separated entries
///
/// `'thanks, goodbye','bye now'` yields two normalized entries. Input
/// without any quotes falls back to a plain comma split.
pub fn parse_phrase_list(raw: &str) -> Vec<String> {
    let mut entries = Vec::new();

    let mut rest = raw;
    while let Some(start) = rest.find('\'') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('\'') else {
            break;
        };

        let entry = after[..end].trim();
        if !entry.is_empty() {
            entries.push(normalize_phrase(entry));
        }

        rest = &after[end + 1..];
    }

    if entries.is_empty() && !raw.contains('\'') {
        entries = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(normalize_phrase)
            .collect();
    }

    entries
}

fn default_ari_url() -> String {
    "http://127.0.0.1:8088".into()
}

fn default_ari_username() -> String {
    "asterisk".into()
}

fn default_ari_password() -> String {
    "asterisk".into()
}

fn default_ari_app() -> String {
    "openai-bridge".into()
}

fn default_realtime_url() -> String {
    "wss://api.openai.com/v1/realtime".into()
}

fn default_realtime_model() -> String {
    "gpt-4o-realtime-preview".into()
}

fn default_voice() -> String {
    "alloy".into()
}

fn default_system_prompt() -> String {
    "You are a friendly phone assistant. Keep your answers short.".into()
}

fn default_initial_message() -> String {
    "Hi".into()
}

fn default_transcription_model() -> String {
    "whisper-1".into()
}

fn default_transcription_language() -> String {
    "en".into()
}

fn default_vad_type() -> String {
    "server_vad".into()
}

fn default_vad_threshold() -> f64 {
    0.6
}

fn default_vad_prefix_padding_ms() -> u32 {
    200
}

fn default_vad_silence_duration_ms() -> u32 {
    600
}

fn default_rtp_port_start() -> u16 {
    12000
}

fn default_max_concurrent_calls() -> u16 {
    10
}

fn default_silence_padding_ms() -> u64 {
    100
}

fn default_cleanup_grace_ms() -> u64 {
    1500
}

fn default_terminate_fallback_ms() -> u64 {
    8000
}

fn default_termination_watchdog_ms() -> u64 {
    8000
}

fn default_shutdown_timeout_ms() -> u64 {
    8000
}

fn default_recordings_dir() -> String {
    "/var/spool/asterisk/monitor".into()
}

fn default_smtp_host() -> String {
    "localhost".into()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_email_from() -> String {
    "bridge@localhost".into()
}

fn default_email_subject_template() -> String {
    "Call transcript from {{callerId}}".into()
}

fn default_email_body_template() -> String {
    "Call {{channelId}} from {{callerId}} ended ({{reason}}).\n\n".into()
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::env;

    #[test]
    fn settings_env_vars_overwrite_config() -> Result<(), ConfigError> {
        // Sanity check
        let settings = Settings::load("./extra/example.toml")?;

        assert_eq!(settings.ari_url, "http://127.0.0.1:8088");
        assert_eq!(settings.rtp_port_start, 12000);
        assert_eq!(settings.cleanup_grace_ms, 1500);
        assert_eq!(settings.redirection_queue.as_deref(), Some("600"));

        // Environment variables overwrite the config file
        env::set_var("ARI_URL", "http://10.0.0.1:8088");
        env::set_var("RTP_PORT_START", "14000");

        let settings = Settings::load("./extra/example.toml")?;

        assert_eq!(settings.ari_url, "http://10.0.0.1:8088");
        assert_eq!(settings.rtp_port_start, 14000);

        env::remove_var("ARI_URL");
        env::remove_var("RTP_PORT_START");

        Ok(())
    }

    #[test]
    fn missing_file_yields_defaults() -> Result<(), ConfigError> {
        let settings = Settings::load("./does-not-exist.toml")?;

        assert_eq!(settings.max_concurrent_calls, 10);
        assert_eq!(settings.silence_padding_ms, 100);
        assert_eq!(settings.terminate_fallback_ms, 8000);
        assert!(!settings.email_enabled);
        assert!(settings.redirection_queue.is_none());

        Ok(())
    }

    #[test]
    fn phrase_list_parses_quoted_entries() {
        let entries = parse_phrase_list("'thanks, goodbye','Bye now', 'Auf Wiederhören'");

        assert_eq!(entries, vec!["thanks, goodbye", "bye now", "auf wiederhören"]);
    }

    #[test]
    fn phrase_list_falls_back_to_comma_split() {
        let entries = parse_phrase_list("goodbye, see you");

        assert_eq!(entries, vec!["goodbye", "see you"]);
    }

    #[test]
    fn phrase_list_normalizes_nfkc() {
        // ﬁ ligature folds to "fi" under NFKC
        let entries = parse_phrase_list("'ﬁnished'");

        assert_eq!(entries, vec!["finished"]);
    }

    #[test]
    fn turn_detection_normalizes() {
        let mut settings = Settings::load("./does-not-exist.toml").unwrap();

        settings.vad_threshold = f64::NAN;
        settings.vad_prefix_padding_ms = 250;
        settings.vad_silence_duration_ms = 700;

        assert_eq!(
            settings.turn_detection(),
            TurnDetection::ServerVad {
                threshold: 0.6,
                prefix_padding_ms: 250,
                silence_duration_ms: 700,
            }
        );

        settings.vad_type = "semantic_vad".into();
        assert_eq!(settings.turn_detection(), TurnDetection::SemanticVad);

        settings.vad_type = "aggressive".into();
        settings.vad_threshold = 0.4;
        assert_eq!(
            settings.turn_detection(),
            TurnDetection::ServerVad {
                threshold: 0.4,
                prefix_padding_ms: 250,
                silence_duration_ms: 700,
            }
        );
    }
}
