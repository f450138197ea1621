// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use anyhow::Result;
use chrono::{Datelike, Local, SecondsFormat};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy)]
pub enum Speaker {
    User,
    Assistant,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "USER"),
            Speaker::Assistant => write!(f, "ASSISTANT"),
        }
    }
}

/// Append-only transcript file of a single call
///
/// Lives under `<recordings_dir>/YYYY/MM/DD/` partitioned by local date.
/// Write failures are logged and never fail the call.
pub struct TranscriptWriter {
    path: PathBuf,
}

impl TranscriptWriter {
    pub fn new(recordings_dir: &str, caller_identity: &str, call_id: &str) -> Self {
        let today = Local::now();

        let path = Path::new(recordings_dir)
            .join(format!("{:04}", today.year()))
            .join(format!("{:02}", today.month()))
            .join(format!("{:02}", today.day()))
            .join(format!(
                "conversation-{}-{}.txt",
                sanitize_caller(caller_identity),
                call_id
            ));

        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line; empty or whitespace-only text is skipped
    pub async fn append(&self, speaker: Speaker, text: &str) {
        let text = text.trim();

        if text.is_empty() {
            return;
        }

        if let Err(e) = self.try_append(speaker, text).await {
            log::warn!(
                "failed to append to transcript {}: {e:#}",
                self.path.display()
            );
        }
    }

    async fn try_append(&self, speaker: Speaker, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let line = format!(
            "{} {speaker}: {text}\n",
            Local::now().to_rfc3339_opts(SecondsFormat::Millis, false)
        );

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;

        Ok(())
    }
}

/// Reduce a caller identity to `[0-9+]` for filename use
pub fn sanitize_caller(identity: &str) -> String {
    let kept: String = identity
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();

    if kept.is_empty() {
        "unknown".into()
    } else {
        kept
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitizes_caller_identities() {
        assert_eq!(sanitize_caller("+49 (123) 45-678"), "+4912345678");
        assert_eq!(sanitize_caller("Alice"), "unknown");
        assert_eq!(sanitize_caller(""), "unknown");
        assert_eq!(sanitize_caller("sip:200@pbx"), "200");
    }

    #[tokio::test]
    async fn appends_lines_and_skips_empty_text() {
        let dir = tempfile::tempdir().unwrap();

        let writer = TranscriptWriter::new(dir.path().to_str().unwrap(), "+491234", "call-1");

        writer.append(Speaker::User, "  ").await;
        writer.append(Speaker::User, "hello").await;
        writer.append(Speaker::Assistant, "hi there\n").await;

        let content = tokio::fs::read_to_string(writer.path()).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" USER: hello"));
        assert!(lines[1].contains(" ASSISTANT: hi there"));

        let name = writer.path().file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "conversation-+491234-call-1.txt");
    }
}
