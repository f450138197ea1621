// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Minimal implementation of the Asterisk REST Interface (ARI)
//!
//! Covers only the bridge/channel operations and the event stream the
//! bridge consumes.

use crate::settings::Settings;
use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use tokio::net::TcpStream;
use tt::tungstenite::protocol::frame::coding::CloseCode;
use tt::tungstenite::protocol::CloseFrame;
use tt::tungstenite::Message;
use tt::MaybeTlsStream;
use tt::WebSocketStream;

/// REST side of ARI, basic-auth'ed plain HTTP calls
pub struct AriClient {
    client: reqwest::Client,
    base: String,
    username: String,
    password: String,
    app: String,
}

impl AriClient {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: settings.ari_url.trim_end_matches('/').to_string(),
            username: settings.ari_username.clone(),
            password: settings.ari_password.clone(),
            app: settings.ari_app.clone(),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    fn url(&self, path: &str) -> String {
        format!("{}/ari{path}", self.base)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            bail!("ARI request failed with {status}: {body}");
        }
    }

    /// Answer an incoming channel
    pub async fn answer(&self, channel_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/channels/{channel_id}/answer")))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        self.check(response).await?;

        Ok(())
    }

    /// Hang up a channel; a 404 for an already-gone channel is an error the
    /// caller is expected to ignore
    pub async fn hangup(&self, channel_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/channels/{channel_id}")))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        self.check(response).await?;

        Ok(())
    }

    /// Create a mixing bridge with media proxying
    pub async fn create_bridge(&self) -> Result<Bridge> {
        let response = self
            .client
            .post(self.url("/bridges"))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("type", "mixing,proxy_media")])
            .send()
            .await?;

        let bridge = self.check(response).await?.json::<Bridge>().await?;

        Ok(bridge)
    }

    pub async fn destroy_bridge(&self, bridge_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/bridges/{bridge_id}")))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        self.check(response).await?;

        Ok(())
    }

    pub async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/bridges/{bridge_id}/addChannel")))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("channel", channel_id)])
            .send()
            .await?;

        self.check(response).await?;

        Ok(())
    }

    /// Originate an external media channel towards `external_host`
    ///
    /// The PBX connects a ulaw/RTP UDP client to our receiver and routes the
    /// channel back into this application.
    pub async fn external_media(&self, external_host: &str) -> Result<Channel> {
        let response = self
            .client
            .post(self.url("/channels/externalMedia"))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[
                ("app", self.app.as_str()),
                ("external_host", external_host),
                ("format", "ulaw"),
                ("transport", "udp"),
                ("encapsulation", "rtp"),
                ("connection_type", "client"),
                ("direction", "both"),
            ])
            .send()
            .await?;

        let channel = self.check(response).await?.json::<Channel>().await?;

        Ok(channel)
    }

    /// Continue a channel in the dialplan at the given context/extension
    pub async fn continue_in_dialplan(
        &self,
        channel_id: &str,
        context: &str,
        extension: &str,
        priority: i32,
    ) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/channels/{channel_id}/continue")))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[
                ("context", context),
                ("extension", extension),
                ("priority", &priority.to_string()),
            ])
            .send()
            .await?;

        self.check(response).await?;

        Ok(())
    }
}

/// Event stream side of ARI
pub struct AriEvents {
    websocket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl AriEvents {
    /// Connect to `/ari/events` for the configured application
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let ws_base = if let Some(rest) = settings.ari_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = settings.ari_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            bail!("ARI url {:?} is neither http nor https", settings.ari_url);
        };

        let uri = format!(
            "{}/ari/events?app={}&api_key={}:{}",
            ws_base.trim_end_matches('/'),
            settings.ari_app,
            settings.ari_username,
            settings.ari_password,
        );

        let (websocket, _) = tt::connect_async(uri)
            .await
            .context("failed to connect to the ARI event stream")?;

        Ok(Self { websocket })
    }

    /// Wait for the next event, answering pings along the way
    ///
    /// Returns `None` once the stream is closed.
    pub async fn receive(&mut self) -> Result<Option<AriEvent>> {
        loop {
            match self.websocket.next().await {
                Some(Ok(Message::Ping(data))) => {
                    self.websocket.send(Message::Pong(data)).await?
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<AriEvent>(&text) {
                        Ok(AriEvent::Unknown) => {
                            log::trace!("ignoring unhandled ARI event");
                        }
                        Ok(event) => return Ok(Some(event)),
                        Err(e) => {
                            log::warn!("failed to parse ARI event: {e}");
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.websocket
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed("shutdown"),
            }))
            .await?;

        Ok(())
    }
}

/// Subset of the ARI event stream the bridge reacts to
///
/// ARI delivers at-least-once; duplicates and events for unknown resources
/// are dropped by the orchestrator.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    StasisStart { channel: Channel },
    StasisEnd { channel: Channel },
    ChannelDestroyed { channel: Channel },
    BridgeDestroyed { bridge: Bridge },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bridge {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub caller: Option<CallerId>,
    #[serde(default)]
    pub connected: Option<CallerId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallerId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

impl Channel {
    /// True for `Local/` pseudo-channels which never carry a real caller
    pub fn is_local(&self) -> bool {
        self.name.starts_with("Local/")
    }

    /// True for the `UnicastRTP/` legs created by externalMedia
    pub fn is_external_media(&self) -> bool {
        self.name.starts_with("UnicastRTP")
    }

    /// Printable caller identity: number, then name, then the connected
    /// party's number and name, else empty
    pub fn caller_identity(&self) -> String {
        let fields = [
            self.caller.as_ref().map(|c| &c.number),
            self.caller.as_ref().map(|c| &c.name),
            self.connected.as_ref().map(|c| &c.number),
            self.connected.as_ref().map(|c| &c.name),
        ];

        fields
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_stasis_start() {
        let raw = r#"{
            "type": "StasisStart",
            "application": "openai-bridge",
            "args": [],
            "channel": {
                "id": "1722520800.42",
                "name": "PJSIP/100-00000012",
                "state": "Ring",
                "caller": { "name": "Alice", "number": "+4912345678" },
                "connected": { "name": "", "number": "" }
            }
        }"#;

        let event = serde_json::from_str::<AriEvent>(raw).unwrap();

        let AriEvent::StasisStart { channel } = event else {
            panic!("expected StasisStart");
        };

        assert_eq!(channel.id, "1722520800.42");
        assert!(!channel.is_local());
        assert!(!channel.is_external_media());
        assert_eq!(channel.caller_identity(), "+4912345678");
    }

    #[test]
    fn parses_bridge_destroyed_and_unknown() {
        let raw = r#"{"type": "BridgeDestroyed", "bridge": {"id": "b-1", "technology": "simple_bridge"}}"#;
        let event = serde_json::from_str::<AriEvent>(raw).unwrap();
        assert!(matches!(event, AriEvent::BridgeDestroyed { bridge } if bridge.id == "b-1"));

        let raw = r#"{"type": "ChannelVarset", "variable": "FOO", "value": "1"}"#;
        let event = serde_json::from_str::<AriEvent>(raw).unwrap();
        assert!(matches!(event, AriEvent::Unknown));
    }

    #[test]
    fn caller_identity_falls_back() {
        let mut channel = Channel {
            id: "c1".into(),
            name: "PJSIP/100-1".into(),
            caller: Some(CallerId {
                name: "Bob".into(),
                number: String::new(),
            }),
            connected: Some(CallerId {
                name: String::new(),
                number: "200".into(),
            }),
        };

        assert_eq!(channel.caller_identity(), "Bob");

        channel.caller = None;
        assert_eq!(channel.caller_identity(), "200");

        channel.connected = None;
        assert_eq!(channel.caller_identity(), "");
    }

    #[test]
    fn recognizes_channel_roles() {
        let external = Channel {
            id: "e1".into(),
            name: "UnicastRTP/127.0.0.1:12000-0x7f".into(),
            caller: None,
            connected: None,
        };
        assert!(external.is_external_media());

        let local = Channel {
            id: "l1".into(),
            name: "Local/600@from-internal-000000a1;2".into(),
            caller: None,
            connected: None,
        };
        assert!(local.is_local());
    }
}
