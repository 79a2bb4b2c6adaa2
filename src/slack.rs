//! Slack Socket Mode listener: opens the websocket, acks envelopes, and hands
//! message events to the persistence handler.

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{info, warn};

use crate::handler::MessageHandler;
use crate::schema::MessageEvent;

const SLACK_API_BASE: &str = "https://slack.com/api";

/// Verify the bot token against `auth.test` and return the bot's user id.
/// Called once at startup so a bad bot credential fails fast instead of
/// surfacing later through Web API calls.
pub async fn authenticate_bot(bot_token: &str) -> Result<String> {
    auth_test(&reqwest::Client::new(), SLACK_API_BASE, bot_token).await
}

async fn auth_test(http: &reqwest::Client, api_base: &str, bot_token: &str) -> Result<String> {
    let response: Value = http
        .get(format!("{api_base}/auth.test"))
        .bearer_auth(bot_token)
        .send()
        .await
        .context("auth.test request failed")?
        .json()
        .await
        .context("auth.test returned invalid JSON")?;

    if response.get("ok") != Some(&Value::Bool(true)) {
        let err = response
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown");
        bail!("auth.test failed: {err}");
    }

    response
        .get("user_id")
        .and_then(|u| u.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("auth.test returned no user_id"))
}

#[derive(Debug, Deserialize)]
struct SocketModeEnvelope {
    envelope_id: String,
    #[serde(rename = "type")]
    envelope_type: String,
    #[serde(default)]
    payload: Value,
}

/// One inbound websocket text frame, pre-classified. Slack interleaves
/// control messages (`hello`, `disconnect`) with envelope deliveries.
#[derive(Debug)]
enum Frame {
    Hello,
    Disconnect { reason: String },
    Envelope(SocketModeEnvelope),
}

enum SessionEnd {
    /// Server asked for a link refresh; caller opens a fresh connection.
    RefreshRequested,
    /// Stream closed or ended without a refresh request.
    Closed,
}

/// Long-lived Socket Mode connection driver. Opens the connection with the
/// app-level token and blocks the calling task for its lifetime; connection
/// and auth failures are fatal and returned to the host.
pub struct SocketModeListener {
    http: reqwest::Client,
    app_token: String,
}

impl SocketModeListener {
    pub fn new(app_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            app_token,
        }
    }

    /// Subscribe to message events and dispatch each one to `handler`. Only
    /// returns on a fatal transport error; the server-requested `disconnect`
    /// link refresh is handled internally, the way the vendor SDK would.
    pub async fn run(&self, handler: &MessageHandler) -> Result<()> {
        loop {
            let socket_url = self.open_socket_connection().await?;
            info!("Connecting to Slack via Socket Mode...");
            match self.run_session(&socket_url, handler).await? {
                SessionEnd::RefreshRequested => continue,
                SessionEnd::Closed => bail!("Socket Mode stream ended"),
            }
        }
    }

    /// Call `apps.connections.open` with the app-level token to obtain the
    /// websocket URL. A rejection here is an auth failure and fatal.
    async fn open_socket_connection(&self) -> Result<String> {
        let response: Value = self
            .http
            .post(format!("{SLACK_API_BASE}/apps.connections.open"))
            .bearer_auth(&self.app_token)
            .send()
            .await
            .context("apps.connections.open request failed")?
            .json()
            .await
            .context("apps.connections.open returned invalid JSON")?;

        if response.get("ok") != Some(&Value::Bool(true)) {
            let err = response
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown");
            bail!("apps.connections.open failed: {err}");
        }

        response
            .get("url")
            .and_then(|u| u.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("apps.connections.open returned no URL"))
    }

    async fn run_session(&self, socket_url: &str, handler: &MessageHandler) -> Result<SessionEnd> {
        let (stream, _response) = connect_async(socket_url)
            .await
            .context("failed to connect Socket Mode websocket")?;
        let (mut sink, mut source) = stream.split();
        info!("Socket Mode connected");

        while let Some(message) = source.next().await {
            let message = message.context("failed reading Socket Mode websocket message")?;
            match message {
                WsMessage::Text(text) => {
                    let frame = match parse_frame(&text) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(error = %err, "Skipping unparseable Socket Mode frame");
                            continue;
                        }
                    };
                    match frame {
                        Frame::Hello => {
                            info!("Socket Mode hello received");
                        }
                        Frame::Disconnect { reason } => {
                            info!(reason = %reason, "Socket Mode disconnect requested, refreshing connection");
                            return Ok(SessionEnd::RefreshRequested);
                        }
                        Frame::Envelope(envelope) => {
                            // Slack requires the ack within three seconds; send
                            // it before any processing.
                            sink.send(WsMessage::Text(ack_payload(&envelope.envelope_id)))
                                .await
                                .context("failed to send Socket Mode ack")?;
                            if envelope.envelope_type != "events_api" {
                                continue;
                            }
                            if let Some(event) = extract_message_event(&envelope.payload) {
                                // The handler logs its own failures and never
                                // propagates them past this boundary.
                                handler.handle_event(&event).await;
                            }
                        }
                    }
                }
                WsMessage::Ping(data) => {
                    let _ = sink.send(WsMessage::Pong(data)).await;
                }
                WsMessage::Close(_) => return Ok(SessionEnd::Closed),
                _ => {}
            }
        }

        Ok(SessionEnd::Closed)
    }
}

fn parse_frame(text: &str) -> Result<Frame> {
    let raw: Value = serde_json::from_str(text).context("frame is not valid JSON")?;
    match raw.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "hello" => Ok(Frame::Hello),
        "disconnect" => {
            let reason = raw
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or("unknown")
                .to_string();
            Ok(Frame::Disconnect { reason })
        }
        _ => {
            let envelope = serde_json::from_value::<SocketModeEnvelope>(raw)
                .context("failed to parse Socket Mode envelope")?;
            Ok(Frame::Envelope(envelope))
        }
    }
}

fn ack_payload(envelope_id: &str) -> String {
    json!({ "envelope_id": envelope_id }).to_string()
}

/// Pull a `MessageEvent` out of an `events_api` payload. Only events of type
/// `message` with a channel and timestamp are forwarded; the relevance
/// predicate itself (subtype, user, text) lives in the handler.
fn extract_message_event(payload: &Value) -> Option<MessageEvent> {
    if payload.get("type").and_then(|t| t.as_str()) != Some("event_callback") {
        return None;
    }
    let event = payload.get("event")?;
    if event.get("type").and_then(|t| t.as_str()) != Some("message") {
        return None;
    }
    let parsed: MessageEvent = serde_json::from_value(event.clone()).ok()?;
    if parsed.channel.is_none() || parsed.ts.is_none() {
        return None;
    }
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn callback(event: Value) -> Value {
        json!({
            "type": "event_callback",
            "event_id": "Ev01",
            "event": event,
        })
    }

    #[test]
    fn hello_and_disconnect_frames_are_classified() {
        assert!(matches!(
            parse_frame(r#"{"type":"hello","num_connections":1}"#).unwrap(),
            Frame::Hello
        ));
        match parse_frame(r#"{"type":"disconnect","reason":"link_disabled"}"#).unwrap() {
            Frame::Disconnect { reason } => assert_eq!(reason, "link_disabled"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn events_api_frame_parses_as_envelope() {
        let text = json!({
            "envelope_id": "env-1",
            "type": "events_api",
            "payload": callback(json!({"type": "message", "channel": "C1", "ts": "T1"})),
        })
        .to_string();
        match parse_frame(&text).unwrap() {
            Frame::Envelope(envelope) => {
                assert_eq!(envelope.envelope_id, "env-1");
                assert_eq!(envelope.envelope_type, "events_api");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn garbage_frame_is_an_error() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"type":"events_api"}"#).is_err());
    }

    #[test]
    fn ack_carries_the_envelope_id() {
        let ack: Value = serde_json::from_str(&ack_payload("env-9")).unwrap();
        assert_eq!(ack, json!({"envelope_id": "env-9"}));
    }

    #[test]
    fn message_event_fields_are_extracted() {
        let payload = callback(json!({
            "type": "message",
            "user": "U1",
            "text": "hello",
            "channel": "C1",
            "ts": "1700000000.000100",
        }));
        let event = extract_message_event(&payload).unwrap();
        assert_eq!(event.user.as_deref(), Some("U1"));
        assert_eq!(event.text.as_deref(), Some("hello"));
        assert_eq!(event.channel.as_deref(), Some("C1"));
        assert_eq!(event.ts.as_deref(), Some("1700000000.000100"));
        assert!(event.subtype.is_none());
    }

    #[test]
    fn subtype_is_retained_for_the_handler_to_filter() {
        let payload = callback(json!({
            "type": "message",
            "subtype": "message_changed",
            "channel": "C1",
            "ts": "T1",
        }));
        let event = extract_message_event(&payload).unwrap();
        assert_eq!(event.subtype.as_deref(), Some("message_changed"));
    }

    #[test]
    fn non_message_events_are_skipped() {
        let payload = callback(json!({"type": "reaction_added", "channel": "C1", "ts": "T1"}));
        assert!(extract_message_event(&payload).is_none());
        assert!(extract_message_event(&json!({"type": "url_verification"})).is_none());
    }

    #[tokio::test]
    async fn auth_test_returns_the_bot_user_id() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/auth.test")
                .header("authorization", "Bearer xoxb-test");
            then.status(200)
                .json_body(json!({"ok": true, "user_id": "B0BOT", "team": "T1"}));
        });

        let user_id = auth_test(&reqwest::Client::new(), &server.base_url(), "xoxb-test")
            .await
            .unwrap();
        assert_eq!(user_id, "B0BOT");
        mock.assert();
    }

    #[tokio::test]
    async fn auth_test_rejection_is_fatal_with_the_slack_error() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/auth.test");
            then.status(200)
                .json_body(json!({"ok": false, "error": "invalid_auth"}));
        });

        let err = auth_test(&reqwest::Client::new(), &server.base_url(), "xoxb-bad")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid_auth"));
    }

    #[test]
    fn events_without_channel_or_ts_are_skipped() {
        let no_ts = callback(json!({"type": "message", "channel": "C1"}));
        assert!(extract_message_event(&no_ts).is_none());
        let no_channel = callback(json!({"type": "message", "ts": "T1"}));
        assert!(extract_message_event(&no_channel).is_none());
    }
}
