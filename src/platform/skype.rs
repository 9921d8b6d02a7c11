//! Bot Framework (Skype) adapter.
//!
//! Inbound activities arrive as `POST /api/messages` on a local listener;
//! replies go to the conversation's `serviceUrl` with a client-credentials
//! bearer token.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::attachment::Attachment;
use crate::bus::EventSink;
use crate::config::Settings;
use crate::error::BusError;
use crate::platform::{
    is_stale, strip_mention, Backoff, ChannelRef, InboundEvent, Outbound, Protocol, ReplyTarget,
    SenderProfile, Session,
};
use crate::token::{Token, TokenManager};

const NAME: &str = "skype";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingActivity {
    #[serde(rename = "type", default)]
    pub activity_type: String,
    #[serde(default)]
    pub text: String,
    pub timestamp: Option<String>,
    pub id: Option<String>,
    pub channel_id: Option<String>,
    pub service_url: Option<String>,
    #[serde(default)]
    pub from: ChannelAccount,
    #[serde(default)]
    pub conversation: Conversation,
}

impl IncomingActivity {
    fn sent_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.timestamp.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingAttachment {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_url: Option<String>,
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingActivity<'a> {
    text: &'a str,
    #[serde(rename = "type")]
    activity_type: &'static str,
    text_format: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<OutgoingAttachment>,
}

/// Split an `app_id:app_password` credential.
pub fn parse_credential(credential: &str) -> Result<(String, String), BusError> {
    match credential.split_once(':') {
        Some((app_id, secret)) if !app_id.is_empty() && !secret.is_empty() => {
            Ok((app_id.to_string(), secret.to_string()))
        }
        _ => Err(BusError::Config {
            protocol: NAME,
            reason: "expected app_id:app_password".to_string(),
        }),
    }
}

/// Listen address for the account with `ordinal`: the configured port plus
/// the ordinal, so several accounts can share one host.
fn listen_addr(settings: &Settings, ordinal: usize) -> Result<SocketAddr> {
    let raw = settings.get("skype.listen_addr");
    let mut addr: SocketAddr = raw
        .parse()
        .with_context(|| format!("Invalid skype.listen_addr '{}'", raw))?;
    let port = u16::try_from(ordinal)
        .ok()
        .and_then(|n| addr.port().checked_add(n))
        .ok_or_else(|| anyhow!("No free port for skype account #{} above {}", ordinal, addr))?;
    addr.set_port(port);
    Ok(addr)
}

/// Turn an activity into an event, or `None` when it is not a live message.
fn normalize(account: &Account, activity: IncomingActivity) -> Option<InboundEvent> {
    if activity.activity_type != "message" {
        debug!(account = %account.id, "Ignoring {} activity", activity.activity_type);
        return None;
    }
    debug!(
        account = %account.id,
        activity = activity.id.as_deref().unwrap_or("-"),
        channel_id = activity.channel_id.as_deref().unwrap_or("-"),
        "Incoming activity"
    );
    if activity.conversation.id.is_empty() {
        warn!(account = %account.id, "Activity without conversation id, dropping");
        return None;
    }
    if let Some(sent_at) = activity.sent_at() {
        if is_stale(sent_at, Utc::now()) {
            debug!(account = %account.id, "Skipping stale activity");
            return None;
        }
    }

    let mut event = InboundEvent::new(
        account,
        ChannelRef::Text(activity.conversation.id),
        SenderProfile {
            id: activity.from.id,
            display_name: activity.from.name,
        },
        strip_mention(&activity.text),
    );
    event.service_url = activity.service_url;
    Some(event)
}

pub struct SkypeProtocol {
    client: reqwest::Client,
    tokens: TokenManager,
}

impl SkypeProtocol {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            tokens: TokenManager::new(client.clone()),
            client,
        }
    }
}

#[async_trait]
impl Protocol for SkypeProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    fn configure(&self, settings: &mut Settings) {
        settings.declare(
            "skype.credentials",
            "",
            "Comma separated Bot Framework credentials, app_id:app_password (env SKYPE)",
        );
        settings.declare("skype.prefix", "!", "Command prefix for Skype accounts");
        settings.declare(
            "skype.listen_addr",
            "0.0.0.0:3978",
            "Listen on this address for incoming Skype messages",
        );
        settings.declare(
            "skype.allow_http_service_url",
            "false",
            "Send replies to plain http serviceUrls (local Bot Framework Emulator only)",
        );
    }

    async fn connect(
        &self,
        account: &mut Account,
        settings: &Settings,
    ) -> Result<Box<dyn Session>> {
        let attempt = account.begin_attempt();
        let (app_id, app_secret) = parse_credential(&account.credential)?;
        let addr = listen_addr(settings, account.ordinal)?;

        info!(account = %account.id, attempt, "Waiting for Skype token...");
        let token = self.tokens.get_token(&app_id, &app_secret).await?;
        account.set_connected(true);
        info!(account = %account.id, "Got Skype token, expires at {}", token.expires_at);

        Ok(Box::new(SkypeSession {
            addr,
            outbound: Arc::new(SkypeOutbound {
                client: self.client.clone(),
                tokens: self.tokens.clone(),
                app_id,
                app_secret,
                token: Mutex::new(token),
                allow_http: settings.get_bool("skype.allow_http_service_url"),
            }),
        }))
    }
}

#[derive(Clone)]
struct ListenerState {
    account: Account,
    events: EventSink,
}

fn router(state: ListenerState) -> Router {
    Router::new()
        .route("/api/messages", post(receive_activity))
        .with_state(state)
}

async fn receive_activity(State(state): State<ListenerState>, body: Bytes) -> StatusCode {
    let activity: IncomingActivity = match serde_json::from_slice(&body) {
        Ok(activity) => activity,
        Err(e) => {
            warn!(account = %state.account.id, "Malformed Skype activity: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    if let Some(event) = normalize(&state.account, activity) {
        debug!(account = %state.account.id, channel = %event.channel, "Received Skype message");
        // Holds the request until the pool has room for the event.
        state.events.submit(event).await;
    }
    StatusCode::ACCEPTED
}

pub struct SkypeSession {
    addr: SocketAddr,
    outbound: Arc<SkypeOutbound>,
}

#[async_trait]
impl Session for SkypeSession {
    fn outbound(&self) -> Arc<dyn Outbound> {
        self.outbound.clone()
    }

    async fn run(self: Box<Self>, mut account: Account, events: EventSink) -> Result<()> {
        let app = router(ListenerState {
            account: account.clone(),
            events,
        });
        let mut backoff = Backoff::default();

        loop {
            let listener = match tokio::net::TcpListener::bind(self.addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    account.set_connected(false);
                    let delay = backoff.next_delay();
                    warn!(account = %account.id, "Failed to bind {}, retrying in {:?}: {}", self.addr, delay, e);
                    tokio::time::sleep(delay).await;
                    account.begin_attempt();
                    continue;
                }
            };

            account.set_connected(true);
            backoff.reset();
            info!(account = %account.id, "Starting Skype API listener on {}", self.addr);

            if let Err(e) = axum::serve(listener, app.clone()).await {
                account.set_connected(false);
                let delay = backoff.next_delay();
                warn!(account = %account.id, "Skype listener stopped, restarting in {:?}: {}", delay, e);
                tokio::time::sleep(delay).await;
                account.begin_attempt();
            }
        }
    }
}

pub struct SkypeOutbound {
    client: reqwest::Client,
    tokens: TokenManager,
    app_id: String,
    app_secret: String,
    token: Mutex<Token>,
    /// The bearer token only goes to https endpoints unless this is set.
    allow_http: bool,
}

impl SkypeOutbound {
    async fn access_token(&self) -> Result<String, BusError> {
        let mut token = self.token.lock().await;
        *token = self
            .tokens
            .ensure_fresh(token.clone(), &self.app_id, &self.app_secret)
            .await?;
        Ok(token.access_token.clone())
    }

    fn activities_url(&self, service_url: &str, conversation: &str) -> Result<Url> {
        let mut url =
            Url::parse(service_url).with_context(|| format!("Invalid serviceUrl: {}", service_url))?;
        match url.scheme() {
            "https" => {}
            "http" if self.allow_http => {}
            other => anyhow::bail!("Refusing to send to {} serviceUrl: {}", other, service_url),
        }
        url.path_segments_mut()
            .map_err(|_| anyhow!("serviceUrl cannot be a base: {}", service_url))?
            .pop_if_empty()
            .extend(["v3", "conversations", conversation, "activities"]);
        Ok(url)
    }
}

async fn to_outgoing(attachment: &Attachment) -> Result<OutgoingAttachment> {
    let (content, content_url) = if attachment.is_remote() {
        (None, Some(attachment.source_url.clone()))
    } else {
        (Some(attachment.data_uri().await?), None)
    };
    Ok(OutgoingAttachment {
        content,
        content_type: attachment.content_type.to_string(),
        content_url,
        name: attachment.display_name.clone(),
    })
}

#[async_trait]
impl Outbound for SkypeOutbound {
    async fn send(
        &self,
        target: &ReplyTarget,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<()> {
        let conversation = match &target.channel {
            ChannelRef::Text(id) => id,
            ChannelRef::Numeric(id) => {
                anyhow::bail!("Skype cannot address numeric channel {}", id)
            }
        };
        let service_url = target
            .service_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow!("No serviceUrl for conversation {}", conversation))?;

        let mut attachments = Vec::new();
        if let Some(attachment) = attachment {
            attachments.push(to_outgoing(attachment).await?);
        }
        let activity = OutgoingActivity {
            text,
            activity_type: "message",
            text_format: "plain",
            attachments,
        };

        let url = self.activities_url(service_url, conversation)?;
        let token = self.access_token().await?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&activity)
            .send()
            .await
            .map_err(|e| BusError::transport(NAME, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BusError::transport(NAME, format!("send failed ({}): {}", status, body)).into());
        }
        debug!(conversation = %conversation, "Skype activity sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountRegistry;
    use crate::attachment::AttachmentPipeline;
    use crate::bus::Bus;
    use crate::commands;
    use crate::dispatch::DispatchTableBuilder;
    use crate::router::{CapabilityRegistry, CommandContext, CommandHandler, Reply};
    use mockito::Matcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use serde_json::json;
    use std::time::Duration;

    const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    fn account() -> Account {
        Account::new(NAME, 0, "app:secret", "!")
    }

    fn activity(value: serde_json::Value) -> IncomingActivity {
        serde_json::from_value(value).unwrap()
    }

    fn outbound(server: &mockito::Server, expires_at: i64) -> SkypeOutbound {
        let client = reqwest::Client::new();
        SkypeOutbound {
            tokens: TokenManager::with_endpoint(client.clone(), format!("{}/token", server.url())),
            client,
            app_id: "app".into(),
            app_secret: "secret".into(),
            token: Mutex::new(Token {
                access_token: "cached-token".into(),
                expires_at,
            }),
            // mockito only speaks plain http
            allow_http: true,
        }
    }

    #[test]
    fn test_parse_credential() {
        assert_eq!(
            parse_credential("app-id:p:ss").unwrap(),
            ("app-id".to_string(), "p:ss".to_string())
        );
        assert!(matches!(
            parse_credential("no-colon"),
            Err(BusError::Config { protocol: "skype", .. })
        ));
        assert!(parse_credential(":secret").is_err());
    }

    #[test]
    fn test_listen_addr_offsets_by_ordinal() {
        let mut settings = Settings::new();
        SkypeProtocol::new(reqwest::Client::new()).configure(&mut settings);
        assert_eq!(listen_addr(&settings, 0).unwrap().to_string(), "0.0.0.0:3978");
        assert_eq!(listen_addr(&settings, 2).unwrap().to_string(), "0.0.0.0:3980");

        settings.set("skype.listen_addr", "nonsense");
        assert!(listen_addr(&settings, 0).is_err());
    }

    #[test]
    fn test_normalize_message() {
        let event = normalize(
            &account(),
            activity(json!({
                "type": "message",
                "text": "@torpedobot !help",
                "timestamp": Utc::now().to_rfc3339(),
                "serviceUrl": "https://smba.example.net/apis/",
                "from": {"id": "29:user", "name": "Alice"},
                "conversation": {"id": "19:conv@thread.skype"},
                "recipient": {"id": "28:bot", "name": "torpedobot"}
            })),
        )
        .unwrap();

        assert_eq!(event.text, "!help");
        assert_eq!(event.origin, "skype#0");
        assert_eq!(event.channel, ChannelRef::Text("19:conv@thread.skype".into()));
        assert_eq!(event.sender.display_name, "Alice");
        assert_eq!(
            event.target().service_url.as_deref(),
            Some("https://smba.example.net/apis/")
        );
    }

    #[test]
    fn test_normalize_skips_non_messages_and_stale() {
        assert!(normalize(
            &account(),
            activity(json!({"type": "conversationUpdate", "conversation": {"id": "c"}}))
        )
        .is_none());

        let old = (Utc::now() - chrono::Duration::seconds(60)).to_rfc3339();
        assert!(normalize(
            &account(),
            activity(json!({"type": "message", "text": "!help", "timestamp": old, "conversation": {"id": "c"}}))
        )
        .is_none());

        assert!(normalize(&account(), activity(json!({"type": "message", "text": "!help"}))).is_none());
    }

    #[test]
    fn test_outgoing_payload_shape() {
        let plain = serde_json::to_value(OutgoingActivity {
            text: "hi",
            activity_type: "message",
            text_format: "plain",
            attachments: Vec::new(),
        })
        .unwrap();
        assert_eq!(plain, json!({"text": "hi", "type": "message", "textFormat": "plain"}));

        let with_image = serde_json::to_value(OutgoingActivity {
            text: "cat",
            activity_type: "message",
            text_format: "plain",
            attachments: vec![OutgoingAttachment {
                content: None,
                content_type: "image/png".into(),
                content_url: Some("https://x.io/cat.png".into()),
                name: "cat".into(),
            }],
        })
        .unwrap();
        assert_eq!(
            with_image["attachments"],
            json!([{"contentType": "image/png", "contentUrl": "https://x.io/cat.png", "name": "cat"}])
        );
    }

    #[test]
    fn test_activities_url() {
        let server = mockito::Server::new();
        let outbound = outbound(&server, 0);
        let url = outbound
            .activities_url("https://smba.example.net/apis/", "29:conv")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://smba.example.net/apis/v3/conversations/29:conv/activities"
        );
    }

    #[tokio::test]
    async fn test_send_refuses_plain_http_service_url() {
        let mut server = mockito::Server::new_async().await;
        let send_mock = server
            .mock("POST", "/v3/conversations/29:conv/activities")
            .expect(0)
            .create_async()
            .await;

        let mut outbound = outbound(&server, Utc::now().timestamp() + 3600);
        outbound.allow_http = false;
        let target = ReplyTarget {
            channel: ChannelRef::Text("29:conv".into()),
            service_url: Some(server.url()),
        };
        let err = outbound.send(&target, "hello", None).await.unwrap_err();
        assert!(err.to_string().contains("Refusing"));

        let ftp = ReplyTarget {
            channel: ChannelRef::Text("29:conv".into()),
            service_url: Some("ftp://smba.example.net/".into()),
        };
        assert!(outbound.send(&ftp, "hello", None).await.is_err());
        send_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_uses_cached_token() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server.mock("POST", "/token").expect(0).create_async().await;
        let send_mock = server
            .mock("POST", "/v3/conversations/29:conv/activities")
            .match_header("authorization", "Bearer cached-token")
            .match_body(Matcher::PartialJson(
                json!({"text": "hello", "type": "message", "textFormat": "plain"}),
            ))
            .with_status(201)
            .create_async()
            .await;

        let outbound = outbound(&server, Utc::now().timestamp() + 3600);
        let target = ReplyTarget {
            channel: ChannelRef::Text("29:conv".into()),
            service_url: Some(server.url()),
        };
        outbound.send(&target, "hello", None).await.unwrap();

        send_mock.assert_async().await;
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_refreshes_expired_token_and_inlines_local_image() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"token_type":"Bearer","expires_in":3600,"access_token":"fresh-token"}"#)
            .expect(1)
            .create_async()
            .await;
        let send_mock = server
            .mock("POST", "/v3/conversations/29:conv/activities")
            .match_header("authorization", "Bearer fresh-token")
            .match_body(Matcher::Regex(
                r#""content":"data:image/png;base64,"#.to_string(),
            ))
            .with_status(200)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.png");
        std::fs::write(&path, PNG).unwrap();
        let pipeline = AttachmentPipeline::with_temp_dir(reqwest::Client::new(), dir.path());
        let rich = crate::attachment::RichMessage::image(
            "cat",
            Url::from_file_path(&path).unwrap().to_string(),
        );
        let attachment = pipeline.materialize(&rich).await.unwrap().unwrap();

        let outbound = outbound(&server, Utc::now().timestamp() - 5);
        let target = ReplyTarget {
            channel: ChannelRef::Text("29:conv".into()),
            service_url: Some(format!("{}/", server.url())),
        };
        outbound.send(&target, "cat", Some(&attachment)).await.unwrap();

        send_mock.assert_async().await;
        assert_eq!(outbound.token.lock().await.access_token, "fresh-token");
    }

    #[tokio::test]
    async fn test_send_reports_http_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v3/conversations/29:conv/activities")
            .with_status(403)
            .with_body("forbidden")
            .create_async()
            .await;

        let outbound = outbound(&server, Utc::now().timestamp() + 3600);
        let target = ReplyTarget {
            channel: ChannelRef::Text("29:conv".into()),
            service_url: Some(server.url()),
        };
        let err = outbound.send(&target, "hello", None).await.unwrap_err();
        assert!(err.to_string().contains("403"));

        let no_service_url = ReplyTarget {
            channel: ChannelRef::Text("29:conv".into()),
            service_url: None,
        };
        assert!(outbound.send(&no_service_url, "hello", None).await.is_err());
    }

    #[derive(Default)]
    struct Capture {
        sent: std::sync::Mutex<Vec<(ReplyTarget, String)>>,
    }

    #[async_trait]
    impl Outbound for Capture {
        async fn send(&self, target: &ReplyTarget, text: &str, _: Option<&Attachment>) -> Result<()> {
            self.sent.lock().unwrap().push((target.clone(), text.to_string()));
            Ok(())
        }
    }

    /// Never finishes, so it holds its pool slot forever.
    struct Stall {
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandHandler for Stall {
        async fn handle(&self, _ctx: &CommandContext<'_>) -> Result<Reply> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(Reply::default())
        }
    }

    /// Serve the listener on an ephemeral port; returns the messages URL.
    async fn serve_listener(
        registry: CapabilityRegistry,
        capture: Arc<Capture>,
        max_in_flight: usize,
        temp_dir: &std::path::Path,
    ) -> String {
        let (_, command_router) = registry.into_router().unwrap();
        let mut table = DispatchTableBuilder::new();
        table.register("skype#0", capture).unwrap();
        let bus = Bus::new(
            command_router,
            table.build(),
            AttachmentPipeline::with_temp_dir(reqwest::Client::new(), temp_dir),
            max_in_flight,
        );

        let app = router(ListenerState {
            account: account(),
            events: bus.sink(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{}/api/messages", addr)
    }

    fn parsed_registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.run_pre_parsers().unwrap();
        registry.parse(Vec::new()).unwrap();
        registry.run_post_parsers().unwrap();
        registry
    }

    fn message(text: &str) -> serde_json::Value {
        json!({
            "type": "message",
            "text": text,
            "serviceUrl": "https://smba.example.net/",
            "from": {"id": "29:user", "name": "Alice"},
            "conversation": {"id": "29:conv"}
        })
    }

    #[tokio::test]
    async fn test_listener_accepts_activities_and_rejects_garbage() {
        let mut registry = parsed_registry();
        commands::register_builtin(&mut registry, Arc::new(AccountRegistry::new())).unwrap();
        let capture = Arc::new(Capture::default());
        let dir = tempfile::tempdir().unwrap();
        let url = serve_listener(registry, capture.clone(), 4, dir.path()).await;
        let client = reqwest::Client::new();

        let bad = client.post(&url).body("{not json").send().await.unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);

        let ok = client
            .post(&url)
            .json(&message("@torpedobot !help"))
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), reqwest::StatusCode::ACCEPTED);

        tokio::time::timeout(Duration::from_secs(5), async {
            while capture.sent.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let sent = capture.sent.lock().unwrap();
        assert_eq!(sent[0].0.channel, ChannelRef::Text("29:conv".into()));
        assert_eq!(sent[0].0.service_url.as_deref(), Some("https://smba.example.net/"));
        assert!(sent[0].1.contains("!stats - "));
    }

    #[tokio::test]
    async fn test_listener_waits_for_a_free_slot() {
        let started = Arc::new(AtomicUsize::new(0));
        let mut registry = parsed_registry();
        registry
            .register_command(
                "slow",
                "Never answers",
                Arc::new(Stall {
                    started: started.clone(),
                }),
            )
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let url = serve_listener(registry, Arc::new(Capture::default()), 1, dir.path()).await;
        let client = reqwest::Client::new();

        let first = client.post(&url).json(&message("!slow")).send().await.unwrap();
        assert_eq!(first.status(), reqwest::StatusCode::ACCEPTED);
        tokio::time::timeout(Duration::from_secs(5), async {
            while started.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // The only slot is taken, so the next request is held open.
        let second = client
            .post(&url)
            .json(&message("!slow"))
            .timeout(Duration::from_millis(300))
            .send()
            .await;
        assert!(second.is_err());
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }
}
