use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, InputFile, UpdateKind};
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

const NAME: &str = "telegram";
/// Long-poll window; the HTTP client timeout must stay above it.
const POLL_TIMEOUT_SECS: u32 = 30;
/// Telegram caps messages at 4096 chars; leave room.
const MAX_MESSAGE_LEN: usize = 4000;

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Drop the `@botname` Telegram appends to commands in group chats, so
/// `/help@torpedobot now` reads as `/help now`.
fn strip_command_suffix(text: &str, prefix: &str, username: &str) -> String {
    if username.is_empty() || prefix.is_empty() || !text.starts_with(prefix) {
        return text.to_string();
    }
    let (command, rest) = match text.find(char::is_whitespace) {
        Some(pos) => text.split_at(pos),
        None => (text, ""),
    };
    match command.split_once('@') {
        Some((trigger, name)) if name.eq_ignore_ascii_case(username) => {
            format!("{}{}", trigger, rest)
        }
        _ => text.to_string(),
    }
}

fn build_bot(token: &str) -> Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(Duration::from_secs(POLL_TIMEOUT_SECS as u64 + 15))
        .build()
        .context("Failed to build Telegram HTTP client")?;
    Ok(Bot::with_client(token, client))
}

pub struct TelegramProtocol;

#[async_trait]
impl Protocol for TelegramProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    fn configure(&self, settings: &mut Settings) {
        settings.declare(
            "telegram.credentials",
            "",
            "Comma separated Telegram bot tokens (env TELEGRAM)",
        );
        settings.declare("telegram.prefix", "/", "Command prefix for Telegram accounts");
    }

    async fn connect(
        &self,
        account: &mut Account,
        _settings: &Settings,
    ) -> Result<Box<dyn Session>> {
        let attempt = account.begin_attempt();
        info!(account = %account.id, attempt, "Connecting to Telegram...");

        let bot = build_bot(&account.credential)?;
        let me = bot
            .get_me()
            .await
            .map_err(|e| BusError::transport(NAME, e))?;
        // Long polling does not work while a webhook is set.
        bot.delete_webhook()
            .send()
            .await
            .map_err(|e| BusError::transport(NAME, e))?;

        let username = me.user.username.clone().unwrap_or_default();
        account.set_connected(true);
        info!(account = %account.id, username = %username, "Telegram bot connected");

        Ok(Box::new(TelegramSession {
            outbound: Arc::new(TelegramOutbound { bot: bot.clone() }),
            bot,
            username,
        }))
    }
}

pub struct TelegramSession {
    bot: Bot,
    username: String,
    outbound: Arc<TelegramOutbound>,
}

impl TelegramSession {
    fn normalize(&self, account: &Account, msg: &Message) -> Option<InboundEvent> {
        let text = msg.text()?;
        if is_stale(msg.date, Utc::now()) {
            debug!(account = %account.id, chat_id = msg.chat.id.0, "Skipping stale message");
            return None;
        }

        let text = strip_mention(text);
        let text = strip_command_suffix(&text, &account.command_prefix, &self.username);

        let sender = msg
            .from
            .as_ref()
            .map(|user| SenderProfile {
                id: user.id.0.to_string(),
                display_name: user.full_name(),
            })
            .unwrap_or_default();

        Some(InboundEvent::new(
            account,
            ChannelRef::Numeric(msg.chat.id.0),
            sender,
            text,
        ))
    }
}

#[async_trait]
impl Session for TelegramSession {
    fn outbound(&self) -> Arc<dyn Outbound> {
        self.outbound.clone()
    }

    async fn run(self: Box<Self>, mut account: Account, events: EventSink) -> Result<()> {
        info!(account = %account.id, "Starting Telegram polling loop");
        let mut offset: i32 = 0;
        let mut backoff = Backoff::default();

        loop {
            let result = self
                .bot
                .get_updates()
                .offset(offset)
                .timeout(POLL_TIMEOUT_SECS)
                .allowed_updates(vec![AllowedUpdate::Message])
                .await;

            let updates = match result {
                Ok(updates) => updates,
                Err(e) => {
                    account.set_connected(false);
                    let delay = backoff.next_delay();
                    warn!(account = %account.id, "Telegram poll failed, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                    account.begin_attempt();
                    continue;
                }
            };

            if !account.connection().is_connected() {
                info!(account = %account.id, "Telegram polling recovered");
                account.set_connected(true);
            }
            backoff.reset();

            for update in updates {
                offset = update.id.as_offset();
                match update.kind {
                    UpdateKind::Message(msg) => {
                        if let Some(event) = self.normalize(&account, &msg) {
                            debug!(account = %account.id, chat_id = msg.chat.id.0, "Received Telegram message");
                            events.submit(event).await;
                        }
                    }
                    other => debug!(account = %account.id, "Ignoring update: {:?}", other),
                }
            }
        }
    }
}

pub struct TelegramOutbound {
    bot: Bot,
}

#[async_trait]
impl Outbound for TelegramOutbound {
    async fn send(
        &self,
        target: &ReplyTarget,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<()> {
        let chat_id = match &target.channel {
            ChannelRef::Numeric(id) => ChatId(*id),
            ChannelRef::Text(id) => {
                anyhow::bail!("Telegram cannot address non-numeric chat '{}'", id)
            }
        };

        if !text.is_empty() {
            for chunk in split_message(text, MAX_MESSAGE_LEN) {
                self.bot
                    .send_message(chat_id, chunk)
                    .await
                    .map_err(|e| BusError::transport(NAME, e))?;
            }
        }

        if let Some(attachment) = attachment {
            self.bot
                .send_photo(chat_id, InputFile::file(attachment.path().to_path_buf()))
                .await
                .map_err(|e| BusError::transport(NAME, e))?;
        }

        Ok(())
    }
}
