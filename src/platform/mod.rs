pub mod skype;
pub mod telegram;

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::account::Account;
use crate::attachment::Attachment;
use crate::bus::EventSink;
use crate::config::Settings;

/// Events older than this when they arrive are backlog, not live commands.
pub const STALE_AFTER_SECS: i64 = 10;

/// A leading `@name` token, with the whitespace after it.
static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@\S+(\s+|$)").expect("mention pattern is valid"));

/// Platform-specific chat/channel identifier. Never converted between
/// variants: each protocol reads back exactly what it produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelRef {
    Numeric(i64),
    Text(String),
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRef::Numeric(id) => write!(f, "{}", id),
            ChannelRef::Text(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderProfile {
    pub id: String,
    pub display_name: String,
}

/// Where a reply goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub channel: ChannelRef,
    /// Per-conversation reply endpoint (Bot Framework `serviceUrl`).
    pub service_url: Option<String>,
}

/// A message received from any platform, normalized.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub id: Uuid,
    pub sender: SenderProfile,
    pub channel: ChannelRef,
    /// Copied from the owning account.
    pub command_prefix: String,
    /// Identity of the account/adapter that produced the event.
    pub origin: String,
    /// Text with any leading bot mention already removed.
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub service_url: Option<String>,
}

impl InboundEvent {
    pub fn new(
        account: &Account,
        channel: ChannelRef,
        sender: SenderProfile,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            channel,
            command_prefix: account.command_prefix.clone(),
            origin: account.id.clone(),
            text: text.into(),
            received_at: Utc::now(),
            service_url: None,
        }
    }

    pub fn target(&self) -> ReplyTarget {
        ReplyTarget {
            channel: self.channel.clone(),
            service_url: self.service_url.clone(),
        }
    }
}

/// Outbound half of a connected account: what the dispatch table stores.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(
        &self,
        target: &ReplyTarget,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<()>;
}

/// A connected account, ready to run its transport loop.
#[async_trait]
pub trait Session: Send {
    fn outbound(&self) -> Arc<dyn Outbound>;

    /// Receive until the session ends, submitting every normalized event.
    async fn run(self: Box<Self>, account: Account, events: EventSink) -> Result<()>;
}

/// One chat network.
#[async_trait]
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pre-parse hook: declare this protocol's settings and their defaults.
    fn configure(&self, settings: &mut Settings);

    /// Post-parse hook: normalize settings after file and command line.
    fn normalize(&self, settings: &mut Settings) {
        let key = format!("{}.credentials", self.name());
        settings.fallback_to_env(&key, &self.name().to_ascii_uppercase());
    }

    /// One account per configured credential.
    fn accounts(&self, settings: &Settings) -> Vec<Account> {
        let name = self.name();
        Account::parse_csv(
            name,
            settings.get(&format!("{}.credentials", name)),
            settings.get(&format!("{}.prefix", name)),
        )
    }

    /// Establish the account's session. Failing here only drops this account.
    async fn connect(&self, account: &mut Account, settings: &Settings)
        -> Result<Box<dyn Session>>;
}

pub fn is_stale(sent_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - sent_at > chrono::Duration::seconds(STALE_AFTER_SECS)
}

/// Remove a leading `@name` mention so commands parse the same with or
/// without addressing the bot.
pub fn strip_mention(text: &str) -> String {
    MENTION.replace(text, "").into_owned()
}

/// Exponential backoff for reconnect loops.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_threshold() {
        let now = Utc::now();
        assert!(!is_stale(now, now));
        assert!(!is_stale(now - chrono::Duration::seconds(10), now));
        assert!(is_stale(now - chrono::Duration::seconds(11), now));
        assert!(is_stale(now - chrono::Duration::milliseconds(10_001), now));
    }

    #[test]
    fn test_strip_mention() {
        assert_eq!(strip_mention("@torpedobot !help"), "!help");
        assert_eq!(strip_mention("@someone   /stats now"), "/stats now");
        assert_eq!(strip_mention("@torpedobot"), "");
        assert_eq!(strip_mention("!help @torpedobot"), "!help @torpedobot");
        assert_eq!(strip_mention("plain text"), "plain text");
    }

    #[test]
    fn test_channel_ref_display() {
        assert_eq!(ChannelRef::Numeric(-100123).to_string(), "-100123");
        assert_eq!(ChannelRef::Text("19:abc@thread".into()).to_string(), "19:abc@thread");
    }

    #[test]
    fn test_event_copies_account_fields() {
        let account = Account::new("telegram", 2, "t", "/");
        let event = InboundEvent::new(
            &account,
            ChannelRef::Numeric(42),
            SenderProfile::default(),
            "/help",
        );
        assert_eq!(event.origin, "telegram#2");
        assert_eq!(event.command_prefix, "/");
        assert_eq!(
            event.target(),
            ReplyTarget {
                channel: ChannelRef::Numeric(42),
                service_url: None
            }
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
