use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::attachment::RichMessage;
use crate::config::Settings;
use crate::error::BusError;
use crate::platform::InboundEvent;

/// What a command handler answers with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// Empty unless the handler attached rich content.
    pub rich: RichMessage,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            rich: RichMessage::default(),
        }
    }

    pub fn rich(text: impl Into<String>, rich: RichMessage) -> Self {
        Self {
            text: text.into(),
            rich,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.rich.is_empty()
    }
}

/// Everything a handler gets for one invocation.
pub struct CommandContext<'a> {
    pub router: &'a CommandRouter,
    pub event: &'a InboundEvent,
    pub trigger: &'a str,
    /// Text after the trigger and one separating whitespace, verbatim.
    pub args: &'a str,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Reply>;
}

/// Per-protocol configuration hook, run before or after parsing.
pub type ConfigHook = Box<dyn Fn(&mut Settings) + Send + Sync>;

/// Startup phases. Each registry operation is only valid in some of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Unconfigured,
    PreParsed,
    Parsed,
    PostParsed,
    HandlersRegistered,
}

struct Command {
    help: String,
    handler: Arc<dyn CommandHandler>,
}

/// Collects configuration hooks and command handlers at startup, then
/// turns into an immutable [`CommandRouter`].
pub struct CapabilityRegistry {
    phase: Phase,
    settings: Settings,
    pre_parsers: Vec<(String, ConfigHook)>,
    post_parsers: Vec<(String, ConfigHook)>,
    commands: BTreeMap<String, Command>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            phase: Phase::Unconfigured,
            settings: Settings::new(),
            pre_parsers: Vec::new(),
            post_parsers: Vec::new(),
            commands: BTreeMap::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn require(&self, operation: &'static str, ok: bool) -> Result<(), BusError> {
        if ok {
            Ok(())
        } else {
            Err(BusError::Phase {
                operation,
                phase: self.phase,
            })
        }
    }

    /// Register a hook that declares settings. Replaces a hook of the same name.
    pub fn register_pre_parser<F>(&mut self, name: &str, hook: F) -> Result<(), BusError>
    where
        F: Fn(&mut Settings) + Send + Sync + 'static,
    {
        self.require("register_pre_parser", self.phase == Phase::Unconfigured)?;
        upsert_hook(&mut self.pre_parsers, name, Box::new(hook));
        Ok(())
    }

    pub fn run_pre_parsers(&mut self) -> Result<(), BusError> {
        self.require("run_pre_parsers", self.phase == Phase::Unconfigured)?;
        for (name, hook) in &self.pre_parsers {
            debug!("Running pre-parser: {}", name);
            hook(&mut self.settings);
        }
        self.phase = Phase::PreParsed;
        Ok(())
    }

    /// Apply parsed overrides (config file first, command line last).
    pub fn parse<I>(&mut self, overrides: I) -> Result<(), BusError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.require("parse", self.phase == Phase::PreParsed)?;
        self.settings.apply_overrides(overrides);
        self.phase = Phase::Parsed;
        Ok(())
    }

    pub fn register_post_parser<F>(&mut self, name: &str, hook: F) -> Result<(), BusError>
    where
        F: Fn(&mut Settings) + Send + Sync + 'static,
    {
        self.require("register_post_parser", self.phase < Phase::PostParsed)?;
        upsert_hook(&mut self.post_parsers, name, Box::new(hook));
        Ok(())
    }

    pub fn run_post_parsers(&mut self) -> Result<(), BusError> {
        self.require("run_post_parsers", self.phase == Phase::Parsed)?;
        for (name, hook) in &self.post_parsers {
            debug!("Running post-parser: {}", name);
            hook(&mut self.settings);
        }
        self.phase = Phase::PostParsed;
        Ok(())
    }

    /// Register `handler` under a unique, case-sensitive trigger.
    pub fn register_command(
        &mut self,
        trigger: &str,
        help: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), BusError> {
        self.require(
            "register_command",
            self.phase < Phase::HandlersRegistered,
        )?;
        if self.commands.contains_key(trigger) {
            return Err(BusError::DuplicateTrigger(trigger.to_string()));
        }
        self.commands.insert(
            trigger.to_string(),
            Command {
                help: help.to_string(),
                handler,
            },
        );
        Ok(())
    }

    /// Finish startup. The registry is consumed, so nothing can be
    /// registered once adapters start producing traffic.
    pub fn into_router(mut self) -> Result<(Settings, CommandRouter), BusError> {
        self.require("into_router", self.phase == Phase::PostParsed)?;
        self.phase = Phase::HandlersRegistered;
        info!("Registered {} commands", self.commands.len());
        Ok((
            self.settings,
            CommandRouter {
                commands: self.commands,
            },
        ))
    }
}

fn upsert_hook(hooks: &mut Vec<(String, ConfigHook)>, name: &str, hook: ConfigHook) {
    match hooks.iter_mut().find(|(n, _)| n == name) {
        Some(entry) => entry.1 = hook,
        None => hooks.push((name.to_string(), hook)),
    }
}

/// Matches event text against the registered triggers.
pub struct CommandRouter {
    commands: BTreeMap<String, Command>,
}

impl CommandRouter {
    /// Split `text` into a registered trigger and its argument.
    ///
    /// The first whitespace-delimited token must start with `prefix`; the
    /// rest of that token has to equal a trigger exactly.
    pub fn match_command<'r, 't>(&'r self, prefix: &str, text: &'t str) -> Option<(&'r str, &'t str)> {
        let text = text.trim_start();
        let (token, args) = match text.char_indices().find(|(_, c)| c.is_whitespace()) {
            Some((i, c)) => (&text[..i], &text[i + c.len_utf8()..]),
            None => (text, ""),
        };
        let name = token.strip_prefix(prefix)?;
        self.commands
            .get_key_value(name)
            .map(|(trigger, _)| (trigger.as_str(), args))
    }

    /// Run the handler selected by the event text. `None` when the text is
    /// not a command.
    pub async fn dispatch(&self, event: &InboundEvent) -> Option<Reply> {
        let (trigger, args) = self.match_command(&event.command_prefix, &event.text)?;
        let command = self.commands.get(trigger)?;

        info!(event = %event.id, "Command {}{} from {}", event.command_prefix, trigger, event.sender.display_name);

        let ctx = CommandContext {
            router: self,
            event,
            trigger,
            args,
        };
        match command.handler.handle(&ctx).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                error!(event = %event.id, "Command {} failed: {:#}", trigger, e);
                Some(Reply::text(format!(
                    "Command {}{} failed: {}",
                    event.command_prefix, trigger, e
                )))
            }
        }
    }

    pub fn triggers(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// One `<prefix><trigger> - <help>` line per command, sorted by trigger.
    pub fn help_lines(&self, prefix: &str) -> String {
        self.commands
            .iter()
            .map(|(trigger, command)| format!("{}{} - {}", prefix, trigger, command.help))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}
