pub mod images;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::account::AccountRegistry;
use crate::error::BusError;
use crate::router::{CapabilityRegistry, CommandContext, CommandHandler, Reply};

const HELP_TEXT: &str = "Get help using this command";

/// Lists every registered command.
pub struct HelpCommand;

#[async_trait]
impl CommandHandler for HelpCommand {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Reply> {
        Ok(Reply::text(ctx.router.help_lines(&ctx.event.command_prefix)))
    }
}

/// Account and process statistics.
pub struct StatsCommand {
    accounts: Arc<AccountRegistry>,
    started_at: DateTime<Utc>,
}

impl StatsCommand {
    pub fn new(accounts: Arc<AccountRegistry>) -> Self {
        Self {
            accounts,
            started_at: Utc::now(),
        }
    }
}

#[async_trait]
impl CommandHandler for StatsCommand {
    async fn handle(&self, _ctx: &CommandContext<'_>) -> Result<Reply> {
        let mut text = format!("Connected accounts: {}\n", self.accounts.connected_count());
        for account in self.accounts.snapshot() {
            text.push_str(&format!(
                "  {} - {}, {} connect attempts\n",
                account.id,
                if account.is_connected() {
                    "connected"
                } else {
                    "disconnected"
                },
                account.reconnect_count()
            ));
        }
        text.push_str(&format!(
            "Uptime: {}\n",
            format_uptime((Utc::now() - self.started_at).num_seconds())
        ));
        text.push_str(&format!(
            "Version: {} {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ));
        Ok(Reply::text(text))
    }
}

fn format_uptime(secs: i64) -> String {
    let secs = secs.max(0);
    let (days, rest) = (secs / 86_400, secs % 86_400);
    let (hours, rest) = (rest / 3_600, rest % 3_600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else {
        format!("{}m {}s", minutes, seconds)
    }
}

/// Register `?`, `h`, `help` and `stats`.
pub fn register_builtin(
    registry: &mut CapabilityRegistry,
    accounts: Arc<AccountRegistry>,
) -> Result<(), BusError> {
    let help: Arc<dyn CommandHandler> = Arc::new(HelpCommand);
    for trigger in ["?", "h", "help"] {
        registry.register_command(trigger, HELP_TEXT, Arc::clone(&help))?;
    }
    registry.register_command(
        "stats",
        "Just system stats, nothing interesting",
        Arc::new(StatsCommand::new(accounts)),
    )?;
    Ok(())
}
