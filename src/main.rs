mod account;
mod attachment;
mod bus;
mod commands;
mod config;
mod dispatch;
mod error;
mod platform;
mod router;
mod token;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

use crate::account::AccountRegistry;
use crate::attachment::AttachmentPipeline;
use crate::bus::Bus;
use crate::commands::images::ImageStore;
use crate::dispatch::DispatchTableBuilder;
use crate::platform::skype::SkypeProtocol;
use crate::platform::telegram::TelegramProtocol;
use crate::platform::Protocol;
use crate::router::CapabilityRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; general.debug can only raise the level once
    // settings are parsed
    let env_filter = EnvFilter::try_from_default_env();
    let filter_from_env = env_filter.is_ok();
    let (filter, filter_handle) =
        reload::Layer::new(env_filter.unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();

    // File values first, command-line overrides on top
    let config_path = config::config_path(&args);
    let mut overrides = config::load_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    overrides.extend(config::cli_overrides(&args));

    let client = reqwest::Client::new();
    let protocols: Vec<Arc<dyn Protocol>> = vec![
        Arc::new(TelegramProtocol),
        Arc::new(SkypeProtocol::new(client.clone())),
    ];

    let mut registry = CapabilityRegistry::new();
    registry.register_pre_parser("general", config::declare_general)?;
    for protocol in &protocols {
        let p = Arc::clone(protocol);
        registry.register_pre_parser(protocol.name(), move |settings| p.configure(settings))?;
    }
    registry.run_pre_parsers()?;
    registry.parse(overrides)?;
    for protocol in &protocols {
        let p = Arc::clone(protocol);
        registry.register_post_parser(protocol.name(), move |settings| p.normalize(settings))?;
    }
    registry.run_post_parsers()?;

    if !filter_from_env && registry.settings().get_bool("general.debug") {
        filter_handle
            .reload(EnvFilter::new("info,chatbus=debug"))
            .context("Failed to raise log level")?;
    }

    info!("Configuration loaded from: {}", config_path.display());
    debug!("Registry phase: {:?}", registry.phase());

    // Register commands
    let accounts = Arc::new(AccountRegistry::new());
    let pipeline = AttachmentPipeline::new(client.clone());
    let store = ImageStore::new(registry.settings().get("general.data_dir"));
    commands::register_builtin(&mut registry, Arc::clone(&accounts))?;
    commands::images::register(&mut registry, store, pipeline.clone())?;

    let (settings, router) = registry.into_router()?;
    debug!("Settings:\n{}", settings.describe());
    info!("  Commands: {}", router.len());
    debug!(
        "  Triggers: {}",
        router.triggers().collect::<Vec<_>>().join(", ")
    );

    // Connect every account; a failure only drops that account
    let mut table = DispatchTableBuilder::new();
    let mut sessions = Vec::new();
    for protocol in &protocols {
        for mut account in protocol.accounts(&settings) {
            accounts.append(&account);
            match protocol.connect(&mut account, &settings).await {
                Ok(session) => {
                    table.register(account.id.clone(), session.outbound())?;
                    sessions.push((account, session));
                }
                Err(e) => error!(
                    account = %account.id,
                    protocol = account.protocol,
                    "Failed to connect: {:#}",
                    e
                ),
            }
        }
    }

    if sessions.is_empty() {
        warn!("No accounts connected, nothing to do");
        return Ok(());
    }
    info!(
        "  Accounts: {} connected of {} configured",
        sessions.len(),
        accounts.len()
    );

    let max_in_flight: usize = settings.get_parsed("general.max_in_flight")?;
    let table = table.build();
    debug!("Dispatch table holds {} senders", table.len());
    let bus = Bus::new(router, table, pipeline, max_in_flight);

    info!("Bus is starting...");
    let tasks = sessions.into_iter().map(|(account, session)| {
        let sink = bus.sink();
        tokio::spawn(async move {
            let id = account.id.clone();
            if let Err(e) = session.run(account, sink).await {
                error!(account = %id, "Session ended: {:#}", e);
            }
        })
    });
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!("Session task panicked: {}", e);
        }
    }

    Ok(())
}
