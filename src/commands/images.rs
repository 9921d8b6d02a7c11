//! Per-channel image store and its commands.
//!
//! Images live under `<root>/<base64url(channel)>/<base64url(name)>`. Both
//! path segments are encoded, so neither a channel id nor a user-chosen name
//! can climb out of the store root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use reqwest::Url;
use tracing::{info, warn};

use crate::attachment::{AttachmentPipeline, RichMessage};
use crate::error::BusError;
use crate::platform::ChannelRef;
use crate::router::{CapabilityRegistry, CommandContext, CommandHandler, Reply};

#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn channel_dir(&self, channel: &ChannelRef) -> PathBuf {
        self.root.join(URL_SAFE.encode(channel.to_string().as_bytes()))
    }

    async fn create_channel_dir(&self, channel: &ChannelRef) -> Result<PathBuf> {
        let dir = self.channel_dir(channel);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create image directory: {}", dir.display()))?;
        Ok(dir)
    }

    fn file_path(&self, channel: &ChannelRef, name: &str) -> PathBuf {
        self.channel_dir(channel)
            .join(URL_SAFE.encode(name.trim().as_bytes()))
    }

    pub async fn get(&self, channel: &ChannelRef, name: &str) -> Option<PathBuf> {
        let path = self.file_path(channel, name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => None,
        }
    }

    /// Move an already-downloaded file into the store.
    pub async fn save(
        &self,
        channel: &ChannelRef,
        name: &str,
        store: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<()> {
        self.create_channel_dir(channel).await?;
        store(&self.file_path(channel, name))
    }

    /// Decoded image names, sorted.
    pub async fn list(&self, channel: &ChannelRef) -> Result<Vec<String>> {
        let dir = self.create_channel_dir(channel).await?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read image directory: {}", dir.display()))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(encoded) = file_name.to_str() else {
                continue;
            };
            match URL_SAFE.decode(encoded).ok().and_then(|b| String::from_utf8(b).ok()) {
                Some(name) => names.push(name),
                None => continue,
            }
        }
        names.sort();
        Ok(names)
    }

    /// Returns false when there was nothing to remove.
    pub async fn remove(&self, channel: &ChannelRef, name: &str) -> Result<bool> {
        let Some(path) = self.get(channel, name).await else {
            return Ok(false);
        };
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        Ok(true)
    }
}

/// Strip chat-client URL decoration such as `<https://x|label>`.
fn unformat_url(raw: &str) -> &str {
    let trimmed = raw.trim_start_matches('<').trim_end_matches('>');
    trimmed.split('|').next().unwrap_or(trimmed)
}

pub struct GetImage {
    store: ImageStore,
}

#[async_trait]
impl CommandHandler for GetImage {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Reply> {
        let name = ctx.args.trim();
        if name.is_empty() {
            return Ok(Reply::text(format!(
                "Usage: {}{} <name>",
                ctx.event.command_prefix, ctx.trigger
            )));
        }

        match self.store.get(&ctx.event.channel, name).await {
            Some(path) => {
                let path = tokio::fs::canonicalize(&path).await?;
                let url = Url::from_file_path(&path)
                    .map_err(|_| anyhow::anyhow!("Invalid image path: {}", path.display()))?;
                Ok(Reply::rich(name, RichMessage::image(name, url.to_string())))
            }
            None => Ok(Reply::text(format!("Requested file `{}` was not found", name))),
        }
    }
}

pub struct SetImage {
    store: ImageStore,
    pipeline: AttachmentPipeline,
}

#[async_trait]
impl CommandHandler for SetImage {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Reply> {
        let args = ctx.args.trim();
        let (raw_url, destination) = match args.split_once(char::is_whitespace) {
            Some((url, rest)) => (url, rest.trim()),
            None => (args, ""),
        };

        let url = unformat_url(raw_url);
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Ok(Reply::text("No valid URL found"));
        }
        if destination.is_empty() {
            return Ok(Reply::text("No valid destination found"));
        }

        let channel = &ctx.event.channel;
        if self.store.get(channel, destination).await.is_some() {
            return Ok(Reply::text(format!(
                "Destination already exists, set skipped. Use `{}rmimg {}` to remove.",
                ctx.event.command_prefix, destination
            )));
        }

        let image = match self.pipeline.fetch_image(url).await {
            Ok(Some(image)) => image,
            Ok(None) => return Ok(Reply::text(format!("{} is not an image", url))),
            Err(e) => {
                warn!("Failed to download {}: {:#}", url, e);
                return Ok(Reply::text(format!("Could not download {}", url)));
            }
        };

        match self
            .store
            .save(channel, destination, |dest| image.save_to(dest))
            .await
        {
            Ok(()) => {
                info!(channel = %channel, "Stored image '{}'", destination);
                Ok(Reply::text("Image set"))
            }
            Err(e) => {
                warn!("Failed to store image '{}': {:#}", destination, e);
                Ok(Reply::text("There was an issue with setting image"))
            }
        }
    }
}

pub struct ListImages {
    store: ImageStore,
}

#[async_trait]
impl CommandHandler for ListImages {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Reply> {
        let names = match self.store.list(&ctx.event.channel).await {
            Ok(names) => names,
            Err(e) => {
                warn!("Failed to list images: {:#}", e);
                return Ok(Reply::text(
                    "An error occurred while retrieving image file list",
                ));
            }
        };

        if names.is_empty() {
            return Ok(Reply::text(format!(
                "No files found, upload using {}setimg first",
                ctx.event.command_prefix
            )));
        }

        let mut text = String::from("Available image files:\n");
        for name in names {
            text.push_str(&format!("`{}`\n", name));
        }
        Ok(Reply::text(text))
    }
}

pub struct RemoveImage {
    store: ImageStore,
}

#[async_trait]
impl CommandHandler for RemoveImage {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Reply> {
        let name = ctx.args.trim();
        let text = match self.store.remove(&ctx.event.channel, name).await {
            Ok(true) => format!("Requested file `{}` was removed", name),
            Ok(false) => format!("Requested file `{}` was not found", name),
            Err(e) => {
                warn!("Failed to remove image '{}': {:#}", name, e);
                format!("An error occurred while trying to remove `{}`", name)
            }
        };
        Ok(Reply::text(text))
    }
}

/// Register `getimg`, `setimg`, `listimg`, `lsimg` and `rmimg`.
pub fn register(
    registry: &mut CapabilityRegistry,
    store: ImageStore,
    pipeline: AttachmentPipeline,
) -> Result<(), BusError> {
    registry.register_command(
        "getimg",
        "Post a stored image: getimg <name>",
        Arc::new(GetImage {
            store: store.clone(),
        }),
    )?;
    registry.register_command(
        "setimg",
        "Store an image for this channel: setimg <url> <name>",
        Arc::new(SetImage {
            store: store.clone(),
            pipeline,
        }),
    )?;
    let list: Arc<dyn CommandHandler> = Arc::new(ListImages {
        store: store.clone(),
    });
    registry.register_command("listimg", "List stored images", Arc::clone(&list))?;
    registry.register_command("lsimg", "List stored images", list)?;
    registry.register_command(
        "rmimg",
        "Remove a stored image: rmimg <name>",
        Arc::new(RemoveImage { store }),
    )?;
    Ok(())
}
