use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::Engine;
use reqwest::Url;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Largest resource the pipeline is willing to download by default.
const MAX_FETCH_BYTES: usize = 20 * 1024 * 1024;
/// Enough leading bytes for every signature `sniff_image_type` knows.
const SNIFF_LEN: usize = 16;

/// Optional structured reply content layered over a plain-text reply.
///
/// `RichMessage::default()` is the empty state and means "no rich content";
/// check [`RichMessage::is_empty`] before using any field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RichMessage {
    pub title: String,
    pub text: String,
    pub image_url: String,
    pub color: String,
}

impl RichMessage {
    pub fn image(title: impl Into<String>, image_url: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            text: title.clone(),
            title,
            image_url: image_url.into(),
            color: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_empty()
            && self.text.is_empty()
            && self.image_url.is_empty()
            && self.color.is_empty()
    }
}

/// Content type from magic bytes, or `None` when the data is not an image.
pub fn sniff_image_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if data.starts_with(b"BM") && data.len() >= 14 {
        return Some("image/bmp");
    }
    None
}

/// A downloaded, verified image held in a temporary file.
///
/// The file is deleted when this value is dropped unless it was saved.
#[derive(Debug)]
pub struct FetchedImage {
    pub content_type: &'static str,
    file: NamedTempFile,
}

impl FetchedImage {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Move the image to `dest`, copying when a rename is not possible.
    pub fn save_to(self, dest: &Path) -> Result<()> {
        match self.file.persist(dest) {
            Ok(_) => Ok(()),
            Err(e) => {
                std::fs::copy(e.file.path(), dest)
                    .with_context(|| format!("Failed to save image to {}", dest.display()))?;
                Ok(())
            }
        }
    }
}

/// Protocol-neutral attachment built from a [`RichMessage`].
///
/// Exposes both the validated source URL and the bytes so each protocol can
/// pick what its transport needs. Dropping it releases the temporary file.
#[derive(Debug)]
pub struct Attachment {
    pub content_type: &'static str,
    pub source_url: String,
    pub display_name: String,
    image: FetchedImage,
}

impl Attachment {
    pub fn path(&self) -> &Path {
        self.image.path()
    }

    /// Whether third parties can fetch `source_url` themselves.
    pub fn is_remote(&self) -> bool {
        self.source_url.starts_with("http://") || self.source_url.starts_with("https://")
    }

    pub async fn bytes(&self) -> Result<Vec<u8>> {
        tokio::fs::read(self.path())
            .await
            .with_context(|| format!("Failed to read attachment {}", self.path().display()))
    }

    /// `data:<type>;base64,...` for transports that accept inline content.
    pub async fn data_uri(&self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(format!(
            "data:{};base64,{}",
            self.content_type,
            base64::engine::general_purpose::STANDARD.encode(bytes)
        ))
    }
}

/// Fetches remote resources, checks they are images, and turns rich replies
/// into attachments.
#[derive(Debug, Clone)]
pub struct AttachmentPipeline {
    client: reqwest::Client,
    temp_dir: PathBuf,
    max_bytes: usize,
}

impl AttachmentPipeline {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_temp_dir(client, std::env::temp_dir())
    }

    pub fn with_temp_dir(client: reqwest::Client, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            temp_dir: temp_dir.into(),
            max_bytes: MAX_FETCH_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Download `url` into a temporary file and keep it only if it is an
    /// image. `http(s)` and `file` URLs are supported.
    ///
    /// The size limit is enforced while bytes arrive, so an oversized or
    /// unbounded body is cut off without being buffered.
    pub async fn fetch_image(&self, url: &str) -> Result<Option<FetchedImage>> {
        let parsed = Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;
        if !matches!(parsed.scheme(), "http" | "https" | "file") {
            bail!("Unsupported URL scheme '{}' in {}", parsed.scheme(), url);
        }

        let temp_dir = self.temp_dir.clone();
        let file = tokio::task::spawn_blocking(move || -> Result<NamedTempFile> {
            tempfile::Builder::new()
                .prefix("chatbus-")
                .tempfile_in(&temp_dir)
                .with_context(|| format!("Failed to create temp file in {}", temp_dir.display()))
        })
        .await
        .context("Temp file creation panicked")??;

        let mut download = Download {
            url,
            file: tokio::fs::File::from_std(file.as_file().try_clone()?),
            written: 0,
            limit: self.max_bytes,
            head: Vec::with_capacity(SNIFF_LEN),
        };
        if parsed.scheme() == "file" {
            self.read_file(&parsed, &mut download).await?;
        } else {
            self.stream_http(parsed, &mut download).await?;
        }
        download.file.flush().await?;
        debug!("Fetched {} bytes from {}", download.written, url);

        match sniff_image_type(&download.head) {
            Some(content_type) => Ok(Some(FetchedImage { content_type, file })),
            None => {
                debug!("Resource at {} is not an image, discarding", url);
                Ok(None)
            }
        }
    }

    /// Build an attachment for `rich`, or `None` when there is nothing to
    /// attach (empty message, no image URL, or not an image).
    pub async fn materialize(&self, rich: &RichMessage) -> Result<Option<Attachment>> {
        if rich.is_empty() || rich.image_url.is_empty() {
            return Ok(None);
        }

        let image = match self.fetch_image(&rich.image_url).await? {
            Some(image) => image,
            None => return Ok(None),
        };

        Ok(Some(Attachment {
            content_type: image.content_type,
            source_url: rich.image_url.clone(),
            display_name: rich.title.clone(),
            image,
        }))
    }

    async fn stream_http(&self, parsed: Url, download: &mut Download<'_>) -> Result<()> {
        let url = download.url;
        let mut response = self
            .client
            .get(parsed)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?
            .error_for_status()
            .with_context(|| format!("Failed to fetch {}", url))?;
        if let Some(len) = response.content_length() {
            if len > download.limit as u64 {
                bail!("Resource at {} is too large ({} bytes)", url, len);
            }
        }
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("Failed to read body of {}", url))?
        {
            download.push(&chunk).await?;
        }
        Ok(())
    }

    async fn read_file(&self, parsed: &Url, download: &mut Download<'_>) -> Result<()> {
        let path = parsed
            .to_file_path()
            .map_err(|_| anyhow::anyhow!("Invalid file URL: {}", download.url))?;
        let mut source = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = source
                .read(&mut buf)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if read == 0 {
                return Ok(());
            }
            download.push(&buf[..read]).await?;
        }
    }
}

/// A download in progress: counts bytes against the limit and keeps the
/// leading bytes for sniffing.
struct Download<'a> {
    url: &'a str,
    file: tokio::fs::File,
    written: usize,
    limit: usize,
    head: Vec<u8>,
}

impl Download<'_> {
    async fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.written += chunk.len();
        if self.written > self.limit {
            bail!("Resource at {} exceeds {} bytes", self.url, self.limit);
        }
        if self.head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
        }
        self.file
            .write_all(chunk)
            .await
            .context("Failed to write temp file")
    }
}
