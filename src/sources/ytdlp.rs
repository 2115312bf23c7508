use async_trait::async_trait;
use serde::Deserialize;
use serenity::model::id::UserId;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{is_url, looks_like_video_id, StreamResolver};
use crate::audio::item::{PlayableItem, StreamHandle};
use crate::error::ResolveError;

const AUDIO_FORMAT: &str = "bestaudio[ext=webm]/bestaudio[ext=m4a]/bestaudio/best";

/// Resolver basado en yt-dlp: búsqueda, playlists y URLs de stream frescas
pub struct YtDlpResolver {
    binary: String,
}

/// Campos que usamos de `yt-dlp -j`
#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: String,
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
}

/// Campos que usamos de `yt-dlp -J --flat-playlist`
#[derive(Debug, Deserialize)]
struct PlaylistInfo {
    #[serde(default)]
    entries: Vec<Option<PlaylistEntry>>,
}

#[derive(Debug, Deserialize)]
struct PlaylistEntry {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
}

impl YtDlpResolver {
    pub fn new() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
        }
    }

    /// Verifica que yt-dlp esté disponible
    pub async fn verify_dependencies(&self) -> anyhow::Result<()> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("--version")
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ yt-dlp versión: {}", version.trim());
                Ok(())
            }
            _ => {
                error!("❌ yt-dlp no encontrado. Instala con: pip install yt-dlp");
                anyhow::bail!("yt-dlp no disponible")
            }
        }
    }

    /// Busca archivo de cookies disponible
    async fn find_cookies_file(&self) -> Option<String> {
        let cookies_paths = [
            format!("{}/.config/yt-dlp/cookies.txt", std::env::var("HOME").unwrap_or_default()),
            "/app/.config/yt-dlp/cookies.txt".to_string(),
            "./cookies.txt".to_string(),
        ];

        for path in cookies_paths {
            if tokio::fs::metadata(&path).await.is_ok() {
                debug!("🍪 Cookies encontradas en: {}", path);
                return Some(path);
            }
        }

        None
    }

    async fn run(&self, args: &[&str], target: &str) -> Result<String, ResolveError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(args).args([
            "--no-warnings",
            "--socket-timeout",
            "15",
            "--retries",
            "2",
        ]);

        if let Some(cookies) = self.find_cookies_file().await {
            cmd.args(["--cookies", &cookies]);
        }

        cmd.arg(target).kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| ResolveError::Extraction(format!("yt-dlp process error: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp falló para {}: {}", target, stderr.trim());
            return Err(classify_failure(target, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for YtDlpResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamResolver for YtDlpResolver {
    async fn resolve(&self, query: &str, requested_by: UserId) -> Result<PlayableItem, ResolveError> {
        let target = if is_url(query) {
            query.to_string()
        } else if looks_like_video_id(query) {
            format!("https://www.youtube.com/watch?v={}", query)
        } else {
            format!("ytsearch1:{}", query)
        };

        info!("🔍 Resolviendo con yt-dlp: {}", target);
        let stdout = self
            .run(&["-j", "--no-playlist", "-f", AUDIO_FORMAT], &target)
            .await?;

        parse_video_info(&stdout, query, requested_by)
    }

    async fn resolve_playlist(&self, url: &str, requested_by: UserId) -> Result<Vec<PlayableItem>, ResolveError> {
        info!("📃 Extrayendo playlist: {}", url);
        let stdout = self.run(&["-J", "--flat-playlist"], url).await?;

        let items = parse_playlist(&stdout, requested_by)?;
        info!("🎵 Playlist extraída con {} tracks", items.len());
        Ok(items)
    }

    async fn open(&self, item: &PlayableItem) -> Result<StreamHandle, ResolveError> {
        debug!("🔗 Abriendo stream para: {}", item.title());
        let stdout = self
            .run(&["-g", "--no-playlist", "-f", AUDIO_FORMAT], item.url())
            .await?;

        let locator = parse_stream_url(&stdout)
            .ok_or_else(|| ResolveError::Extraction(format!("no audio stream for {}", item.title())))?;

        Ok(StreamHandle {
            item_id: item.id().clone(),
            locator,
        })
    }
}

fn classify_failure(target: &str, stderr: &str) -> ResolveError {
    let lower = stderr.to_lowercase();
    if lower.contains("video unavailable")
        || lower.contains("no video results")
        || lower.contains("unsupported url")
        || lower.contains("private video")
    {
        ResolveError::NotFound(target.to_string())
    } else if lower.contains("javascript") || lower.contains("nsig") {
        error!("❌ yt-dlp necesita un runtime JavaScript (Deno/Node) para YouTube");
        ResolveError::Extraction("yt-dlp requires a JavaScript runtime".to_string())
    } else {
        ResolveError::Extraction(stderr.lines().last().unwrap_or("unknown error").trim().to_string())
    }
}

fn parse_video_info(stdout: &str, query: &str, requested_by: UserId) -> Result<PlayableItem, ResolveError> {
    let line = stdout
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| ResolveError::NotFound(query.to_string()))?;

    let info: VideoInfo = serde_json::from_str(line)
        .map_err(|e| ResolveError::Extraction(format!("invalid yt-dlp output: {}", e)))?;

    let webpage_url = info
        .webpage_url
        .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", info.id));

    let mut item = PlayableItem::new(
        info.id,
        info.title.unwrap_or_else(|| "Unknown".to_string()),
        webpage_url,
        requested_by,
    );

    if let Some(uploader) = info.uploader {
        item = item.with_artist(uploader);
    }
    if let Some(duration) = info.duration.filter(|d| *d > 0.0) {
        item = item.with_duration(Duration::from_secs_f64(duration));
    }
    if let Some(thumbnail) = info.thumbnail {
        item = item.with_thumbnail(thumbnail);
    }
    if let Some(stream_url) = info.url {
        item = item.with_stream_url(stream_url);
    }

    Ok(item)
}

fn parse_playlist(stdout: &str, requested_by: UserId) -> Result<Vec<PlayableItem>, ResolveError> {
    let playlist: PlaylistInfo = serde_json::from_str(stdout.trim())
        .map_err(|e| ResolveError::Extraction(format!("invalid playlist output: {}", e)))?;

    let items = playlist
        .entries
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let id = entry.id?;
            let url = entry
                .url
                .filter(|u| u.starts_with("http"))
                .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", id));

            let mut item = PlayableItem::new(
                id,
                entry.title.unwrap_or_else(|| "Unknown".to_string()),
                url,
                requested_by,
            );
            if let Some(uploader) = entry.uploader {
                item = item.with_artist(uploader);
            }
            if let Some(duration) = entry.duration.filter(|d| *d > 0.0) {
                item = item.with_duration(Duration::from_secs_f64(duration));
            }
            Some(item)
        })
        .collect();

    Ok(items)
}

fn parse_stream_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("http"))
        .map(str::to_string)
}
