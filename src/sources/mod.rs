//! # Sources
//!
//! External collaborators of the playback core:
//!
//! - [`StreamResolver`] turns a query or URL into a [`PlayableItem`] and,
//!   at play time, opens a fresh [`StreamHandle`] for it.
//! - [`RecommendationSource`] proposes what to play next for autoplay.
//!
//! [`BoundedResolver`] wraps any resolver with the process-wide concurrency
//! limit and per-call timeout. Every session shares one instance.

pub mod invidious;
pub mod ytdlp;

use async_trait::async_trait;
use regex::Regex;
use serenity::model::id::UserId;
use std::{collections::HashSet, sync::OnceLock, time::Duration};
use tokio::{sync::Semaphore, time::timeout};
use tracing::{debug, warn};

use crate::audio::item::{ItemId, PlayableItem, StreamHandle};
use crate::error::{RecommendationError, ResolveError};

pub use invidious::InvidiousRecommender;
pub use ytdlp::YtDlpResolver;

/// Resuelve búsquedas/URLs y abre streams reproducibles
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamResolver: Send + Sync {
    /// Busca o extrae un único item
    async fn resolve(&self, query: &str, requested_by: UserId) -> Result<PlayableItem, ResolveError>;

    /// Items de una playlist, en orden
    async fn resolve_playlist(&self, url: &str, requested_by: UserId) -> Result<Vec<PlayableItem>, ResolveError>;

    /// Stream locators expire, so this runs again right before attaching.
    async fn open(&self, item: &PlayableItem) -> Result<StreamHandle, ResolveError>;
}

/// Fuente de recomendaciones para autoplay
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecommendationSource: Send + Sync {
    /// Candidatos rankeados a partir de `seeds`, sin ids de `excluding`
    async fn recommend(
        &self,
        seeds: &[ItemId],
        excluding: &HashSet<ItemId>,
        limit: usize,
    ) -> Result<Vec<PlayableItem>, RecommendationError>;
}

/// Resolver compartido con backpressure: N resoluciones concurrentes y timeout por llamada
pub struct BoundedResolver<R> {
    inner: R,
    permits: Semaphore,
    call_timeout: Duration,
}

impl<R: StreamResolver> BoundedResolver<R> {
    pub fn new(inner: R, max_concurrent: usize, call_timeout: Duration) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_concurrent.max(1)),
            call_timeout,
        }
    }

    async fn bounded<T, F>(&self, what: &str, call: F) -> Result<T, ResolveError>
    where
        F: std::future::Future<Output = Result<T, ResolveError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ResolveError::Extraction("resolver is shut down".to_string()))?;

        debug!("🎫 Permiso de resolución obtenido para: {}", what);
        match timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!("⏱️ Resolución expirada tras {:?}: {}", self.call_timeout, what);
                Err(ResolveError::Timeout(self.call_timeout))
            }
        }
    }
}

#[async_trait]
impl<R: StreamResolver> StreamResolver for BoundedResolver<R> {
    async fn resolve(&self, query: &str, requested_by: UserId) -> Result<PlayableItem, ResolveError> {
        self.bounded(query, self.inner.resolve(query, requested_by)).await
    }

    async fn resolve_playlist(&self, url: &str, requested_by: UserId) -> Result<Vec<PlayableItem>, ResolveError> {
        self.bounded(url, self.inner.resolve_playlist(url, requested_by)).await
    }

    async fn open(&self, item: &PlayableItem) -> Result<StreamHandle, ResolveError> {
        self.bounded(item.title(), self.inner.open(item)).await
    }
}

/// Verifica si el texto es una URL http(s)
pub fn is_url(query: &str) -> bool {
    url::Url::parse(query)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Verifica si la URL apunta a una playlist
pub fn is_playlist_url(url: &str) -> bool {
    url.contains("list=") || url.contains("/playlist")
}

/// Extrae el video ID de una URL de YouTube
pub fn extract_video_id(url: &str) -> Option<String> {
    static VIDEO_ID: OnceLock<Option<Regex>> = OnceLock::new();
    let regex = VIDEO_ID
        .get_or_init(|| {
            Regex::new(r"(?:youtube\.com/watch\?(?:.*&)?v=|youtu\.be/|youtube\.com/embed/|music\.youtube\.com/watch\?v=)([a-zA-Z0-9_-]{11})").ok()
        })
        .as_ref()?;

    regex
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

/// IDs sueltos de 11 caracteres (autocompletado) se tratan como videos
pub fn looks_like_video_id(query: &str) -> bool {
    query.len() == 11
        && query
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn test_youtube_url_detection() {
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            extract_video_id("https://youtu.be/dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?list=PL123&v=dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(extract_video_id("https://example.com/video"), None);
    }

    #[test]
    fn test_query_classification() {
        assert!(is_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(!is_url("never gonna give you up"));
        assert!(is_playlist_url("https://www.youtube.com/playlist?list=PL123"));
        assert!(!is_playlist_url("https://youtu.be/dQw4w9WgXcQ"));
        assert!(looks_like_video_id("dQw4w9WgXcQ"));
        assert!(!looks_like_video_id("hello world"));
    }

    /// Resolver falso que mide cuántas llamadas corren a la vez
    struct SlowResolver {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl StreamResolver for SlowResolver {
        async fn resolve(&self, query: &str, requested_by: UserId) -> Result<PlayableItem, ResolveError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(PlayableItem::new(query, query, query, requested_by))
        }

        async fn resolve_playlist(&self, _url: &str, _requested_by: UserId) -> Result<Vec<PlayableItem>, ResolveError> {
            Ok(Vec::new())
        }

        async fn open(&self, _item: &PlayableItem) -> Result<StreamHandle, ResolveError> {
            std::future::pending().await
        }
    }

    fn slow(delay: Duration) -> SlowResolver {
        SlowResolver {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_resolver_limits_concurrency() {
        let resolver = Arc::new(BoundedResolver::new(
            slow(Duration::from_secs(1)),
            3,
            Duration::from_secs(10),
        ));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve(&format!("q{}", i), UserId::new(1)).await })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(resolver.inner.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_resolver_times_out() {
        let resolver = BoundedResolver::new(slow(Duration::ZERO), 3, Duration::from_secs(10));
        let item = PlayableItem::new("x", "X", "https://youtu.be/x", UserId::new(1));

        assert_eq!(
            resolver.open(&item).await,
            Err(ResolveError::Timeout(Duration::from_secs(10)))
        );
    }
}
