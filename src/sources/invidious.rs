use async_trait::async_trait;
use serde::Deserialize;
use serenity::model::id::UserId;
use std::{
    collections::HashSet,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tracing::{debug, info, warn};

use super::RecommendationSource;
use crate::audio::item::{ItemId, Origin, PlayableItem};
use crate::error::RecommendationError;

/// Instancias públicas usadas si no se configura ninguna
pub const DEFAULT_INSTANCES: &[&str] = &[
    "https://yewtu.be",
    "https://inv.nadeko.net",
    "https://invidious.nerdvpn.de",
    "https://invidious.privacydev.net",
];

/// Plazo de cada petición para que todos los intentos quepan en `budget`
fn attempt_timeout(budget: Duration, attempts: usize) -> Duration {
    budget / attempts.max(1) as u32
}

/// Recomendaciones "relacionadas" vía la API de Invidious (`/api/v1/videos/{id}`)
pub struct InvidiousRecommender {
    client: reqwest::Client,
    instances: Vec<String>,
    current_instance: AtomicUsize,
    attempts_per_seed: usize,
    autoplay_user: UserId,
}

#[derive(Debug, Deserialize)]
struct VideoDetails {
    #[serde(rename = "recommendedVideos", default)]
    recommended_videos: Vec<RecommendedVideo>,
}

#[derive(Debug, Deserialize)]
struct RecommendedVideo {
    #[serde(rename = "videoId")]
    video_id: String,
    title: String,
    author: Option<String>,
    #[serde(rename = "lengthSeconds")]
    length_seconds: Option<u64>,
    #[serde(rename = "videoThumbnails", default)]
    video_thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
    width: u32,
}

impl InvidiousRecommender {
    /// `autoplay_user` is recorded as the contributor of recommended items.
    ///
    /// `budget` is the time one seed may take across all its instance
    /// attempts; each request gets an equal share of it.
    pub fn new(
        instances: Vec<String>,
        autoplay_user: UserId,
        budget: Duration,
    ) -> Result<Self, RecommendationError> {
        let instances: Vec<String> = if instances.is_empty() {
            DEFAULT_INSTANCES.iter().map(|s| s.to_string()).collect()
        } else {
            instances
        };
        let attempts_per_seed = instances.len().min(3);
        let per_attempt = attempt_timeout(budget, attempts_per_seed);

        let client = reqwest::Client::builder()
            .timeout(per_attempt)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| RecommendationError::Unavailable(format!("http client: {}", e)))?;

        debug!("🌐 Invidious: {} intentos por semilla, {:?} cada uno", attempts_per_seed, per_attempt);

        Ok(Self {
            client,
            attempts_per_seed,
            instances,
            current_instance: AtomicUsize::new(0),
            autoplay_user,
        })
    }

    /// Obtiene la siguiente instancia de Invidious
    fn next_instance(&self) -> &str {
        let current = self.current_instance.fetch_add(1, Ordering::Relaxed);
        &self.instances[current % self.instances.len()]
    }

    async fn fetch_related(&self, seed: &ItemId) -> Result<Vec<RecommendedVideo>, RecommendationError> {
        let mut last_error = String::new();

        for _ in 0..self.attempts_per_seed {
            let instance = self.next_instance();
            let url = format!("{}/api/v1/videos/{}", instance, seed);

            match self.try_fetch(&url).await {
                Ok(details) => {
                    debug!("✅ {} recomendaciones de {}", details.recommended_videos.len(), instance);
                    return Ok(details.recommended_videos);
                }
                Err(e) => {
                    warn!("❌ Falló recomendación en {}: {}", instance, e);
                    last_error = format!("{}: {}", instance, e);
                }
            }
        }

        Err(RecommendationError::Unavailable(last_error))
    }

    async fn try_fetch(&self, url: &str) -> Result<VideoDetails, reqwest::Error> {
        self.client
            .get(url)
            .query(&[("fields", "recommendedVideos")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    fn to_item(&self, video: RecommendedVideo) -> PlayableItem {
        let url = format!("https://www.youtube.com/watch?v={}", video.video_id);
        let thumbnail = video
            .video_thumbnails
            .into_iter()
            .find(|t| t.width >= 320)
            .map(|t| t.url);

        let mut item = PlayableItem::new(video.video_id, video.title, url, self.autoplay_user)
            .with_origin(Origin::Autoplay);
        if let Some(author) = video.author {
            item = item.with_artist(author);
        }
        if let Some(secs) = video.length_seconds.filter(|s| *s > 0) {
            item = item.with_duration(Duration::from_secs(secs));
        }
        if let Some(thumbnail) = thumbnail {
            item = item.with_thumbnail(thumbnail);
        }
        item
    }
}

#[async_trait]
impl RecommendationSource for InvidiousRecommender {
    async fn recommend(
        &self,
        seeds: &[ItemId],
        excluding: &HashSet<ItemId>,
        limit: usize,
    ) -> Result<Vec<PlayableItem>, RecommendationError> {
        let mut per_seed = Vec::with_capacity(seeds.len());
        let mut failures = 0;

        for seed in seeds {
            match self.fetch_related(seed).await {
                Ok(videos) => per_seed.push(videos),
                Err(e) => {
                    failures += 1;
                    warn!("⚠️ Sin recomendaciones para {}: {}", seed, e);
                }
            }
        }

        if failures == seeds.len() && !seeds.is_empty() {
            return Err(RecommendationError::Unavailable(format!(
                "all {} seeds failed",
                failures
            )));
        }

        let picked = merge_candidates(per_seed, seeds, excluding, limit);
        info!("🎲 {} recomendaciones para {} semillas", picked.len(), seeds.len());
        Ok(picked.into_iter().map(|video| self.to_item(video)).collect())
    }
}

/// Intercala las listas por semilla, sin repetidos ni excluidos
fn merge_candidates(
    per_seed: Vec<Vec<RecommendedVideo>>,
    seeds: &[ItemId],
    excluding: &HashSet<ItemId>,
    limit: usize,
) -> Vec<RecommendedVideo> {
    let mut seen: HashSet<String> = seeds.iter().map(|s| s.to_string()).collect();
    seen.extend(excluding.iter().map(|s| s.to_string()));

    let mut iters: Vec<_> = per_seed.into_iter().map(Vec::into_iter).collect();
    let mut picked = Vec::new();

    while picked.len() < limit && !iters.is_empty() {
        iters.retain_mut(|iter| {
            if picked.len() >= limit {
                return true;
            }
            for video in iter.by_ref() {
                if seen.insert(video.video_id.clone()) {
                    picked.push(video);
                    return true;
                }
            }
            false
        });
    }

    picked
}
