use futures::future::join_all;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use super::item::{ItemId, Origin, PlayableItem};
use crate::config::PlayerSettings;
use crate::error::RecommendationError;
use crate::sources::RecommendationSource;

/// Últimos ids reproducidos, el más reciente al final
#[derive(Debug, Clone)]
pub struct RecentHistory {
    ids: VecDeque<ItemId>,
    limit: usize,
}

impl RecentHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(limit.min(64)),
            limit: limit.max(1),
        }
    }

    /// A replayed id moves to the most recent position instead of duplicating.
    pub fn record(&mut self, id: ItemId) {
        self.ids.retain(|existing| existing != &id);
        self.ids.push_back(id);
        while self.ids.len() > self.limit {
            self.ids.pop_front();
        }
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.ids.contains(id)
    }

    /// Hasta `count` semillas, la más reciente primero
    pub fn seeds(&self, count: usize) -> Vec<ItemId> {
        self.ids.iter().rev().take(count).cloned().collect()
    }

    pub fn ids(&self) -> HashSet<ItemId> {
        self.ids.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// How a fetch spreads its request over the most recent history entries.
///
/// Seed `i` (0 = most recent) weighs `recency_decay^i`. A decay of `1.0`
/// splits evenly; lower values favour what just played. Every seed is asked
/// for at least two candidates so an older seed never vanishes entirely.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendPolicy {
    pub seed_count: usize,
    pub recency_decay: f32,
}

impl BlendPolicy {
    const MIN_PER_SEED: usize = 2;

    pub fn quotas(&self, seeds: usize, limit: usize) -> Vec<usize> {
        let weights: Vec<f32> = (0..seeds).map(|i| self.recency_decay.powi(i as i32)).collect();
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            return vec![Self::MIN_PER_SEED; seeds];
        }

        weights
            .iter()
            .map(|w| ((limit as f32 * w / total).ceil() as usize).max(Self::MIN_PER_SEED))
            .collect()
    }
}

/// Resultado de un `try_pull`
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    Ready(PlayableItem),
    /// Buffer vacío, pero hay una búsqueda en curso
    Pending,
    Empty,
}

#[derive(Debug)]
struct EngineState {
    buffer: VecDeque<PlayableItem>,
    history: RecentHistory,
    // Bumped by every clear; a fetch started under an older value is dropped.
    generation: u64,
}

/// Autoplay lookahead for one session.
///
/// Owns the prefetch buffer and the recent history. Its state sits behind a
/// short synchronous lock, never held across an await, so a background
/// refill can complete while the controller holds the session guard and
/// waits on it.
pub struct AutoplayEngine {
    guild_id: GuildId,
    source: Arc<dyn RecommendationSource>,
    depth: usize,
    blend: BlendPolicy,
    fetch_timeout: Duration,
    state: Mutex<EngineState>,
    fetching: Arc<watch::Sender<bool>>,
    refill_task: Mutex<Option<JoinHandle<()>>>,
}

/// Libera el flag de búsqueda al soltarse, incluso si la tarea se aborta
struct FetchClaim(Arc<watch::Sender<bool>>);

impl Drop for FetchClaim {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl AutoplayEngine {
    pub fn new(guild_id: GuildId, source: Arc<dyn RecommendationSource>, settings: &PlayerSettings) -> Self {
        let (fetching, _) = watch::channel(false);
        Self {
            guild_id,
            source,
            depth: settings.autoplay_buffer_depth.max(1),
            blend: BlendPolicy {
                seed_count: settings.autoplay_seed_count.max(1),
                recency_decay: settings.autoplay_recency_decay,
            },
            fetch_timeout: settings.recommend_timeout,
            state: Mutex::new(EngineState {
                buffer: VecDeque::new(),
                history: RecentHistory::new(settings.history_limit),
                generation: 0,
            }),
            fetching: Arc::new(fetching),
            refill_task: Mutex::new(None),
        }
    }

    /// Registra un item que empezó a sonar
    pub fn record_played(&self, item: &PlayableItem) {
        let mut state = self.state.lock();
        state.history.record(item.id().clone());
        state.buffer.retain(|buffered| buffered.id() != item.id());
    }

    /// Saca el item más antiguo del buffer sin esperar
    pub fn try_pull(&self) -> Pull {
        if let Some(item) = self.state.lock().buffer.pop_front() {
            debug!("🎲 [{}] Autoplay entrega: {}", self.guild_id, item.title());
            return Pull::Ready(item);
        }

        if self.is_fetching() {
            Pull::Pending
        } else {
            Pull::Empty
        }
    }

    /// Pull that waits out a pending fetch, or fetches inline when nothing
    /// is in flight. Failures degrade to `None`.
    pub async fn next(&self) -> Option<PlayableItem> {
        match self.try_pull() {
            Pull::Ready(item) => return Some(item),
            Pull::Pending => self.wait_pending().await,
            Pull::Empty => {
                if let Err(e) = self.fill_now().await {
                    warn!("⚠️ [{}] Autoplay sin recomendaciones: {}", self.guild_id, e);
                }
            }
        }

        match self.try_pull() {
            Pull::Ready(item) => Some(item),
            _ => None,
        }
    }

    /// Starts a background refill when the buffer is under its target depth
    /// and no fetch is already running.
    pub fn refill_in_background(self: &Arc<Self>) {
        if self.state.lock().buffer.len() >= self.depth {
            return;
        }
        let Some(claim) = self.claim() else {
            debug!("⏳ [{}] Ya hay una búsqueda de autoplay en curso", self.guild_id);
            return;
        };

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match engine.fetch(claim).await {
                Ok(added) => debug!("📥 [{}] Prefetch de autoplay: {} nuevos", engine.guild_id, added),
                Err(e) => warn!("⚠️ [{}] Prefetch de autoplay falló: {}", engine.guild_id, e),
            }
        });
        *self.refill_task.lock() = Some(handle);
    }

    /// Busca recomendaciones ahora; si ya hay una búsqueda, espera a que termine
    pub async fn fill_now(&self) -> Result<usize, RecommendationError> {
        match self.claim() {
            Some(claim) => self.fetch(claim).await,
            None => {
                self.wait_pending().await;
                Ok(0)
            }
        }
    }

    /// Espera a que termine la búsqueda en curso, como mucho `fetch_timeout`
    pub async fn wait_pending(&self) {
        let mut rx = self.fetching.subscribe();
        if timeout(self.fetch_timeout, rx.wait_for(|fetching| !*fetching))
            .await
            .is_err()
        {
            warn!("⏱️ [{}] La búsqueda de autoplay sigue en curso", self.guild_id);
        }
    }

    /// Drops buffered items. An in-flight fetch will discard its result.
    pub fn clear_buffer(&self) -> usize {
        let mut state = self.state.lock();
        state.generation += 1;
        let cleared = state.buffer.len();
        state.buffer.clear();
        cleared
    }

    /// Borra historial y buffer (el buffer se filtró contra el historial viejo)
    pub fn clear_history(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.history.clear();
        state.buffer.clear();
        info!("🧹 [{}] Historial de autoplay borrado", self.guild_id);
    }

    pub fn buffered(&self) -> Vec<PlayableItem> {
        self.state.lock().buffer.iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    pub fn is_fetching(&self) -> bool {
        *self.fetching.borrow()
    }

    /// Aborta el prefetch en segundo plano
    pub fn shutdown(&self) {
        if let Some(handle) = self.refill_task.lock().take() {
            handle.abort();
        }
    }

    fn claim(&self) -> Option<FetchClaim> {
        let claimed = self.fetching.send_if_modified(|fetching| {
            if *fetching {
                false
            } else {
                *fetching = true;
                true
            }
        });
        claimed.then(|| FetchClaim(Arc::clone(&self.fetching)))
    }

    async fn fetch(&self, _claim: FetchClaim) -> Result<usize, RecommendationError> {
        let (seeds, excluding, generation) = {
            let state = self.state.lock();
            let mut excluding = state.history.ids();
            excluding.extend(state.buffer.iter().map(|item| item.id().clone()));
            (state.history.seeds(self.blend.seed_count), excluding, state.generation)
        };

        if seeds.is_empty() {
            debug!("🎲 [{}] Sin historial, nada que recomendar", self.guild_id);
            return Ok(0);
        }

        let quotas = self.blend.quotas(seeds.len(), self.depth * 2);
        debug!("🎲 [{}] Pidiendo recomendaciones: semillas {:?}, cuotas {:?}", self.guild_id, seeds, quotas);

        // Cada semilla tiene su propio plazo: una lenta no tira las demás
        let calls = seeds.iter().zip(quotas).map(|(seed, quota)| {
            let excluding = &excluding;
            async move {
                let call = self.source.recommend(std::slice::from_ref(seed), excluding, quota);
                match timeout(self.fetch_timeout, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("⏱️ [{}] Semilla {} sin respuesta a tiempo", self.guild_id, seed);
                        Err(RecommendationError::Timeout(self.fetch_timeout))
                    }
                }
            }
        });

        let results = join_all(calls).await;

        let mut lists = Vec::with_capacity(results.len());
        let mut last_error = None;
        for result in results {
            match result {
                Ok(items) => lists.push(items),
                Err(e) => last_error = Some(e),
            }
        }
        if lists.is_empty() {
            return Err(last_error.unwrap_or_else(|| RecommendationError::Unavailable("no seeds answered".to_string())));
        }

        let mut state = self.state.lock();
        if state.generation != generation {
            debug!("🗑️ [{}] Recomendaciones descartadas (sesión limpiada)", self.guild_id);
            return Ok(0);
        }

        let mut added = 0;
        for item in interleave(lists) {
            if state.buffer.len() >= self.depth {
                break;
            }
            if state.history.contains(item.id()) || state.buffer.iter().any(|b| b.id() == item.id()) {
                continue;
            }
            debug!("➕ [{}] Autoplay en buffer: {}", self.guild_id, item.title());
            state.buffer.push_back(item.with_origin(Origin::Autoplay));
            added += 1;
        }

        Ok(added)
    }
}

/// Toma un candidato de cada lista por turno, la más reciente primero
fn interleave(lists: Vec<Vec<PlayableItem>>) -> Vec<PlayableItem> {
    let total = lists.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = lists.into_iter().map(Vec::into_iter).collect();
    let mut merged = Vec::with_capacity(total);

    while merged.len() < total {
        for iter in iters.iter_mut() {
            if let Some(item) = iter.next() {
                merged.push(item);
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MockRecommendationSource;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;
    use tokio::sync::Notify;

    fn song(id: &str) -> PlayableItem {
        PlayableItem::new(id, format!("Song {}", id), format!("https://youtu.be/{}", id), UserId::new(3))
    }

    fn ids(items: &[PlayableItem]) -> Vec<String> {
        items.iter().map(|i| i.id().to_string()).collect()
    }

    fn engine(source: impl RecommendationSource + 'static) -> Arc<AutoplayEngine> {
        Arc::new(AutoplayEngine::new(
            GuildId::new(1),
            Arc::new(source),
            &PlayerSettings::default(),
        ))
    }

    #[test]
    fn test_history_is_bounded_and_ordered() {
        let mut history = RecentHistory::new(3);
        for id in ["A", "B", "C", "B", "D"] {
            history.record(ItemId::from(id));
        }

        assert_eq!(history.len(), 3);
        assert!(!history.contains(&ItemId::from("A")));
        assert_eq!(
            history.seeds(2),
            vec![ItemId::from("D"), ItemId::from("B")]
        );
    }

    #[test]
    fn test_blend_quotas() {
        let even = BlendPolicy { seed_count: 3, recency_decay: 1.0 };
        assert_eq!(even.quotas(3, 6), vec![2, 2, 2]);
        assert_eq!(even.quotas(1, 6), vec![6]);

        let recent_first = BlendPolicy { seed_count: 3, recency_decay: 0.5 };
        assert_eq!(recent_first.quotas(3, 6), vec![4, 2, 2]);
    }

    #[test]
    fn test_interleave_takes_turns() {
        let merged = interleave(vec![vec![song("A"), song("B"), song("C")], vec![song("D")]]);
        assert_eq!(ids(&merged), vec!["A", "D", "B", "C"]);
    }

    #[tokio::test]
    async fn test_autoplay_seeds_from_history_and_skips_repeats() {
        let mut source = MockRecommendationSource::new();
        source
            .expect_recommend()
            .withf(|seeds, excluding, _| seeds.to_vec() == vec![ItemId::from("A")] && excluding.contains(&ItemId::from("A")))
            .times(1)
            .returning(|_, _, _| Ok(vec![song("A"), song("B"), song("C")]));

        let engine = engine(source);
        engine.record_played(&song("A"));

        let next = engine.next().await.unwrap();
        assert_eq!(next.id().as_str(), "B");
        assert_eq!(ids(&engine.buffered()), vec!["C"]);
    }

    #[tokio::test]
    async fn test_blend_asks_each_recent_seed() {
        let mut source = MockRecommendationSource::new();
        source
            .expect_recommend()
            .withf(|seeds, _, limit| seeds.to_vec() == vec![ItemId::from("C")] && *limit == 2)
            .returning(|_, _, _| Ok(vec![song("C1"), song("C2")]));
        source
            .expect_recommend()
            .withf(|seeds, _, _| seeds.to_vec() == vec![ItemId::from("B")])
            .returning(|_, _, _| Ok(vec![song("B1")]));
        source
            .expect_recommend()
            .withf(|seeds, _, _| seeds.to_vec() == vec![ItemId::from("A")])
            .returning(|_, _, _| Err(RecommendationError::Unavailable("down".into())));

        let engine = engine(source);
        for id in ["A", "B", "C"] {
            engine.record_played(&song(id));
        }

        assert_eq!(engine.fill_now().await, Ok(3));
        assert_eq!(ids(&engine.buffered()), vec!["C1", "B1", "C2"]);
    }

    #[tokio::test]
    async fn test_failure_leaves_buffer_empty() {
        let mut source = MockRecommendationSource::new();
        source
            .expect_recommend()
            .returning(|_, _, _| Err(RecommendationError::Unavailable("down".into())));

        let engine = engine(source);
        engine.record_played(&song("A"));

        assert!(engine.next().await.is_none());
        assert!(!engine.is_fetching());
        assert_eq!(engine.try_pull(), Pull::Empty);
    }

    #[tokio::test]
    async fn test_no_history_no_request() {
        let mut source = MockRecommendationSource::new();
        source.expect_recommend().never();

        let engine = engine(source);
        assert_eq!(engine.fill_now().await, Ok(0));
    }

    #[tokio::test]
    async fn test_record_played_purges_buffer() {
        let mut source = MockRecommendationSource::new();
        source
            .expect_recommend()
            .returning(|_, _, _| Ok(vec![song("B"), song("C")]));

        let engine = engine(source);
        engine.record_played(&song("A"));
        engine.fill_now().await.unwrap();

        engine.record_played(&song("B"));
        assert_eq!(ids(&engine.buffered()), vec!["C"]);
    }

    /// Fuente que no responde hasta que se abre la compuerta
    struct GatedSource {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl RecommendationSource for GatedSource {
        async fn recommend(
            &self,
            _seeds: &[ItemId],
            _excluding: &HashSet<ItemId>,
            _limit: usize,
        ) -> Result<Vec<PlayableItem>, RecommendationError> {
            self.gate.notified().await;
            Ok(vec![song("X"), song("Y")])
        }
    }

    #[tokio::test]
    async fn test_background_refill_is_pending_then_ready() {
        let gate = Arc::new(Notify::new());
        let engine = engine(GatedSource { gate: gate.clone() });
        engine.record_played(&song("A"));

        engine.refill_in_background();
        assert_eq!(engine.try_pull(), Pull::Pending);

        gate.notify_one();
        engine.wait_pending().await;

        assert_eq!(ids(&engine.buffered()), vec!["X", "Y"]);
    }

    #[tokio::test]
    async fn test_clear_discards_in_flight_fetch() {
        let gate = Arc::new(Notify::new());
        let engine = engine(GatedSource { gate: gate.clone() });
        engine.record_played(&song("A"));

        engine.refill_in_background();
        // deja que la búsqueda tome su snapshot y quede esperando
        tokio::task::yield_now().await;
        engine.clear_history();

        gate.notify_one();
        engine.wait_pending().await;

        assert_eq!(engine.try_pull(), Pull::Empty);
        assert_eq!(engine.history_len(), 0);
    }

    /// Responde para todas las semillas salvo `stuck`, que nunca contesta
    struct StuckSeedSource {
        stuck: ItemId,
    }

    #[async_trait]
    impl RecommendationSource for StuckSeedSource {
        async fn recommend(
            &self,
            seeds: &[ItemId],
            _excluding: &HashSet<ItemId>,
            _limit: usize,
        ) -> Result<Vec<PlayableItem>, RecommendationError> {
            if seeds.contains(&self.stuck) {
                std::future::pending::<()>().await;
            }
            Ok(vec![song("X"), song("Y")])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_seed_keeps_answers_from_other_seeds() {
        let engine = engine(StuckSeedSource { stuck: ItemId::from("A") });
        engine.record_played(&song("A"));
        engine.record_played(&song("B"));

        assert_eq!(engine.fill_now().await, Ok(2));
        assert_eq!(ids(&engine.buffered()), vec!["X", "Y"]);
        assert!(!engine.is_fetching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_source_times_out() {
        let engine = engine(GatedSource { gate: Arc::new(Notify::new()) });
        engine.record_played(&song("A"));

        assert_eq!(
            engine.fill_now().await,
            Err(RecommendationError::Timeout(PlayerSettings::default().recommend_timeout))
        );
        assert!(!engine.is_fetching());
    }
}
