use serenity::model::id::GuildId;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex, MutexGuard},
    time::{timeout, Instant},
};
use tracing::{debug, error, info, warn};

use super::{
    autoplay::AutoplayEngine,
    events::{EventBus, SessionEvent},
    idle::{IdleExpired, IdleTimer},
    item::{Origin, PlayableItem, StreamToken},
    queue::SessionQueue,
    transport::{AudioTransport, StreamEndNotifier},
};
use crate::{
    config::PlayerSettings,
    error::{PlayerError, PlayerResult, TransportError},
    sources::{RecommendationSource, StreamResolver},
};

/// Dependencias compartidas por todas las sesiones
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn StreamResolver>,
    pub recommender: Arc<dyn RecommendationSource>,
    pub transport: Arc<dyn AudioTransport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    /// Resolviendo o conectando un stream
    Starting,
    Playing,
    Paused,
}

/// Un item descartado durante un avance
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedItem {
    pub title: String,
    pub error: PlayerError,
}

/// Outcome of one playback transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Started {
        item: PlayableItem,
        skipped: Vec<SkippedItem>,
    },
    /// Nothing left to play; the session is idle and the idle timer armed.
    Idle { skipped: Vec<SkippedItem> },
    /// Another transition completed while this call waited for the guard.
    Superseded,
    /// `stop()` arrived while the transition was suspended; its result was
    /// discarded.
    Cancelled,
}

/// Resultado de agregar a la cola
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub added: usize,
    /// Posición (1-based) del primer item agregado
    pub position: usize,
    /// Present when the session was idle and the enqueue started playback.
    pub started: Option<PlayerResult<Advance>>,
}

/// Vista de solo lectura para comandos como /queue y /nowplaying
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub status: PlaybackStatus,
    pub current: Option<PlayableItem>,
    pub elapsed: Option<Duration>,
    pub paused: bool,
    pub queue: Vec<PlayableItem>,
    pub queue_duration: Duration,
    pub autoplay_enabled: bool,
    pub autoplay_buffer: Vec<PlayableItem>,
    pub history_len: usize,
}

/// Qué hizo el controlador con una expiración del timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleVerdict {
    /// The timer was rearmed or cancelled after this expiry was sent.
    Stale,
    /// Still playing: timer rearmed.
    Active,
    /// Stopped and closed; the registry must drop the session.
    Expired,
}

struct ActiveStream {
    item: PlayableItem,
    token: StreamToken,
    started_at: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl ActiveStream {
    fn new(item: PlayableItem, token: StreamToken) -> Self {
        Self {
            item,
            token,
            started_at: Instant::now(),
            paused_at: None,
            paused_total: Duration::ZERO,
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        let paused = self.paused_total
            + self
                .paused_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
        now.saturating_duration_since(self.started_at).saturating_sub(paused)
    }
}

/// Everything the guard protects.
struct SessionState {
    status: PlaybackStatus,
    current: Option<ActiveStream>,
    queue: SessionQueue,
    autoplay_enabled: bool,
    next_token: u64,
    last_activity: Instant,
}

/// Playback state machine for one guild.
///
/// Every state-changing operation runs under one async mutex, the session
/// guard, held across resolver and recommendation awaits so that a
/// stream-end callback and a user command can never both start a track.
/// Three counters live outside the guard so callers can tell, once they
/// hold it, whether the world moved on while they waited:
///
/// - `transitions` grows at the end of every transition. An `advance()`
///   that sees it changed returns [`Advance::Superseded`].
/// - `epoch` grows as soon as `stop()` is called, before it waits for the
///   guard. A suspended transition compares it after each await and
///   discards its result.
/// - `active_token` mirrors the current stream token (0 = none) for
///   `skip()`.
pub struct PlaybackController {
    guild_id: GuildId,
    me: Weak<PlaybackController>,
    state: Mutex<SessionState>,
    transitions: AtomicU64,
    epoch: AtomicU64,
    active_token: AtomicU64,
    closed: AtomicBool,
    resolver: Arc<dyn StreamResolver>,
    transport: Arc<dyn AudioTransport>,
    autoplay: Arc<AutoplayEngine>,
    idle: IdleTimer,
    events: EventBus,
    settings: PlayerSettings,
}

impl PlaybackController {
    /// Builds an idle session and arms its idle timer.
    pub fn new(
        guild_id: GuildId,
        collaborators: &Collaborators,
        settings: PlayerSettings,
        events: EventBus,
        idle_tx: mpsc::UnboundedSender<IdleExpired>,
    ) -> Arc<Self> {
        let controller = Arc::new_cyclic(|me| Self {
            guild_id,
            me: me.clone(),
            state: Mutex::new(SessionState {
                status: PlaybackStatus::Idle,
                current: None,
                queue: SessionQueue::new(settings.max_queue_size),
                autoplay_enabled: settings.autoplay_by_default,
                next_token: 0,
                last_activity: Instant::now(),
            }),
            transitions: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            active_token: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            resolver: Arc::clone(&collaborators.resolver),
            transport: Arc::clone(&collaborators.transport),
            autoplay: Arc::new(AutoplayEngine::new(
                guild_id,
                Arc::clone(&collaborators.recommender),
                &settings,
            )),
            idle: IdleTimer::new(guild_id, settings.idle_timeout, idle_tx),
            events,
            settings,
        });

        controller.idle.arm();
        info!("🎛️ [{}] Sesión creada", guild_id);
        controller
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Agrega un item; si la sesión está inactiva, empieza a reproducir
    pub async fn enqueue(&self, item: PlayableItem) -> PlayerResult<Enqueued> {
        let mut state = self.lock_open().await?;
        let position = state.queue.append(item)?;
        let started = self.start_if_idle(&mut state).await;

        Ok(Enqueued {
            added: 1,
            position,
            started,
        })
    }

    /// Agrega una playlist en orden, recortada al límite de playlist y al
    /// espacio libre de la cola
    pub async fn enqueue_many(&self, items: Vec<PlayableItem>) -> PlayerResult<Enqueued> {
        let mut state = self.lock_open().await?;
        let offered = items.len();
        let items: Vec<_> = items.into_iter().take(self.settings.max_playlist_size).collect();

        let position = state.queue.len() + 1;
        let added = state.queue.append_many(items);
        if added == 0 && offered > 0 {
            return Err(PlayerError::QueueFull {
                max: self.settings.max_queue_size,
            });
        }

        let started = self.start_if_idle(&mut state).await;
        Ok(Enqueued {
            added,
            position,
            started,
        })
    }

    /// Starts the next item unless another transition already did while
    /// this call waited.
    pub async fn advance(&self) -> PlayerResult<Advance> {
        let seen = self.transitions.load(Ordering::SeqCst);
        let mut state = self.lock_open().await?;

        if self.transitions.load(Ordering::SeqCst) != seen {
            debug!("⏭️ [{}] Avance ya resuelto por otra transición", self.guild_id);
            return Ok(Advance::Superseded);
        }

        self.advance_locked(&mut state).await
    }

    /// Called by the transport when the stream behind `token` finished.
    pub async fn on_stream_ended(&self, token: StreamToken) -> PlayerResult<Advance> {
        let mut state = self.lock_open().await?;

        match state.current.as_ref() {
            Some(active) if active.token == token => {
                debug!("🏁 [{}] Terminó: {}", self.guild_id, active.item.title());
            }
            _ => {
                warn!("👻 [{}] Callback de fin obsoleto para stream {}", self.guild_id, token);
                return Err(PlayerError::StaleCallback(token.get()));
            }
        }

        self.advance_locked(&mut state).await
    }

    /// Salta la canción actual
    pub async fn skip(&self) -> PlayerResult<Advance> {
        let seen = self.active_token.load(Ordering::SeqCst);
        let mut state = self.lock_open().await?;

        // The stream the user wanted gone already ended and something else started.
        if self.active_token.load(Ordering::SeqCst) != seen {
            return Ok(Advance::Superseded);
        }
        if state.current.is_none() {
            return Err(PlayerError::NothingPlaying);
        }

        info!("⏭️ [{}] Canción saltada", self.guild_id);
        self.advance_locked(&mut state).await
    }

    /// Detiene la reproducción y limpia la cola; devuelve cuántos items se borraron
    pub async fn stop(&self) -> PlayerResult<usize> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock_open().await?;

        let cleared = self.stop_locked(&mut state).await;
        self.idle.arm();
        info!("⏹️ [{}] Reproducción detenida", self.guild_id);
        Ok(cleared)
    }

    /// Pausa la reproducción actual
    pub async fn pause(&self) -> PlayerResult<()> {
        let mut state = self.lock_open().await?;
        match state.status {
            PlaybackStatus::Playing => {}
            PlaybackStatus::Paused => return Ok(()),
            _ => return Err(PlayerError::NothingPlaying),
        }

        self.transport.pause(self.guild_id).await?;

        let now = Instant::now();
        state.status = PlaybackStatus::Paused;
        if let Some(active) = state.current.as_mut() {
            active.paused_at = Some(now);
        }
        state.last_activity = now;
        self.idle.arm();

        info!("⏸️ [{}] Reproducción pausada", self.guild_id);
        Ok(())
    }

    /// Reanuda la reproducción
    pub async fn resume(&self) -> PlayerResult<()> {
        let mut state = self.lock_open().await?;
        match state.status {
            PlaybackStatus::Paused => {}
            PlaybackStatus::Playing => return Ok(()),
            _ => return Err(PlayerError::NothingPlaying),
        }

        self.transport.resume(self.guild_id).await?;

        let now = Instant::now();
        state.status = PlaybackStatus::Playing;
        if let Some(active) = state.current.as_mut() {
            if let Some(at) = active.paused_at.take() {
                active.paused_total += now.saturating_duration_since(at);
            }
        }
        state.last_activity = now;
        self.idle.arm();

        info!("▶️ [{}] Reproducción reanudada", self.guild_id);
        Ok(())
    }

    /// Quita el item en `index` (0-based) de la cola
    pub async fn remove_at(&self, index: usize) -> PlayerResult<PlayableItem> {
        let mut state = self.lock_open().await?;
        state.queue.remove_at(index)
    }

    pub async fn move_to(&self, from: usize, to: usize) -> PlayerResult<()> {
        let mut state = self.lock_open().await?;
        state.queue.move_to(from, to)
    }

    pub async fn shuffle(&self) -> PlayerResult<usize> {
        let mut state = self.lock_open().await?;
        Ok(state.queue.shuffle())
    }

    pub async fn set_autoplay(&self, enabled: bool) -> PlayerResult<bool> {
        let mut state = self.lock_open().await?;
        self.apply_autoplay(&mut state, enabled);
        Ok(enabled)
    }

    pub async fn toggle_autoplay(&self) -> PlayerResult<bool> {
        let mut state = self.lock_open().await?;
        let enabled = !state.autoplay_enabled;
        self.apply_autoplay(&mut state, enabled);
        Ok(enabled)
    }

    /// Borra el historial reciente y el buffer de autoplay
    pub async fn clear_history(&self) -> PlayerResult<()> {
        let _state = self.lock_open().await?;
        self.autoplay.clear_history();
        Ok(())
    }

    pub async fn snapshot(&self) -> PlayerResult<Snapshot> {
        let state = self.lock_open().await?;
        let now = Instant::now();

        Ok(Snapshot {
            status: state.status,
            current: state.current.as_ref().map(|active| active.item.clone()),
            elapsed: state.current.as_ref().map(|active| active.elapsed(now)),
            paused: state.status == PlaybackStatus::Paused,
            queue: state.queue.peek_all(),
            queue_duration: state.queue.total_duration(),
            autoplay_enabled: state.autoplay_enabled,
            autoplay_buffer: self.autoplay.buffered(),
            history_len: self.autoplay.history_len(),
        })
    }

    /// Handles an idle-timer expiry under the guard.
    pub async fn on_idle_timeout(&self, generation: u64) -> PlayerResult<IdleVerdict> {
        let mut state = self.lock_open().await?;

        if !self.idle.is_current(generation) {
            debug!("⏲️ [{}] Expiración obsoleta (gen {})", self.guild_id, generation);
            return Ok(IdleVerdict::Stale);
        }

        if state.status == PlaybackStatus::Playing {
            self.idle.arm();
            return Ok(IdleVerdict::Active);
        }

        info!(
            "💤 [{}] Inactiva desde hace {:?}, cerrando sesión",
            self.guild_id,
            state.last_activity.elapsed()
        );
        self.stop_locked(&mut state).await;
        self.close();
        Ok(IdleVerdict::Expired)
    }

    /// Stops playback and closes the session. Later calls fail with
    /// `SessionNotFound`. Idempotent.
    pub async fn shutdown(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if self.is_closed() {
            return;
        }

        self.stop_locked(&mut state).await;
        self.close();
    }

    async fn lock_open(&self) -> PlayerResult<MutexGuard<'_, SessionState>> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        // Pudo cerrarse mientras esperábamos el guard
        self.ensure_open()?;
        Ok(state)
    }

    fn ensure_open(&self) -> PlayerResult<()> {
        if self.is_closed() {
            Err(PlayerError::SessionNotFound(self.guild_id))
        } else {
            Ok(())
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.idle.cancel();
        self.autoplay.shutdown();
        info!("🔒 [{}] Sesión cerrada", self.guild_id);
    }

    fn cancelled(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    async fn start_if_idle(&self, state: &mut SessionState) -> Option<PlayerResult<Advance>> {
        if state.status == PlaybackStatus::Idle {
            Some(self.advance_locked(state).await)
        } else {
            None
        }
    }

    fn apply_autoplay(&self, state: &mut SessionState, enabled: bool) {
        state.autoplay_enabled = enabled;
        if enabled && state.current.is_some() {
            self.autoplay.refill_in_background();
        }
        info!(
            "🎲 [{}] Autoplay {}",
            self.guild_id,
            if enabled { "activado" } else { "desactivado" }
        );
    }

    /// Replaces whatever is playing with the next playable candidate,
    /// skipping items that fail to resolve or attach.
    async fn advance_locked(&self, state: &mut SessionState) -> PlayerResult<Advance> {
        let epoch = self.epoch.load(Ordering::SeqCst);

        if state.current.take().is_some() {
            self.transport.detach(self.guild_id).await;
        }
        self.active_token.store(0, Ordering::SeqCst);
        state.status = PlaybackStatus::Starting;

        let mut skipped = Vec::new();
        let mut failures: u8 = 0;

        let outcome = loop {
            let Some(item) = self.next_candidate(state).await else {
                break Ok(Advance::Idle { skipped });
            };
            if self.cancelled(epoch) {
                debug!("🚫 [{}] Avance cancelado, descartando: {}", self.guild_id, item.title());
                break Ok(Advance::Cancelled);
            }

            match self.start_item(state, &item, epoch).await {
                Ok(Some(token)) => {
                    state.current = Some(ActiveStream::new(item.clone(), token));
                    break Ok(Advance::Started { item, skipped });
                }
                Ok(None) => break Ok(Advance::Cancelled),
                Err(PlayerError::Transport(TransportError::NotConnected(guild_id))) => {
                    // Sin conexión de voz no tiene sentido seguir consumiendo la cola
                    if item.origin() == Origin::Manual {
                        state.queue.push_front(item);
                    }
                    break Err(PlayerError::Transport(TransportError::NotConnected(guild_id)));
                }
                Err(error) => {
                    failures += 1;
                    warn!(
                        "❌ [{}] No se pudo reproducir {} ({}/{}): {}",
                        self.guild_id,
                        item.title(),
                        failures,
                        self.settings.max_resolve_failures,
                        error
                    );
                    self.events.publish(SessionEvent::TrackSkipped {
                        guild_id: self.guild_id,
                        title: item.title().to_string(),
                        reason: error.user_message(),
                    });
                    skipped.push(SkippedItem {
                        title: item.title().to_string(),
                        error,
                    });

                    if failures >= self.settings.max_resolve_failures {
                        error!("💥 [{}] {} fallos seguidos, pasando a inactivo", self.guild_id, failures);
                        break Err(PlayerError::RetriesExhausted { attempts: failures });
                    }
                }
            }
        };

        self.finish_transition(state, &outcome);
        self.transitions.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    async fn next_candidate(&self, state: &mut SessionState) -> Option<PlayableItem> {
        if let Some(item) = state.queue.pop_front() {
            return Some(item);
        }
        if !state.autoplay_enabled {
            return None;
        }

        debug!("🎲 [{}] Cola vacía, pidiendo a autoplay", self.guild_id);
        self.autoplay.next().await
    }

    /// Abre y conecta el stream de `item`. `Ok(None)` si llegó un stop mientras tanto.
    async fn start_item(
        &self,
        state: &mut SessionState,
        item: &PlayableItem,
        epoch: u64,
    ) -> PlayerResult<Option<StreamToken>> {
        let stream = self
            .resolver
            .open(item)
            .await
            .map_err(|source| PlayerError::ResolutionFailure {
                title: item.title().to_string(),
                source,
            })?;

        if self.cancelled(epoch) {
            debug!("🚫 [{}] Stop durante la resolución de {}", self.guild_id, item.title());
            return Ok(None);
        }

        state.next_token += 1;
        let token = StreamToken(state.next_token);
        let on_end = StreamEndNotifier::new(token, self.me.clone());

        let attach = self.transport.attach(self.guild_id, stream, token, on_end);
        match timeout(self.settings.resolve_timeout, attach).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                self.transport.detach(self.guild_id).await;
                return Err(TransportError::Attach(format!(
                    "attach timed out after {:?}",
                    self.settings.resolve_timeout
                ))
                .into());
            }
        }

        if self.cancelled(epoch) {
            self.transport.detach(self.guild_id).await;
            return Ok(None);
        }

        Ok(Some(token))
    }

    fn finish_transition(&self, state: &mut SessionState, outcome: &PlayerResult<Advance>) {
        let now = Instant::now();

        match outcome {
            Ok(Advance::Started { item, .. }) => {
                state.status = PlaybackStatus::Playing;
                state.last_activity = now;
                if let Some(active) = state.current.as_ref() {
                    self.active_token.store(active.token.get(), Ordering::SeqCst);
                }

                self.autoplay.record_played(item);
                self.idle.arm();
                if state.autoplay_enabled {
                    self.autoplay.refill_in_background();
                }

                info!("🎵 [{}] Reproduciendo: {}", self.guild_id, item.title());
                self.events.publish(SessionEvent::TrackStarted {
                    guild_id: self.guild_id,
                    item: item.clone(),
                });
            }
            Ok(Advance::Cancelled) | Ok(Advance::Superseded) => {
                state.status = PlaybackStatus::Idle;
                state.current = None;
            }
            Ok(Advance::Idle { .. }) | Err(_) => {
                state.status = PlaybackStatus::Idle;
                state.current = None;
                state.last_activity = now;
                self.idle.arm();

                if !matches!(outcome, Err(PlayerError::Transport(_))) {
                    info!("📭 [{}] Cola terminada", self.guild_id);
                    self.events.publish(SessionEvent::QueueFinished { guild_id: self.guild_id });
                }
            }
        }
    }

    async fn stop_locked(&self, state: &mut SessionState) -> usize {
        let cleared = state.queue.clear();
        self.autoplay.clear_buffer();

        if state.current.take().is_some() {
            self.transport.detach(self.guild_id).await;
        }
        self.active_token.store(0, Ordering::SeqCst);
        state.status = PlaybackStatus::Idle;
        state.last_activity = Instant::now();
        self.transitions.fetch_add(1, Ordering::SeqCst);
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{
            item::ItemId,
            testing::{song, FakeResolver, RecordingTransport},
        },
        error::RecommendationError,
        sources::MockRecommendationSource,
    };
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use tokio::sync::{broadcast, Notify};

    struct Harness {
        controller: Arc<PlaybackController>,
        transport: Arc<RecordingTransport>,
        idle_rx: mpsc::UnboundedReceiver<IdleExpired>,
        events: broadcast::Receiver<SessionEvent>,
    }

    fn harness_with(resolver: FakeResolver, recommender: MockRecommendationSource) -> Harness {
        harness_on(resolver, recommender, RecordingTransport::default())
    }

    fn harness_on(
        resolver: FakeResolver,
        recommender: MockRecommendationSource,
        transport: RecordingTransport,
    ) -> Harness {
        let transport = Arc::new(transport);
        let collaborators = Collaborators {
            resolver: Arc::new(resolver),
            recommender: Arc::new(recommender),
            transport: transport.clone(),
        };
        let bus = EventBus::new();
        let events = bus.subscribe();
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();

        let controller = PlaybackController::new(
            GuildId::new(77),
            &collaborators,
            PlayerSettings::default(),
            bus,
            idle_tx,
        );

        Harness {
            controller,
            transport,
            idle_rx,
            events,
        }
    }

    fn harness(resolver: FakeResolver) -> Harness {
        // Sin expectativas: cualquier llamada a recomendaciones hace fallar el test
        harness_with(resolver, MockRecommendationSource::new())
    }

    fn started_id(outcome: &PlayerResult<Advance>) -> Option<String> {
        match outcome {
            Ok(Advance::Started { item, .. }) => Some(item.id().to_string()),
            _ => None,
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_plays_in_fifo_order_then_idles() {
        let h = harness(FakeResolver::default());

        let enqueued = h
            .controller
            .enqueue_many(vec![song("A"), song("B"), song("C")])
            .await
            .unwrap();
        assert_eq!(enqueued.added, 3);
        assert_eq!(started_id(enqueued.started.as_ref().unwrap()).as_deref(), Some("A"));

        assert_eq!(started_id(&h.controller.advance().await).as_deref(), Some("B"));
        assert_eq!(started_id(&h.controller.advance().await).as_deref(), Some("C"));
        assert_eq!(h.controller.advance().await, Ok(Advance::Idle { skipped: Vec::new() }));

        assert_eq!(h.transport.played(), vec!["A", "B", "C"]);
        let snapshot = h.controller.snapshot().await.unwrap();
        assert_eq!(snapshot.status, PlaybackStatus::Idle);
        assert!(snapshot.current.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_while_playing_only_queues() {
        let h = harness(FakeResolver::default());

        h.controller.enqueue(song("A")).await.unwrap();
        let second = h.controller.enqueue(song("B")).await.unwrap();

        assert_eq!(second.position, 1);
        assert!(second.started.is_none());
        assert_eq!(h.transport.played(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_concurrent_advances_start_exactly_once() {
        let gate = Arc::new(Notify::new());
        let h = harness(FakeResolver::gated("B", gate.clone()));

        h.controller
            .enqueue_many(vec![song("A"), song("B"), song("C"), song("D")])
            .await
            .unwrap();

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let controller = h.controller.clone();
                tokio::spawn(async move { controller.advance().await })
            })
            .collect();

        // Todas leen la generación antes de que termine la primera
        settle().await;
        gate.notify_one();

        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap().unwrap());
        }

        let started = outcomes
            .iter()
            .filter(|o| matches!(o, Advance::Started { .. }))
            .count();
        let superseded = outcomes.iter().filter(|o| **o == Advance::Superseded).count();
        assert_eq!(started, 1);
        assert_eq!(superseded, 4);
        assert_eq!(h.transport.played(), vec!["A", "B"]);

        let queue: Vec<_> = h
            .controller
            .snapshot()
            .await
            .unwrap()
            .queue
            .iter()
            .map(|i| i.id().to_string())
            .collect();
        assert_eq!(queue, vec!["C", "D"]);
    }

    #[tokio::test]
    async fn test_stream_end_advances() {
        let h = harness(FakeResolver::default());
        h.controller.enqueue_many(vec![song("A"), song("B")]).await.unwrap();

        assert!(h.transport.notifier(0).notify());
        settle().await;

        assert_eq!(h.transport.played(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_stale_stream_end_is_ignored() {
        let h = harness(FakeResolver::default());
        h.controller
            .enqueue_many(vec![song("A"), song("B"), song("C")])
            .await
            .unwrap();

        let first = h.transport.notifier(0).token();
        assert_eq!(started_id(&h.controller.skip().await).as_deref(), Some("B"));

        assert_eq!(
            h.controller.on_stream_ended(first).await,
            Err(PlayerError::StaleCallback(first.get()))
        );
        // The transport reporting the old stream's end later changes nothing either.
        h.transport.notifier(0).notify();
        settle().await;

        assert_eq!(h.transport.played(), vec!["A", "B"]);
        let snapshot = h.controller.snapshot().await.unwrap();
        assert_eq!(snapshot.current.unwrap().id().as_str(), "B");
        assert_eq!(snapshot.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_skip_racing_stream_end_advances_once() {
        let gate = Arc::new(Notify::new());
        let h = harness(FakeResolver::gated("B", gate.clone()));
        h.controller
            .enqueue_many(vec![song("A"), song("B"), song("C")])
            .await
            .unwrap();

        // El fin de A toma la sesión y queda resolviendo B
        assert!(h.transport.notifier(0).notify());
        settle().await;

        // El usuario salta A mientras tanto
        let skip = {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.skip().await })
        };
        settle().await;
        gate.notify_one();

        assert_eq!(skip.await.unwrap(), Ok(Advance::Superseded));
        assert_eq!(h.transport.played(), vec!["A", "B"]);
        let snapshot = h.controller.snapshot().await.unwrap();
        assert_eq!(snapshot.current.unwrap().id().as_str(), "B");
        assert_eq!(
            snapshot.queue.iter().map(|item| item.id().to_string()).collect::<Vec<_>>(),
            vec!["C"]
        );
    }

    #[tokio::test]
    async fn test_stream_end_racing_skip_advances_once() {
        let gate = Arc::new(Notify::new());
        let h = harness(FakeResolver::gated("B", gate.clone()));
        h.controller
            .enqueue_many(vec![song("A"), song("B"), song("C")])
            .await
            .unwrap();

        // El skip toma la sesión primero y A termina mientras resuelve B
        let skip = {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.skip().await })
        };
        settle().await;
        assert!(h.transport.notifier(0).notify());
        settle().await;
        gate.notify_one();

        assert_eq!(started_id(&skip.await.unwrap()).as_deref(), Some("B"));
        settle().await;

        assert_eq!(h.transport.played(), vec!["A", "B"]);
        let snapshot = h.controller.snapshot().await.unwrap();
        assert_eq!(snapshot.current.unwrap().id().as_str(), "B");
        assert_eq!(
            snapshot.queue.iter().map(|item| item.id().to_string()).collect::<Vec<_>>(),
            vec!["C"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_attach_skips_to_next_item() {
        let h = harness_on(
            FakeResolver::default(),
            MockRecommendationSource::new(),
            RecordingTransport::stalling(&["A"]),
        );

        let enqueued = h.controller.enqueue_many(vec![song("A"), song("B")]).await.unwrap();

        match enqueued.started {
            Some(Ok(Advance::Started { item, skipped })) => {
                assert_eq!(item.id().as_str(), "B");
                assert_eq!(skipped.len(), 1);
                assert_eq!(skipped[0].title, "Song A");
                assert!(matches!(
                    skipped[0].error,
                    PlayerError::Transport(TransportError::Attach(_))
                ));
            }
            other => panic!("esperaba B en reproducción, llegó {:?}", other),
        }
        assert_eq!(h.transport.played(), vec!["B"]);
        assert_eq!(h.transport.detaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_during_resolve_discards_item() {
        let gate = Arc::new(Notify::new());
        let h = harness(FakeResolver::gated("X", gate.clone()));

        let enqueue = {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.enqueue(song("X")).await })
        };
        settle().await;

        let stop = {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.stop().await })
        };
        settle().await;
        gate.notify_one();

        let enqueued = enqueue.await.unwrap().unwrap();
        assert_eq!(enqueued.started, Some(Ok(Advance::Cancelled)));
        assert_eq!(stop.await.unwrap(), Ok(0));

        assert!(h.transport.played().is_empty());
        let snapshot = h.controller.snapshot().await.unwrap();
        assert_eq!(snapshot.status, PlaybackStatus::Idle);
        assert!(snapshot.current.is_none());
        assert!(snapshot.queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_item_is_skipped_not_requeued() {
        let mut h = harness(FakeResolver::failing(&["D"]));

        let enqueued = h.controller.enqueue_many(vec![song("D"), song("E")]).await.unwrap();
        match enqueued.started {
            Some(Ok(Advance::Started { item, skipped })) => {
                assert_eq!(item.id().as_str(), "E");
                assert_eq!(skipped.len(), 1);
                assert_eq!(skipped[0].title, "Song D");
                assert!(skipped[0].error.is_item_local());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(h.transport.played(), vec!["E"]);
        assert!(h.controller.snapshot().await.unwrap().queue.is_empty());

        match h.events.recv().await.unwrap() {
            SessionEvent::TrackSkipped { title, .. } => assert_eq!(title, "Song D"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_cap_goes_idle_with_queue_intact() {
        let h = harness(FakeResolver::failing(&["D1", "D2", "D3"]));

        let enqueued = h
            .controller
            .enqueue_many(vec![song("D1"), song("D2"), song("D3"), song("E")])
            .await
            .unwrap();
        assert_eq!(enqueued.started, Some(Err(PlayerError::RetriesExhausted { attempts: 3 })));

        let snapshot = h.controller.snapshot().await.unwrap();
        assert_eq!(snapshot.status, PlaybackStatus::Idle);
        assert_eq!(snapshot.queue.len(), 1);
        assert!(h.transport.played().is_empty());
    }

    #[tokio::test]
    async fn test_lost_voice_connection_keeps_item() {
        let h = harness(FakeResolver::default());
        h.transport.disconnected.store(true, Ordering::SeqCst);

        let enqueued = h.controller.enqueue(song("A")).await.unwrap();
        assert_eq!(
            enqueued.started,
            Some(Err(PlayerError::Transport(TransportError::NotConnected(GuildId::new(77)))))
        );
        assert_eq!(h.controller.snapshot().await.unwrap().queue.len(), 1);
    }

    #[tokio::test]
    async fn test_lost_voice_connection_keeps_queue_order() {
        let h = harness(FakeResolver::default());
        h.transport.disconnected.store(true, Ordering::SeqCst);

        h.controller
            .enqueue_many(vec![song("A"), song("B"), song("C")])
            .await
            .unwrap();

        let snapshot = h.controller.snapshot().await.unwrap();
        assert_eq!(
            snapshot.queue.iter().map(|item| item.id().to_string()).collect::<Vec<_>>(),
            vec!["A", "B", "C"]
        );
        assert_eq!(snapshot.status, PlaybackStatus::Idle);
    }

    #[tokio::test]
    async fn test_out_of_range_edits_leave_queue_unchanged() {
        let h = harness(FakeResolver::default());
        h.controller
            .enqueue_many(vec![song("A"), song("B"), song("C")])
            .await
            .unwrap();

        assert_eq!(
            h.controller.remove_at(2).await,
            Err(PlayerError::OutOfRange { index: 2, len: 2 })
        );
        assert_eq!(
            h.controller.move_to(0, 5).await,
            Err(PlayerError::OutOfRange { index: 5, len: 2 })
        );

        let queue: Vec<_> = h
            .controller
            .snapshot()
            .await
            .unwrap()
            .queue
            .iter()
            .map(|i| i.id().to_string())
            .collect();
        assert_eq!(queue, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_skip_with_nothing_playing() {
        let h = harness(FakeResolver::default());
        assert_eq!(h.controller.skip().await, Err(PlayerError::NothingPlaying));
        assert_eq!(h.controller.pause().await, Err(PlayerError::NothingPlaying));
    }

    #[tokio::test]
    async fn test_autoplay_seeds_from_history_and_never_repeats() {
        let calls: Arc<parking_lot::Mutex<Vec<Vec<ItemId>>>> = Arc::default();
        let mut recommender = MockRecommendationSource::new();
        {
            let calls = calls.clone();
            recommender
                .expect_recommend()
                .returning(move |seeds: &[ItemId], _excluding: &HashSet<ItemId>, _limit: usize| {
                    calls.lock().push(seeds.to_vec());
                    if seeds.to_vec() == vec![ItemId::from("A")] {
                        Ok(vec![song("A"), song("B"), song("C")])
                    } else {
                        Err(RecommendationError::Unavailable("no more".to_string()))
                    }
                });
        }
        let h = harness_with(FakeResolver::default(), recommender);

        h.controller.enqueue(song("A")).await.unwrap();
        h.controller.set_autoplay(true).await.unwrap();

        let token = h.transport.notifier(0).token();
        let next = h.controller.on_stream_ended(token).await;

        assert_eq!(started_id(&next).as_deref(), Some("B"));
        assert_eq!(calls.lock()[0], vec![ItemId::from("A")]);
        if let Ok(Advance::Started { item, .. }) = next {
            assert_eq!(item.origin(), Origin::Autoplay);
        }
    }

    #[tokio::test]
    async fn test_autoplay_disabled_goes_idle() {
        let h = harness(FakeResolver::default());
        h.controller.enqueue(song("A")).await.unwrap();

        let token = h.transport.notifier(0).token();
        assert_eq!(
            h.controller.on_stream_ended(token).await,
            Ok(Advance::Idle { skipped: Vec::new() })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_excludes_paused_time() {
        let h = harness(FakeResolver::default());
        h.controller.enqueue(song("A")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        h.controller.pause().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let paused = h.controller.snapshot().await.unwrap();
        assert!(paused.paused);
        assert_eq!(paused.elapsed, Some(Duration::from_secs(10)));

        h.controller.resume().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let playing = h.controller.snapshot().await.unwrap();
        assert_eq!(playing.elapsed, Some(Duration::from_secs(15)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry_closes_idle_session() {
        let mut h = harness(FakeResolver::default());
        h.controller.enqueue(song("A")).await.unwrap();
        h.controller.stop().await.unwrap();

        let expired = h.idle_rx.recv().await.unwrap();
        assert_eq!(
            h.controller.on_idle_timeout(expired.generation).await,
            Ok(IdleVerdict::Expired)
        );
        assert!(h.controller.is_closed());
        assert_eq!(
            h.controller.enqueue(song("B")).await,
            Err(PlayerError::SessionNotFound(GuildId::new(77)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry_while_playing_rearms() {
        let mut h = harness(FakeResolver::default());
        h.controller.enqueue(song("A")).await.unwrap();

        let expired = h.idle_rx.recv().await.unwrap();
        assert_eq!(
            h.controller.on_idle_timeout(expired.generation).await,
            Ok(IdleVerdict::Active)
        );
        // La generación vieja ya no vale tras rearmar
        assert_eq!(
            h.controller.on_idle_timeout(expired.generation).await,
            Ok(IdleVerdict::Stale)
        );
        assert!(!h.controller.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_detaches_and_closes() {
        let h = harness(FakeResolver::default());
        h.controller.enqueue_many(vec![song("A"), song("B")]).await.unwrap();

        h.controller.shutdown().await;
        h.controller.shutdown().await;

        assert!(h.controller.is_closed());
        assert_eq!(h.transport.detaches.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.skip().await, Err(PlayerError::SessionNotFound(GuildId::new(77))));
    }
}
