use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use std::sync::{Arc, Weak};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    events::{EventBus, SessionEvent},
    idle::IdleExpired,
    item::PlayableItem,
    player::{Advance, Collaborators, Enqueued, IdleVerdict, PlaybackController, Snapshot},
};
use crate::{
    config::PlayerSettings,
    error::{PlayerError, PlayerResult},
    sources::StreamResolver,
};

/// Process-wide map of guild sessions.
///
/// Sessions are created on the first command that needs one and destroyed
/// on explicit disconnect or idle expiry. Idle expiries arrive on a
/// mailbox drained by one reaper task, which hands each back to its
/// controller under the session guard.
pub struct SessionRegistry {
    sessions: DashMap<GuildId, Arc<PlaybackController>>,
    collaborators: Collaborators,
    settings: PlayerSettings,
    events: EventBus,
    idle_tx: mpsc::UnboundedSender<IdleExpired>,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    /// Crea el registro y arranca la tarea que procesa expiraciones
    pub fn init(collaborators: Collaborators, settings: PlayerSettings) -> Arc<Self> {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            sessions: DashMap::new(),
            collaborators,
            settings,
            events: EventBus::new(),
            idle_tx,
            shutdown: CancellationToken::new(),
            reaper: Mutex::new(None),
        });

        let reaper = tokio::spawn(Self::reap(
            Arc::downgrade(&registry),
            idle_rx,
            registry.shutdown.clone(),
        ));
        *registry.reaper.lock() = Some(reaper);

        info!("🗂️ Registro de sesiones iniciado");
        registry
    }

    /// Destruye todas las sesiones y detiene el reaper
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }

        let guilds: Vec<GuildId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for guild_id in &guilds {
            self.destroy(*guild_id).await;
        }
        info!("🛑 Registro cerrado ({} sesiones destruidas)", guilds.len());
    }

    /// Returns the live session, replacing one that closed but was not yet
    /// removed.
    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<PlaybackController> {
        if let Some(existing) = self.session(guild_id) {
            return existing;
        }

        self.sessions
            .entry(guild_id)
            .and_modify(|existing| {
                if existing.is_closed() {
                    *existing = self.new_session(guild_id);
                }
            })
            .or_insert_with(|| self.new_session(guild_id))
            .clone()
    }

    /// Sesión abierta para `guild_id`, si existe
    pub fn session(&self, guild_id: GuildId) -> Option<Arc<PlaybackController>> {
        self.sessions
            .get(&guild_id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|controller| !controller.is_closed())
    }

    pub fn require(&self, guild_id: GuildId) -> PlayerResult<Arc<PlaybackController>> {
        self.session(guild_id).ok_or(PlayerError::SessionNotFound(guild_id))
    }

    /// Cancels the timer, detaches the transport and drops the session.
    /// Returns `false` if there was no session.
    pub async fn destroy(&self, guild_id: GuildId) -> bool {
        let Some((_, controller)) = self.sessions.remove(&guild_id) else {
            debug!("[{}] Sin sesión que destruir", guild_id);
            return false;
        };

        self.teardown(&controller).await;
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn resolver(&self) -> Arc<dyn StreamResolver> {
        Arc::clone(&self.collaborators.resolver)
    }

    pub fn settings(&self) -> &PlayerSettings {
        &self.settings
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    // Comandos

    pub async fn enqueue(&self, guild_id: GuildId, item: PlayableItem) -> PlayerResult<Enqueued> {
        match self.get_or_create(guild_id).enqueue(item.clone()).await {
            // Closed by an idle expiry between lookup and guard
            Err(PlayerError::SessionNotFound(_)) => self.get_or_create(guild_id).enqueue(item).await,
            other => other,
        }
    }

    pub async fn enqueue_many(&self, guild_id: GuildId, items: Vec<PlayableItem>) -> PlayerResult<Enqueued> {
        match self.get_or_create(guild_id).enqueue_many(items.clone()).await {
            Err(PlayerError::SessionNotFound(_)) => self.get_or_create(guild_id).enqueue_many(items).await,
            other => other,
        }
    }

    pub async fn skip(&self, guild_id: GuildId) -> PlayerResult<Advance> {
        self.require(guild_id)?.skip().await
    }

    pub async fn stop(&self, guild_id: GuildId) -> PlayerResult<usize> {
        self.require(guild_id)?.stop().await
    }

    pub async fn pause(&self, guild_id: GuildId) -> PlayerResult<()> {
        self.require(guild_id)?.pause().await
    }

    pub async fn resume(&self, guild_id: GuildId) -> PlayerResult<()> {
        self.require(guild_id)?.resume().await
    }

    pub async fn remove_at(&self, guild_id: GuildId, index: usize) -> PlayerResult<PlayableItem> {
        self.require(guild_id)?.remove_at(index).await
    }

    pub async fn move_to(&self, guild_id: GuildId, from: usize, to: usize) -> PlayerResult<()> {
        self.require(guild_id)?.move_to(from, to).await
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> PlayerResult<usize> {
        self.require(guild_id)?.shuffle().await
    }

    pub async fn set_autoplay(&self, guild_id: GuildId, enabled: bool) -> PlayerResult<bool> {
        self.require(guild_id)?.set_autoplay(enabled).await
    }

    pub async fn toggle_autoplay(&self, guild_id: GuildId) -> PlayerResult<bool> {
        self.require(guild_id)?.toggle_autoplay().await
    }

    pub async fn snapshot(&self, guild_id: GuildId) -> PlayerResult<Snapshot> {
        self.require(guild_id)?.snapshot().await
    }

    pub async fn clear_history(&self, guild_id: GuildId) -> PlayerResult<()> {
        self.require(guild_id)?.clear_history().await
    }

    /// Processes one idle expiry. A session that is already gone makes this
    /// a no-op.
    pub async fn handle_idle(&self, expired: IdleExpired) {
        let Some(controller) = self.session(expired.guild_id) else {
            debug!("⏲️ [{}] Expiración para una sesión inexistente", expired.guild_id);
            return;
        };

        match controller.on_idle_timeout(expired.generation).await {
            Ok(IdleVerdict::Expired) => {
                self.sessions
                    .remove_if(&expired.guild_id, |_, current| Arc::ptr_eq(current, &controller));
                self.teardown(&controller).await;
            }
            Ok(_) => {}
            Err(e) => debug!("⏲️ [{}] Expiración ignorada: {}", expired.guild_id, e),
        }
    }

    fn new_session(&self, guild_id: GuildId) -> Arc<PlaybackController> {
        PlaybackController::new(
            guild_id,
            &self.collaborators,
            self.settings.clone(),
            self.events.clone(),
            self.idle_tx.clone(),
        )
    }

    async fn teardown(&self, controller: &PlaybackController) {
        let guild_id = controller.guild_id();
        controller.shutdown().await;
        self.collaborators.transport.disconnect(guild_id).await;
        self.events.publish(SessionEvent::Disconnected { guild_id });
        info!("👋 [{}] Sesión destruida", guild_id);
    }

    async fn reap(
        registry: Weak<Self>,
        mut expirations: mpsc::UnboundedReceiver<IdleExpired>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                expired = expirations.recv() => {
                    let Some(expired) = expired else { break };
                    let Some(registry) = registry.upgrade() else { break };
                    // Una sesión lenta no retrasa las expiraciones de las demás
                    tokio::spawn(async move { registry.handle_idle(expired).await });
                }
            }
        }
        debug!("⏲️ Reaper de inactividad detenido");
    }
}
