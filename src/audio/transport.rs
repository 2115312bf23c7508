use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::GuildId;
use songbird::{
    input::{HttpRequest, Input},
    tracks::TrackHandle,
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};
use tracing::{debug, info, warn};

use super::item::{StreamHandle, StreamToken};
use super::player::PlaybackController;
use crate::error::TransportError;

/// Plays one stream per guild and reports when it ends.
#[async_trait]
pub trait AudioTransport: Send + Sync {
    /// Starts `stream`; `on_end` must fire when it finishes or fails.
    async fn attach(
        &self,
        guild_id: GuildId,
        stream: StreamHandle,
        token: StreamToken,
        on_end: StreamEndNotifier,
    ) -> Result<(), TransportError>;

    /// Detiene el stream actual, si hay uno
    async fn detach(&self, guild_id: GuildId);

    async fn pause(&self, guild_id: GuildId) -> Result<(), TransportError>;

    async fn resume(&self, guild_id: GuildId) -> Result<(), TransportError>;

    /// Sale del canal de voz
    async fn disconnect(&self, guild_id: GuildId);
}

/// Callback handed to the transport with each attach.
///
/// Fires at most once however many clones and events report the end; the
/// controller then checks the token against the active stream.
#[derive(Clone)]
pub struct StreamEndNotifier {
    token: StreamToken,
    fired: Arc<AtomicBool>,
    controller: Weak<PlaybackController>,
}

impl StreamEndNotifier {
    pub(crate) fn new(token: StreamToken, controller: Weak<PlaybackController>) -> Self {
        Self {
            token,
            fired: Arc::new(AtomicBool::new(false)),
            controller,
        }
    }

    pub fn token(&self) -> StreamToken {
        self.token
    }

    /// Entrega el fin del stream al controlador en su propia tarea.
    /// Devuelve `false` si ya se había notificado.
    pub fn notify(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(controller) = self.controller.upgrade() {
            let token = self.token;
            tokio::spawn(async move {
                if let Err(e) = controller.on_stream_ended(token).await {
                    debug!("Fin de stream {} ignorado: {}", token, e);
                }
            });
        }
        true
    }
}

/// Transporte real sobre Songbird
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    tracks: DashMap<GuildId, TrackHandle>,
    volume: f32,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, volume: f32) -> Self {
        Self {
            manager,
            http: reqwest::Client::new(),
            tracks: DashMap::new(),
            volume: volume.clamp(0.0, 2.0),
        }
    }

    fn track(&self, guild_id: GuildId) -> Result<TrackHandle, TransportError> {
        self.tracks
            .get(&guild_id)
            .map(|track| track.clone())
            .ok_or(TransportError::NotConnected(guild_id))
    }
}

#[async_trait]
impl AudioTransport for SongbirdTransport {
    async fn attach(
        &self,
        guild_id: GuildId,
        stream: StreamHandle,
        token: StreamToken,
        on_end: StreamEndNotifier,
    ) -> Result<(), TransportError> {
        let call = self
            .manager
            .get(guild_id)
            .ok_or(TransportError::NotConnected(guild_id))?;

        if let Some((_, previous)) = self.tracks.remove(&guild_id) {
            let _ = previous.stop();
        }

        let input: Input = HttpRequest::new(self.http.clone(), stream.locator).into();
        let track = {
            let mut call = call.lock().await;
            call.play_input(input)
        };

        // Configurar volumen por defecto
        let _ = track.set_volume(self.volume);

        for event in [TrackEvent::End, TrackEvent::Error] {
            track
                .add_event(Event::Track(event), TrackEndHandler { notifier: on_end.clone() })
                .map_err(|e| TransportError::Attach(format!("Error al agregar event handler: {}", e)))?;
        }

        info!("🎵 [{}] Stream {} conectado ({})", guild_id, token, stream.item_id);
        self.tracks.insert(guild_id, track);
        Ok(())
    }

    async fn detach(&self, guild_id: GuildId) {
        if let Some((_, track)) = self.tracks.remove(&guild_id) {
            let _ = track.stop();
            debug!("⏹️ [{}] Stream detenido", guild_id);
        }
    }

    async fn pause(&self, guild_id: GuildId) -> Result<(), TransportError> {
        self.track(guild_id)?
            .pause()
            .map_err(|e| TransportError::Control(e.to_string()))
    }

    async fn resume(&self, guild_id: GuildId) -> Result<(), TransportError> {
        self.track(guild_id)?
            .play()
            .map_err(|e| TransportError::Control(e.to_string()))
    }

    async fn disconnect(&self, guild_id: GuildId) {
        self.detach(guild_id).await;
        if self.manager.get(guild_id).is_some() {
            if let Err(e) = self.manager.remove(guild_id).await {
                warn!("⚠️ [{}] Error al salir del canal de voz: {}", guild_id, e);
            } else {
                info!("👋 [{}] Desconectado del canal de voz", guild_id);
            }
        }
    }
}

/// Handler para cuando termina (o falla) una canción
struct TrackEndHandler {
    notifier: StreamEndNotifier,
}

#[async_trait]
impl VoiceEventHandler for TrackEndHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(states) = ctx {
            for (state, _) in states.iter() {
                if let songbird::tracks::PlayMode::Errored(e) = &state.playing {
                    warn!("❌ Stream {} falló: {:?}", self.notifier.token(), e);
                }
            }
        }

        if self.notifier.notify() {
            debug!("Track {} terminado, avanzando...", self.notifier.token());
        }
        None
    }
}
