use dashmap::DashMap;
use serenity::{
    builder::CreateMessage,
    http::Http,
    model::id::{ChannelId, GuildId},
};
use std::sync::Arc;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use crate::{audio::events::SessionEvent, ui::embeds};

/// Escucha los eventos de sesión y los anuncia en el canal de cada guild.
/// Termina cuando se cierra el bus.
pub fn spawn_announcer(
    http: Arc<Http>,
    mut events: broadcast::Receiver<SessionEvent>,
    channels: Arc<DashMap<GuildId, ChannelId>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    warn!("⚠️ Anunciador atrasado, {} eventos perdidos", missed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let guild_id = event.guild_id();
            let channel_id = if matches!(event, SessionEvent::Disconnected { .. }) {
                channels.remove(&guild_id).map(|(_, channel)| channel)
            } else {
                channels.get(&guild_id).map(|entry| *entry.value())
            };

            let Some(channel_id) = channel_id else {
                debug!("[{}] Sin canal para anunciar {:?}", guild_id, event);
                continue;
            };

            if let Err(e) = channel_id.send_message(&http, announcement(&event)).await {
                error!("Error al enviar anuncio en guild {}: {:?}", guild_id, e);
            }
        }
        debug!("📢 Anunciador detenido");
    })
}

fn announcement(event: &SessionEvent) -> CreateMessage {
    match event {
        SessionEvent::TrackStarted { item, .. } => {
            CreateMessage::new().embed(embeds::create_now_playing_embed(item))
        }
        other => CreateMessage::new().content(announcement_text(other)),
    }
}

/// Texto del anuncio para eventos sin embed
pub fn announcement_text(event: &SessionEvent) -> String {
    match event {
        SessionEvent::TrackStarted { item, .. } => format!("🎵 Reproduciendo **{}**", item.title()),
        SessionEvent::TrackSkipped { title, reason, .. } => {
            format!("⚠️ No se pudo reproducir **{}**, saltando ({})", title, reason)
        }
        SessionEvent::QueueFinished { .. } => {
            "✅ La cola terminó. Usa `/play` para seguir escuchando".to_string()
        }
        SessionEvent::Disconnected { .. } => "👋 Desconectado del canal de voz".to_string(),
    }
}
