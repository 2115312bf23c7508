//! Session event bus.
//!
//! Controllers publish what happened to a session; the bot layer subscribes
//! to announce it in the text channel. Lagging or absent subscribers never
//! block playback.

use serenity::model::id::GuildId;
use tokio::sync::broadcast;

use super::item::PlayableItem;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    TrackStarted {
        guild_id: GuildId,
        item: PlayableItem,
    },
    /// Un item no se pudo reproducir y se saltó
    TrackSkipped {
        guild_id: GuildId,
        title: String,
        reason: String,
    },
    QueueFinished {
        guild_id: GuildId,
    },
    Disconnected {
        guild_id: GuildId,
    },
}

impl SessionEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            SessionEvent::TrackStarted { guild_id, .. }
            | SessionEvent::TrackSkipped { guild_id, .. }
            | SessionEvent::QueueFinished { guild_id }
            | SessionEvent::Disconnected { guild_id } => *guild_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        // Sin suscriptores no es un error
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
