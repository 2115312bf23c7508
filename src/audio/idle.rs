use parking_lot::Mutex;
use serenity::model::id::GuildId;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

/// Mensaje enviado al registro cuando vence un timer de inactividad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleExpired {
    pub guild_id: GuildId,
    pub generation: u64,
}

/// Idle-disconnect timer for one session.
///
/// Expiry is not acted on here: it is posted to the registry, which hands it
/// back to the controller under the session guard. Each arm or cancel bumps
/// the generation, so an expiry already in the mailbox when the timer was
/// rearmed is recognised as stale.
pub struct IdleTimer {
    guild_id: GuildId,
    duration: Duration,
    generation: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
    expired_tx: mpsc::UnboundedSender<IdleExpired>,
}

impl IdleTimer {
    pub fn new(guild_id: GuildId, duration: Duration, expired_tx: mpsc::UnboundedSender<IdleExpired>) -> Self {
        Self {
            guild_id,
            duration,
            generation: AtomicU64::new(0),
            task: Mutex::new(None),
            expired_tx,
        }
    }

    /// (Re)inicia la cuenta regresiva; devuelve la nueva generación
    pub fn arm(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let expired = IdleExpired {
            guild_id: self.guild_id,
            generation,
        };
        let tx = self.expired_tx.clone();
        let duration = self.duration;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // El registro puede haberse cerrado ya
            let _ = tx.send(expired);
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        debug!("⏲️ [{}] Timer de inactividad armado ({:?}, gen {})", self.guild_id, duration, generation);
        generation
    }

    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            debug!("⏲️ [{}] Timer de inactividad cancelado", self.guild_id);
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub fn is_armed(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}
