//! Fakes shared by the session tests.

use async_trait::async_trait;
use serenity::model::id::{GuildId, UserId};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::Notify;

use super::item::{PlayableItem, StreamHandle, StreamToken};
use super::transport::{AudioTransport, StreamEndNotifier};
use crate::error::{ResolveError, TransportError};
use crate::sources::StreamResolver;

pub(crate) fn song(id: &str) -> PlayableItem {
    PlayableItem::new(id, format!("Song {}", id), format!("https://youtu.be/{}", id), UserId::new(5))
}

/// Resolver falso: falla para algunos ids y puede retener uno hasta abrir la compuerta
#[derive(Default)]
pub(crate) struct FakeResolver {
    failing: HashSet<String>,
    gate: Option<(String, Arc<Notify>)>,
}

impl FakeResolver {
    pub(crate) fn failing(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|id| id.to_string()).collect(),
            gate: None,
        }
    }

    pub(crate) fn gated(id: &str, gate: Arc<Notify>) -> Self {
        Self {
            failing: HashSet::new(),
            gate: Some((id.to_string(), gate)),
        }
    }
}

#[async_trait]
impl StreamResolver for FakeResolver {
    async fn resolve(&self, query: &str, requested_by: UserId) -> Result<PlayableItem, ResolveError> {
        Ok(song(query).with_requested_by(requested_by))
    }

    async fn resolve_playlist(&self, _url: &str, _requested_by: UserId) -> Result<Vec<PlayableItem>, ResolveError> {
        Ok(Vec::new())
    }

    async fn open(&self, item: &PlayableItem) -> Result<StreamHandle, ResolveError> {
        if let Some((id, gate)) = &self.gate {
            if id == item.id().as_str() {
                gate.notified().await;
            }
        }
        if self.failing.contains(item.id().as_str()) {
            return Err(ResolveError::Extraction("HTTP 403".to_string()));
        }
        Ok(StreamHandle {
            item_id: item.id().clone(),
            locator: format!("https://stream.example/{}", item.id()),
        })
    }
}

/// Transporte que solo anota lo que le piden
#[derive(Default)]
pub(crate) struct RecordingTransport {
    pub(crate) attached: parking_lot::Mutex<Vec<(String, StreamToken)>>,
    pub(crate) notifiers: parking_lot::Mutex<Vec<StreamEndNotifier>>,
    pub(crate) detaches: AtomicUsize,
    pub(crate) disconnects: AtomicUsize,
    /// Simula haber perdido la conexión de voz
    pub(crate) disconnected: AtomicBool,
    /// Ids cuyo attach nunca termina
    stalled: HashSet<String>,
}

impl RecordingTransport {
    pub(crate) fn stalling(ids: &[&str]) -> Self {
        Self {
            stalled: ids.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }

    pub(crate) fn played(&self) -> Vec<String> {
        self.attached.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub(crate) fn notifier(&self, index: usize) -> StreamEndNotifier {
        self.notifiers.lock()[index].clone()
    }
}

#[async_trait]
impl AudioTransport for RecordingTransport {
    async fn attach(
        &self,
        guild_id: GuildId,
        stream: StreamHandle,
        token: StreamToken,
        on_end: StreamEndNotifier,
    ) -> Result<(), TransportError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected(guild_id));
        }
        if self.stalled.contains(stream.item_id.as_str()) {
            std::future::pending::<()>().await;
        }
        self.attached.lock().push((stream.item_id.to_string(), token));
        self.notifiers.lock().push(on_end);
        Ok(())
    }

    async fn detach(&self, _guild_id: GuildId) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }

    async fn pause(&self, _guild_id: GuildId) -> Result<(), TransportError> {
        Ok(())
    }

    async fn resume(&self, _guild_id: GuildId) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self, _guild_id: GuildId) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}
