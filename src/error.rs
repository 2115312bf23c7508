//! Error taxonomy for the playback core.
//!
//! Collaborator errors (`ResolveError`, `RecommendationError`,
//! `TransportError`) stay narrow; `PlayerError` is what commands return.

use serenity::model::id::GuildId;
use std::time::Duration;
use thiserror::Error;

/// Result type for playback operations
pub type PlayerResult<T> = std::result::Result<T, PlayerError>;

/// Fallos al resolver una búsqueda o abrir el stream de un item
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("no results for '{0}'")]
    NotFound(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("resolver timed out after {0:?}")]
    Timeout(Duration),
}

/// Fallos de la fuente de recomendaciones
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecommendationError {
    #[error("recommendations unavailable: {0}")]
    Unavailable(String),

    #[error("recommendation fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Fallos del transporte de audio (conexión de voz)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("no voice connection for guild {0}")]
    NotConnected(GuildId),

    #[error("could not attach stream: {0}")]
    Attach(String),

    #[error("track control failed: {0}")]
    Control(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlayerError {
    /// Per-item, transient. The controller skips to the next candidate.
    #[error("could not resolve '{title}': {source}")]
    ResolutionFailure {
        title: String,
        #[source]
        source: ResolveError,
    },

    /// Autoplay degrades silently; surfaced only in logs.
    #[error(transparent)]
    RecommendationUnavailable(#[from] RecommendationError),

    #[error("index {index} out of range (queue has {len} items)")]
    OutOfRange { index: usize, len: usize },

    #[error("no session for guild {0}")]
    SessionNotFound(GuildId),

    /// Fatal for the current item only, handled like a resolution failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A stream-end callback for a stream that is no longer active.
    #[error("stale stream-end callback for token {0}")]
    StaleCallback(u64),

    #[error("queue is full ({max} items)")]
    QueueFull { max: usize },

    #[error("nothing is playing")]
    NothingPlaying,

    #[error("gave up after {attempts} consecutive playback failures")]
    RetriesExhausted { attempts: u8 },
}

impl PlayerError {
    /// Mensaje corto y final para el usuario, sin detalles internos
    pub fn user_message(&self) -> String {
        match self {
            PlayerError::ResolutionFailure { title, .. } => {
                format!("No se pudo reproducir **{}**, saltando", title)
            }
            PlayerError::RecommendationUnavailable(_) => {
                "Autoplay no encontró recomendaciones".to_string()
            }
            PlayerError::OutOfRange { len, .. } => {
                format!("Posición inválida, la cola tiene {} canciones", len)
            }
            PlayerError::SessionNotFound(_) => "No hay nada reproduciéndose en este servidor".to_string(),
            PlayerError::Transport(TransportError::NotConnected(_)) => {
                "No estoy conectado a un canal de voz".to_string()
            }
            PlayerError::Transport(_) => "Error de audio, saltando canción".to_string(),
            PlayerError::StaleCallback(_) => String::new(),
            PlayerError::QueueFull { max } => {
                format!("La cola está llena (máximo {} canciones)", max)
            }
            PlayerError::NothingPlaying => "No hay nada reproduciéndose".to_string(),
            PlayerError::RetriesExhausted { attempts } => format!(
                "Fallaron {} canciones seguidas, deteniendo la reproducción",
                attempts
            ),
        }
    }

    /// Errores por item que el controlador absorbe saltando al siguiente
    pub fn is_item_local(&self) -> bool {
        matches!(
            self,
            PlayerError::ResolutionFailure { .. } | PlayerError::Transport(TransportError::Attach(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages_hide_internal_details() {
        let err = PlayerError::ResolutionFailure {
            title: "Song D".to_string(),
            source: ResolveError::Extraction("HTTP 403 from googlevideo".to_string()),
        };
        let msg = err.user_message();
        assert!(msg.contains("Song D"));
        assert!(!msg.contains("403"));
    }

    #[test]
    fn test_item_local_classification() {
        assert!(PlayerError::Transport(TransportError::Attach("eof".into())).is_item_local());
        assert!(!PlayerError::Transport(TransportError::NotConnected(GuildId::new(1))).is_item_local());
        assert!(!PlayerError::OutOfRange { index: 4, len: 2 }.is_item_local());
    }
}
