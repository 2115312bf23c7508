use chrono::{DateTime, Utc};
use serenity::model::id::UserId;
use std::{fmt, time::Duration};

/// Identificador estable de un item (video id de YouTube)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Quién puso el item en la cola
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Manual,
    Autoplay,
}

/// A resolved, playable song. Immutable once built: the `with_*` builders
/// consume and return a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableItem {
    id: ItemId,
    title: String,
    artist: Option<String>,
    duration: Option<Duration>,
    thumbnail: Option<String>,
    url: String,
    stream_url: Option<String>,
    origin: Origin,
    requested_by: UserId,
    added_at: DateTime<Utc>,
}

impl PlayableItem {
    pub fn new(id: impl Into<ItemId>, title: impl Into<String>, url: impl Into<String>, requested_by: UserId) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: None,
            duration: None,
            thumbnail: None,
            url: url.into(),
            stream_url: None,
            origin: Origin::Manual,
            requested_by,
            added_at: Utc::now(),
        }
    }

    // Getters
    pub fn id(&self) -> &ItemId {
        &self.id
    }
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn artist(&self) -> Option<&str> {
        self.artist.as_deref()
    }
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnail.as_deref()
    }
    /// Página del video, usada para volver a resolver el stream
    pub fn url(&self) -> &str {
        &self.url
    }
    /// Locator resuelto en la búsqueda; puede haber expirado al reproducir
    pub fn stream_url(&self) -> Option<&str> {
        self.stream_url.as_deref()
    }
    pub fn origin(&self) -> Origin {
        self.origin
    }
    pub fn requested_by(&self) -> UserId {
        self.requested_by
    }
    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    // Builders
    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    pub fn with_stream_url(mut self, stream_url: impl Into<String>) -> Self {
        self.stream_url = Some(stream_url.into());
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_requested_by(mut self, user_id: UserId) -> Self {
        self.requested_by = user_id;
        self
    }
}

/// What the transport actually plays: a fresh locator for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHandle {
    pub item_id: ItemId,
    pub locator: String,
}

/// Identifies one stream attachment. Tokens only grow within a session,
/// so a stale callback can never match the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamToken(pub(crate) u64);

impl StreamToken {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
