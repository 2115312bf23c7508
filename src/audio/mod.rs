//! # Audio Module
//!
//! Per-guild playback orchestration: what plays, in which order, and what
//! happens when the queue runs dry.
//!
//! ## Architecture
//!
//! ### [`registry`] - Session Registry
//! - One [`player::PlaybackController`] per guild, created on first use
//! - Reaps sessions whose idle timer expired and leaves the voice channel
//! - Publishes [`events::SessionEvent`]s for the command layer
//!
//! ### [`player`] - Playback Controller
//! - Serialized state machine (`Idle → Starting → Playing ⇄ Paused`)
//! - Resolve retries, stale end-of-stream callbacks, cancellation by stop
//!
//! ### [`queue`] - Queue Management
//! - FIFO of manual requests with capacity, move, remove and shuffle
//!
//! ### [`autoplay`] - Autoplay
//! - Recent history, blended recommendation seeds and a prefetch buffer
//!
//! ### [`transport`] - Voice Output
//! - [`transport::AudioTransport`] seam plus the songbird implementation
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use guild_jukebox::audio::{item::PlayableItem, player::Collaborators, registry::SessionRegistry};
//! use guild_jukebox::config::PlayerSettings;
//! use serenity::all::{GuildId, UserId};
//!
//! # async fn example(collaborators: Collaborators) -> anyhow::Result<()> {
//! let registry = SessionRegistry::init(collaborators, PlayerSettings::default());
//! let guild_id = GuildId::new(123456789);
//!
//! let item = registry.resolver().resolve("lofi hip hop", UserId::new(1)).await?;
//! registry.enqueue(guild_id, item).await?;
//!
//! registry.pause(guild_id).await?;
//! registry.resume(guild_id).await?;
//! registry.skip(guild_id).await?;
//!
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod autoplay;
pub mod events;
pub mod idle;
pub mod item;
pub mod player;
pub mod queue;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
