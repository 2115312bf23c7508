//! # Guild Jukebox
//!
//! Discord music bot core: per-guild queues, autoplay from recommendations
//! and idle disconnect, driven by slash commands.

pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod sources;
pub mod ui;
