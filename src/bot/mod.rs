//! # Bot Module
//!
//! Thin serenity layer over the [`SessionRegistry`].
//!
//! - Slash command registration and dispatch ([`commands`], [`handlers`])
//! - Voice channel join before the first enqueue
//! - Session cleanup when the bot is disconnected from voice externally
//! - Announcing [`SessionEvent`](crate::audio::events::SessionEvent)s in the
//!   text channel where the session was started ([`events`])
//!
//! Every playback decision lives in the audio core; handlers only map
//! interactions to registry calls and results to messages.

use anyhow::Result;
use dashmap::DashMap;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{error, info, warn};

pub mod commands;
pub mod events;
pub mod handlers;

use crate::{audio::registry::SessionRegistry, config::Config};

/// Discord event handler for the jukebox.
pub struct JukeboxBot {
    config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    /// Canal de texto donde se anuncian los eventos de cada guild
    announce_channels: Arc<DashMap<GuildId, ChannelId>>,
    announcer_started: AtomicBool,
}

impl JukeboxBot {
    pub fn new(config: Config, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            announce_channels: Arc::new(DashMap::new()),
            announcer_started: AtomicBool::new(false),
        }
    }

    /// Registers slash commands, per guild when `GUILD_ID` is set (instant
    /// propagation) or globally otherwise.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");
        info!("🔧 Application ID: {}", self.config.application_id);

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);

                // Verificar que el bot esté en la guild
                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id).await.map_err(|e| {
                    error!("❌ Error registrando comandos de guild: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica el permiso 'applications.commands'.")
                })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica el permiso 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }

    /// Conecta al canal de voz; no hace nada si ya está en ese canal
    pub async fn join_voice_channel(
        &self,
        ctx: &Context,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<()> {
        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird no inicializado"))?;

        if let Some(call) = manager.get(guild_id) {
            let current = call.lock().await.current_channel();
            if current.map(|c| c.0.get()) == Some(channel_id.get()) {
                return Ok(());
            }
        }

        manager.join(guild_id, channel_id).await.map_err(|e| {
            error!("Error al unirse al canal de voz: {:?}", e);
            anyhow::anyhow!("Error al conectar al canal de voz")
        })?;

        info!("🔊 Conectado al canal de voz {} en guild {}", channel_id, guild_id);
        Ok(())
    }

    /// Los eventos de esta guild se anunciarán en `channel_id`
    pub fn remember_channel(&self, guild_id: GuildId, channel_id: ChannelId) {
        self.announce_channels.insert(guild_id, channel_id);
    }
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }

        // ready se repite en cada reconexión del gateway
        if !self.announcer_started.swap(true, Ordering::AcqRel) {
            events::spawn_announcer(
                ctx.http.clone(),
                self.registry.subscribe(),
                self.announce_channels.clone(),
            );
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command_interaction) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Drops the session when someone disconnects the bot from voice.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }

        if let Some(guild_id) = new.guild_id {
            info!("🔌 Bot desconectado en guild {}", guild_id);
            if self.registry.destroy(guild_id).await {
                self.announce_channels.remove(&guild_id);
            }
        }
    }
}
