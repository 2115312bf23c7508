use anyhow::Result;
use serenity::{
    builder::{
        CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage,
        EditInteractionResponse,
    },
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use tracing::{info, warn};

use crate::{
    audio::{
        item::PlayableItem,
        player::{Advance, Enqueued},
    },
    bot::JukeboxBot,
    error::PlayerError,
    sources::is_playlist_url,
    ui::embeds,
};

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &JukeboxBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    match command.data.name.as_str() {
        "play" => handle_play(ctx, &command, bot, guild_id).await?,
        "playlist" => handle_playlist(ctx, &command, bot, guild_id).await?,
        "pause" => handle_pause(ctx, &command, bot, guild_id).await?,
        "resume" => handle_resume(ctx, &command, bot, guild_id).await?,
        "skip" => handle_skip(ctx, &command, bot, guild_id).await?,
        "stop" => handle_stop(ctx, &command, bot, guild_id).await?,
        "queue" => handle_queue(ctx, &command, bot, guild_id).await?,
        "nowplaying" => handle_nowplaying(ctx, &command, bot, guild_id).await?,
        "remove" => handle_remove(ctx, &command, bot, guild_id).await?,
        "move" => handle_move(ctx, &command, bot, guild_id).await?,
        "shuffle" => handle_shuffle(ctx, &command, bot, guild_id).await?,
        "autoplay" => handle_autoplay(ctx, &command, bot, guild_id).await?,
        "clearhistory" => handle_clear_history(ctx, &command, bot, guild_id).await?,
        "leave" => handle_leave(ctx, &command, bot, guild_id).await?,
        _ => respond(ctx, &command, "❌ Comando no reconocido", true).await?,
    }

    Ok(())
}

// Handlers específicos para cada comando

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let query = string_option(command, "query")
        .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?
        .to_string();

    if is_playlist_url(&query) {
        return enqueue_playlist(ctx, command, bot, guild_id, &query, false).await;
    }

    // Defer la respuesta ya que resolver puede tardar
    defer(ctx, command).await?;

    if !join_caller(ctx, command, bot, guild_id).await? {
        return Ok(());
    }

    let item = match bot.registry.resolver().resolve(&query, command.user.id).await {
        Ok(item) => item,
        Err(e) => {
            warn!("🔍 [{}] No se pudo resolver '{}': {}", guild_id, query, e);
            let embed = embeds::create_error_embed("Sin resultados", &format!("No encontré nada para `{}`", query));
            return edit_embed(ctx, command, embed).await;
        }
    };

    let embed = match bot.registry.enqueue(guild_id, item.clone()).await {
        Ok(enqueued) => enqueued_embed(&item, &enqueued),
        Err(e) => error_embed(&e),
    };
    edit_embed(ctx, command, embed).await
}

async fn handle_playlist(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let url = string_option(command, "url")
        .ok_or_else(|| anyhow::anyhow!("URL no proporcionada"))?
        .to_string();
    let shuffle = bool_option(command, "shuffle").unwrap_or(false);

    enqueue_playlist(ctx, command, bot, guild_id, &url, shuffle).await
}

async fn enqueue_playlist(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
    url: &str,
    shuffle: bool,
) -> Result<()> {
    defer(ctx, command).await?;

    if !join_caller(ctx, command, bot, guild_id).await? {
        return Ok(());
    }

    let items = match bot.registry.resolver().resolve_playlist(url, command.user.id).await {
        Ok(items) if !items.is_empty() => items,
        Ok(_) => {
            let embed = embeds::create_error_embed("Playlist vacía", "La playlist no tiene canciones reproducibles");
            return edit_embed(ctx, command, embed).await;
        }
        Err(e) => {
            warn!("📋 [{}] Error cargando playlist {}: {}", guild_id, url, e);
            let embed = embeds::create_error_embed("Error de playlist", "No se pudo cargar la playlist");
            return edit_embed(ctx, command, embed).await;
        }
    };
    let found = items.len();

    let outcome = match bot.registry.enqueue_many(guild_id, items).await {
        Ok(enqueued) if shuffle => bot.registry.shuffle(guild_id).await.map(|_| enqueued),
        other => other,
    };
    edit_embed(ctx, command, playlist_reply(outcome, found, url)).await
}

/// Respuesta de /playlist; cualquier error termina en el embed de error
fn playlist_reply(outcome: Result<Enqueued, PlayerError>, found: usize, url: &str) -> CreateEmbed {
    match outcome {
        Ok(enqueued) => embeds::create_playlist_added_embed(enqueued.added, found, url),
        Err(e) => {
            warn!("📋 No se pudo completar la playlist {}: {}", url, e);
            error_embed(&e)
        }
    }
}

async fn handle_pause(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    match bot.registry.pause(guild_id).await {
        Ok(()) => respond(ctx, command, "⏸️ Reproducción pausada", false).await,
        Err(e) => respond_error(ctx, command, &e).await,
    }
}

async fn handle_resume(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    match bot.registry.resume(guild_id).await {
        Ok(()) => respond(ctx, command, "▶️ Reproducción reanudada", false).await,
        Err(e) => respond_error(ctx, command, &e).await,
    }
}

async fn handle_skip(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    // El siguiente item puede tardar en resolverse
    defer(ctx, command).await?;

    let content = match bot.registry.skip(guild_id).await {
        Ok(outcome) => skip_message(&outcome),
        Err(e) => format!("❌ {}", e.user_message()),
    };
    edit_content(ctx, command, content).await
}

async fn handle_stop(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    match bot.registry.stop(guild_id).await {
        Ok(cleared) => {
            let content = format!("⏹️ Reproducción detenida y cola limpiada ({} canciones)", cleared);
            respond(ctx, command, &content, false).await
        }
        Err(e) => respond_error(ctx, command, &e).await,
    }
}

async fn handle_queue(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let page = int_option(command, "page").unwrap_or(1).max(1) as usize;

    match bot.registry.snapshot(guild_id).await {
        Ok(snapshot) => respond_embed(ctx, command, embeds::create_queue_embed(&snapshot, page)).await,
        Err(e) => respond_error(ctx, command, &e).await,
    }
}

async fn handle_nowplaying(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    match bot.registry.snapshot(guild_id).await {
        Ok(snapshot) => respond_embed(ctx, command, embeds::create_status_embed(&snapshot)).await,
        Err(e) => respond_error(ctx, command, &e).await,
    }
}

async fn handle_remove(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let index = position_option(command, "position")?;

    match bot.registry.remove_at(guild_id, index).await {
        Ok(removed) => {
            let content = format!("🗑️ Quitada de la cola: **{}**", removed.title());
            respond(ctx, command, &content, false).await
        }
        Err(e) => respond_error(ctx, command, &e).await,
    }
}

async fn handle_move(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let from = position_option(command, "from")?;
    let to = position_option(command, "to")?;

    match bot.registry.move_to(guild_id, from, to).await {
        Ok(()) => {
            let content = format!("📍 Canción movida de #{} a #{}", from + 1, to + 1);
            respond(ctx, command, &content, false).await
        }
        Err(e) => respond_error(ctx, command, &e).await,
    }
}

async fn handle_shuffle(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    match bot.registry.shuffle(guild_id).await {
        Ok(count) if count > 1 => {
            respond(ctx, command, &format!("🔀 Cola mezclada ({} canciones)", count), false).await
        }
        Ok(_) => respond(ctx, command, "➡️ No hay suficientes canciones para mezclar", true).await,
        Err(e) => respond_error(ctx, command, &e).await,
    }
}

async fn handle_autoplay(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    // Se puede activar antes de la primera canción
    let session = bot.registry.get_or_create(guild_id);
    let result = match bool_option(command, "enabled") {
        Some(enabled) => session.set_autoplay(enabled).await,
        None => session.toggle_autoplay().await,
    };

    match result {
        Ok(true) => respond(ctx, command, "🤖 Autoplay activado", false).await,
        Ok(false) => respond(ctx, command, "➡️ Autoplay desactivado", false).await,
        Err(e) => respond_error(ctx, command, &e).await,
    }
}

async fn handle_clear_history(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    match bot.registry.clear_history(guild_id).await {
        Ok(()) => respond(ctx, command, "🧹 Historial de autoplay borrado", false).await,
        Err(e) => respond_error(ctx, command, &e).await,
    }
}

async fn handle_leave(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    if bot.registry.destroy(guild_id).await {
        respond(ctx, command, "👋 Desconectado del canal de voz", false).await
    } else {
        respond(ctx, command, "❌ No estoy conectado a un canal de voz", true).await
    }
}

/// Une el bot al canal del usuario. Devuelve `false` (ya respondido) si el
/// usuario no está en voz o no se pudo conectar.
async fn join_caller(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<bool> {
    let Some(voice_channel_id) = get_user_voice_channel(ctx, guild_id, command.user.id) else {
        let embed = embeds::create_error_embed("Sin canal de voz", "Debes estar en un canal de voz");
        edit_embed(ctx, command, embed).await?;
        return Ok(false);
    };

    if let Err(e) = bot.join_voice_channel(ctx, guild_id, voice_channel_id).await {
        edit_embed(ctx, command, embeds::create_error_embed("Error de conexión", &e.to_string())).await?;
        return Ok(false);
    }

    bot.remember_channel(guild_id, command.channel_id);
    Ok(true)
}

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}

fn enqueued_embed(item: &PlayableItem, enqueued: &Enqueued) -> CreateEmbed {
    match &enqueued.started {
        Some(Ok(Advance::Started { item: started, .. })) => {
            embeds::create_track_added_embed(started, enqueued.position, true)
        }
        Some(Err(e)) => error_embed(e),
        _ => embeds::create_track_added_embed(item, enqueued.position, false),
    }
}

/// Mensaje para el resultado de /skip
pub fn skip_message(outcome: &Advance) -> String {
    match outcome {
        Advance::Started { item, .. } => format!("⏭️ Saltada. Ahora suena **{}**", item.title()),
        Advance::Idle { .. } => "⏭️ Saltada. No quedan canciones en la cola".to_string(),
        Advance::Superseded => "⏭️ La canción ya había cambiado".to_string(),
        Advance::Cancelled => "⏹️ La reproducción se detuvo".to_string(),
    }
}

fn error_embed(error: &PlayerError) -> CreateEmbed {
    embeds::create_error_embed("No se pudo completar", &error.user_message())
}

// Opciones

fn string_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
}

fn int_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_i64())
}

fn bool_option(command: &CommandInteraction, name: &str) -> Option<bool> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_bool())
}

/// Posición 1-based de Discord a índice 0-based de la cola
fn position_option(command: &CommandInteraction, name: &str) -> Result<usize> {
    let position = int_option(command, name)
        .ok_or_else(|| anyhow::anyhow!("Opción '{}' no proporcionada", name))?;
    to_index(position).ok_or_else(|| anyhow::anyhow!("Posición inválida: {}", position))
}

fn to_index(position: i64) -> Option<usize> {
    usize::try_from(position).ok()?.checked_sub(1)
}

// Respuestas

async fn defer(ctx: &Context, command: &CommandInteraction) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;
    Ok(())
}

async fn respond(ctx: &Context, command: &CommandInteraction, content: &str, ephemeral: bool) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;
    Ok(())
}

async fn respond_embed(ctx: &Context, command: &CommandInteraction, embed: CreateEmbed) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed)),
        )
        .await?;
    Ok(())
}

async fn respond_error(ctx: &Context, command: &CommandInteraction, error: &PlayerError) -> Result<()> {
    respond(ctx, command, &format!("❌ {}", error.user_message()), true).await
}

async fn edit_embed(ctx: &Context, command: &CommandInteraction, embed: CreateEmbed) -> Result<()> {
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
        .await?;
    Ok(())
}

async fn edit_content(ctx: &Context, command: &CommandInteraction, content: String) -> Result<()> {
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;
    Ok(())
}
