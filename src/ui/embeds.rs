use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::audio::{
    item::{Origin, PlayableItem},
    player::{PlaybackStatus, Snapshot},
    queue::QueuePage,
};

/// Canciones por página en /queue
pub const ITEMS_PER_PAGE: usize = 10;

const PROGRESS_BAR_WIDTH: usize = 20;

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎵 Guild Jukebox";

/// Campos comunes de un item: artista, duración, quién lo pidió
fn with_item_fields(mut embed: CreateEmbed, item: &PlayableItem) -> CreateEmbed {
    embed = embed.field("🎤 Artista", item.artist().unwrap_or("Desconocido"), true);

    embed = match item.duration() {
        Some(duration) => embed.field("⏱️ Duración", format_duration(duration), true),
        None => embed.field("⏱️ Duración", "🔴 En vivo", true),
    };

    let requested = match item.origin() {
        Origin::Manual => format!("<@{}>", item.requested_by()),
        Origin::Autoplay => "🤖 Autoplay".to_string(),
    };
    embed = embed.field("👤 Solicitado por", requested, true);

    if let Some(thumbnail) = item.thumbnail() {
        embed = embed.thumbnail(thumbnail);
    }

    embed.url(item.url())
}

/// Anuncio de una canción que acaba de empezar
pub fn create_now_playing_embed(item: &PlayableItem) -> CreateEmbed {
    let embed = CreateEmbed::default()
        .title("🎵 Reproduciendo Ahora")
        .description(format!("**{}**", item.title()))
        .color(colors::SUCCESS_GREEN);

    with_item_fields(embed, item)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// /nowplaying: canción actual con barra de progreso
pub fn create_status_embed(snapshot: &Snapshot) -> CreateEmbed {
    let Some(current) = &snapshot.current else {
        return create_info_embed(
            "😴 Nada sonando",
            "Usa `/play <canción>` para agregar música",
        );
    };

    let elapsed = snapshot.elapsed.unwrap_or_default();
    let progress = match current.duration() {
        Some(total) => format!(
            "{} `{} / {}`",
            render_progress_bar(elapsed, total, PROGRESS_BAR_WIDTH),
            format_duration(elapsed),
            format_duration(total)
        ),
        None => format!("🔴 En vivo `{}`", format_duration(elapsed)),
    };

    let (title, color) = match snapshot.status {
        PlaybackStatus::Paused => ("⏸️ En Pausa", colors::WARNING_ORANGE),
        PlaybackStatus::Starting => ("⏳ Cargando", colors::INFO_BLUE),
        _ => ("🎵 Reproduciendo Ahora", colors::SUCCESS_GREEN),
    };

    let embed = CreateEmbed::default()
        .title(title)
        .description(format!("**{}**\n{}", current.title(), progress))
        .color(color);

    with_item_fields(embed, current)
        .field("📋 En cola", snapshot.queue.len().to_string(), true)
        .field("🤖 Autoplay", on_off(snapshot.autoplay_enabled), true)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed para mostrar que se agregó una canción
pub fn create_track_added_embed(item: &PlayableItem, position: usize, started: bool) -> CreateEmbed {
    let (title, description) = if started {
        ("▶️ Reproduciendo", format!("**{}** empieza a sonar", item.title()))
    } else {
        (
            "✅ Canción Agregada",
            format!("**{}** se agregó en la posición **#{}**", item.title(), position),
        )
    };

    let embed = CreateEmbed::default()
        .title(title)
        .description(description)
        .color(colors::SUCCESS_GREEN);

    with_item_fields(embed, item)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed para mostrar que una playlist fue agregada
pub fn create_playlist_added_embed(added: usize, found: usize, playlist_url: &str) -> CreateEmbed {
    let description = if added == found {
        format!("Se agregaron **{} canciones** a la cola", added)
    } else {
        format!(
            "Se agregaron **{} de {} canciones** (límite de playlist o cola llena)",
            added, found
        )
    };

    let mut embed = CreateEmbed::default()
        .title("📋 Playlist Agregada")
        .description(description)
        .color(colors::MUSIC_PURPLE)
        .field("📊 Canciones agregadas", added.to_string(), true);

    // Extraer el ID de la playlist para mostrar
    if let Some(list_start) = playlist_url.find("list=") {
        let list_id = &playlist_url[list_start + 5..];
        let clean_list_id = list_id.split('&').next().unwrap_or(list_id);
        embed = embed.field("🆔 Playlist ID", format!("`{}`", clean_list_id), true);
    }

    embed
        .footer(CreateEmbedFooter::new("💡 Usa /queue para ver todas las canciones"))
        .timestamp(Timestamp::now())
}

/// Crea un embed para mostrar la cola de reproducción
pub fn create_queue_embed(snapshot: &Snapshot, page: usize) -> CreateEmbed {
    let queue_page = QueuePage::from_items(&snapshot.queue, page, ITEMS_PER_PAGE);

    let mut embed = CreateEmbed::default()
        .title("📋 Cola de Reproducción")
        .color(colors::INFO_BLUE);

    if let Some(current) = &snapshot.current {
        let status = if snapshot.paused { "⏸️" } else { "▶️" };
        embed = embed.field(
            format!("{} Reproduciendo", status),
            format!("**{}**{}", current.title(), artist_suffix(current)),
            false,
        );
    }

    if queue_page.total_items == 0 {
        let hint = if snapshot.autoplay_enabled {
            "🤖 Autoplay elegirá la siguiente canción"
        } else {
            "💡 Usa `/play <canción>` para agregar música"
        };
        return embed
            .description(format!("😴 **La cola está vacía**\n\n{}", hint))
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    }

    embed = embed.field("Próximas canciones", queue_lines(&queue_page, ITEMS_PER_PAGE), false);

    // Información adicional
    let mut info = format!("**Total:** {} canciones", queue_page.total_items);
    if snapshot.queue_duration > Duration::ZERO {
        info.push_str(&format!(" • **Duración:** {}", format_duration(snapshot.queue_duration)));
    }
    if snapshot.autoplay_enabled {
        info.push_str(" • 🤖 **Autoplay**");
    }
    embed = embed.field("Información", info, false);

    let footer = if queue_page.total_pages > 1 {
        format!(
            "Página {} de {} • Guild Jukebox",
            queue_page.current_page, queue_page.total_pages
        )
    } else {
        STANDARD_FOOTER.to_string()
    };

    embed
        .footer(CreateEmbedFooter::new(footer))
        .timestamp(Timestamp::now())
}

/// Líneas numeradas de una página; la numeración es global (1-based)
pub fn queue_lines(page: &QueuePage, items_per_page: usize) -> String {
    let offset = page.current_page.saturating_sub(1) * items_per_page.max(1);
    let mut lines = String::new();

    for (i, item) in page.items.iter().enumerate() {
        let duration = item
            .duration()
            .map(|d| format!(" `[{}]`", format_duration(d)))
            .unwrap_or_default();

        lines.push_str(&format!(
            "**{}**. {}{}{}\n",
            offset + i + 1,
            item.title(),
            artist_suffix(item),
            duration
        ));
    }

    lines
}

pub fn create_error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {}", title))
        .description(description)
        .color(colors::ERROR_RED)
        .timestamp(Timestamp::now())
}

pub fn create_success_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("✅ {}", title))
        .description(description)
        .color(colors::SUCCESS_GREEN)
        .timestamp(Timestamp::now())
}

pub fn create_info_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(title)
        .description(description)
        .color(colors::INFO_BLUE)
        .timestamp(Timestamp::now())
}

fn artist_suffix(item: &PlayableItem) -> String {
    item.artist()
        .map(|artist| format!(" - {}", artist))
        .unwrap_or_default()
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "Activado"
    } else {
        "Desactivado"
    }
}

/// Barra de progreso de `width` segmentos; sin duración total queda vacía
pub fn render_progress_bar(elapsed: Duration, total: Duration, width: usize) -> String {
    let filled = if total.is_zero() {
        0
    } else {
        let ratio = (elapsed.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0);
        (ratio * width as f64).round() as usize
    };

    format!("{}🔘{}", "▬".repeat(filled), "▬".repeat(width.saturating_sub(filled)))
}

/// Formatea una duración en formato legible
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
