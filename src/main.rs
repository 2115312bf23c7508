use anyhow::Result;
use serenity::{http::Http, model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info};

use guild_jukebox::{
    audio::{player::Collaborators, registry::SessionRegistry, transport::SongbirdTransport},
    bot::JukeboxBot,
    config::Config,
    sources::{BoundedResolver, InvidiousRecommender, YtDlpResolver},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_jukebox=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    info!("🎵 Iniciando Guild Jukebox v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let resolver = YtDlpResolver::new();
    resolver.verify_dependencies().await?;

    // El autoplay pide canciones a nombre del propio bot
    let bot_user = Http::new(&config.discord_token).get_current_user().await?.id;
    let recommender = InvidiousRecommender::new(
        config.invidious_instances.clone(),
        bot_user,
        config.recommend_timeout,
    )?;

    let manager = Songbird::serenity();
    let collaborators = Collaborators {
        resolver: Arc::new(BoundedResolver::new(
            resolver,
            config.resolver_concurrency,
            config.resolve_timeout,
        )),
        recommender: Arc::new(recommender),
        transport: Arc::new(SongbirdTransport::new(manager.clone(), config.default_volume)),
    };
    let registry = SessionRegistry::init(collaborators, config.player_settings());

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = JukeboxBot::new(config.clone(), registry.clone());
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(manager)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        registry.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

async fn health_check() -> Result<()> {
    // yt-dlp es la única dependencia externa
    let yt_dlp = async_process::Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await?;

    if yt_dlp.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
