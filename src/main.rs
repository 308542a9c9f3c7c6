use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info};

use vox_assistant::{
    audio::{
        encoder::{build_encoder, StreamCodec},
        registry::PlaybackRegistry,
    },
    bot::{self, AssistantBot},
    config::Config,
    voice::{discord::SongbirdTransport, lifecycle::ConnectionManager},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vox_assistant=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎙️ Iniciando Vox Assistant v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config);
    }

    info!("{}", config.summary());

    // Núcleo de voz
    let songbird = Songbird::serenity();
    let registry = PlaybackRegistry::new(config.playback.clone());
    let transport = Arc::new(SongbirdTransport::new(
        songbird.clone(),
        config.playback.frame_spec(),
    ));
    let voice = ConnectionManager::new(transport, registry, config.lifecycle.clone());

    tokio::spawn(bot::log_notices(voice.clone()));
    tokio::spawn(bot::diagnostics_task(voice.clone()));

    // Solo hacen falta guilds y estados de voz
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = AssistantBot::new(config.clone(), voice.clone());

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        voice.leave_all().await;
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

fn health_check(config: &Config) -> Result<()> {
    // libopus enlazada y configuración de audio utilizable
    build_encoder(
        StreamCodec::Opus,
        config.playback.frame_spec(),
        config.playback.opus_bitrate,
    )?;
    build_encoder(
        config.playback.codec,
        config.playback.frame_spec(),
        config.playback.opus_bitrate,
    )?;

    println!("OK");
    Ok(())
}
