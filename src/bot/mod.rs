//! # Bot Module
//!
//! Discord glue for the voice assistant.
//!
//! [`AssistantBot`] implements Serenity's [`EventHandler`] and only deals
//! with gateway events: it joins the configured voice channel once the bot is
//! ready and tears the session down when the bot is kicked out of voice.
//! Everything voice related goes through the
//! [`ConnectionManager`](crate::voice::lifecycle::ConnectionManager).

use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Ready, VoiceState},
    async_trait,
};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use crate::{
    config::Config,
    voice::lifecycle::{ConnectionManager, SessionNotice},
};

const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(300);

pub struct AssistantBot {
    config: Arc<Config>,
    voice: Arc<ConnectionManager>,
}

impl AssistantBot {
    pub fn new(config: Config, voice: Arc<ConnectionManager>) -> Self {
        Self {
            config: Arc::new(config),
            voice,
        }
    }

    /// Canal configurado para entrar al arrancar, si lo hay.
    fn auto_join_target(&self) -> Option<(GuildId, ChannelId)> {
        match (self.config.voice_guild_id, self.config.voice_channel_id) {
            (Some(guild_id), Some(channel_id)) => {
                Some((GuildId::new(guild_id), ChannelId::new(channel_id)))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl EventHandler for AssistantBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        // Un reconnect del gateway vuelve a emitir `ready`
        let voice = self.voice.clone();
        if let Some((guild_id, channel_id)) = self.auto_join_target() {
            if voice.connection(guild_id).is_some() {
                return;
            }
            tokio::spawn(async move {
                if let Err(e) = voice.connect(guild_id, channel_id).await {
                    error!("❌ No se pudo entrar al canal configurado: {}", e);
                }
            });
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        // Detectar si el bot fue desconectado
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }

        if let Some(guild_id) = new.guild_id {
            info!("🔌 Bot desconectado en guild {}", guild_id);
            self.voice.leave(guild_id).await;
        }
    }
}

/// Registra en el log cada aviso del ciclo de vida de voz.
pub async fn log_notices(voice: Arc<ConnectionManager>) {
    let mut notices = voice.subscribe_notices();
    loop {
        match notices.recv().await {
            Ok(SessionNotice::Ready {
                session_id,
                channel_id,
            }) => info!("🔊 Listo para hablar en canal {} (guild {})", channel_id, session_id),
            Ok(SessionNotice::Lost { session_id, reason }) => {
                warn!("💔 Sesión de voz perdida en guild {}: {}", session_id, reason)
            }
            Ok(SessionNotice::Closed { session_id }) => {
                info!("👋 Sesión de voz cerrada en guild {}", session_id)
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("⚠️ Se perdieron {} avisos de voz", skipped)
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Resumen periódico de la reproducción.
pub async fn diagnostics_task(voice: Arc<ConnectionManager>) {
    let mut interval = tokio::time::interval(DIAGNOSTICS_INTERVAL);
    interval.tick().await;

    loop {
        interval.tick().await;

        let stats = voice.registry().stats();
        info!(
            "📈 Voz: {} sesiones ({} sonando), {} chunks, {} descartados, {} pipelines activos",
            voice.connected_sessions().len(),
            voice.registry().playing_sessions(),
            stats.chunks_played,
            stats.chunks_dropped,
            stats.pipelines_created.saturating_sub(stats.pipelines_destroyed)
        );
    }
}
