//! # Voice Module
//!
//! Seams between the playback core and the external voice transport.
//!
//! The playback registry never talks to songbird directly: it only sees the
//! traits defined here, so the whole state machine can be driven in tests by
//! [`testing::MockTransport`].
//!
//! - [`VoiceTransport`] joins a channel and hands back a [`VoiceConnection`]
//! - [`VoiceConnection`] exposes its [`ConnectionState`] and creates players
//! - [`AudioPlayer`] consumes an [`AudioResource`] and reports
//!   [`PlayerEvent`]s through a [`PlayerEventSink`]
//!
//! [`lifecycle`] sits on top and decides between reconnection and teardown.

use async_trait::async_trait;
use bytes::Bytes;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

pub mod discord;
pub mod lifecycle;
pub mod state;

#[cfg(test)]
pub mod testing;

pub use state::{ConnectionState, ConnectionStateCell};

use crate::{audio::encoder::StreamCodec, error::VoiceResult};

/// Una sesión de voz se identifica por su guild: Discord permite una sola
/// conexión de voz por guild.
pub type SessionId = GuildId;

/// Stream continuo de frames codificados listo para reproducirse.
///
/// El pipeline retiene el extremo emisor; cuando lo suelta el stream termina.
#[derive(Debug)]
pub struct AudioResource {
    pub codec: StreamCodec,
    pub packets: flume::Receiver<Bytes>,
}

/// Eventos que un reproductor reporta al registro.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// Terminó de reproducir lo que tenía.
    Idle,
    Error(String),
    Destroyed,
}

/// Evento etiquetado con la sesión y la generación del pipeline que lo
/// originó, para descartar eventos de pipelines ya reemplazados.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub generation: u64,
    pub event: PlayerEvent,
}

/// Extremo que recibe cada reproductor para reportar sus eventos.
#[derive(Debug, Clone)]
pub struct PlayerEventSink {
    session_id: SessionId,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl PlayerEventSink {
    pub fn new(
        session_id: SessionId,
        generation: u64,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            session_id,
            generation,
            tx,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn emit(&self, event: PlayerEvent) {
        trace!("Evento de reproductor en guild {}: {:?}", self.session_id, event);
        // el registro puede haberse soltado durante el apagado
        let _ = self.tx.send(SessionEvent {
            session_id: self.session_id,
            generation: self.generation,
            event,
        });
    }
}

#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Formato que el reproductor sabe consumir.
    fn accepts(&self, codec: StreamCodec) -> bool;

    async fn play(&self, resource: AudioResource) -> VoiceResult<()>;

    fn stop(&self) -> VoiceResult<()>;

    fn is_playing(&self) -> bool;
}

#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn session_id(&self) -> SessionId;

    fn channel_id(&self) -> ChannelId;

    fn states(&self) -> &ConnectionStateCell;

    fn state(&self) -> ConnectionState {
        self.states().get()
    }

    /// Crea un reproductor ya suscrito a esta conexión.
    fn create_player(&self, events: PlayerEventSink) -> VoiceResult<Arc<dyn AudioPlayer>>;

    async fn destroy(&self);
}

/// Dos handles apuntan a la misma conexión (no solo a la misma guild).
pub fn same_connection(a: &Arc<dyn VoiceConnection>, b: &Arc<dyn VoiceConnection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Pide una conexión y vuelve enseguida; el establecimiento sigue en
    /// segundo plano y se observa con [`ConnectionStateCell::wait_for`].
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> VoiceResult<Arc<dyn VoiceConnection>>;
}
