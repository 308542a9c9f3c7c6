use serenity::model::id::GuildId;
use std::time::Duration;
use thiserror::Error;

use crate::voice::ConnectionState;

/// Errores del núcleo de reproducción de voz.
///
/// Los errores de transporte transitorios nunca llegan aquí: los absorbe el
/// [`ConnectionManager`](crate::voice::lifecycle::ConnectionManager). Lo que
/// sí aparece son fallos de uso (escribir en un pipeline destruido), fallos
/// por chunk (codec, resampler) y fallos permanentes de conexión.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("el pipeline de audio ya fue destruido")]
    PipelineDestroyed,

    #[error("el stream de salida fue cerrado por el consumidor")]
    StreamClosed,

    #[error("la conexión de voz no llegó a {expected:?} en {timeout:?}")]
    ConnectionTimeout {
        expected: ConnectionState,
        timeout: Duration,
    },

    #[error("la conexión de voz fue destruida")]
    ConnectionDestroyed,

    #[error("no hay conexión de voz para guild {0}")]
    NotConnected(GuildId),

    #[error("la cola de guild {guild_id} está llena (máximo {max} chunks)")]
    QueueFull { guild_id: GuildId, max: usize },

    #[error("error de codificación: {0}")]
    Encode(String),

    #[error("error de resampling: {0}")]
    Resample(String),

    #[error("la geometría de frame {0:?} no produce muestras")]
    InvalidFrameSpec(crate::audio::frame::FrameSpec),

    #[error("el reproductor no soporta el codec {0:?}")]
    UnsupportedCodec(crate::audio::encoder::StreamCodec),

    #[error("error del transporte de voz: {0}")]
    Transport(String),

    #[error("error del reproductor: {0}")]
    Player(String),
}

impl From<audiopus::Error> for VoiceError {
    fn from(err: audiopus::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

pub type VoiceResult<T> = std::result::Result<T, VoiceError>;
