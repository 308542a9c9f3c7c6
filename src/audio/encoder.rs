use audiopus::{coder::Encoder as OpusEncoder, Application, Bitrate, Channels, SampleRate};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

use super::frame::{FrameSpec, BYTES_PER_SAMPLE};
use crate::error::{VoiceError, VoiceResult};

/// Tamaño máximo recomendado por libopus para un paquete.
const MAX_OPUS_PACKET: usize = 4000;

/// Formato de los frames que salen del pipeline hacia el reproductor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamCodec {
    /// Paquetes Opus de 20ms, listos para un transporte que no re-codifica.
    Opus,
    /// PCM f32 little-endian, para transportes que codifican Opus por su
    /// cuenta (el `RawAdapter` de songbird).
    FloatPcm,
    /// PCM s16le sin tocar.
    RawPcm,
}

impl FromStr for StreamCodec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "opus" => Ok(Self::Opus),
            "f32" | "float" | "floatpcm" => Ok(Self::FloatPcm),
            "s16" | "pcm" | "rawpcm" => Ok(Self::RawPcm),
            other => anyhow::bail!("Codec desconocido: {}", other),
        }
    }
}

/// Codificador de frames completos.
///
/// El pipeline garantiza que `encode` solo recibe frames de exactamente
/// `FrameSpec::frame_bytes()` bytes.
#[cfg_attr(test, mockall::automock)]
pub trait FrameEncoder: Send {
    fn codec(&self) -> StreamCodec;

    fn encode(&mut self, frame: &[u8]) -> VoiceResult<Bytes>;

    /// Cierra el codificador. Llamado una sola vez desde `destroy`.
    fn finish(&mut self) -> VoiceResult<()>;
}

/// Construye el codificador configurado para un pipeline.
pub fn build_encoder(
    codec: StreamCodec,
    spec: FrameSpec,
    opus_bitrate: u32,
) -> VoiceResult<Box<dyn FrameEncoder>> {
    let encoder: Box<dyn FrameEncoder> = match codec {
        StreamCodec::Opus => Box::new(OpusFrameEncoder::new(spec, opus_bitrate)?),
        StreamCodec::FloatPcm => Box::new(FloatPcmEncoder::default()),
        StreamCodec::RawPcm => Box::new(RawPcmEncoder),
    };
    Ok(encoder)
}

fn samples(frame: &[u8]) -> impl Iterator<Item = i16> + '_ {
    frame
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
}

pub struct OpusFrameEncoder {
    encoder: Option<OpusEncoder>,
    pcm: Vec<i16>,
    packet: Vec<u8>,
}

impl OpusFrameEncoder {
    pub fn new(spec: FrameSpec, bitrate: u32) -> VoiceResult<Self> {
        let sample_rate = match spec.sample_rate {
            8_000 => SampleRate::Hz8000,
            12_000 => SampleRate::Hz12000,
            16_000 => SampleRate::Hz16000,
            24_000 => SampleRate::Hz24000,
            48_000 => SampleRate::Hz48000,
            other => {
                return Err(VoiceError::Encode(format!(
                    "Opus no soporta {} Hz",
                    other
                )))
            }
        };
        let channels = match spec.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => {
                return Err(VoiceError::Encode(format!(
                    "Opus no soporta {} canales",
                    other
                )))
            }
        };

        let mut encoder = OpusEncoder::new(sample_rate, channels, Application::Voip)?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(bitrate as i32))?;
        debug!("🎚️ Encoder Opus creado: {:?} a {}bps", spec, bitrate);

        Ok(Self {
            encoder: Some(encoder),
            pcm: Vec::with_capacity(spec.samples_per_frame()),
            packet: vec![0; MAX_OPUS_PACKET],
        })
    }
}

impl FrameEncoder for OpusFrameEncoder {
    fn codec(&self) -> StreamCodec {
        StreamCodec::Opus
    }

    fn encode(&mut self, frame: &[u8]) -> VoiceResult<Bytes> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| VoiceError::Encode("encoder Opus cerrado".to_string()))?;

        self.pcm.clear();
        self.pcm.extend(samples(frame));
        let written = encoder.encode(&self.pcm, &mut self.packet)?;
        Ok(Bytes::copy_from_slice(&self.packet[..written]))
    }

    fn finish(&mut self) -> VoiceResult<()> {
        // libopus no tiene flush; basta con liberar el estado
        self.encoder.take();
        Ok(())
    }
}

/// s16le -> f32le normalizado a [-1.0, 1.0).
#[derive(Default)]
pub struct FloatPcmEncoder {
    finished: bool,
}

impl FrameEncoder for FloatPcmEncoder {
    fn codec(&self) -> StreamCodec {
        StreamCodec::FloatPcm
    }

    fn encode(&mut self, frame: &[u8]) -> VoiceResult<Bytes> {
        if self.finished {
            return Err(VoiceError::Encode("encoder f32 cerrado".to_string()));
        }
        let mut out = BytesMut::with_capacity(frame.len() * 2);
        for sample in samples(frame) {
            out.put_f32_le(sample as f32 / 32_768.0);
        }
        Ok(out.freeze())
    }

    fn finish(&mut self) -> VoiceResult<()> {
        self.finished = true;
        Ok(())
    }
}

pub struct RawPcmEncoder;

impl FrameEncoder for RawPcmEncoder {
    fn codec(&self) -> StreamCodec {
        StreamCodec::RawPcm
    }

    fn encode(&mut self, frame: &[u8]) -> VoiceResult<Bytes> {
        Ok(Bytes::copy_from_slice(frame))
    }

    fn finish(&mut self) -> VoiceResult<()> {
        Ok(())
    }
}
