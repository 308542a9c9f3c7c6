use bytes::{Bytes, BytesMut};
use std::time::Duration;

/// Valor con el que se rellena el último frame parcial.
///
/// En PCM de 16 bits con signo el cero es silencio, así que un residuo
/// rellenado con este byte se escucha completo y termina en silencio en vez
/// de descartarse.
pub const SILENCE_BYTE: u8 = 0x00;

/// Bytes por muestra en PCM s16le.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Geometría de un frame de codec: frecuencia, canales y duración.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: Duration,
}

impl FrameSpec {
    /// 48kHz mono, 20ms por frame (960 muestras, 1920 bytes).
    pub const DISCORD_MONO: FrameSpec = FrameSpec {
        sample_rate: 48_000,
        channels: 1,
        frame_duration: Duration::from_millis(20),
    };

    pub fn samples_per_frame(&self) -> usize {
        let per_channel =
            (self.sample_rate as u128 * self.frame_duration.as_micros()) / 1_000_000;
        per_channel as usize * self.channels as usize
    }

    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * BYTES_PER_SAMPLE
    }
}

impl Default for FrameSpec {
    fn default() -> Self {
        Self::DISCORD_MONO
    }
}

/// Acumulador de bytes residuales más cortos que un frame.
///
/// Entre escrituras siempre se cumple `len() < frame_bytes`: quien llama a
/// [`FrameBuffer::extend`] debe vaciar los frames completos con
/// [`FrameBuffer::next_frame`] antes de soltar el buffer.
#[derive(Debug)]
pub struct FrameBuffer {
    frame_bytes: usize,
    pending: BytesMut,
}

impl FrameBuffer {
    pub fn new(frame_bytes: usize) -> Self {
        assert!(frame_bytes > 0, "frame_bytes debe ser mayor que cero");
        Self {
            frame_bytes,
            pending: BytesMut::with_capacity(frame_bytes * 2),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Separa exactamente un frame si hay suficientes bytes acumulados.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.pending.len() < self.frame_bytes {
            return None;
        }
        Some(self.pending.split_to(self.frame_bytes).freeze())
    }

    /// Devuelve el residuo rellenado con [`SILENCE_BYTE`] hasta un frame
    /// completo y deja el buffer vacío. `None` si no había residuo.
    pub fn take_padded(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        let mut frame = self.pending.split();
        frame.resize(self.frame_bytes, SILENCE_BYTE);
        Some(frame.freeze())
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
