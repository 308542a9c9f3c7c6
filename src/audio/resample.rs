use rubato::{FftFixedIn, Resampler};
use tracing::debug;

use super::frame::BYTES_PER_SAMPLE;
use crate::error::{VoiceError, VoiceResult};

/// Frames de entrada por bloque de resampling (10ms a 48kHz).
const RESAMPLE_CHUNK: usize = 480;

/// Convierte PCM s16le mono de la frecuencia del productor a la del
/// pipeline. Mantiene estado entre chunks: las muestras que no completan un
/// bloque quedan pendientes hasta el siguiente `convert` o `flush`.
///
/// La salida está alineada con la entrada: se descartan las primeras
/// `output_delay()` muestras del filtro y `flush` empuja ceros hasta sacar
/// la cola retenida, así cada enunciado sale completo y sin silencio inicial.
pub struct PcmResampler {
    resampler: FftFixedIn<f32>,
    pending: Vec<f32>,
    odd_byte: Option<u8>,
    from_rate: u32,
    to_rate: u32,
    /// Muestras de salida que todavía son retardo del filtro.
    delay_left: usize,
    /// Muestras de entrada y de salida desde el último `flush`.
    consumed: usize,
    emitted: usize,
}

impl PcmResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> VoiceResult<Self> {
        let resampler = build(from_rate, to_rate)?;
        let delay = resampler.output_delay();
        debug!(
            "🔁 Resampler creado: {}Hz -> {}Hz (retardo {} muestras)",
            from_rate, to_rate, delay
        );

        Ok(Self {
            resampler,
            pending: Vec::with_capacity(RESAMPLE_CHUNK * 2),
            odd_byte: None,
            from_rate,
            to_rate,
            delay_left: delay,
            consumed: 0,
            emitted: 0,
        })
    }

    /// Devuelve `None` si las frecuencias coinciden y no hace falta convertir.
    pub fn for_rates(from_rate: u32, to_rate: u32) -> VoiceResult<Option<Self>> {
        if from_rate == to_rate {
            return Ok(None);
        }
        Self::new(from_rate, to_rate).map(Some)
    }

    pub fn convert(&mut self, chunk: &[u8]) -> VoiceResult<Vec<u8>> {
        self.push_samples(chunk);

        let mut out = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let wave = vec![self.pending.drain(..needed).collect::<Vec<f32>>()];
            let resampled = self
                .resampler
                .process(&wave, None)
                .map_err(|e| VoiceError::Resample(e.to_string()))?;
            self.consumed += needed;
            self.emit(&resampled[0], usize::MAX, &mut out);
        }
        Ok(out)
    }

    /// Procesa lo pendiente y vacía el filtro. El siguiente `convert`
    /// empieza un enunciado nuevo.
    pub fn flush(&mut self) -> VoiceResult<Vec<u8>> {
        self.odd_byte = None;
        if self.consumed == 0 && self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let pending = std::mem::take(&mut self.pending);
        self.consumed += pending.len();
        let expected =
            (self.consumed as u64 * self.to_rate as u64 / self.from_rate as u64) as usize;

        let mut out = Vec::new();
        let mut tail = (!pending.is_empty()).then(|| vec![pending]);
        while self.emitted < expected {
            // sin entrada, process_partial rellena con ceros
            let resampled = match tail.take() {
                Some(wave) => self.resampler.process_partial(Some(wave.as_slice()), None),
                None => self.resampler.process_partial::<Vec<f32>>(None, None),
            }
            .map_err(|e| VoiceError::Resample(e.to_string()))?;

            if resampled[0].is_empty() {
                break;
            }
            let room = expected - self.emitted;
            self.emit(&resampled[0], room, &mut out);
        }

        self.resampler.reset();
        self.delay_left = self.resampler.output_delay();
        self.consumed = 0;
        self.emitted = 0;
        Ok(out)
    }

    /// Escribe la salida del filtro saltando el retardo pendiente y sin
    /// pasar de `limit` muestras.
    fn emit(&mut self, produced: &[f32], limit: usize, out: &mut Vec<u8>) {
        let skip = self.delay_left.min(produced.len());
        self.delay_left -= skip;

        let aligned = &produced[skip..];
        let take = aligned.len().min(limit);
        write_samples(&aligned[..take], out);
        self.emitted += take;
    }

    fn push_samples(&mut self, chunk: &[u8]) {
        let mut bytes = chunk;
        if let Some(low) = self.odd_byte.take() {
            match bytes.split_first() {
                Some((&high, rest)) => {
                    self.pending.push(to_f32(i16::from_le_bytes([low, high])));
                    bytes = rest;
                }
                None => {
                    self.odd_byte = Some(low);
                    return;
                }
            }
        }

        let mut pairs = bytes.chunks_exact(BYTES_PER_SAMPLE);
        for pair in &mut pairs {
            self.pending.push(to_f32(i16::from_le_bytes([pair[0], pair[1]])));
        }
        if let [last] = pairs.remainder() {
            self.odd_byte = Some(*last);
        }
    }
}

fn build(from_rate: u32, to_rate: u32) -> VoiceResult<FftFixedIn<f32>> {
    FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| VoiceError::Resample(e.to_string()))
}

fn to_f32(sample: i16) -> f32 {
    sample as f32 / 32_768.0
}

fn write_samples(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * BYTES_PER_SAMPLE);
    for sample in samples {
        let scaled = (sample * 32_768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out.extend_from_slice(&scaled.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tone(samples: usize) -> Vec<u8> {
        (0..samples)
            .flat_map(|i| (((i % 48) as i16 - 24) * 512).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_same_rate_needs_no_resampler() {
        assert!(PcmResampler::for_rates(48_000, 48_000).unwrap().is_none());
        assert!(PcmResampler::for_rates(24_000, 48_000).unwrap().is_some());
    }

    /// Silencio seguido de un nivel constante, mitad y mitad.
    fn step(samples: usize, level: i16) -> Vec<u8> {
        (0..samples)
            .flat_map(|i| (if i < samples / 2 { 0i16 } else { level }).to_le_bytes())
            .collect()
    }

    fn decode(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    fn resample_all(resampler: &mut PcmResampler, input: &[u8]) -> Vec<i16> {
        let mut out = resampler.convert(input).unwrap();
        out.extend(resampler.flush().unwrap());
        decode(&out)
    }

    #[test]
    fn test_upsampling_keeps_whole_utterance_aligned() {
        const LEVEL: i16 = 8_000;
        let mut resampler = PcmResampler::new(24_000, 48_000).unwrap();

        // 100ms a 24kHz: 50ms de silencio y 50ms de nivel constante
        let out = resample_all(&mut resampler, &step(2_400, LEVEL));

        // 100ms a 48kHz, sin perder la cola retenida por el filtro
        assert_eq!(out.len(), 4_800);

        // el escalón cae en la muestra 2400, no desplazado por el retardo
        let level = LEVEL as f32;
        assert!((out[2_280] as f32).abs() < level * 0.2, "antes: {}", out[2_280]);
        assert!(out[2_520] as f32 > level * 0.8, "después: {}", out[2_520]);
        // y el final del enunciado conserva el nivel
        assert!(out[4_680] as f32 > level * 0.8, "cola: {}", out[4_680]);
    }

    #[test]
    fn test_flush_restarts_filter_for_next_utterance() {
        let mut resampler = PcmResampler::new(24_000, 48_000).unwrap();
        let input = tone(1_000);

        let first = resample_all(&mut resampler, &input);
        let second = resample_all(&mut resampler, &input);

        assert_eq!(first.len(), 2_000);
        assert_eq!(first, second);
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn test_odd_byte_is_carried_between_chunks() {
        let mut resampler = PcmResampler::new(24_000, 48_000).unwrap();
        let input = tone(RESAMPLE_CHUNK * 2);
        let (head, tail) = input.split_at(301);

        resampler.convert(head).unwrap();
        resampler.convert(tail).unwrap();
        assert!(resampler.odd_byte.is_none());
    }
}
