use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    encoder::FrameEncoder,
    frame::{FrameBuffer, FrameSpec},
    resample::PcmResampler,
};
use crate::{
    error::{VoiceError, VoiceResult},
    voice::{AudioPlayer, AudioResource, SessionId},
};

/// Pipeline de frames de una sesión de voz.
///
/// Recibe PCM en chunks de cualquier tamaño, lo corta en frames fijos de
/// 20ms, los codifica y los publica en un stream acotado que consume el
/// reproductor del transporte. Si el stream está lleno, `write_pcm` espera
/// a que el consumidor libere espacio.
///
/// Un pipeline destruido rechaza escrituras con
/// [`VoiceError::PipelineDestroyed`]; el registro crea uno nuevo cuando
/// vuelve a necesitarlo.
pub struct FramePipeline {
    session_id: SessionId,
    generation: u64,
    buffer: FrameBuffer,
    encoder: Box<dyn FrameEncoder>,
    resampler: Option<PcmResampler>,
    output: Option<flume::Sender<Bytes>>,
    resource: Option<flume::Receiver<Bytes>>,
    resource_created: bool,
    player: Arc<dyn AudioPlayer>,
    cancel: CancellationToken,
    destroyed: bool,
    frames_written: u64,
}

impl FramePipeline {
    pub fn new(
        session_id: SessionId,
        generation: u64,
        spec: FrameSpec,
        encoder: Box<dyn FrameEncoder>,
        resampler: Option<PcmResampler>,
        player: Arc<dyn AudioPlayer>,
        stream_capacity: usize,
    ) -> Self {
        let (output, resource) = flume::bounded(stream_capacity.max(1));
        debug!(
            "🎛️ Pipeline #{} creado para guild {} ({} bytes/frame, {:?})",
            generation,
            session_id,
            spec.frame_bytes(),
            encoder.codec()
        );

        Self {
            session_id,
            generation,
            buffer: FrameBuffer::new(spec.frame_bytes()),
            encoder,
            resampler,
            output: Some(output),
            resource: Some(resource),
            resource_created: false,
            player,
            cancel: CancellationToken::new(),
            destroyed: false,
            frames_written: 0,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Token que se cancela al destruir el pipeline. Permite soltar una
    /// escritura bloqueada por backpressure sin tomar el lock del pipeline.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed || self.cancel.is_cancelled()
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Adapta un chunk del productor al formato del pipeline.
    pub fn convert_input(&mut self, chunk: Bytes) -> VoiceResult<Bytes> {
        match self.resampler.as_mut() {
            Some(resampler) => resampler.convert(&chunk).map(Bytes::from),
            None => Ok(chunk),
        }
    }

    pub async fn write_pcm(&mut self, chunk: &[u8]) -> VoiceResult<()> {
        if self.is_destroyed() {
            return Err(VoiceError::PipelineDestroyed);
        }

        self.buffer.extend(chunk);
        while let Some(frame) = self.buffer.next_frame() {
            self.write_frame(frame).await?;
        }
        Ok(())
    }

    /// Rellena con silencio el residuo final y lo escribe como un frame
    /// completo. En un pipeline destruido solo descarta el residuo.
    pub async fn flush_residual(&mut self) -> VoiceResult<()> {
        if self.is_destroyed() {
            self.buffer.clear();
            return Ok(());
        }

        if let Some(resampler) = self.resampler.as_mut() {
            let tail = resampler.flush()?;
            if !tail.is_empty() {
                self.write_pcm(&tail).await?;
            }
        }

        if let Some(frame) = self.buffer.take_padded() {
            trace!(
                "Residuo rellenado con silencio en guild {} ({} bytes)",
                self.session_id,
                frame.len()
            );
            self.write_frame(frame).await?;
        }
        Ok(())
    }

    pub fn has_resource(&self) -> bool {
        self.resource_created
    }

    pub fn mark_resource_created(&mut self) {
        self.resource_created = true;
    }

    /// Entrega el stream de salida como recurso reproducible. Solo la
    /// primera llamada devuelve algo: un pipeline tiene un único recurso.
    pub fn create_resource(&mut self) -> Option<AudioResource> {
        if self.resource_created || self.is_destroyed() {
            return None;
        }
        let packets = self.resource.take()?;
        self.mark_resource_created();

        Some(AudioResource {
            codec: self.encoder.codec(),
            packets,
        })
    }

    /// `true` si el consumidor del recurso desapareció (el transporte
    /// terminó la pista) y el stream ya no puede drenarse.
    pub fn output_closed(&self) -> bool {
        match &self.output {
            Some(output) => self.resource_created && output.is_disconnected(),
            None => true,
        }
    }

    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.cancel.cancel();

        // Cada paso por separado: un fallo no debe impedir los siguientes
        if let Err(e) = self.player.stop() {
            warn!("⚠️ Error deteniendo reproductor en guild {}: {}", self.session_id, e);
        }

        if let Some(output) = self.output.take() {
            let unplayed = output.len();
            drop(output);
            if unplayed > 0 {
                debug!(
                    "Stream cerrado con {} frames sin reproducir en guild {}",
                    unplayed, self.session_id
                );
            }
        }
        self.resource.take();

        if let Err(e) = self.encoder.finish() {
            warn!("⚠️ Error cerrando encoder en guild {}: {}", self.session_id, e);
        }

        self.buffer.clear();
        info!(
            "🗑️ Pipeline #{} destruido en guild {} ({} frames escritos)",
            self.generation, self.session_id, self.frames_written
        );
    }

    async fn write_frame(&mut self, frame: Bytes) -> VoiceResult<()> {
        let packet = self.encoder.encode(&frame)?;
        let output = self.output.as_ref().ok_or(VoiceError::PipelineDestroyed)?;

        match output.try_send(packet) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(packet)) => {
                trace!("Backpressure en guild {}, esperando al consumidor", self.session_id);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(VoiceError::PipelineDestroyed),
                    sent = output.send_async(packet) => {
                        sent.map_err(|_| VoiceError::StreamClosed)?;
                    }
                }
            }
            Err(flume::TrySendError::Disconnected(_)) => return Err(VoiceError::StreamClosed),
        }

        self.frames_written += 1;
        Ok(())
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}
