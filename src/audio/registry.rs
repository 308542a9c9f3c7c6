use bytes::Bytes;
use dashmap::DashMap;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    encoder::{build_encoder, FrameEncoder, StreamCodec},
    frame::FrameSpec,
    pipeline::FramePipeline,
    resample::PcmResampler,
};
use crate::{
    config::PlaybackConfig,
    error::{VoiceError, VoiceResult},
    voice::{
        same_connection, AudioPlayer, PlayerEvent, PlayerEventSink, SessionEvent, SessionId,
        VoiceConnection,
    },
};

/// Estado de reproducción de una sesión.
///
/// `Draining` lleva el identificador del único bucle de drenado autorizado:
/// un bucle que ve otro `run` (o cualquier otro estado) termina sin tocar
/// nada, así nunca hay dos drenando la misma cola.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Draining { run: u64 },
    /// Tras un error del reproductor, esperando el reintento programado.
    Recovering,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub drains_started: u64,
    pub chunks_queued: u64,
    pub chunks_played: u64,
    pub chunks_dropped: u64,
    pub pipelines_created: u64,
    pub pipelines_destroyed: u64,
}

#[derive(Default)]
struct Counters {
    drains_started: AtomicU64,
    chunks_queued: AtomicU64,
    chunks_played: AtomicU64,
    chunks_dropped: AtomicU64,
    pipelines_created: AtomicU64,
    pipelines_destroyed: AtomicU64,
}

#[derive(Clone)]
struct PipelineSlot {
    generation: u64,
    pipeline: Arc<Mutex<FramePipeline>>,
    cancel: CancellationToken,
    player: Arc<dyn AudioPlayer>,
}

struct SessionEntry {
    connection: Arc<dyn VoiceConnection>,
    queue: VecDeque<Bytes>,
    pipeline: Option<PipelineSlot>,
    state: SessionState,
}

impl SessionEntry {
    fn new(connection: Arc<dyn VoiceConnection>) -> Self {
        Self {
            connection,
            queue: VecDeque::new(),
            pipeline: None,
            state: SessionState::Idle,
        }
    }
}

/// Construye el codificador de cada pipeline nuevo.
pub type EncoderFactory =
    Arc<dyn Fn(StreamCodec, FrameSpec, u32) -> VoiceResult<Box<dyn FrameEncoder>> + Send + Sync>;

/// Registro de reproducción: cola, pipeline y estado por sesión de voz.
///
/// Es el único punto de entrada que usan los demás componentes. Los eventos
/// de todos los reproductores llegan a una sola tarea de despacho que los
/// aplica con [`PlaybackRegistry::handle_event`].
///
/// Debe crearse dentro de un runtime de tokio.
pub struct PlaybackRegistry {
    config: PlaybackConfig,
    encoders: EncoderFactory,
    sessions: DashMap<SessionId, SessionEntry>,
    events: mpsc::UnboundedSender<SessionEvent>,
    next_generation: AtomicU64,
    next_run: AtomicU64,
    counters: Counters,
    self_ref: Weak<PlaybackRegistry>,
}

impl PlaybackRegistry {
    pub fn new(config: PlaybackConfig) -> Arc<Self> {
        Self::with_encoders(config, Arc::new(build_encoder))
    }

    pub fn with_encoders(config: PlaybackConfig, encoders: EncoderFactory) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Arc::new_cyclic(|self_ref| Self {
            config,
            encoders,
            sessions: DashMap::new(),
            events,
            next_generation: AtomicU64::new(0),
            next_run: AtomicU64::new(0),
            counters: Counters::default(),
            self_ref: self_ref.clone(),
        });

        tokio::spawn(Self::dispatch(Arc::downgrade(&registry), rx));
        info!("🎧 Registro de reproducción iniciado");
        registry
    }

    async fn dispatch(registry: Weak<Self>, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.handle_event(event).await;
        }
        debug!("Despacho de eventos de reproducción terminado");
    }

    /// Encola un chunk PCM para la sesión de `connection` y arranca el
    /// drenado si la sesión estaba inactiva. Vuelve en cuanto el chunk está
    /// en la cola; la reproducción sigue en segundo plano.
    pub fn play_audio_to_channel(
        &self,
        connection: &Arc<dyn VoiceConnection>,
        chunk: Bytes,
    ) -> VoiceResult<()> {
        let session_id = connection.session_id();

        let (run, stale) = {
            let mut entry = self
                .sessions
                .entry(session_id)
                .or_insert_with(|| SessionEntry::new(connection.clone()));
            let stale = self.bind_connection(&mut entry, connection);

            if entry.queue.len() >= self.config.max_queued_chunks {
                warn!("🚫 Cola llena en guild {}, chunk rechazado", session_id);
                return Err(VoiceError::QueueFull {
                    guild_id: session_id,
                    max: self.config.max_queued_chunks,
                });
            }

            self.ensure_slot(session_id, &mut entry)?;
            entry.queue.push_back(chunk);
            self.counters.chunks_queued.fetch_add(1, Ordering::Relaxed);

            let run = match entry.state {
                SessionState::Idle => {
                    let run = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
                    entry.state = SessionState::Draining { run };
                    Some(run)
                }
                // el bucle activo o el reintento recogerán el chunk
                SessionState::Draining { .. } | SessionState::Recovering => None,
            };
            (run, stale)
        };

        if let Some(slot) = stale {
            self.retire_later(slot);
        }
        if let Some(run) = run {
            self.spawn_drain(session_id, run);
        }
        Ok(())
    }

    /// Prepara la sesión y su reproductor sin encolar audio.
    pub fn attach(
        &self,
        connection: &Arc<dyn VoiceConnection>,
    ) -> VoiceResult<Arc<dyn AudioPlayer>> {
        let session_id = connection.session_id();
        let (player, stale) = {
            let mut entry = self
                .sessions
                .entry(session_id)
                .or_insert_with(|| SessionEntry::new(connection.clone()));
            let stale = self.bind_connection(&mut entry, connection);
            (self.ensure_slot(session_id, &mut entry)?.player, stale)
        };

        if let Some(slot) = stale {
            self.retire_later(slot);
        }
        Ok(player)
    }

    /// Detiene la sesión indicada o, sin argumento, todas.
    pub async fn stop_playback(&self, session_id: Option<SessionId>) {
        match session_id {
            Some(session_id) => {
                self.cleanup_guild(session_id).await;
            }
            None => self.cleanup_all().await,
        }
    }

    /// Destruye el pipeline de la sesión y elimina su cola y su estado.
    /// Devuelve `false` si la sesión no existía.
    pub async fn cleanup_guild(&self, session_id: SessionId) -> bool {
        let Some((_, entry)) = self.sessions.remove(&session_id) else {
            debug!("Nada que limpiar en guild {}", session_id);
            return false;
        };

        let discarded = entry.queue.len();
        if let Some(slot) = entry.pipeline {
            self.retire(slot).await;
        }
        info!(
            "🧹 Sesión de guild {} limpiada ({} chunks descartados)",
            session_id, discarded
        );
        true
    }

    pub async fn cleanup_all(&self) {
        let sessions: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        futures::future::join_all(sessions.into_iter().map(|id| self.cleanup_guild(id))).await;
    }

    pub fn get_player(&self, session_id: SessionId) -> Option<Arc<dyn AudioPlayer>> {
        let entry = self.sessions.get(&session_id)?;
        entry.pipeline.as_ref().map(|slot| slot.player.clone())
    }

    pub fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        self.sessions.get(&session_id).map(|entry| entry.state)
    }

    pub fn queued_chunks(&self, session_id: SessionId) -> usize {
        self.sessions
            .get(&session_id)
            .map_or(0, |entry| entry.queue.len())
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Sesiones cuyo reproductor está sonando ahora mismo.
    pub fn playing_sessions(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| {
                entry
                    .pipeline
                    .as_ref()
                    .is_some_and(|slot| slot.player.is_playing())
            })
            .count()
    }

    pub fn stats(&self) -> PlaybackStats {
        let c = &self.counters;
        PlaybackStats {
            drains_started: c.drains_started.load(Ordering::Relaxed),
            chunks_queued: c.chunks_queued.load(Ordering::Relaxed),
            chunks_played: c.chunks_played.load(Ordering::Relaxed),
            chunks_dropped: c.chunks_dropped.load(Ordering::Relaxed),
            pipelines_created: c.pipelines_created.load(Ordering::Relaxed),
            pipelines_destroyed: c.pipelines_destroyed.load(Ordering::Relaxed),
        }
    }

    /// Punto único de despacho de eventos de reproductor.
    pub async fn handle_event(&self, event: SessionEvent) {
        let SessionEvent {
            session_id,
            generation,
            event,
        } = event;

        match event {
            PlayerEvent::Idle => self.on_player_idle(session_id, generation).await,
            PlayerEvent::Error(reason) => {
                self.on_player_error(session_id, generation, reason).await
            }
            PlayerEvent::Destroyed => {
                debug!("Reproductor #{} destruido en guild {}", generation, session_id);
            }
        }
    }

    async fn on_player_idle(&self, session_id: SessionId, generation: u64) {
        let slot = {
            let Some(entry) = self.sessions.get(&session_id) else {
                return;
            };
            if entry.state != SessionState::Idle {
                return;
            }
            entry.pipeline.clone()
        };

        // Si el transporte soltó el stream, el pipeline ya no sirve
        if let Some(slot) = slot.filter(|slot| slot.generation == generation) {
            let closed = slot.pipeline.lock().await.output_closed();
            if closed && self.detach_pipeline(session_id, generation).is_some() {
                debug!("Stream terminado en guild {}, pipeline descartado", session_id);
                self.retire(slot).await;
            }
        }

        self.resume_drain(session_id);
    }

    async fn on_player_error(&self, session_id: SessionId, generation: u64, reason: String) {
        let slot = {
            let Some(mut entry) = self.sessions.get_mut(&session_id) else {
                return;
            };
            if entry.pipeline.as_ref().map(|slot| slot.generation) != Some(generation) {
                debug!(
                    "Error de un pipeline viejo (#{}) ignorado en guild {}",
                    generation, session_id
                );
                return;
            }
            entry.state = SessionState::Recovering;
            entry.pipeline.take()
        };

        error!("❌ Error del reproductor en guild {}: {}", session_id, reason);
        if let Some(slot) = slot {
            self.retire(slot).await;
        }
        self.schedule_retry(session_id);
    }

    fn schedule_retry(&self, session_id: SessionId) {
        let registry = self.self_ref.clone();
        let backoff = self.config.error_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Some(registry) = registry.upgrade() {
                registry.retry_drain(session_id);
            }
        });
    }

    fn retry_drain(&self, session_id: SessionId) {
        let run = {
            let Some(mut entry) = self.sessions.get_mut(&session_id) else {
                return;
            };
            if entry.state != SessionState::Recovering {
                return;
            }
            if entry.queue.is_empty() {
                entry.state = SessionState::Idle;
                None
            } else {
                let run = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
                entry.state = SessionState::Draining { run };
                Some(run)
            }
        };

        if let Some(run) = run {
            info!("🔄 Reintentando reproducción en guild {}", session_id);
            self.spawn_drain(session_id, run);
        }
    }

    fn resume_drain(&self, session_id: SessionId) {
        let run = {
            let Some(mut entry) = self.sessions.get_mut(&session_id) else {
                return;
            };
            if entry.state != SessionState::Idle || entry.queue.is_empty() {
                return;
            }
            let run = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
            entry.state = SessionState::Draining { run };
            run
        };
        self.spawn_drain(session_id, run);
    }

    fn spawn_drain(&self, session_id: SessionId, run: u64) {
        let Some(registry) = self.self_ref.upgrade() else {
            return;
        };
        self.counters.drains_started.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move { registry.drain(session_id, run).await });
    }

    async fn drain(&self, session_id: SessionId, run: u64) {
        debug!("▶️ Drenando cola de guild {} (run {})", session_id, run);

        loop {
            let (slot, next) = {
                let Some(mut entry) = self.sessions.get_mut(&session_id) else {
                    return;
                };
                if entry.state != (SessionState::Draining { run }) {
                    return;
                }
                let slot = match self.ensure_slot(session_id, &mut entry) {
                    Ok(slot) => slot,
                    Err(e) => {
                        error!("❌ No se pudo crear el pipeline de guild {}: {}", session_id, e);
                        entry.state = SessionState::Idle;
                        return;
                    }
                };
                (slot, entry.queue.pop_front())
            };

            match self.ensure_resource(&slot).await {
                Ok(()) => {}
                Err(VoiceError::PipelineDestroyed) => {
                    self.requeue_front(session_id, next);
                    continue;
                }
                Err(e) => {
                    self.requeue_front(session_id, next);
                    self.on_player_error(session_id, slot.generation, e.to_string())
                        .await;
                    return;
                }
            }

            let Some(chunk) = next else {
                let flushed = slot.pipeline.lock().await.flush_residual().await;
                if let Err(e) = flushed {
                    warn!("⚠️ No se pudo vaciar el residuo en guild {}: {}", session_id, e);
                }

                let Some(mut entry) = self.sessions.get_mut(&session_id) else {
                    return;
                };
                if entry.state != (SessionState::Draining { run }) {
                    return;
                }
                if entry.queue.is_empty() {
                    entry.state = SessionState::Idle;
                    debug!("⏹️ Cola de guild {} vacía", session_id);
                    return;
                }
                continue;
            };

            if chunk.is_empty() {
                trace!("Chunk vacío ignorado en guild {}", session_id);
                continue;
            }

            let result = {
                let mut pipeline = slot.pipeline.lock().await;
                match pipeline.convert_input(chunk) {
                    Ok(pcm) => pipeline.write_pcm(&pcm).await,
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(()) => {
                    self.counters.chunks_played.fetch_add(1, Ordering::Relaxed);
                }
                // cleanup o error en curso: la próxima vuelta lo detecta
                Err(VoiceError::PipelineDestroyed) => {
                    self.counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(VoiceError::StreamClosed) => {
                    self.counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                    self.on_player_error(
                        session_id,
                        slot.generation,
                        "el consumidor cerró el stream".to_string(),
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    self.counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("⚠️ Chunk descartado en guild {}: {}", session_id, e);
                }
            }
        }
    }

    async fn ensure_resource(&self, slot: &PipelineSlot) -> VoiceResult<()> {
        let mut pipeline = slot.pipeline.lock().await;
        if pipeline.has_resource() {
            return Ok(());
        }

        let resource = pipeline
            .create_resource()
            .ok_or(VoiceError::PipelineDestroyed)?;
        slot.player.play(resource).await?;
        info!(
            "🔊 Reproducción iniciada en guild {} (pipeline #{})",
            pipeline.session_id(),
            slot.generation
        );
        Ok(())
    }

    fn requeue_front(&self, session_id: SessionId, chunk: Option<Bytes>) {
        if let Some(chunk) = chunk {
            if let Some(mut entry) = self.sessions.get_mut(&session_id) {
                entry.queue.push_front(chunk);
            }
        }
    }

    fn ensure_slot(
        &self,
        session_id: SessionId,
        entry: &mut SessionEntry,
    ) -> VoiceResult<PipelineSlot> {
        if let Some(slot) = &entry.pipeline {
            return Ok(slot.clone());
        }
        let slot = self.build_slot(session_id, &entry.connection)?;
        entry.pipeline = Some(slot.clone());
        Ok(slot)
    }

    fn build_slot(
        &self,
        session_id: SessionId,
        connection: &Arc<dyn VoiceConnection>,
    ) -> VoiceResult<PipelineSlot> {
        let spec = self.config.frame_spec();
        if spec.frame_bytes() == 0 {
            return Err(VoiceError::InvalidFrameSpec(spec));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let sink = PlayerEventSink::new(session_id, generation, self.events.clone());
        let player = connection.create_player(sink)?;

        let codec = self.config.codec;
        if !player.accepts(codec) {
            return Err(VoiceError::UnsupportedCodec(codec));
        }

        let encoder = (self.encoders)(codec, spec, self.config.opus_bitrate)?;
        let resampler = PcmResampler::for_rates(self.config.input_sample_rate, spec.sample_rate)?;
        let pipeline = FramePipeline::new(
            session_id,
            generation,
            spec,
            encoder,
            resampler,
            player.clone(),
            self.config.stream_capacity,
        );
        self.counters.pipelines_created.fetch_add(1, Ordering::Relaxed);

        Ok(PipelineSlot {
            generation,
            cancel: pipeline.cancellation(),
            pipeline: Arc::new(Mutex::new(pipeline)),
            player,
        })
    }

    /// Asocia la sesión a `connection`; si era otra, devuelve el pipeline
    /// suscrito a la conexión vieja para retirarlo.
    fn bind_connection(
        &self,
        entry: &mut SessionEntry,
        connection: &Arc<dyn VoiceConnection>,
    ) -> Option<PipelineSlot> {
        if same_connection(&entry.connection, connection) {
            return None;
        }
        info!(
            "🔀 Nueva conexión de voz para guild {}, se reemplaza el pipeline",
            connection.session_id()
        );
        entry.connection = connection.clone();
        entry.pipeline.take()
    }

    fn detach_pipeline(&self, session_id: SessionId, generation: u64) -> Option<PipelineSlot> {
        let mut entry = self.sessions.get_mut(&session_id)?;
        if entry.pipeline.as_ref().map(|slot| slot.generation) != Some(generation) {
            return None;
        }
        entry.pipeline.take()
    }

    async fn retire(&self, slot: PipelineSlot) {
        // soltar primero a un escritor bloqueado por backpressure
        slot.cancel.cancel();
        slot.pipeline.lock().await.destroy();
        self.counters
            .pipelines_destroyed
            .fetch_add(1, Ordering::Relaxed);
    }

    fn retire_later(&self, slot: PipelineSlot) {
        let Some(registry) = self.self_ref.upgrade() else {
            slot.cancel.cancel();
            return;
        };
        tokio::spawn(async move { registry.retire(slot).await });
    }
}
