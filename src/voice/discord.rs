//! Implementación de los traits de voz sobre songbird.

use async_trait::async_trait;
use bytes::Bytes;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    error::ControlError,
    events::CoreEvent,
    input::{Input, RawAdapter},
    tracks::TrackHandle,
    Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::{
    io::{self, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use symphonia::core::io::ReadOnlySource;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    AudioPlayer, AudioResource, ConnectionState, ConnectionStateCell, PlayerEvent,
    PlayerEventSink, SessionId, VoiceConnection, VoiceTransport,
};
use crate::{
    audio::{encoder::StreamCodec, frame::FrameSpec},
    error::{VoiceError, VoiceResult},
};

const F32_BYTES: usize = 4;

pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    spec: FrameSpec,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, spec: FrameSpec) -> Self {
        Self { manager, spec }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> VoiceResult<Arc<dyn VoiceConnection>> {
        let call = self.manager.get_or_insert(guild_id);
        let states = Arc::new(ConnectionStateCell::new(ConnectionState::Signalling));

        {
            let mut handler = call.lock().await;
            // los forwarders de una conexión anterior apuntan a otra celda
            handler.remove_all_global_events();
            for event in [
                CoreEvent::DriverConnect,
                CoreEvent::DriverReconnect,
                CoreEvent::DriverDisconnect,
            ] {
                handler.add_global_event(
                    Event::Core(event),
                    ConnectionStateForwarder {
                        guild_id,
                        states: states.clone(),
                    },
                );
            }
        }

        // El establecimiento sigue en segundo plano; el ciclo de vida lo
        // observa a través de la celda de estados.
        let connecting = call.clone();
        let cell = states.clone();
        tokio::spawn(async move {
            let join = {
                let mut handler = connecting.lock().await;
                handler.join(channel_id).await
            };

            match join {
                Ok(join) => {
                    cell.set(ConnectionState::Connecting);
                    match join.await {
                        Ok(()) => {
                            cell.set(ConnectionState::Ready);
                        }
                        Err(e) => {
                            error!("❌ Conexión de voz fallida en guild {}: {:?}", guild_id, e);
                            cell.set(ConnectionState::Destroyed);
                        }
                    }
                }
                Err(e) => {
                    error!("❌ No se pudo iniciar la conexión en guild {}: {:?}", guild_id, e);
                    cell.set(ConnectionState::Destroyed);
                }
            }
        });

        Ok(Arc::new(SongbirdConnection {
            guild_id,
            channel_id,
            manager: self.manager.clone(),
            call,
            states,
            spec: self.spec,
        }))
    }
}

pub struct SongbirdConnection {
    guild_id: GuildId,
    channel_id: ChannelId,
    manager: Arc<Songbird>,
    call: Arc<Mutex<Call>>,
    states: Arc<ConnectionStateCell>,
    spec: FrameSpec,
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    fn session_id(&self) -> SessionId {
        self.guild_id
    }

    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    fn states(&self) -> &ConnectionStateCell {
        &self.states
    }

    fn create_player(&self, events: PlayerEventSink) -> VoiceResult<Arc<dyn AudioPlayer>> {
        Ok(Arc::new(SongbirdPlayer {
            call: self.call.clone(),
            events,
            spec: self.spec,
            track: parking_lot::Mutex::new(None),
            playing: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn destroy(&self) {
        if let Err(e) = self.manager.remove(self.guild_id).await {
            debug!("Llamada de guild {} ya no existía: {:?}", self.guild_id, e);
        }
        self.states.set(ConnectionState::Destroyed);
    }
}

/// Reproductor sobre una pista de songbird. Solo acepta f32 intercalado:
/// songbird mezcla y codifica a Opus por su cuenta.
pub struct SongbirdPlayer {
    call: Arc<Mutex<Call>>,
    events: PlayerEventSink,
    spec: FrameSpec,
    track: parking_lot::Mutex<Option<TrackHandle>>,
    playing: Arc<AtomicBool>,
}

#[async_trait]
impl AudioPlayer for SongbirdPlayer {
    fn accepts(&self, codec: StreamCodec) -> bool {
        codec == StreamCodec::FloatPcm
    }

    async fn play(&self, resource: AudioResource) -> VoiceResult<()> {
        if !self.accepts(resource.codec) {
            return Err(VoiceError::UnsupportedCodec(resource.codec));
        }

        let source = ReadOnlySource::new(PacketReader::new(
            resource.packets,
            silence_bytes(self.spec),
        ));
        let input: Input =
            RawAdapter::new(source, self.spec.sample_rate, self.spec.channels as u32).into();

        let handle = {
            let mut call = self.call.lock().await;
            call.play_only_input(input)
        };

        for event in [TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(
                    Event::Track(event),
                    TrackStateForwarder {
                        events: self.events.clone(),
                        playing: self.playing.clone(),
                    },
                )
                .map_err(|e| VoiceError::Player(e.to_string()))?;
        }

        self.playing.store(true, Ordering::SeqCst);
        *self.track.lock() = Some(handle);
        info!("🔊 Pista en vivo iniciada en guild {}", self.events.session_id());
        Ok(())
    }

    fn stop(&self) -> VoiceResult<()> {
        self.playing.store(false, Ordering::SeqCst);
        let Some(handle) = self.track.lock().take() else {
            return Ok(());
        };
        match handle.stop() {
            Ok(()) | Err(ControlError::Finished) => Ok(()),
            Err(e) => Err(VoiceError::Player(e.to_string())),
        }
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

/// Traduce los eventos del driver a transiciones de [`ConnectionState`].
struct ConnectionStateForwarder {
    guild_id: GuildId,
    states: Arc<ConnectionStateCell>,
}

#[async_trait]
impl VoiceEventHandler for ConnectionStateForwarder {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::DriverConnect(_) => {
                self.states.set(ConnectionState::Ready);
            }
            EventContext::DriverReconnect(_) => {
                info!("🔄 Driver de voz reconectado en guild {}", self.guild_id);
                self.states.set(ConnectionState::Connecting);
                self.states.set(ConnectionState::Ready);
            }
            EventContext::DriverDisconnect(data) => {
                warn!(
                    "🔌 Driver de voz desconectado en guild {}: {:?}",
                    self.guild_id, data.reason
                );
                self.states.set(ConnectionState::Disconnected);
            }
            _ => {}
        }
        None
    }
}

struct TrackStateForwarder {
    events: PlayerEventSink,
    playing: Arc<AtomicBool>,
}

#[async_trait]
impl VoiceEventHandler for TrackStateForwarder {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(tracks) = ctx {
            for (state, _handle) in *tracks {
                self.playing.store(false, Ordering::SeqCst);
                match &state.playing {
                    songbird::tracks::PlayMode::Errored(e) => {
                        self.events.emit(PlayerEvent::Error(format!("{:?}", e)))
                    }
                    _ => self.events.emit(PlayerEvent::Idle),
                }
            }
        }
        None
    }
}

/// Un frame f32 de silencio; `samples_per_frame` ya cuenta todos los canales.
fn silence_bytes(spec: FrameSpec) -> usize {
    spec.samples_per_frame() * F32_BYTES
}

/// Adapta el stream de frames a `Read` para el `RawAdapter` de songbird.
///
/// El mezclador lee en su propio hilo y no puede esperar: sin frames
/// disponibles entrega silencio, y cuando el pipeline suelta el stream
/// devuelve EOF para que la pista termine.
struct PacketReader {
    packets: flume::Receiver<Bytes>,
    pending: Bytes,
    silence: usize,
}

impl PacketReader {
    fn new(packets: flume::Receiver<Bytes>, silence: usize) -> Self {
        Self {
            packets,
            pending: Bytes::new(),
            silence,
        }
    }
}

impl Read for PacketReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.packets.try_recv() {
                Ok(packet) => self.pending = packet,
                Err(flume::TryRecvError::Empty) => {
                    let n = buf.len().min(self.silence);
                    buf[..n].fill(0);
                    return Ok(n);
                }
                Err(flume::TryRecvError::Disconnected) => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    #[test]
    fn test_reader_splits_packets_across_reads() {
        let (tx, rx) = flume::bounded(4);
        tx.send(Bytes::from_static(&[1, 2, 3, 4, 5, 6])).unwrap();
        let mut reader = PacketReader::new(rx, 8);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[5, 6]);
    }

    #[test]
    fn test_reader_fills_silence_when_starved() {
        let (_tx, rx) = flume::bounded::<Bytes>(4);
        let mut reader = PacketReader::new(rx, 8);

        let mut buf = [0xFFu8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 8);
        assert!(buf[..8].iter().all(|&b| b == 0));
        assert!(buf[8..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_reader_ends_when_stream_closes() {
        let (tx, rx) = flume::bounded(4);
        tx.send(Bytes::from_static(&[9, 9])).unwrap();
        drop(tx);
        let mut reader = PacketReader::new(rx, 8);

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_starvation_silence_is_one_frame() {
        assert_eq!(silence_bytes(FrameSpec::DISCORD_MONO), 960 * F32_BYTES);

        let stereo = FrameSpec {
            channels: 2,
            ..FrameSpec::DISCORD_MONO
        };
        assert_eq!(silence_bytes(stereo), 1920 * F32_BYTES);
    }

    #[tokio::test]
    async fn test_player_only_accepts_float_pcm() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let call = Call::standalone(GuildId::new(1), UserId::new(2));
        let player = SongbirdPlayer {
            call: Arc::new(Mutex::new(call)),
            events: PlayerEventSink::new(GuildId::new(1), 1, tx),
            spec: FrameSpec::DISCORD_MONO,
            track: parking_lot::Mutex::new(None),
            playing: Arc::new(AtomicBool::new(false)),
        };

        assert!(player.accepts(StreamCodec::FloatPcm));
        assert!(!player.accepts(StreamCodec::Opus));
        assert!(!player.is_playing());
        player.stop().unwrap();
    }
}
