//! Transporte falso para los tests del registro y del ciclo de vida.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use tokio::task::JoinHandle;

use super::{
    AudioPlayer, AudioResource, ConnectionState, ConnectionStateCell, PlayerEvent,
    PlayerEventSink, SessionId, VoiceConnection, VoiceTransport,
};
use crate::{
    audio::encoder::StreamCodec,
    error::{VoiceError, VoiceResult},
};

/// Reproductor que consume el stream en una tarea y guarda cada frame.
#[derive(Default)]
pub struct MockPlayer {
    sink: Option<PlayerEventSink>,
    received: Arc<Mutex<Vec<Bytes>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    held: Mutex<Option<AudioResource>>,
    plays: AtomicUsize,
    stops: AtomicUsize,
    fail_play: AtomicBool,
    stall: AtomicBool,
}

impl MockPlayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_sink(sink: PlayerEventSink) -> Arc<Self> {
        Arc::new(Self {
            sink: Some(sink),
            ..Self::default()
        })
    }

    pub fn emit(&self, event: PlayerEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    /// El reproductor acepta el recurso pero no lo lee nunca, así el
    /// pipeline queda frenado por backpressure.
    pub fn stall(&self) {
        self.stall.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_play(&self) {
        self.fail_play.store(true, Ordering::SeqCst);
    }

    /// Simula que el transporte soltó la pista: el stream queda sin lector.
    pub fn drop_stream(&self) {
        if let Some(consumer) = self.consumer.lock().take() {
            consumer.abort();
        }
    }

    pub fn play_count(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.received.lock().clone()
    }

    pub fn received_bytes(&self) -> Vec<u8> {
        self.received
            .lock()
            .iter()
            .flat_map(|frame| frame.iter().copied())
            .collect()
    }
}

#[async_trait]
impl AudioPlayer for MockPlayer {
    fn accepts(&self, _codec: StreamCodec) -> bool {
        true
    }

    async fn play(&self, resource: AudioResource) -> VoiceResult<()> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        if self.fail_play.swap(false, Ordering::SeqCst) {
            return Err(VoiceError::Player("play rechazado".to_string()));
        }

        if self.stall.load(Ordering::SeqCst) {
            *self.held.lock() = Some(resource);
            return Ok(());
        }

        let received = self.received.clone();
        let consumer = tokio::spawn(async move {
            while let Ok(packet) = resource.packets.recv_async().await {
                received.lock().push(packet);
            }
        });
        *self.consumer.lock() = Some(consumer);
        Ok(())
    }

    fn stop(&self) -> VoiceResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.consumer
            .lock()
            .as_ref()
            .is_some_and(|consumer| !consumer.is_finished())
    }
}

pub struct MockConnection {
    session_id: SessionId,
    channel_id: ChannelId,
    cell: ConnectionStateCell,
    players: Mutex<Vec<Arc<MockPlayer>>>,
    destroys: AtomicUsize,
    stall_players: AtomicBool,
    fail_next_play: AtomicBool,
}

impl MockConnection {
    pub fn new(session_id: u64, initial: ConnectionState) -> Arc<Self> {
        Self::in_channel(session_id, ChannelId::new(session_id + 1000), initial)
    }

    pub fn in_channel(
        session_id: u64,
        channel_id: ChannelId,
        initial: ConnectionState,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: GuildId::new(session_id),
            channel_id,
            cell: ConnectionStateCell::new(initial),
            players: Mutex::new(Vec::new()),
            destroys: AtomicUsize::new(0),
            stall_players: AtomicBool::new(false),
            fail_next_play: AtomicBool::new(false),
        })
    }

    pub fn ready(session_id: u64) -> Arc<Self> {
        Self::new(session_id, ConnectionState::Ready)
    }

    pub fn as_dyn(self: &Arc<Self>) -> Arc<dyn VoiceConnection> {
        self.clone()
    }

    pub fn stall_players(&self) {
        self.stall_players.store(true, Ordering::SeqCst);
    }

    /// El próximo reproductor creado rechaza su primer `play`.
    pub fn fail_next_play(&self) {
        self.fail_next_play.store(true, Ordering::SeqCst);
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.cell.set(state);
    }

    pub fn players(&self) -> Vec<Arc<MockPlayer>> {
        self.players.lock().clone()
    }

    pub fn last_player(&self) -> Option<Arc<MockPlayer>> {
        self.players.lock().last().cloned()
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceConnection for MockConnection {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    fn states(&self) -> &ConnectionStateCell {
        &self.cell
    }

    fn create_player(&self, events: PlayerEventSink) -> VoiceResult<Arc<dyn AudioPlayer>> {
        let player = MockPlayer::with_sink(events);
        if self.stall_players.load(Ordering::SeqCst) {
            player.stall();
        }
        if self.fail_next_play.swap(false, Ordering::SeqCst) {
            player.fail_next_play();
        }
        self.players.lock().push(player.clone());
        Ok(player)
    }

    async fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.cell.set(ConnectionState::Destroyed);
    }
}

/// Transporte que crea [`MockConnection`]s. Con `auto_ready` cada conexión
/// pasa sola por `Connecting` hasta `Ready`.
#[derive(Default)]
pub struct MockTransport {
    auto_ready: bool,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockTransport {
    pub fn auto_ready() -> Arc<Self> {
        Arc::new(Self {
            auto_ready: true,
            ..Self::default()
        })
    }

    pub fn stalled() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().last().cloned()
    }

    pub fn connections_made(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl VoiceTransport for MockTransport {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> VoiceResult<Arc<dyn VoiceConnection>> {
        let connection =
            MockConnection::in_channel(guild_id.get(), channel_id, ConnectionState::Signalling);
        self.connections.lock().push(connection.clone());

        if self.auto_ready {
            let establishing = connection.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                establishing.set_state(ConnectionState::Connecting);
                establishing.set_state(ConnectionState::Ready);
            });
        }
        Ok(connection)
    }
}
