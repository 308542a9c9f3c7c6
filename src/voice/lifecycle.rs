use bytes::Bytes;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{same_connection, ConnectionState, SessionId, VoiceConnection, VoiceTransport};
use crate::{
    audio::registry::PlaybackRegistry,
    config::LifecycleConfig,
    error::{VoiceError, VoiceResult},
};

/// Avisos del ciclo de vida para la capa del bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    Ready {
        session_id: SessionId,
        channel_id: ChannelId,
    },
    /// La conexión se perdió sin recuperarse y la sesión fue limpiada.
    Lost { session_id: SessionId, reason: String },
    /// Salida pedida por el propio bot.
    Closed { session_id: SessionId },
}

struct ConnectionEntry {
    connection: Arc<dyn VoiceConnection>,
    watcher: CancellationToken,
}

/// Gestiona las conexiones de voz: espera a que estén listas, distingue
/// cortes transitorios de pérdidas definitivas y limpia el registro de
/// reproducción cuando una sesión termina.
pub struct ConnectionManager {
    transport: Arc<dyn VoiceTransport>,
    registry: Arc<PlaybackRegistry>,
    config: LifecycleConfig,
    connections: DashMap<SessionId, ConnectionEntry>,
    notices: broadcast::Sender<SessionNotice>,
    self_ref: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn VoiceTransport>,
        registry: Arc<PlaybackRegistry>,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        let (notices, _) = broadcast::channel(64);
        Arc::new_cyclic(|self_ref| Self {
            transport,
            registry,
            config,
            connections: DashMap::new(),
            notices,
            self_ref: self_ref.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<PlaybackRegistry> {
        &self.registry
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn connection(&self, session_id: SessionId) -> Option<Arc<dyn VoiceConnection>> {
        self.connections
            .get(&session_id)
            .map(|entry| entry.connection.clone())
    }

    pub fn connected_sessions(&self) -> Vec<SessionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Pide la conexión al transporte y vuelve sin esperar a que esté lista.
    /// Si ya había una conexión viva al mismo canal, la reutiliza.
    pub async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> VoiceResult<Arc<dyn VoiceConnection>> {
        if let Some(existing) = self.connection(guild_id) {
            if existing.channel_id() == channel_id
                && existing.state() != ConnectionState::Destroyed
            {
                debug!("Reutilizando conexión de voz en guild {}", guild_id);
                return Ok(existing);
            }
            info!("🔀 Cambiando de canal en guild {}", guild_id);
            self.cleanup(guild_id).await;
        }

        info!("🔗 Uniéndose al canal {} en guild {}", channel_id, guild_id);
        let connection = self.transport.join(guild_id, channel_id).await?;

        // suscribir antes de soltar la tarea para no perder transiciones
        let transitions = connection.states().subscribe();
        let watcher = CancellationToken::new();
        self.connections.insert(
            guild_id,
            ConnectionEntry {
                connection: connection.clone(),
                watcher: watcher.clone(),
            },
        );

        tokio::spawn(Self::watch(
            self.self_ref.clone(),
            connection.clone(),
            transitions,
            watcher,
        ));
        Ok(connection)
    }

    pub async fn await_ready(
        &self,
        connection: &Arc<dyn VoiceConnection>,
        timeout: Duration,
    ) -> VoiceResult<()> {
        connection
            .states()
            .wait_for(ConnectionState::Ready, timeout)
            .await
    }

    /// Une, espera `Ready` y prepara el reproductor de la sesión. Cualquier
    /// fallo deja la sesión limpia.
    pub async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> VoiceResult<Arc<dyn VoiceConnection>> {
        let result: VoiceResult<Arc<dyn VoiceConnection>> = async {
            let connection = self.join(guild_id, channel_id).await?;
            self.await_ready(&connection, self.config.ready_timeout).await?;
            self.registry.attach(&connection)?;
            Ok(connection)
        }
        .await;

        match result {
            Ok(connection) => {
                info!("✅ Conexión de voz lista en guild {}", guild_id);
                let _ = self.notices.send(SessionNotice::Ready {
                    session_id: guild_id,
                    channel_id,
                });
                Ok(connection)
            }
            Err(e) => {
                error!("❌ No se pudo conectar en guild {}: {}", guild_id, e);
                self.cleanup(guild_id).await;
                Err(e)
            }
        }
    }

    /// Encola PCM para una sesión ya conectada.
    pub fn speak(&self, session_id: SessionId, pcm: Bytes) -> VoiceResult<()> {
        let connection = self
            .connection(session_id)
            .ok_or(VoiceError::NotConnected(session_id))?;
        self.registry.play_audio_to_channel(&connection, pcm)
    }

    /// Destruye la conexión de la sesión y limpia su reproducción.
    ///
    /// Puede llamarse desde varios caminos de fallo a la vez: solo el primero
    /// destruye la conexión (y devuelve `true`); la limpieza del registro se
    /// hace siempre.
    pub async fn cleanup(&self, session_id: SessionId) -> bool {
        let removed = self.connections.remove(&session_id);
        let first = match removed {
            Some((_, entry)) => {
                self.teardown(session_id, entry).await;
                true
            }
            None => false,
        };
        self.registry.cleanup_guild(session_id).await;
        first
    }

    pub async fn leave(&self, session_id: SessionId) {
        if self.cleanup(session_id).await {
            info!("👋 Saliendo del canal de voz en guild {}", session_id);
            let _ = self.notices.send(SessionNotice::Closed { session_id });
        }
    }

    pub async fn leave_all(&self) {
        let sessions = self.connected_sessions();
        info!("👋 Saliendo de {} canales de voz", sessions.len());
        futures::future::join_all(sessions.into_iter().map(|id| self.leave(id))).await;
        self.registry.cleanup_all().await;
    }

    async fn teardown(&self, session_id: SessionId, entry: ConnectionEntry) {
        entry.watcher.cancel();
        entry.connection.destroy().await;
        debug!("Conexión de voz destruida en guild {}", session_id);
    }

    /// Como `cleanup`, pero solo si la sesión sigue usando `connection`.
    async fn cleanup_connection(&self, connection: &Arc<dyn VoiceConnection>) -> bool {
        let session_id = connection.session_id();
        let Some((_, entry)) = self
            .connections
            .remove_if(&session_id, |_, entry| same_connection(&entry.connection, connection))
        else {
            return false;
        };

        self.teardown(session_id, entry).await;
        self.registry.cleanup_guild(session_id).await;
        true
    }

    async fn lose(&self, connection: &Arc<dyn VoiceConnection>, reason: String) {
        let session_id = connection.session_id();
        if self.cleanup_connection(connection).await {
            error!("💀 Conexión de voz perdida en guild {}: {}", session_id, reason);
            let _ = self
                .notices
                .send(SessionNotice::Lost { session_id, reason });
        }
    }

    async fn watch(
        manager: Weak<Self>,
        connection: Arc<dyn VoiceConnection>,
        mut transitions: broadcast::Receiver<ConnectionState>,
        stop: CancellationToken,
    ) {
        let session_id = connection.session_id();
        loop {
            let received = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                received = transitions.recv() => received,
            };

            let state = match received {
                Ok(state) => state,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Watcher de guild {} atrasado ({} estados)", session_id, skipped);
                    connection.state()
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let Some(manager) = manager.upgrade() else {
                break;
            };
            match state {
                ConnectionState::Disconnected => manager.handle_disconnect(&connection).await,
                ConnectionState::Destroyed => {
                    manager
                        .lose(&connection, "el transporte destruyó la conexión".to_string())
                        .await;
                    break;
                }
                other => debug!("Conexión de guild {} en {:?}", session_id, other),
            }
        }
        debug!("Watcher de guild {} terminado", session_id);
    }

    async fn handle_disconnect(&self, connection: &Arc<dyn VoiceConnection>) {
        let session_id = connection.session_id();
        if connection.state() == ConnectionState::Ready {
            debug!("Desconexión ya recuperada en guild {}", session_id);
            return;
        }

        warn!(
            "⚠️ Conexión de voz caída en guild {}, esperando reconexión ({})",
            session_id,
            humantime::format_duration(self.config.reconnect_grace)
        );

        let grace = self.config.reconnect_grace;
        let states = connection.states();
        let recovered = tokio::select! {
            Ok(()) = states.wait_for(ConnectionState::Signalling, grace) => true,
            Ok(()) = states.wait_for(ConnectionState::Connecting, grace) => true,
            // songbird puede saltar directo a Ready
            Ok(()) = states.wait_for(ConnectionState::Ready, grace) => true,
            else => false,
        };

        if !recovered {
            self.lose(connection, format!("sin reconexión en {:?}", grace))
                .await;
            return;
        }

        if let Some(limit) = self.config.stuck_watchdog {
            if let Err(e) = states.wait_for(ConnectionState::Ready, limit).await {
                self.lose(connection, format!("reconexión atascada: {}", e))
                    .await;
                return;
            }
        }

        info!("🔄 Conexión de voz recuperándose en guild {}", session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{encoder::StreamCodec, registry::SessionState},
        config::PlaybackConfig,
        voice::testing::MockTransport,
    };
    use pretty_assertions::assert_eq;

    const GUILD: GuildId = GuildId::new(7);
    const CHANNEL: ChannelId = ChannelId::new(70);

    fn manager_with(
        transport: Arc<MockTransport>,
        lifecycle: LifecycleConfig,
    ) -> Arc<ConnectionManager> {
        let registry = PlaybackRegistry::new(PlaybackConfig {
            codec: StreamCodec::RawPcm,
            ..PlaybackConfig::default()
        });
        ConnectionManager::new(transport, registry, lifecycle)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_attaches_player() {
        let transport = MockTransport::auto_ready();
        let manager = manager_with(transport.clone(), LifecycleConfig::default());
        let mut notices = manager.subscribe_notices();

        let connection = manager.connect(GUILD, CHANNEL).await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Ready);
        assert!(manager.registry().get_player(GUILD).is_some());
        assert_eq!(
            manager.registry().session_state(GUILD),
            Some(SessionState::Idle)
        );
        assert_eq!(
            notices.try_recv().unwrap(),
            SessionNotice::Ready {
                session_id: GUILD,
                channel_id: CHANNEL
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_cleans_up() {
        let transport = MockTransport::stalled();
        let manager = manager_with(transport.clone(), LifecycleConfig::default());

        let result = manager.connect(GUILD, CHANNEL).await;
        assert!(matches!(
            result,
            Err(VoiceError::ConnectionTimeout {
                expected: ConnectionState::Ready,
                ..
            })
        ));

        let connection = transport.last_connection().unwrap();
        assert_eq!(connection.destroy_count(), 1);
        assert!(manager.connection(GUILD).is_none());
        assert_eq!(manager.registry().session_state(GUILD), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_disconnect_keeps_session() {
        let transport = MockTransport::auto_ready();
        let manager = manager_with(transport.clone(), LifecycleConfig::default());
        manager.connect(GUILD, CHANNEL).await.unwrap();
        let connection = transport.last_connection().unwrap();

        connection.set_state(ConnectionState::Disconnected);
        settle().await;
        connection.set_state(ConnectionState::Connecting);
        connection.set_state(ConnectionState::Ready);
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(connection.destroy_count(), 0);
        assert!(manager.connection(GUILD).is_some());
        assert!(manager.registry().get_player(GUILD).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_loss_cleans_up_once() {
        let transport = MockTransport::auto_ready();
        let manager = manager_with(transport.clone(), LifecycleConfig::default());
        manager.connect(GUILD, CHANNEL).await.unwrap();
        let mut notices = manager.subscribe_notices();
        let connection = transport.last_connection().unwrap();

        connection.set_state(ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(connection.destroy_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(connection.destroy_count(), 1);
        assert!(manager.connection(GUILD).is_none());
        assert_eq!(manager.registry().session_state(GUILD), None);

        assert!(matches!(
            notices.try_recv(),
            Ok(SessionNotice::Lost { session_id, .. }) if session_id == GUILD
        ));
        assert!(notices.try_recv().is_err());

        // un segundo camino de fallo no vuelve a destruir
        assert!(!manager.cleanup(GUILD).await);
        assert_eq!(connection.destroy_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_watchdog_treats_stalled_reconnect_as_loss() {
        let transport = MockTransport::auto_ready();
        let manager = manager_with(
            transport.clone(),
            LifecycleConfig {
                stuck_watchdog: Some(Duration::from_secs(2)),
                ..LifecycleConfig::default()
            },
        );
        manager.connect(GUILD, CHANNEL).await.unwrap();
        let connection = transport.last_connection().unwrap();

        connection.set_state(ConnectionState::Disconnected);
        settle().await;
        connection.set_state(ConnectionState::Connecting);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connection.destroy_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(connection.destroy_count(), 1);
        assert!(manager.connection(GUILD).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_destroy_cleans_registry() {
        let transport = MockTransport::auto_ready();
        let manager = manager_with(transport.clone(), LifecycleConfig::default());
        manager.connect(GUILD, CHANNEL).await.unwrap();
        let connection = transport.last_connection().unwrap();

        connection.set_state(ConnectionState::Destroyed);
        settle().await;

        assert!(manager.connection(GUILD).is_none());
        assert_eq!(manager.registry().session_state(GUILD), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speak_routes_to_registry() {
        let transport = MockTransport::auto_ready();
        let manager = manager_with(transport.clone(), LifecycleConfig::default());

        assert!(matches!(
            manager.speak(GUILD, Bytes::from_static(&[1, 2, 3, 4])),
            Err(VoiceError::NotConnected(_))
        ));

        manager.connect(GUILD, CHANNEL).await.unwrap();
        let pcm: Bytes = (0..1920u32).map(|i| (i % 200) as u8).collect();
        manager.speak(GUILD, pcm.clone()).unwrap();
        settle().await;

        let player = transport.last_connection().unwrap().last_player().unwrap();
        assert_eq!(player.received_bytes(), pcm.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_all_closes_every_session() {
        let transport = MockTransport::auto_ready();
        let manager = manager_with(transport.clone(), LifecycleConfig::default());
        manager.connect(GUILD, CHANNEL).await.unwrap();
        let first = transport.last_connection().unwrap();
        manager
            .connect(GuildId::new(8), ChannelId::new(80))
            .await
            .unwrap();
        let second = transport.last_connection().unwrap();
        let mut notices = manager.subscribe_notices();

        manager.leave_all().await;

        assert_eq!(first.destroy_count(), 1);
        assert_eq!(second.destroy_count(), 1);
        assert!(manager.connected_sessions().is_empty());
        assert!(manager.registry().active_sessions().is_empty());
        assert!(matches!(notices.try_recv(), Ok(SessionNotice::Closed { .. })));
        assert!(matches!(notices.try_recv(), Ok(SessionNotice::Closed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_reuses_live_connection() {
        let transport = MockTransport::auto_ready();
        let manager = manager_with(transport.clone(), LifecycleConfig::default());

        let first = manager.connect(GUILD, CHANNEL).await.unwrap();
        let again = manager.join(GUILD, CHANNEL).await.unwrap();
        assert!(same_connection(&first, &again));
        assert_eq!(transport.connections_made(), 1);
        assert_eq!(transport.last_connection().unwrap().destroy_count(), 0);

        manager.join(GUILD, ChannelId::new(71)).await.unwrap();
        assert!(!same_connection(&first, &manager.connection(GUILD).unwrap()));
        assert_eq!(transport.connections_made(), 2);
    }
}
