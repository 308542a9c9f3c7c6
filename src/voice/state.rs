use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{VoiceError, VoiceResult};

/// Estado de una conexión de voz tal como lo reporta el transporte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Signalling,
    Connecting,
    Ready,
    Disconnected,
    Destroyed,
}

impl ConnectionState {
    /// Transiciones que el transporte puede reportar. `Destroyed` es
    /// alcanzable desde cualquier estado y es terminal.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Signalling, Connecting) | (Connecting, Ready) => true,
            (Ready, Disconnected) | (Connecting, Disconnected) | (Signalling, Disconnected) => true,
            (Disconnected, Signalling) | (Disconnected, Connecting) => true,
            // songbird solo avisa al terminar la reconexión
            (Disconnected, Ready) => true,
            _ => false,
        }
    }
}

/// Estado actual de una conexión más la difusión de cada transición.
///
/// Se usa `broadcast` en vez de `watch` porque el manejo de desconexiones
/// necesita ver estados intermedios (`Connecting`) aunque la conexión pase
/// a `Ready` inmediatamente después.
#[derive(Debug)]
pub struct ConnectionStateCell {
    current: RwLock<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl ConnectionStateCell {
    pub fn new(initial: ConnectionState) -> Self {
        let (transitions, _) = broadcast::channel(32);
        Self {
            current: RwLock::new(initial),
            transitions,
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.current.read()
    }

    /// Aplica una transición. Devuelve `false` si no es válida desde el
    /// estado actual (p.ej. cualquier cosa después de `Destroyed`).
    pub fn set(&self, next: ConnectionState) -> bool {
        let mut current = self.current.write();
        if *current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            debug!("Transición ignorada: {:?} -> {:?}", *current, next);
            return false;
        }
        *current = next;
        // sin suscriptores el envío falla, no importa
        let _ = self.transitions.send(next);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Espera hasta que la conexión esté en `target` o pase `timeout`.
    ///
    /// Termina con `ConnectionDestroyed` si la conexión muere antes.
    pub async fn wait_for(&self, target: ConnectionState, timeout: Duration) -> VoiceResult<()> {
        // suscribir antes de leer el estado para no perder transiciones
        let mut rx = self.subscribe();
        let current = self.get();
        if current == target {
            return Ok(());
        }
        if current == ConnectionState::Destroyed {
            return Err(VoiceError::ConnectionDestroyed);
        }

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(state) if state == target => return Ok(()),
                    Ok(ConnectionState::Destroyed) => return Err(VoiceError::ConnectionDestroyed),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Receptor de estados atrasado ({} transiciones)", skipped);
                        if self.get() == target {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(VoiceError::ConnectionDestroyed)
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| VoiceError::ConnectionTimeout {
                expected: target,
                timeout,
            })?
    }
}
