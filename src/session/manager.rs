//! # Gestor de Sesiones
//! src/session/manager.rs
//!
//! Tabla id -> sesión compartida por todos los workers.

use super::Session;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Gestor thread-safe de sesiones
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    counter: AtomicU64,
    timeout_secs: AtomicU64,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            timeout_secs: AtomicU64::new(timeout.as_secs()),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Timeout aplicado a las sesiones creadas a partir de ahora
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_secs.store(timeout.as_secs(), Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.load(Ordering::Relaxed))
    }

    /// Genera un id único: `<timestamp>.<contador>.<digest>`
    ///
    /// El contador es monotónico; el digest evita que los ids sean
    /// predecibles a partir de los dos primeros campos.
    fn generate_id(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let millis = since_epoch.as_millis();

        let mut hasher = Sha256::new();
        hasher.update(counter.to_le_bytes());
        hasher.update(since_epoch.as_nanos().to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(format!("{:?}", std::thread::current().id()).as_bytes());
        let digest = hasher.finalize();
        let suffix: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();

        format!("{:x}.{:x}.{}", millis, counter, suffix)
    }

    /// Crea y registra una sesión nueva
    pub fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(self.generate_id(), self.timeout()));
        self.sessions()
            .insert(session.id().to_string(), Arc::clone(&session));
        debug!(session = session.id(), "session created");
        session
    }

    /// Busca una sesión viva por id exacto
    ///
    /// Una sesión expirada o invalidada se elimina y se trata como ausente.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions();
        let session = sessions.get(id)?;
        if session.is_expired() {
            debug!(session = id, "session expired");
            sessions.remove(id);
            return None;
        }
        let session = Arc::clone(session);
        drop(sessions);
        session.touch();
        Some(session)
    }

    pub fn invalidate(&self, id: &str) -> bool {
        match self.sessions().remove(id) {
            Some(session) => {
                session.invalidate();
                true
            }
            None => false,
        }
    }

    /// Elimina las sesiones expiradas; retorna cuántas se eliminaron
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn clear(&self) {
        self.sessions().clear();
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.len())
            .field("timeout", &self.timeout())
            .finish()
    }
}
