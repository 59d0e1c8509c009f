//! # Sesiones HTTP
//! src/session/mod.rs
//!
//! Una sesión se asocia a un request por cookie (`SESSIONID`) o, si el
//! cliente no soporta cookies, por un parámetro en el path
//! (`/carrito;sessionid=...`).
//!
//! La expiración es perezosa: una sesión inactiva más allá de su timeout se
//! trata como inexistente en la siguiente búsqueda. El core no programa
//! barridos periódicos; [`SessionManager::purge_expired`] queda disponible
//! para quien integre el servidor.

pub mod manager;

pub use manager::SessionManager;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// Nombre de la cookie de sesión
pub const SESSION_COOKIE: &str = "SESSIONID";

/// Marcador del id de sesión en URLs reescritas
pub const SESSION_URL_PARAM: &str = ";sessionid=";

struct SessionState {
    last_accessed: SystemTime,
    last_accessed_at: Instant,
    attributes: HashMap<String, Value>,
    is_new: bool,
    valid: bool,
}

/// Sesión de usuario con atributos arbitrarios (JSON)
pub struct Session {
    id: String,
    created: SystemTime,
    max_inactive: Duration,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(id: String, max_inactive: Duration) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            created: now,
            max_inactive,
            state: Mutex::new(SessionState {
                last_accessed: now,
                last_accessed_at: Instant::now(),
                attributes: HashMap::new(),
                is_new: true,
                valid: true,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn last_accessed(&self) -> SystemTime {
        self.state().last_accessed
    }

    /// Timeout de inactividad (cero = no expira)
    pub fn max_inactive(&self) -> Duration {
        self.max_inactive
    }

    /// true hasta que el cliente vuelve a presentar la sesión
    pub fn is_new(&self) -> bool {
        self.state().is_new
    }

    pub fn is_valid(&self) -> bool {
        self.state().valid
    }

    /// Verifica si la inactividad supera el timeout en el instante `now`
    pub fn is_expired_at(&self, now: Instant) -> bool {
        let state = self.state();
        if !state.valid {
            return true;
        }
        !self.max_inactive.is_zero()
            && now.saturating_duration_since(state.last_accessed_at) > self.max_inactive
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Registra un nuevo acceso del cliente
    pub(crate) fn touch(&self) {
        let mut state = self.state();
        state.last_accessed = SystemTime::now();
        state.last_accessed_at = Instant::now();
        state.is_new = false;
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.state().attributes.get(name).cloned()
    }

    pub fn set_attribute(&self, name: &str, value: Value) {
        self.state().attributes.insert(name.to_string(), value);
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.state().attributes.remove(name)
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.state().attributes.keys().cloned().collect()
    }

    /// Invalida la sesión; el manager la descarta en la próxima búsqueda
    pub fn invalidate(&self) {
        let mut state = self.state();
        state.valid = false;
        state.attributes.clear();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created", &self.created)
            .field("max_inactive", &self.max_inactive)
            .finish()
    }
}
