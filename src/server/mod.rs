//! # Módulo del Servidor HTTP
//! src/server/mod.rs
//!
//! Arma el servidor completo:
//! 1. Un [`SocketListener`] por esquema (http y https)
//! 2. Un [`TransactionManager`] con los pools y el control de admisión
//! 3. Un thread por conexión que corre su [`Transaction`]
//!
//! ## Ejemplo de uso
//!
//! ```no_run
//! use embedded_httpd::config::{Config, Scheme};
//! use embedded_httpd::dispatcher::{DirectoryContext, Dispatcher};
//! use embedded_httpd::server::HttpServer;
//! use std::sync::Arc;
//!
//! let dispatcher = Arc::new(Dispatcher::new());
//! dispatcher
//!     .register_resources("/", "", Arc::new(DirectoryContext::new("./www")))
//!     .unwrap();
//!
//! let server = HttpServer::new(Config::default(), dispatcher).unwrap();
//! server.start().unwrap();
//! println!("escuchando en {:?}", server.local_addr(Scheme::Http));
//! ```

pub mod connection;
pub mod listener;
pub mod manager;
pub mod transaction;

pub use connection::{Connection, ConnectionInfo, NetStream, TlsProviders, TlsSocketFactory};
pub use listener::SocketListener;
pub use manager::{Admission, Permit, TransactionManager};
pub use transaction::{Transaction, TxState};

use crate::config::{Config, ConfigStore, Scheme};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::session::SessionManager;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Espera a las transacciones al soltar el servidor sin `shutdown`
const DROP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Señal de apagado compartida entre threads
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Servidor HTTP embebible
pub struct HttpServer {
    store: Arc<ConfigStore>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
    manager: Arc<TransactionManager>,
    tls: Arc<TlsProviders>,
    listeners: [SocketListener; 2],
    stopped: AtomicBool,
}

impl HttpServer {
    pub fn new(config: Config, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        config.validate()?;
        Self::with_store(Arc::new(ConfigStore::new(config)), dispatcher)
    }

    /// Servidor sobre un store compartido con el proveedor de configuración
    pub fn with_store(store: Arc<ConfigStore>, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let config = store.snapshot();
        config.validate()?;

        let sessions = Arc::new(SessionManager::new(config.session_timeout()));
        let manager = Arc::new(TransactionManager::new(
            Arc::clone(&dispatcher),
            Arc::clone(&sessions),
            config.max_connections,
            CancelToken::new(),
        ));
        let tls = Arc::new(TlsProviders::new());
        let listeners = [Scheme::Http, Scheme::Https].map(|scheme| {
            SocketListener::new(store.view(scheme), Arc::clone(&manager), Arc::clone(&tls))
        });

        Ok(Self {
            store,
            dispatcher,
            sessions,
            manager,
            tls,
            listeners,
            stopped: AtomicBool::new(false),
        })
    }

    /// Abre los listeners habilitados
    ///
    /// Un bind fallido del listener http se devuelve como error; el https
    /// hace bind más tarde, cuando haya una fábrica TLS.
    pub fn start(&self) -> Result<()> {
        self.store.snapshot().log_summary();
        for listener in &self.listeners {
            listener.update()?;
        }
        Ok(())
    }

    /// Aplica un update clave/valor y reconfigura lo que haga falta
    pub fn update_config(&self, properties: &BTreeMap<String, String>) -> Result<()> {
        let config = self.store.update(properties)?;
        self.sessions.set_timeout(config.session_timeout());
        self.manager.admission().set_limit(config.max_connections);
        for listener in &self.listeners {
            listener.update()?;
        }
        info!(keys = properties.len(), "configuration updated");
        Ok(())
    }

    /// Dirección real del listener del esquema, si ya hizo bind
    pub fn local_addr(&self, scheme: Scheme) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.scheme() == scheme)
            .and_then(|l| l.local_addr())
    }

    pub fn config(&self) -> Arc<Config> {
        self.store.snapshot()
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Registro donde el entorno ofrece fábricas TLS
    pub fn tls_providers(&self) -> &Arc<TlsProviders> {
        &self.tls
    }

    pub fn active_transactions(&self) -> usize {
        self.manager.active_count()
    }

    /// Cierra los listeners y detiene las transacciones en curso
    ///
    /// Idempotente. Espera a cada thread hasta `timeout`.
    pub fn shutdown(&self, timeout: Duration) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        for listener in &self.listeners {
            listener.destroy();
        }
        self.manager.shutdown(timeout);
        self.sessions.clear();
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.shutdown(DROP_SHUTDOWN_TIMEOUT);
    }
}
