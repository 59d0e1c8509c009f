//! # Socket Listener
//! src/server/listener.rs
//!
//! Un listener por esquema. Cada uno corre su accept loop en un thread
//! propio y entrega las conexiones al [`TransactionManager`].
//!
//! El listener http hace bind en el momento, así un puerto ocupado se
//! reporta enseguida. El https espera a que haya una [`TlsSocketFactory`]
//! disponible y recién ahí crea el socket.

use super::connection::{Connection, TlsProviders, TlsSocketFactory};
use super::manager::{Permit, TransactionManager};
use super::CancelToken;
use crate::config::{ConfigView, Scheme};
use crate::error::{Error, Result};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Espera máxima de cada vuelta del accept loop
const ACCEPT_WAIT: Duration = Duration::from_millis(25);

/// Cuánto se espera al thread de accept al destruir el listener
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Parámetros que obligan a recrear el socket si cambian
#[derive(Debug, Clone, PartialEq, Eq)]
struct BindKey {
    scheme: Scheme,
    enabled: bool,
    host: String,
    port: u16,
    max_connections: usize,
    need_client_auth: bool,
}

impl BindKey {
    fn from_view(view: &ConfigView) -> Self {
        let config = view.snapshot();
        let settings = config.scheme(view.scheme());
        Self {
            scheme: view.scheme(),
            enabled: settings.enabled,
            host: settings.host.clone(),
            port: settings.port,
            max_connections: config.max_connections,
            need_client_auth: view.need_client_auth(),
        }
    }
}

struct Running {
    key: BindKey,
    cancel: CancelToken,
    bound: Arc<Mutex<Option<SocketAddr>>>,
    handle: Option<JoinHandle<()>>,
}

impl Running {
    /// Mismo socket: un pedido de puerto 0 ya resuelto equivale al puerto real
    fn serves(&self, wanted: &BindKey) -> bool {
        if self.key == *wanted {
            return true;
        }
        let bound_port = self.bound.lock().unwrap_or_else(|e| e.into_inner()).map(|a| a.port());
        self.key.port == 0
            && bound_port == Some(wanted.port)
            && BindKey { port: 0, ..wanted.clone() } == self.key
    }

    fn stop(mut self) {
        self.cancel.cancel();
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };
        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            let _ = handle.join();
            info!(scheme = %self.key.scheme, "listener stopped");
        } else {
            error!(scheme = %self.key.scheme, "listener thread did not stop in time");
        }
    }
}

/// Dueño del socket de escucha de un esquema
pub struct SocketListener {
    view: ConfigView,
    manager: Arc<TransactionManager>,
    tls: Arc<TlsProviders>,
    running: Mutex<Option<Running>>,
}

impl SocketListener {
    pub fn new(view: ConfigView, manager: Arc<TransactionManager>, tls: Arc<TlsProviders>) -> Self {
        Self {
            view,
            manager,
            tls,
            running: Mutex::new(None),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.view.scheme()
    }

    /// Aplica la configuración actual
    ///
    /// Sin cambios en los parámetros de bind no hace nada; si cambiaron,
    /// cierra el socket anterior y abre uno nuevo.
    pub fn update(&self) -> Result<()> {
        let wanted = BindKey::from_view(&self.view);
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(current) = running.as_ref() {
            if current.serves(&wanted) {
                return Ok(());
            }
        }
        if let Some(previous) = running.take() {
            info!(scheme = %wanted.scheme, "bind parameters changed, rebuilding listener");
            previous.stop();
        }
        if !wanted.enabled {
            debug!(scheme = %wanted.scheme, "listener disabled");
            return Ok(());
        }

        *running = Some(match wanted.scheme {
            Scheme::Http => self.start_plain(wanted)?,
            Scheme::Https => self.start_tls(wanted)?,
        });
        Ok(())
    }

    /// Dirección local del socket, una vez hecho el bind
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running
            .as_ref()
            .and_then(|r| *r.bound.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Cierra el socket y espera al thread de accept
    pub fn destroy(&self) {
        let previous = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    fn start_plain(&self, key: BindKey) -> Result<Running> {
        let address = format!("{}:{}", key.host, key.port);
        let listener = TcpListener::bind(&address).map_err(|source| Error::Bind {
            address: address.clone(),
            source,
        })?;
        let local = prepare_listener(&listener, &self.view, &key)?;
        let bound = Arc::new(Mutex::new(Some(local)));

        let cancel = CancelToken::new();
        let accept = AcceptLoop {
            listener,
            scheme: key.scheme,
            tls: None,
            view: self.view.clone(),
            manager: Arc::clone(&self.manager),
            cancel: cancel.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("{}-listener", key.scheme))
            .spawn(move || accept.run())?;

        Ok(Running {
            key,
            cancel,
            bound,
            handle: Some(handle),
        })
    }

    fn start_tls(&self, key: BindKey) -> Result<Running> {
        let cancel = CancelToken::new();
        let bound = Arc::new(Mutex::new(None));

        let view = self.view.clone();
        let manager = Arc::clone(&self.manager);
        let tls = Arc::clone(&self.tls);
        let thread_cancel = cancel.clone();
        let thread_bound = Arc::clone(&bound);
        let thread_key = key.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-listener", key.scheme))
            .spawn(move || {
                let factory = match wait_for_factory(&tls, &thread_cancel, manager.cancel_token()) {
                    Some(factory) => factory,
                    None => return,
                };
                let address = format!("{}:{}", thread_key.host, thread_key.port);
                let listener = match bind_tls(factory.as_ref(), &address, thread_key.need_client_auth) {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!(%address, error = %e, "cannot create TLS listener");
                        return;
                    }
                };
                match prepare_listener(&listener, &view, &thread_key) {
                    Ok(local) => *thread_bound.lock().unwrap_or_else(|e| e.into_inner()) = Some(local),
                    Err(e) => {
                        error!(%address, error = %e, "cannot configure TLS listener");
                        return;
                    }
                }
                AcceptLoop {
                    listener,
                    scheme: thread_key.scheme,
                    tls: Some(factory),
                    view,
                    manager,
                    cancel: thread_cancel,
                }
                .run();
            })?;

        Ok(Running {
            key,
            cancel,
            bound,
            handle: Some(handle),
        })
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Pasa el socket a modo no bloqueante y registra el puerto efectivo
fn prepare_listener(listener: &TcpListener, view: &ConfigView, key: &BindKey) -> Result<SocketAddr> {
    listener.set_nonblocking(true)?;
    let local = listener.local_addr()?;
    info!(scheme = %key.scheme, address = %local, "listening");
    if key.port == 0 {
        view.store().set_effective_port(key.scheme, local.port());
    }
    Ok(local)
}

fn wait_for_factory(
    tls: &TlsProviders,
    cancel: &CancelToken,
    server_cancel: &CancelToken,
) -> Option<Arc<dyn TlsSocketFactory>> {
    let mut warned = false;
    loop {
        if cancel.is_cancelled() || server_cancel.is_cancelled() {
            return None;
        }
        if let Some(factory) = tls.wait_for(ACCEPT_WAIT * 4) {
            return Some(factory);
        }
        if !warned {
            info!("waiting for a TLS socket factory");
            warned = true;
        }
    }
}

fn bind_tls(factory: &dyn TlsSocketFactory, address: &str, need_client_auth: bool) -> io::Result<TcpListener> {
    if need_client_auth && !factory.set_need_client_auth(true) {
        warn!("TLS socket factory does not support client authentication");
    }
    factory.create_listener(address)
}

struct AcceptLoop {
    listener: TcpListener,
    scheme: Scheme,
    tls: Option<Arc<dyn TlsSocketFactory>>,
    view: ConfigView,
    manager: Arc<TransactionManager>,
    cancel: CancelToken,
}

impl AcceptLoop {
    fn stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.manager.cancel_token().is_cancelled()
    }

    /// Obtiene un lugar en la admisión antes de aceptar cada conexión
    fn run(self) {
        let mut permit: Option<Permit> = None;
        while !self.stopped() {
            if permit.is_none() {
                permit = self.manager.admission().acquire_timeout(ACCEPT_WAIT);
                if permit.is_none() {
                    continue;
                }
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let Some(slot) = permit.take() else { continue };
                    match self.open(stream) {
                        Ok(connection) => {
                            let config = self.view.snapshot();
                            if let Err(e) = self.manager.start_transaction(connection, config, slot) {
                                warn!(%peer, error = %e, "connection dropped before start");
                            }
                        }
                        Err(e) => debug!(%peer, error = %e, "cannot set up accepted socket"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_WAIT),
                Err(e) => {
                    warn!(scheme = %self.scheme, error = %e, "accept failed");
                    thread::sleep(ACCEPT_WAIT);
                }
            }
        }
    }

    /// El handshake TLS queda para el thread de la transacción
    fn open(&self, stream: TcpStream) -> io::Result<Connection> {
        stream.set_nonblocking(false)?;
        Ok(match &self.tls {
            Some(factory) => Connection::tls(stream, Arc::clone(factory), self.scheme),
            None => Connection::new(Box::new(stream), self.scheme),
        })
    }
}
