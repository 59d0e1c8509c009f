//! # Manager de Transacciones
//! src/server/manager.rs
//!
//! Un thread por conexión aceptada. El manager es dueño de los tres pools
//! (transacciones, requests y responses), lleva la cuenta de transacciones
//! en curso y las detiene al apagar el servidor.
//!
//! La admisión se controla con un semáforo contador: el listener no acepta
//! una conexión hasta obtener un [`Permit`], y la transacción lo libera al
//! terminar.

use super::connection::{Connection, NetStream};
use super::transaction::{Transaction, TransactionDeps};
use super::CancelToken;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::pool::ObjectPool;
use crate::session::SessionManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Objetos ociosos que conserva cada pool
const POOL_MAX_IDLE: usize = 64;

struct AdmissionState {
    active: usize,
    limit: usize,
}

/// Semáforo contador de transacciones en curso
pub struct Admission {
    state: Mutex<AdmissionState>,
    released: Condvar,
}

impl Admission {
    /// `limit == 0` significa sin límite
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(AdmissionState { active: 0, limit }),
            released: Condvar::new(),
        }
    }

    /// Espera hasta `timeout` por un lugar libre
    pub fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Option<Permit> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.limit > 0 && state.active >= state.limit {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        state.active += 1;
        Some(Permit {
            admission: Arc::clone(self),
        })
    }

    pub fn active(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).active
    }

    pub fn limit(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).limit
    }

    /// Cambia el límite en caliente; las transacciones en curso no se tocan
    pub fn set_limit(&self, limit: usize) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).limit = limit;
        self.released.notify_all();
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.released.notify_all();
    }
}

/// Lugar ocupado en [`Admission`], se libera en `Drop`
pub struct Permit {
    admission: Arc<Admission>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.admission.release();
    }
}

/// Transacción en curso
struct Worker {
    socket: Option<Box<dyn NetStream>>,
    handle: Option<JoinHandle<()>>,
}

/// Grupo de threads de transacciones y sus pools
pub struct TransactionManager {
    transactions: Arc<ObjectPool<Transaction>>,
    deps: TransactionDeps,
    admission: Arc<Admission>,
    live: Arc<Mutex<HashMap<u64, Worker>>>,
    next_id: AtomicU64,
}

impl TransactionManager {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        sessions: Arc<SessionManager>,
        max_connections: usize,
        cancel: CancelToken,
    ) -> Self {
        let deps = TransactionDeps {
            requests: Arc::new(ObjectPool::<Request>::new(POOL_MAX_IDLE)),
            responses: Arc::new(ObjectPool::<Response>::new(POOL_MAX_IDLE)),
            sessions,
            dispatcher,
            cancel,
        };
        Self {
            transactions: Arc::new(ObjectPool::new(POOL_MAX_IDLE)),
            deps,
            admission: Arc::new(Admission::new(max_connections)),
            live: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.deps.cancel
    }

    /// Transacciones en curso
    pub fn active_count(&self) -> usize {
        self.admission.active()
    }

    /// Corre la conexión en un thread nuevo
    ///
    /// El `permit` se libera cuando la transacción termina, o enseguida si
    /// el thread no se pudo crear.
    pub fn start_transaction(&self, connection: Connection, config: Arc<Config>, permit: Permit) -> Result<()> {
        if self.deps.cancel.is_cancelled() {
            return Err(Error::Terminated);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = connection.info();
        let socket = connection.shutdown_handle().ok();

        let mut builder = thread::Builder::new().name(format!("{}-{}", config.worker_name_prefix, id));
        if config.worker_stack_size_kb > 0 {
            builder = builder.stack_size(config.worker_stack_size_kb * 1024);
        }

        let transactions = Arc::clone(&self.transactions);
        let deps = self.deps.clone();
        let live = Arc::clone(&self.live);

        // El lock se mantiene hasta registrar el handle; el worker se borra
        // del mapa al terminar y tiene que encontrarlo completo.
        let mut workers = self.live.lock().unwrap_or_else(|e| e.into_inner());
        let spawned = builder.spawn(move || {
            let mut transaction = transactions.checkout();
            match transaction.init(connection, config, deps) {
                Ok(()) => {
                    if let Err(e) = transaction.run() {
                        debug!(id, error = %e, "transaction stopped");
                    }
                }
                Err(e) => debug!(id, error = %e, "transaction init failed"),
            }
            drop(transaction);
            drop(permit);
            live.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        });

        match spawned {
            Ok(handle) => {
                debug!(id, remote = ?info.remote_addr, scheme = %info.scheme, "transaction started");
                workers.insert(
                    id,
                    Worker {
                        socket,
                        handle: Some(handle),
                    },
                );
                Ok(())
            }
            Err(e) => {
                error!(id, error = %e, "cannot spawn transaction thread");
                Err(Error::Io(e))
            }
        }
    }

    /// Detiene todas las transacciones en curso
    ///
    /// Cierra sus sockets para desbloquear lecturas y espera a cada thread
    /// hasta `timeout` en total. Los que no terminan quedan sueltos y se
    /// reportan como error.
    pub fn shutdown(&self, timeout: Duration) {
        self.deps.cancel.cancel();

        let workers: Vec<Worker> = {
            let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
            live.drain().map(|(_, worker)| worker).collect()
        };
        if !workers.is_empty() {
            info!(count = workers.len(), "stopping active transactions");
        }

        for worker in &workers {
            if let Some(socket) = &worker.socket {
                let _ = socket.shutdown();
            }
        }

        let deadline = Instant::now() + timeout;
        let mut stragglers = 0;
        for mut worker in workers {
            let handle = match worker.handle.take() {
                Some(handle) => handle,
                None => continue,
            };
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("transaction thread panicked during shutdown");
                }
            } else {
                stragglers += 1;
                error!(
                    thread = handle.thread().name().unwrap_or("unnamed"),
                    "transaction thread did not stop in time"
                );
            }
        }

        self.transactions.clear();
        self.deps.requests.clear();
        self.deps.responses.clear();
        info!(stragglers, "transaction manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scheme;
    use crate::dispatcher::DirectoryContext;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn manager(max: usize) -> TransactionManager {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher
            .register_handler(
                "/hello",
                |_: &mut Request, res: &mut Response| res.print("hello"),
                Arc::new(DirectoryContext::new(".")),
            )
            .unwrap();
        TransactionManager::new(
            dispatcher,
            Arc::new(SessionManager::new(Duration::from_secs(60))),
            max,
            CancelToken::new(),
        )
    }

    fn accept_pair(listener: &TcpListener) -> (TcpStream, Connection) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, Connection::new(Box::new(server), Scheme::Http))
    }

    #[test]
    fn test_admission_blocks_at_limit() {
        let admission = Arc::new(Admission::new(2));
        let a = admission.acquire_timeout(Duration::from_millis(10)).unwrap();
        let _b = admission.acquire_timeout(Duration::from_millis(10)).unwrap();
        assert!(admission.acquire_timeout(Duration::from_millis(20)).is_none());
        assert_eq!(admission.active(), 2);

        drop(a);
        assert_eq!(admission.active(), 1);
        assert!(admission.acquire_timeout(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_admission_wakes_waiter_on_release() {
        let admission = Arc::new(Admission::new(1));
        let permit = admission.acquire_timeout(Duration::from_millis(10)).unwrap();

        let waiting = Arc::clone(&admission);
        let waiter = thread::spawn(move || waiting.acquire_timeout(Duration::from_secs(5)).is_some());
        thread::sleep(Duration::from_millis(50));
        drop(permit);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_admission_limit_update() {
        let admission = Arc::new(Admission::new(1));
        let _a = admission.acquire_timeout(Duration::from_millis(10)).unwrap();
        assert!(admission.acquire_timeout(Duration::from_millis(10)).is_none());
        admission.set_limit(2);
        assert!(admission.acquire_timeout(Duration::from_millis(10)).is_some());
        admission.set_limit(0);
        assert_eq!(admission.limit(), 0);
        assert!(admission.acquire_timeout(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_transaction_releases_permit() {
        let manager = manager(4);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut client, connection) = accept_pair(&listener);

        let permit = manager.admission().acquire_timeout(Duration::from_millis(10)).unwrap();
        manager
            .start_transaction(connection, Arc::new(Config::default()), permit)
            .unwrap();
        assert_eq!(manager.active_count(), 1);

        client.write_all(b"GET /hello HTTP/1.0\r\n\r\n").unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).unwrap();
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(out.ends_with("hello"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.active_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_shutdown_unblocks_idle_connection() {
        let manager = manager(4);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut client, connection) = accept_pair(&listener);

        let permit = manager.admission().acquire_timeout(Duration::from_millis(10)).unwrap();
        manager
            .start_transaction(connection, Arc::new(Config::default()), permit)
            .unwrap();

        // El worker queda bloqueado leyendo un request que nunca llega
        thread::sleep(Duration::from_millis(50));
        manager.shutdown(Duration::from_secs(5));
        assert_eq!(manager.active_count(), 0);

        let mut buf = Vec::new();
        let _ = client.read_to_end(&mut buf);
        assert!(buf.is_empty());
        assert!(manager.cancel_token().is_cancelled());
    }

    #[test]
    fn test_start_after_shutdown_is_rejected() {
        let manager = manager(4);
        manager.shutdown(Duration::from_millis(10));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (_client, connection) = accept_pair(&listener);
        let permit = manager.admission().acquire_timeout(Duration::from_millis(10)).unwrap();
        let result = manager.start_transaction(connection, Arc::new(Config::default()), permit);
        assert!(matches!(result, Err(Error::Terminated)));
        assert_eq!(manager.active_count(), 0);
    }
}
