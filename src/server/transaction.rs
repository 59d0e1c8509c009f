//! # Transacción
//! src/server/transaction.rs
//!
//! Máquina de estados de una conexión:
//!
//! ```text
//! AwaitRequest -> Parsing -> Dispatching -> Responding -+-> AwaitRequest (keep-alive)
//!                                                       +-> Closed
//! ```
//!
//! `Aborted` es el estado terminal ante un error no recuperable o un panic.
//! Request y Response salen de sus pools en cada intercambio y vuelven al
//! terminar, incluso si el handler hace panic.

use super::connection::{Connection, ConnectionInfo, NetStream, StreamWriter};
use super::CancelToken;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::http::response::Output;
use crate::http::{Request, Response, StatusCode};
use crate::pool::{ObjectPool, Poolable};
use crate::session::SessionManager;
use std::any::Any;
use std::io::{BufRead, BufReader, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxState {
    #[default]
    AwaitRequest,
    Parsing,
    Dispatching,
    Responding,
    Closed,
    Aborted,
}

/// Lo que una transacción comparte con el resto del servidor
#[derive(Clone)]
pub(crate) struct TransactionDeps {
    pub(crate) requests: Arc<ObjectPool<Request>>,
    pub(crate) responses: Arc<ObjectPool<Response>>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) cancel: CancelToken,
}

/// Una conexión atendida de punta a punta por un thread
#[derive(Default)]
pub struct Transaction {
    reader: Option<BufReader<Box<dyn NetStream>>>,
    writer: Option<Output>,
    closer: Option<Box<dyn NetStream>>,
    info: ConnectionInfo,
    config: Arc<Config>,
    deps: Option<TransactionDeps>,
    state: TxState,
    exchanges: u64,
}

impl Poolable for Transaction {
    fn create() -> Self {
        Transaction::default()
    }

    fn reset(&mut self) {
        self.close();
        self.info = ConnectionInfo::default();
        self.config = Arc::default();
        self.deps = None;
        self.state = TxState::AwaitRequest;
        self.exchanges = 0;
    }
}

impl Transaction {
    /// Asocia la conexión y aplica el timeout de lectura
    pub(crate) fn init(&mut self, connection: Connection, config: Arc<Config>, deps: TransactionDeps) -> Result<()> {
        let (stream, info) = connection.establish(config.connection_timeout())?;
        let write_half = stream.try_clone_box()?;
        self.closer = Some(stream.try_clone_box()?);
        self.reader = Some(BufReader::new(stream));
        self.writer = Some(Box::new(StreamWriter(write_half)));
        self.info = info;
        self.config = config;
        self.deps = Some(deps);
        self.state = TxState::AwaitRequest;
        self.exchanges = 0;
        Ok(())
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Intercambios completados en esta conexión
    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    /// Atiende la conexión hasta que se cierre
    ///
    /// Los errores de transporte terminan la conexión en silencio; el resto
    /// se registran. Solo [`Error::Terminated`] se devuelve al llamador.
    pub fn run(&mut self) -> Result<()> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_loop()));
        let result = match outcome {
            Ok(Ok(())) => {
                self.state = TxState::Closed;
                Ok(())
            }
            Ok(Err(Error::Terminated)) => {
                self.state = TxState::Aborted;
                Err(Error::Terminated)
            }
            Ok(Err(e)) if e.is_transport() => {
                debug!(remote = ?self.info.remote_addr, error = %e, "connection dropped");
                self.state = TxState::Closed;
                Ok(())
            }
            Ok(Err(e)) => {
                error!(remote = ?self.info.remote_addr, error = %e, "transaction failed");
                self.state = TxState::Aborted;
                Ok(())
            }
            Err(payload) => {
                error!(
                    remote = ?self.info.remote_addr,
                    panic = panic_message(payload.as_ref()),
                    "transaction panicked"
                );
                self.state = TxState::Aborted;
                Ok(())
            }
        };
        self.close();
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            if self.deps.as_ref().is_some_and(|d| d.cancel.is_cancelled()) {
                return Err(Error::Terminated);
            }
            self.state = TxState::AwaitRequest;
            if !self.exchange()? {
                return Ok(());
            }
            self.skip_crlf();
        }
    }

    /// Un request y su respuesta; `true` si la conexión sigue abierta
    fn exchange(&mut self) -> Result<bool> {
        let deps = self
            .deps
            .clone()
            .ok_or_else(|| Error::IllegalState("transaction not initialized".to_string()))?;
        let config = Arc::clone(&self.config);
        let mut request = deps.requests.checkout();
        let mut response = deps.responses.checkout();

        self.state = TxState::Parsing;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| Error::IllegalState("connection already closed".to_string()))?;
        match request.init(reader, &config, &self.info, Some(Arc::clone(&deps.sessions))) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(Error::Protocol { status, message }) => {
                warn!(
                    remote = ?self.info.remote_addr,
                    status = status.as_u16(),
                    reason = %message,
                    "malformed request"
                );
                let mut exchange = request.exchange_info();
                exchange.keep_alive = false;
                exchange.accepts_gzip = false;
                response.init(exchange, config, self.take_writer()?);
                response.send_error(status, &message)?;
                response.finish()?;
                self.writer = response.take_output();
                return Ok(false);
            }
            Err(e) if e.is_transport() || matches!(e, Error::Terminated) => return Err(e),
            Err(e) => {
                // Intento de 500; la conexión se cierra igual
                let mut exchange = request.exchange_info();
                exchange.keep_alive = false;
                exchange.accepts_gzip = false;
                response.init(exchange, config, self.take_writer()?);
                if response.send_error(StatusCode::INTERNAL_SERVER_ERROR, "").is_ok() {
                    let _ = response.finish();
                }
                self.writer = response.take_output();
                return Err(e);
            }
        }
        trace!(request = %request.request_line(), "request parsed");

        self.state = TxState::Dispatching;
        response.init(request.exchange_info(), Arc::clone(&config), self.take_writer()?);
        if let Some(session) = request.session(false) {
            response.set_session_id(session.id());
        }

        let dispatcher = Arc::clone(&deps.dispatcher);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            dispatcher.dispatch(&mut request, &mut response)
        }));

        self.state = TxState::Responding;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_transport() => return Err(e),
            Ok(Err(Error::Terminated)) => return Err(Error::Terminated),
            Ok(Err(e)) => {
                error!(request = %request.request_line(), error = %e, "request processing failed");
                if response.is_committed() {
                    return Ok(false);
                }
                response.send_error(e.status(), "")?;
            }
            Err(payload) => {
                error!(
                    request = %request.request_line(),
                    panic = panic_message(payload.as_ref()),
                    "handler panicked"
                );
                if !response.is_committed() {
                    response.set_keep_alive(false);
                    if response.send_error(StatusCode::INTERNAL_SERVER_ERROR, "").is_ok() {
                        let _ = response.finish();
                    }
                }
                return Ok(false);
            }
        }

        if let Some(session) = request.current_session() {
            response.set_session_id(session.id());
        }
        response.finish()?;
        self.exchanges += 1;
        let keep_alive = response.keep_alive();
        self.writer = response.take_output();
        Ok(keep_alive && self.writer.is_some())
    }

    fn take_writer(&mut self) -> Result<Output> {
        self.writer
            .take()
            .ok_or_else(|| Error::IllegalState("connection already closed".to_string()))
    }

    /// Descarta un CRLF suelto entre requests, sin bloquear
    fn skip_crlf(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            let pending = reader.buffer();
            let skip = if pending.starts_with(b"\r\n") {
                2
            } else if pending.starts_with(b"\n") {
                1
            } else {
                0
            };
            reader.consume(skip);
        }
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
        self.reader = None;
        if let Some(closer) = self.closer.take() {
            let _ = closer.shutdown();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scheme;
    use crate::dispatcher::DirectoryContext;
    use std::io::{self, Cursor, Read};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::sync::Mutex;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    fn deps() -> TransactionDeps {
        let dispatcher = Arc::new(Dispatcher::new());
        let context = Arc::new(DirectoryContext::new("."));
        dispatcher
            .register_handler(
                "/echo",
                |req: &mut Request, res: &mut Response| {
                    let body = req.body().to_vec();
                    res.set_content_type("text/plain");
                    res.write(&body)
                },
                context.clone(),
            )
            .unwrap();
        dispatcher
            .register_handler(
                "/fail",
                |_: &mut Request, _: &mut Response| Err(Error::Handler("boom".to_string())),
                context.clone(),
            )
            .unwrap();
        dispatcher
            .register_handler(
                "/panic",
                |_: &mut Request, _: &mut Response| -> Result<()> { panic!("handler bug") },
                context.clone(),
            )
            .unwrap();
        dispatcher
            .register_handler(
                "/login",
                |req: &mut Request, res: &mut Response| {
                    let session = req.session(true).ok_or_else(|| Error::Handler("no session".into()))?;
                    res.print(session.id())
                },
                context,
            )
            .unwrap();
        TransactionDeps {
            requests: Arc::new(ObjectPool::new(4)),
            responses: Arc::new(ObjectPool::new(4)),
            sessions: Arc::new(SessionManager::new(Duration::from_secs(60))),
            dispatcher,
            cancel: CancelToken::new(),
        }
    }

    /// Cliente conectado y una transacción corriendo en otro thread
    fn serve(deps: TransactionDeps) -> (TcpStream, JoinHandle<(TxState, u64)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let handle = thread::spawn(move || {
            let mut tx = Transaction::create();
            tx.init(
                Connection::new(Box::new(server), Scheme::Http),
                Arc::new(Config::default()),
                deps,
            )
            .unwrap();
            let _ = tx.run();
            (tx.state(), tx.exchanges())
        });
        (client, handle)
    }

    /// Stream en memoria: entrega `input` y después falla la lectura
    #[derive(Clone)]
    struct FailingStream {
        input: Arc<Mutex<Cursor<Vec<u8>>>>,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl FailingStream {
        fn new(input: &[u8]) -> Self {
            Self {
                input: Arc::new(Mutex::new(Cursor::new(input.to_vec()))),
                output: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn written(&self) -> String {
            String::from_utf8_lossy(&self.output.lock().unwrap()).into_owned()
        }
    }

    impl Read for FailingStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.input.lock().unwrap().read(buf)?;
            if n == 0 && !buf.is_empty() {
                return Err(io::Error::new(io::ErrorKind::Other, "device failure"));
            }
            Ok(n)
        }
    }

    impl Write for FailingStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl NetStream for FailingStream {
        fn try_clone_box(&self) -> io::Result<Box<dyn NetStream>> {
            Ok(Box::new(self.clone()))
        }

        fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn shutdown(&self) -> io::Result<()> {
            Ok(())
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Err(io::Error::new(io::ErrorKind::NotConnected, "in memory"))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Err(io::Error::new(io::ErrorKind::NotConnected, "in memory"))
        }
    }

    fn read_all(mut client: TcpStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_keep_alive_serves_sequential_requests() {
        let (mut client, handle) = serve(deps());
        client
            .write_all(
                b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nonePOST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nConnection: close\r\n\r\ntwo",
            )
            .unwrap();
        let out = read_all(client);
        assert_eq!(out.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert!(out.contains("\r\n\r\none"));
        assert!(out.ends_with("\r\n\r\ntwo"));
        assert!(out.contains("Connection: Close\r\n"));
        assert_eq!(handle.join().unwrap(), (TxState::Closed, 2));
    }

    #[test]
    fn test_stray_crlf_between_requests() {
        let (mut client, handle) = serve(deps());
        client
            .write_all(b"GET /echo HTTP/1.1\r\nHost: x\r\n\r\n\r\nGET /echo HTTP/1.0\r\n\r\n")
            .unwrap();
        let out = read_all(client);
        assert!(out.contains("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("HTTP/1.0 200 OK\r\n"));
        assert_eq!(handle.join().unwrap().1, 2);
    }

    #[test]
    fn test_read_failure_sends_500() {
        let stream = FailingStream::new(b"GET /echo HTTP/1.1\r\nHost: x\r\n");
        let mut tx = Transaction::create();
        tx.init(
            Connection::new(Box::new(stream.clone()), Scheme::Http),
            Arc::new(Config::default()),
            deps(),
        )
        .unwrap();
        assert!(tx.run().is_ok());

        let out = stream.written();
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.contains("Connection: Close\r\n"));
        assert_eq!(tx.state(), TxState::Aborted);
        assert_eq!(tx.exchanges(), 0);
    }

    #[test]
    fn test_protocol_fault_closes_connection() {
        let (mut client, handle) = serve(deps());
        client.write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let out = read_all(client);
        assert!(out.starts_with("HTTP/1.1 411 Length Required\r\n"));
        assert!(out.contains("Connection: Close\r\n"));
        assert_eq!(handle.join().unwrap(), (TxState::Closed, 0));
    }

    #[test]
    fn test_handler_fault_keeps_connection() {
        let (mut client, handle) = serve(deps());
        client
            .write_all(b"GET /fail HTTP/1.1\r\nHost: x\r\n\r\nGET /echo HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        let out = read_all(client);
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!out.contains("boom"));
        assert!(out.contains("HTTP/1.1 200 OK\r\n"));
        assert_eq!(handle.join().unwrap().1, 2);
    }

    #[test]
    fn test_handler_panic_returns_500_and_closes() {
        let deps = deps();
        let requests = Arc::clone(&deps.requests);
        let (mut client, handle) = serve(deps);
        client.write_all(b"GET /panic HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let out = read_all(client);
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.contains("Connection: Close\r\n"));
        assert!(!out.contains("handler bug"));
        assert_eq!(handle.join().unwrap(), (TxState::Closed, 0));
        // El request volvió al pool pese al panic
        assert_eq!(requests.idle_count(), 1);
    }

    #[test]
    fn test_session_cookie_is_emitted() {
        let (mut client, handle) = serve(deps());
        client.write_all(b"GET /login HTTP/1.0\r\n\r\n").unwrap();
        let out = read_all(client);
        let id = out.split("\r\n\r\n").nth(1).unwrap().to_string();
        assert!(out.contains(&format!("Set-Cookie: SESSIONID={}; Path=/; HttpOnly\r\n", id)));
        handle.join().unwrap();
    }

    #[test]
    fn test_cancelled_transaction_aborts() {
        let deps = deps();
        deps.cancel.cancel();
        let (client, handle) = serve(deps);
        assert_eq!(handle.join().unwrap(), (TxState::Aborted, 0));
        assert!(read_all(client).is_empty());
    }

    #[test]
    fn test_reset_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let mut tx = Transaction::create();
        tx.init(
            Connection::new(Box::new(server), Scheme::Http),
            Arc::new(Config::default()),
            deps(),
        )
        .unwrap();
        tx.reset();
        assert_eq!(tx.state(), TxState::AwaitRequest);
        assert!(read_all(client).is_empty());
    }
}
