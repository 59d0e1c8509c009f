//! # Conexiones
//! src/server/connection.rs
//!
//! Abstracción del stream de una conexión aceptada (TCP plano o envuelto en
//! TLS) y la capacidad TLS que el servidor consume sin depender de una
//! librería concreta.

use crate::config::Scheme;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Stream bidireccional de una conexión
pub trait NetStream: Read + Write + Send {
    /// Segundo handle al mismo socket (lectura y escritura por separado)
    fn try_clone_box(&self) -> io::Result<Box<dyn NetStream>>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Cierra ambos sentidos; desbloquea lecturas pendientes en otro thread
    fn shutdown(&self) -> io::Result<()>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl NetStream for TcpStream {
    fn try_clone_box(&self) -> io::Result<Box<dyn NetStream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

/// Mitad de escritura de un [`NetStream`]
pub(crate) struct StreamWriter(pub(crate) Box<dyn NetStream>);

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Direcciones y esquema de una conexión
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub scheme: Scheme,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            scheme: Scheme::Http,
            local_addr: None,
            remote_addr: None,
        }
    }
}

enum Socket {
    Ready(Box<dyn NetStream>),
    /// Handshake TLS pendiente; corre en el thread de la transacción
    Handshake(TcpStream, Arc<dyn TlsSocketFactory>),
}

/// Socket aceptado, vive lo que dure su transacción
pub struct Connection {
    socket: Socket,
    info: ConnectionInfo,
}

impl Connection {
    pub fn new(stream: Box<dyn NetStream>, scheme: Scheme) -> Self {
        let info = ConnectionInfo {
            scheme,
            local_addr: stream.local_addr().ok(),
            remote_addr: stream.peer_addr().ok(),
        };
        Self {
            socket: Socket::Ready(stream),
            info,
        }
    }

    /// Socket que todavía tiene que pasar por `factory.wrap_accepted`
    pub fn tls(stream: TcpStream, factory: Arc<dyn TlsSocketFactory>, scheme: Scheme) -> Self {
        let info = ConnectionInfo {
            scheme,
            local_addr: stream.local_addr().ok(),
            remote_addr: stream.peer_addr().ok(),
        };
        Self {
            socket: Socket::Handshake(stream, factory),
            info,
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info
    }

    /// Handle para cerrar el socket desde otro thread
    ///
    /// Con handshake pendiente es el socket TCP crudo, que también corta
    /// un handshake bloqueado.
    pub fn shutdown_handle(&self) -> io::Result<Box<dyn NetStream>> {
        match &self.socket {
            Socket::Ready(stream) => stream.try_clone_box(),
            Socket::Handshake(stream, _) => Ok(Box::new(stream.try_clone()?)),
        }
    }

    /// Hace el handshake si hace falta, con `timeout` para leer y escribir
    pub(crate) fn establish(self, timeout: Option<Duration>) -> io::Result<(Box<dyn NetStream>, ConnectionInfo)> {
        let stream = match self.socket {
            Socket::Ready(stream) => stream,
            Socket::Handshake(stream, factory) => {
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)?;
                factory.wrap_accepted(stream)?
            }
        };
        stream.set_read_timeout(timeout)?;
        Ok((stream, self.info))
    }
}

/// Capacidad TLS provista desde afuera del servidor
///
/// Implementada típicamente sobre rustls u openssl por quien integra el
/// servidor; el core solo crea listeners y envuelve sockets aceptados.
pub trait TlsSocketFactory: Send + Sync {
    /// Crea el socket de escucha
    fn create_listener(&self, address: &str) -> io::Result<TcpListener> {
        TcpListener::bind(address)
    }

    /// Envuelve un socket aceptado en una sesión TLS
    fn wrap_accepted(&self, stream: TcpStream) -> io::Result<Box<dyn NetStream>>;

    /// Exige certificado de cliente; false si la fábrica no lo soporta
    fn set_need_client_auth(&self, _need: bool) -> bool {
        false
    }
}

/// Registro de fábricas TLS ofrecidas por el entorno
#[derive(Default)]
pub struct TlsProviders {
    factories: Mutex<Vec<Arc<dyn TlsSocketFactory>>>,
    offered: Condvar,
}

impl TlsProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&self, factory: Arc<dyn TlsSocketFactory>) {
        let mut factories = self.factories.lock().unwrap_or_else(|e| e.into_inner());
        factories.push(factory);
        info!(count = factories.len(), "TLS socket factory offered");
        self.offered.notify_all();
    }

    /// Retira todas las fábricas
    pub fn clear(&self) {
        self.factories.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.factories.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fábrica a usar; con varias disponibles se usa la primera
    pub fn select(&self) -> Option<Arc<dyn TlsSocketFactory>> {
        let factories = self.factories.lock().unwrap_or_else(|e| e.into_inner());
        if factories.len() > 1 {
            warn!(
                count = factories.len(),
                "multiple TLS socket factories available, using the first one"
            );
        }
        factories.first().cloned()
    }

    /// Espera hasta `timeout` a que se ofrezca una fábrica
    pub fn wait_for(&self, timeout: Duration) -> Option<Arc<dyn TlsSocketFactory>> {
        let deadline = Instant::now() + timeout;
        let mut factories = self.factories.lock().unwrap_or_else(|e| e.into_inner());
        while factories.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            factories = self
                .offered
                .wait_timeout(factories, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        drop(factories);
        self.select()
    }
}
