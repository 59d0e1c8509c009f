//! # Errores del Servidor
//! src/error.rs
//!
//! Taxonomía de fallos que atraviesan el pipeline:
//!
//! - **Protocolo**: request malformado, header faltante, límites excedidos.
//!   Se convierte en una respuesta 4xx/5xx y la conexión no se reutiliza.
//! - **Handler**: fallo dentro de un handler registrado, se responde 500.
//! - **Transporte**: el peer cerró, timeout, broken pipe. Se ignora en silencio.
//! - **Terminated**: apagado del servidor, nunca se convierte en respuesta.

use crate::http::StatusCode;
use std::io;
use thiserror::Error;

/// Error del servidor HTTP
#[derive(Debug, Error)]
pub enum Error {
    /// Request malformado con el status que debe devolverse al cliente
    #[error("{message}")]
    Protocol { status: StatusCode, message: String },

    /// Include/forward del mismo URI dentro del mismo stack del worker
    #[error("recursive include of {0}")]
    RecursiveInclude(String),

    /// Fallo reportado por un handler registrado
    #[error("handler failed: {0}")]
    Handler(String),

    /// Operación inválida para el estado actual (ej: respuesta ya enviada)
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Valor de configuración inválido
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No se pudo hacer bind del socket
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// El servidor se está apagando
    #[error("transaction terminated by shutdown")]
    Terminated,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Atajo para construir un fallo de protocolo
    pub fn protocol(status: StatusCode, message: impl Into<String>) -> Self {
        Error::Protocol {
            status,
            message: message.into(),
        }
    }

    /// Status HTTP con el que se reporta este error al cliente
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Protocol { status, .. } => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Verifica si es un fallo de transporte (peer cerrado, timeout, pipe roto)
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Io(e) => is_transport_error(e),
            _ => false,
        }
    }
}

/// Clasifica errores de I/O que se esperan en un socket y no se loguean
pub fn is_transport_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}
