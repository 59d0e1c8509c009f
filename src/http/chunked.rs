//! # Transfer-Encoding: chunked
//! src/http/chunked.rs
//!
//! Decodificación del body de requests chunked y codificación del body de
//! respuestas cuyo tamaño no se conoce al hacer commit.
//!
//! ```text
//! 4\r\n
//! Wiki\r\n
//! 5;ext=1\r\n
//! pedia\r\n
//! 0\r\n
//! Trailer: value\r\n
//! \r\n
//! ```

use super::request::read_line;
use super::{HeaderMap, StatusCode};
use crate::error::{Error, Result};
use std::io::{self, BufRead, Read, Write};

/// Decodifica un body chunked completo
///
/// Concatena los payloads, ignora extensiones `;ext` y agrega los trailers
/// a `trailers` con el nombre en minúsculas. Más de `max_trailers` líneas
/// de trailer es un 431.
pub fn decode_chunked(
    reader: &mut dyn BufRead,
    max_body: usize,
    max_line: usize,
    max_trailers: usize,
    trailers: &mut HeaderMap,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();

    loop {
        let line = read_line(reader, max_line, StatusCode::BAD_REQUEST)?
            .ok_or_else(|| eof("chunk size"))?;
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_field, 16).map_err(|_| {
            Error::protocol(
                StatusCode::BAD_REQUEST,
                format!("Invalid chunk size: {}", size_field),
            )
        })?;

        if size == 0 {
            break;
        }
        // El tamaño viene del cliente: no se suma sin chequear
        if size > max_body.saturating_sub(body.len()) {
            return Err(Error::protocol(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Chunked body exceeds {} bytes", max_body),
            ));
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..])?;

        // Cada chunk termina con CRLF
        match read_line(reader, max_line, StatusCode::BAD_REQUEST)? {
            Some(rest) if rest.is_empty() => {}
            Some(_) => {
                return Err(Error::protocol(
                    StatusCode::BAD_REQUEST,
                    "Chunk data longer than declared size",
                ))
            }
            None => return Err(eof("chunk terminator")),
        }
    }

    let mut count = 0usize;
    while let Some(line) = read_line(reader, max_line, StatusCode::BAD_REQUEST)? {
        if line.is_empty() {
            break;
        }
        count += 1;
        if count > max_trailers {
            return Err(Error::protocol(
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                format!("More than {} trailer fields", max_trailers),
            ));
        }
        if let Some((name, value)) = line.split_once(':') {
            trailers.append(&name.trim().to_ascii_lowercase(), value.trim());
        }
    }

    Ok(body)
}

fn eof(what: &str) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("connection closed while reading {}", what),
    ))
}

/// Writer que envuelve cada `write` en un chunk
pub struct ChunkedWriter<W: Write> {
    inner: W,
    finished: bool,
}

impl<W: Write> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    /// Escribe el chunk final de tamaño cero (idempotente)
    pub fn finish(&mut self) -> io::Result<()> {
        if !self.finished {
            self.finished = true;
            self.inner.write_all(b"0\r\n\r\n")?;
            self.inner.flush()?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Un chunk vacío terminaría el body antes de tiempo
        if buf.is_empty() {
            return Ok(0);
        }
        write!(self.inner, "{:x}\r\n", buf.len())?;
        self.inner.write_all(buf)?;
        self.inner.write_all(b"\r\n")?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
