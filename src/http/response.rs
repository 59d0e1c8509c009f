//! # Escritura de Respuestas HTTP
//! src/http/response.rs
//!
//! La respuesta acumula el body en un buffer y decide el framing una sola vez,
//! al hacer commit de los headers:
//!
//! ```text
//! ¿status prohíbe body (304, 204, 1xx)?  -> sin body, sin chunked
//! ¿el body entró completo en el buffer?  -> Content-Length medido
//!                                            (el largo comprimido si hay gzip)
//! ¿overflow y Content-Length explícito?  -> se streamea con ese largo
//! ¿overflow en HTTP/1.1?                 -> Transfer-Encoding: chunked
//! ¿overflow en HTTP/1.0?                 -> sin largo, se cierra la conexión
//! ```
//!
//! gzip se negocia en el primer byte escrito: MIME comprimible y cliente que
//! prefiere gzip. Después de escribir sin comprimir ya no se puede aplicar.
//!
//! ## Ejemplo de uso
//!
//! ```
//! use embedded_httpd::http::{Response, StatusCode};
//!
//! let mut response = Response::standalone();
//! response.set_status(StatusCode::OK);
//! response.set_content_type("application/json");
//! response.write(br#"{"message": "Hello"}"#).unwrap();
//! response.finish().unwrap();
//!
//! let bytes = response.into_bytes();
//! assert!(bytes.starts_with(b"HTTP/1.0 200 OK\r\n"));
//! ```

use super::chunked::ChunkedWriter;
use super::cookie::Cookie;
use super::request::Version;
use super::{HeaderMap, StatusCode};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pool::Poolable;
use crate::session::SESSION_COOKIE;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::warn;

/// Stream de salida de la conexión
pub type Output = Box<dyn Write + Send>;

/// Lo que la respuesta necesita saber del request que contesta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeInfo {
    pub version: Version,
    /// HEAD: se calculan los headers pero el body se descarta
    pub head_only: bool,
    pub keep_alive: bool,
    pub accepts_gzip: bool,
}

/// Framing del body sobre el socket
enum Framing {
    /// Content-Length o delimitado por cierre
    Plain(Output),
    Chunked(ChunkedWriter<Output>),
    /// HEAD / status sin body
    Discard(Output),
}

impl Framing {
    fn finish(self) -> io::Result<Output> {
        match self {
            Framing::Plain(mut w) | Framing::Discard(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Framing::Chunked(mut c) => {
                c.finish()?;
                Ok(c.into_inner())
            }
        }
    }
}

impl Write for Framing {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Framing::Plain(w) => w.write(buf),
            Framing::Chunked(c) => c.write(buf),
            Framing::Discard(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Framing::Plain(w) | Framing::Discard(w) => w.flush(),
            Framing::Chunked(c) => c.flush(),
        }
    }
}

/// Body en modo streaming (después de un commit por overflow)
enum BodyWriter {
    Direct(Framing),
    Gzip(GzEncoder<Framing>),
}

impl BodyWriter {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            BodyWriter::Direct(f) => f.write_all(data),
            BodyWriter::Gzip(g) => g.write_all(data),
        }
    }

    fn finish(self) -> io::Result<Output> {
        match self {
            BodyWriter::Direct(f) => f.finish(),
            BodyWriter::Gzip(g) => g.finish()?.finish(),
        }
    }
}

/// Respuesta HTTP reutilizable
#[derive(Default)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    cookies: Vec<Cookie>,
    content_type: Option<String>,
    charset: Option<String>,
    content_length: Option<u64>,
    /// Largo anunciado al streamear sin chunked
    declared_length: Option<u64>,

    exchange: ExchangeInfo,
    config: Arc<Config>,
    buffer: Vec<u8>,
    buffer_size: usize,
    output: Option<Output>,
    body: Option<BodyWriter>,

    gzip: bool,
    compression_decided: bool,
    written: u64,
    committed: bool,
    finished: bool,
    force_close: bool,
    session_id: Option<String>,
    /// Solo en respuestas standalone
    memory: Option<MemorySink>,
}

impl Poolable for Response {
    fn create() -> Self {
        Response::default()
    }

    fn reset(&mut self) {
        self.status = StatusCode::OK;
        self.headers.clear();
        self.cookies.clear();
        self.content_type = None;
        self.charset = None;
        self.content_length = None;
        self.declared_length = None;
        self.exchange = ExchangeInfo::default();
        self.buffer.clear();
        self.buffer_size = 0;
        self.output = None;
        self.body = None;
        self.gzip = false;
        self.compression_decided = false;
        self.written = 0;
        self.committed = false;
        self.finished = false;
        self.force_close = false;
        self.session_id = None;
        self.memory = None;
    }
}

impl Response {
    /// Prepara la respuesta para un intercambio
    pub fn init(&mut self, exchange: ExchangeInfo, config: Arc<Config>, output: Output) {
        self.exchange = exchange;
        self.buffer_size = config.buffer_size;
        self.config = config;
        self.output = Some(output);
    }

    /// Respuesta HTTP/1.0 sin conexión, que escribe en memoria
    ///
    /// Los bytes generados se obtienen con [`Response::into_bytes`].
    pub fn standalone() -> Self {
        Self::with_exchange(ExchangeInfo::default())
    }

    /// Igual que [`Response::standalone`] con un intercambio dado
    pub fn with_exchange(exchange: ExchangeInfo) -> Self {
        let mut response = Response::create();
        let sink = MemorySink::default();
        response.init(exchange, Arc::new(Config::default()), Box::new(sink.clone()));
        response.memory = Some(sink);
        response
    }

    /// Bytes escritos por una respuesta creada con [`Response::standalone`]
    pub fn into_bytes(self) -> Vec<u8> {
        self.memory.map(|sink| sink.contents()).unwrap_or_default()
    }

    // === Status y headers ===

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Cambia el status (ignorado con un warning si ya se hizo commit)
    pub fn set_status(&mut self, status: StatusCode) {
        if self.committed {
            warn!(status = status.as_u16(), "set_status after commit ignored");
            return;
        }
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn contains_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    /// Reemplaza todos los valores de un header
    ///
    /// `Content-Length` pasa por [`Response::set_content_length`]: el header
    /// lo escribe el commit según el framing elegido.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if self.committed {
            return;
        }
        if name.eq_ignore_ascii_case("content-length") {
            self.set_content_length_header(value);
        } else {
            self.headers.set(name, value);
        }
    }

    /// Agrega un valor más a un header
    pub fn add_header(&mut self, name: &str, value: &str) {
        if self.committed {
            return;
        }
        if name.eq_ignore_ascii_case("content-length") {
            self.set_content_length_header(value);
        } else {
            self.headers.append(name, value);
        }
    }

    fn set_content_length_header(&mut self, value: &str) {
        match value.trim().parse() {
            Ok(length) => self.content_length = Some(length),
            Err(_) => warn!(value, "invalid Content-Length ignored"),
        }
    }

    pub fn set_date_header(&mut self, name: &str, time: SystemTime) {
        self.set_header(name, &httpdate::fmt_http_date(time));
    }

    pub fn add_cookie(&mut self, cookie: Cookie) {
        if !self.committed {
            self.cookies.push(cookie);
        }
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Id de sesión a (re)emitir como cookie en el commit
    pub fn set_session_id(&mut self, id: &str) {
        if !self.committed {
            self.session_id = Some(id.to_string());
        }
    }

    /// Fija el Content-Type; un `charset=` incluido pasa a ser la codificación
    pub fn set_content_type(&mut self, content_type: &str) {
        if self.committed {
            return;
        }
        let mut parts = content_type.split(';');
        let mime = parts.next().unwrap_or("").trim().to_string();
        for param in parts {
            if let Some((name, value)) = param.split_once('=') {
                if name.trim().eq_ignore_ascii_case("charset") {
                    self.charset = Some(value.trim().trim_matches('"').to_string());
                }
            }
        }
        self.content_type = Some(mime);
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_character_encoding(&mut self, charset: &str) {
        if !self.committed {
            self.charset = Some(charset.to_string());
        }
    }

    /// Codificación usada por [`Response::print`]
    pub fn character_encoding(&self) -> &str {
        self.charset
            .as_deref()
            .unwrap_or(self.config.default_charset.as_str())
    }

    /// Largo explícito del body
    pub fn set_content_length(&mut self, length: u64) {
        if !self.committed {
            self.content_length = Some(length);
        }
    }

    // === Buffer ===

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn set_buffer_size(&mut self, size: usize) -> Result<()> {
        if self.written > 0 || self.committed {
            return Err(Error::IllegalState(
                "buffer size cannot change after content was written".to_string(),
            ));
        }
        self.buffer_size = size.max(1);
        Ok(())
    }

    /// Descarta el body acumulado (solo antes del commit)
    pub fn reset_buffer(&mut self) -> Result<()> {
        if self.committed {
            return Err(Error::IllegalState("response already committed".to_string()));
        }
        self.buffer.clear();
        self.written = 0;
        self.gzip = false;
        self.compression_decided = false;
        Ok(())
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes de body entregados por el handler (antes de comprimir)
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Fuerza el cierre de la conexión tras esta respuesta
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        if !keep_alive {
            self.force_close = true;
        }
    }

    /// Si la conexión puede reutilizarse tras esta respuesta
    pub fn keep_alive(&self) -> bool {
        self.exchange.keep_alive && !self.force_close
    }

    pub fn exchange(&self) -> ExchangeInfo {
        self.exchange
    }

    /// Snapshot de configuración con el que se atiende este intercambio
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    // === Body ===

    /// Escribe bytes de body
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::IllegalState("response already finished".to_string()));
        }
        if data.is_empty() {
            return Ok(());
        }
        if !self.compression_decided {
            self.decide_compression();
        }
        self.written += data.len() as u64;

        if let Some(body) = self.body.as_mut() {
            body.write_all(data)?;
            return Ok(());
        }

        self.buffer.extend_from_slice(data);
        if self.buffer.len() > self.buffer_size {
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Escribe texto en la codificación de la respuesta
    ///
    /// Los caracteres que la codificación no puede representar se emiten
    /// como `?`.
    pub fn print(&mut self, text: &str) -> Result<()> {
        let bytes = encode_text(text, self.character_encoding());
        self.write(&bytes)
    }

    /// Hace commit de los headers y empieza a streamear el body
    pub fn flush_buffer(&mut self) -> Result<()> {
        if !self.committed {
            self.commit_streaming()?;
        }
        let pending = std::mem::take(&mut self.buffer);
        if let Some(body) = self.body.as_mut() {
            body.write_all(&pending)?;
        }
        Ok(())
    }

    /// Termina la respuesta: commit si hace falta y cierre del framing
    ///
    /// Idempotente.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.committed {
            self.commit_complete()?;
        } else if let Some(body) = self.body.take() {
            self.output = Some(body.finish()?);
        }
        if let Some(declared) = self.declared_length {
            if declared != self.written {
                // El cliente no puede encontrar el próximo request
                warn!(declared, written = self.written, "body length differs from Content-Length");
                self.force_close = true;
            }
        }
        if let Some(out) = self.output.as_mut() {
            out.flush()?;
        }
        self.finished = true;
        Ok(())
    }

    /// Devuelve el stream de salida al terminar la respuesta
    pub fn take_output(&mut self) -> Option<Output> {
        self.output.take()
    }

    // === Errores y redirects ===

    /// Reemplaza la respuesta por una página de error mínima
    pub fn send_error(&mut self, status: StatusCode, message: &str) -> Result<()> {
        if self.committed {
            return Err(Error::IllegalState(format!(
                "cannot send {} after commit",
                status.as_u16()
            )));
        }
        self.discard_content();
        self.status = status;
        if status.forbids_body() {
            return Ok(());
        }
        self.set_content_type("text/html");
        let body = error_page(status, message);
        self.write(body.as_bytes())
    }

    /// Redirect 302 a `location`
    pub fn send_redirect(&mut self, location: &str) -> Result<()> {
        if self.committed {
            return Err(Error::IllegalState("cannot redirect after commit".to_string()));
        }
        self.discard_content();
        self.status = StatusCode::FOUND;
        self.headers.set("Location", location);
        self.set_content_type("text/html");
        let body = format!(
            "<html><head><title>{status}</title></head><body><h1>{status}</h1>\
             <p>The document has moved <a href=\"{href}\">here</a>.</p></body></html>",
            status = self.status,
            href = escape_html(location),
        );
        self.write(body.as_bytes())
    }

    fn discard_content(&mut self) {
        self.buffer.clear();
        self.written = 0;
        self.content_length = None;
        self.content_type = None;
        self.gzip = false;
        self.compression_decided = false;
        self.headers.remove("content-encoding");
        self.headers.remove("content-length");
    }

    // === Commit ===

    fn decide_compression(&mut self) {
        self.compression_decided = true;
        self.gzip = self.exchange.accepts_gzip
            && !self.status.forbids_body()
            && !self.headers.contains("content-encoding")
            && self
                .content_type
                .as_deref()
                .map(|ct| self.config.is_compressible(ct))
                .unwrap_or(false);
    }

    /// Commit con el body completo en el buffer
    fn commit_complete(&mut self) -> Result<()> {
        if !self.compression_decided {
            self.gzip = false;
        }

        let body = if self.status.forbids_body() {
            self.headers.remove("content-length");
            Vec::new()
        } else if self.gzip && !self.buffer.is_empty() {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&self.buffer)?;
            let compressed = encoder.finish()?;
            self.headers.set("Content-Length", &compressed.len().to_string());
            compressed
        } else {
            self.gzip = false;
            let length = match (self.exchange.head_only, self.content_length) {
                (true, Some(explicit)) => explicit,
                _ => self.buffer.len() as u64,
            };
            self.headers.set("Content-Length", &length.to_string());
            std::mem::take(&mut self.buffer)
        };

        let head = self.render_head(false);
        let head_only = self.exchange.head_only;
        let out = self.output_mut()?;
        out.write_all(&head)?;
        if !head_only {
            out.write_all(&body)?;
        }
        self.buffer.clear();
        self.committed = true;
        Ok(())
    }

    /// Commit anticipado: el body se streamea a medida que se escribe
    fn commit_streaming(&mut self) -> Result<()> {
        let mut chunked = false;
        let forbids_body = self.status.forbids_body();

        if !forbids_body {
            if self.gzip {
                self.headers.remove("content-length");
                chunked = self.exchange.version == Version::Http11;
            } else if let Some(length) = self.content_length {
                self.headers.set("Content-Length", &length.to_string());
                if !self.exchange.head_only {
                    self.declared_length = Some(length);
                }
            } else {
                chunked = self.exchange.version == Version::Http11;
            }
            if chunked {
                self.headers.remove("content-length");
            }
            if !chunked && !self.headers.contains("content-length") {
                // Delimitado por cierre
                self.force_close = true;
            }
        } else {
            self.headers.remove("content-length");
        }

        let head = self.render_head(chunked);
        let mut out = self
            .output
            .take()
            .ok_or_else(|| Error::IllegalState("response has no output".to_string()))?;
        out.write_all(&head)?;
        self.committed = true;

        let framing = if forbids_body || self.exchange.head_only {
            Framing::Discard(out)
        } else if chunked {
            Framing::Chunked(ChunkedWriter::new(out))
        } else {
            Framing::Plain(out)
        };
        self.body = Some(if self.gzip && !forbids_body {
            BodyWriter::Gzip(GzEncoder::new(framing, Compression::default()))
        } else {
            BodyWriter::Direct(framing)
        });
        Ok(())
    }

    fn output_mut(&mut self) -> Result<&mut Output> {
        self.output
            .as_mut()
            .ok_or_else(|| Error::IllegalState("response has no output".to_string()))
    }

    /// Status line + headers + línea vacía
    fn render_head(&mut self, chunked: bool) -> Vec<u8> {
        let date = httpdate::fmt_http_date(SystemTime::now());
        self.headers.set("Date", &date);
        if !self.headers.contains("server") {
            let server = self.config.server_name.clone();
            self.headers.set("Server", &server);
        }

        if let Some(mime) = self.content_type.clone() {
            let value = if mime.starts_with("text/") || self.charset.is_some() {
                format!("{}; charset={}", mime, self.character_encoding())
            } else {
                mime
            };
            self.headers.set("Content-Type", &value);
        }

        if chunked {
            self.headers.set("Transfer-Encoding", "chunked");
        }
        if self.gzip && !self.status.forbids_body() {
            self.headers.set("Content-Encoding", "gzip");
            self.headers.append("Vary", "Accept-Encoding");
        }

        if !self.keep_alive() {
            self.headers.set("Connection", "Close");
        } else if self.exchange.version == Version::Http10 {
            self.headers.set("Connection", "Keep-Alive");
        }

        if let Some(id) = self.session_id.take() {
            if !self.cookies.iter().any(|c| c.name == SESSION_COOKIE) {
                self.cookies
                    .push(Cookie::new(SESSION_COOKIE, &id).with_path("/").http_only());
            }
        }

        let mut head = Vec::with_capacity(256);
        // write! sobre un Vec no falla
        let _ = write!(head, "{} {}\r\n", self.exchange.version.as_str(), self.status);
        for (name, value) in self.headers.iter() {
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        for cookie in &self.cookies {
            let _ = write!(head, "Set-Cookie: {}\r\n", cookie.to_header_value());
        }
        head.extend_from_slice(b"\r\n");
        head
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("committed", &self.committed)
            .field("finished", &self.finished)
            .field("gzip", &self.gzip)
            .finish()
    }
}

/// Salida en memoria compartida entre la respuesta y quien la inspecciona
#[derive(Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Codifica texto en UTF-8, ISO-8859-1 o US-ASCII
pub fn encode_text(text: &str, charset: &str) -> Vec<u8> {
    let limit = match charset.to_ascii_lowercase().as_str() {
        "iso-8859-1" | "latin1" | "latin-1" | "iso8859-1" => 0xFF,
        "us-ascii" | "ascii" => 0x7F,
        _ => return text.as_bytes().to_vec(),
    };
    text.chars()
        .map(|c| if (c as u32) <= limit { c as u32 as u8 } else { b'?' })
        .collect()
}

/// Escapa `& < > "` para insertar texto en HTML
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn error_page(status: StatusCode, message: &str) -> String {
    let mut body = format!(
        "<html><head><title>{status}</title></head><body><h1>{status}</h1>",
        status = status
    );
    if !message.is_empty() {
        body.push_str("<p>");
        body.push_str(&escape_html(message));
        body.push_str("</p>");
    }
    body.push_str("</body></html>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn response(exchange: ExchangeInfo, config: Config) -> (Response, MemorySink) {
        let captured = MemorySink::default();
        let mut response = Response::create();
        response.init(exchange, Arc::new(config), Box::new(captured.clone()));
        (response, captured)
    }

    fn http11() -> ExchangeInfo {
        ExchangeInfo {
            version: Version::Http11,
            keep_alive: true,
            ..ExchangeInfo::default()
        }
    }

    fn split(raw: &[u8]) -> (String, Vec<u8>) {
        let pos = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("header terminator");
        (
            String::from_utf8_lossy(&raw[..pos]).into_owned(),
            raw[pos + 4..].to_vec(),
        )
    }

    #[test]
    fn test_default_status_and_measured_length() {
        let (mut res, out) = response(http11(), Config::default());
        res.write(b"Hello").unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 5"));
        assert!(head.contains("Date: "));
        assert!(head.contains("Server: embedded_httpd/"));
        assert!(!head.contains("Connection:"));
        assert_eq!(body, b"Hello");
    }

    #[test]
    fn test_unknown_status_phrase() {
        let (mut res, out) = response(http11(), Config::default());
        res.set_status(StatusCode::from_u16(599));
        res.finish().unwrap();
        let (head, _) = split(&out.contents());
        assert!(head.starts_with("HTTP/1.1 599 Unknown Status"));
    }

    #[test]
    fn test_not_modified_has_no_body() {
        let (mut res, out) = response(http11(), Config::default());
        res.set_status(StatusCode::NOT_MODIFIED);
        res.write(b"ignored").unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(head.starts_with("HTTP/1.1 304 Not Modified"));
        assert!(!head.contains("Content-Length"));
        assert!(!head.contains("chunked"));
        assert!(body.is_empty());
    }

    #[test]
    fn test_connection_headers() {
        let (mut res, out) = response(
            ExchangeInfo { version: Version::Http10, keep_alive: true, ..ExchangeInfo::default() },
            Config::default(),
        );
        res.finish().unwrap();
        assert!(split(&out.contents()).0.contains("Connection: Keep-Alive"));

        let (mut res, out) = response(ExchangeInfo::default(), Config::default());
        res.finish().unwrap();
        assert!(split(&out.contents()).0.contains("Connection: Close"));
    }

    #[test]
    fn test_overflow_uses_chunked_on_http11() {
        let mut config = Config::default();
        config.buffer_size = 8;
        let (mut res, out) = response(http11(), config);
        res.write(b"0123456789").unwrap();
        res.write(b"abc").unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(head.contains("Transfer-Encoding: chunked"));
        assert!(!head.contains("Content-Length"));
        assert_eq!(body, b"a\r\n0123456789\r\n3\r\nabc\r\n0\r\n\r\n");
        assert!(res.keep_alive());
    }

    #[test]
    fn test_overflow_on_http10_closes() {
        let mut config = Config::default();
        config.buffer_size = 4;
        let (mut res, out) = response(
            ExchangeInfo { version: Version::Http10, keep_alive: true, ..ExchangeInfo::default() },
            config,
        );
        res.write(b"0123456789").unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(head.contains("Connection: Close"));
        assert_eq!(body, b"0123456789");
        assert!(!res.keep_alive());
    }

    #[test]
    fn test_overflow_with_explicit_length() {
        let mut config = Config::default();
        config.buffer_size = 4;
        let (mut res, out) = response(http11(), config);
        res.set_content_length(10);
        res.write(b"0123456789").unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(head.contains("Content-Length: 10"));
        assert_eq!(body, b"0123456789");
        assert!(res.keep_alive());
    }

    #[test]
    fn test_content_length_header_uses_typed_length() {
        let mut config = Config::default();
        config.buffer_size = 4;
        let (mut res, out) = response(http11(), config);
        res.set_header("content-length", "10");
        res.write(b"0123456789").unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert_eq!(head.matches("Content-Length").count(), 1);
        assert!(head.contains("Content-Length: 10"));
        assert!(!head.contains("Transfer-Encoding"));
        assert_eq!(body, b"0123456789");
    }

    #[test]
    fn test_invalid_content_length_header_falls_back_to_chunked() {
        let mut config = Config::default();
        config.buffer_size = 4;
        let (mut res, out) = response(http11(), config);
        res.set_header("Content-Length", "lots");
        res.write(b"0123456789").unwrap();
        res.finish().unwrap();

        let (head, _) = split(&out.contents());
        assert!(head.contains("Transfer-Encoding: chunked"));
        assert!(!head.contains("Content-Length"));
    }

    #[test]
    fn test_short_body_with_declared_length_closes() {
        let mut config = Config::default();
        config.buffer_size = 4;
        let (mut res, out) = response(http11(), config);
        res.set_content_length(20);
        res.write(b"0123456789").unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(head.contains("Content-Length: 20"));
        assert_eq!(body, b"0123456789");
        assert!(!res.keep_alive());
    }

    #[test]
    fn test_gzip_when_negotiated() {
        let exchange = ExchangeInfo { accepts_gzip: true, ..http11() };
        let (mut res, out) = response(exchange, Config::default());
        res.set_content_type("text/plain");
        res.print(&"compress me ".repeat(50)).unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(head.contains("Content-Encoding: gzip"));
        assert!(head.contains("Vary: Accept-Encoding"));
        assert!(head.contains(&format!("Content-Length: {}", body.len())));

        let mut decoded = String::new();
        GzDecoder::new(&body[..]).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "compress me ".repeat(50));
    }

    #[test]
    fn test_no_gzip_for_binary_or_unwilling_client() {
        let exchange = ExchangeInfo { accepts_gzip: true, ..http11() };
        let (mut res, out) = response(exchange, Config::default());
        res.set_content_type("image/png");
        res.write(&[1, 2, 3]).unwrap();
        res.finish().unwrap();
        assert!(!split(&out.contents()).0.contains("Content-Encoding"));

        let (mut res, out) = response(http11(), Config::default());
        res.set_content_type("text/html");
        res.write(b"<p>").unwrap();
        res.finish().unwrap();
        assert!(!split(&out.contents()).0.contains("Content-Encoding"));
    }

    #[test]
    fn test_gzip_not_retro_applied() {
        let exchange = ExchangeInfo { accepts_gzip: true, ..http11() };
        let (mut res, out) = response(exchange, Config::default());
        res.write(b"plain first").unwrap();
        res.set_content_type("text/plain");
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(!head.contains("Content-Encoding"));
        assert_eq!(body, b"plain first");
    }

    #[test]
    fn test_gzip_streaming_overflow() {
        let mut config = Config::default();
        config.buffer_size = 16;
        let exchange = ExchangeInfo { accepts_gzip: true, ..http11() };
        let (mut res, out) = response(exchange, config);
        res.set_content_type("application/json");
        let payload = "[1,2,3,4,5,6,7,8,9]".repeat(20);
        res.write(payload.as_bytes()).unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(head.contains("Transfer-Encoding: chunked"));
        assert!(head.contains("Content-Encoding: gzip"));

        let mut reader = std::io::BufReader::new(&body[..]);
        let mut trailers = HeaderMap::new();
        let compressed =
            crate::http::chunked::decode_chunked(&mut reader, 1 << 20, 1024, 100, &mut trailers).unwrap();
        let mut decoded = String::new();
        GzDecoder::new(&compressed[..]).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_head_discards_body_keeps_length() {
        let exchange = ExchangeInfo { head_only: true, ..http11() };
        let (mut res, out) = response(exchange, Config::default());
        res.write(b"0123456789").unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(head.contains("Content-Length: 10"));
        assert!(body.is_empty());
    }

    #[test]
    fn test_charset_pairing_and_latin1() {
        let (mut res, out) = response(http11(), Config::default());
        res.set_content_type("text/plain; charset=ISO-8859-1");
        res.print("año €").unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(head.contains("Content-Type: text/plain; charset=ISO-8859-1"));
        assert_eq!(body, vec![b'a', 0xF1, b'o', b' ', b'?']);
    }

    #[test]
    fn test_text_type_gets_default_charset() {
        let (mut res, out) = response(http11(), Config::default());
        res.set_content_type("text/html");
        res.finish().unwrap();
        assert!(split(&out.contents()).0.contains("Content-Type: text/html; charset=UTF-8"));
    }

    #[test]
    fn test_send_error_escapes_message() {
        let (mut res, out) = response(http11(), Config::default());
        res.write(b"partial").unwrap();
        res.send_error(StatusCode::NOT_FOUND, "<script>").unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(head.starts_with("HTTP/1.1 404 Not Found"));
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("&lt;script&gt;"));
        assert!(!body.contains("partial"));
    }

    #[test]
    fn test_send_error_after_commit_fails() {
        let mut config = Config::default();
        config.buffer_size = 2;
        let (mut res, _) = response(http11(), config);
        res.write(b"too long").unwrap();
        assert!(res.is_committed());
        assert!(matches!(
            res.send_error(StatusCode::INTERNAL_SERVER_ERROR, ""),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_send_redirect() {
        let (mut res, out) = response(http11(), Config::default());
        res.send_redirect("/login?next=/a&b").unwrap();
        res.finish().unwrap();

        let (head, body) = split(&out.contents());
        assert!(head.starts_with("HTTP/1.1 302 Found"));
        assert!(head.contains("Location: /login?next=/a&b"));
        assert!(String::from_utf8(body).unwrap().contains("/login?next=/a&amp;b"));
    }

    #[test]
    fn test_session_and_cookies() {
        let (mut res, out) = response(http11(), Config::default());
        res.add_cookie(Cookie::new("theme", "dark"));
        res.set_session_id("abc.1.ff");
        res.finish().unwrap();

        let (head, _) = split(&out.contents());
        assert!(head.contains("Set-Cookie: theme=dark"));
        assert!(head.contains("Set-Cookie: SESSIONID=abc.1.ff; Path=/; HttpOnly"));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let (mut res, out) = response(http11(), Config::default());
        res.write(b"x").unwrap();
        res.finish().unwrap();
        let len = out.contents().len();
        res.finish().unwrap();
        assert_eq!(out.contents().len(), len);
        assert!(res.write(b"y").is_err());
        assert!(res.take_output().is_some());
    }

    #[test]
    fn test_reset_for_pool() {
        let (mut res, _) = response(http11(), Config::default());
        res.set_status(StatusCode::NOT_FOUND);
        res.set_header("X-A", "1");
        res.write(b"abc").unwrap();
        res.reset();

        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().is_empty());
        assert_eq!(res.bytes_written(), 0);
        assert!(!res.is_committed());
    }

    #[test]
    fn test_standalone() {
        let mut res = Response::standalone();
        res.print("hola").unwrap();
        res.finish().unwrap();
        let bytes = res.into_bytes();
        let (head, body) = split(&bytes);
        assert!(head.starts_with("HTTP/1.0 200 OK"));
        assert_eq!(body, b"hola");
    }
}
