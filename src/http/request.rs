//! # Parsing de Requests HTTP/1.0 y HTTP/1.1
//! src/http/request.rs
//!
//! Este módulo implementa el parser de requests leyendo directamente del
//! stream de la conexión, línea por línea.
//!
//! ## Formato de un Request
//!
//! ```text
//! POST /carrito;sessionid=abc?item=7 HTTP/1.1\r\n
//! Host: localhost:8080\r\n
//! X-Long: primera parte\r\n
//!  continuación\r\n
//! Transfer-Encoding: chunked\r\n
//! \r\n
//! 4\r\nWiki\r\n0\r\n\r\n
//! ```
//!
//! ## Reglas
//!
//! 1. **Request Line**: `METHOD URI VERSION`. HTTP/1.1 exige `Host`.
//! 2. **Headers**: nombre en minúsculas, duplicados conservados, líneas que
//!    empiezan con espacio/tab continúan el header anterior.
//! 3. **Body**: `Content-Length`, o `Transfer-Encoding: chunked`. Un método
//!    con body sin ninguno de los dos es un 411.
//!
//! El objeto es reutilizable: vive en un pool y se resetea entre usos.

use super::chunked::decode_chunked;
use super::cookie::{parse_cookies, Cookie};
use super::negotiation::{parse_accept_language, prefers_gzip, Locale};
use super::response::ExchangeInfo;
use super::{HeaderMap, StatusCode};
use crate::config::{Config, Scheme};
use crate::error::{Error, Result};
use crate::pool::Poolable;
use crate::server::connection::ConnectionInfo;
use crate::session::{Session, SessionManager, SESSION_COOKIE, SESSION_URL_PARAM};
use std::collections::HashMap;
use std::io::{BufRead, Cursor, Read};
use std::net::SocketAddr;
use std::sync::Arc;

/// Métodos HTTP soportados
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    GET,
    HEAD,
    POST,
    PUT,
    DELETE,
    OPTIONS,
    TRACE,
    PATCH,
}

impl Method {
    /// Parsea un método HTTP (case-sensitive, como exige el RFC)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "HEAD" => Some(Method::HEAD),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "OPTIONS" => Some(Method::OPTIONS),
            "TRACE" => Some(Method::TRACE),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }

    /// Convierte el método a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::HEAD => "HEAD",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::OPTIONS => "OPTIONS",
            Method::TRACE => "TRACE",
            Method::PATCH => "PATCH",
        }
    }

    /// Métodos que normalmente llevan body y exigen longitud conocida
    pub fn has_body(&self) -> bool {
        matches!(self, Method::POST | Method::PUT | Method::PATCH)
    }
}

/// Versión del protocolo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    #[default]
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Decide si la conexión puede mantenerse abierta tras este mensaje
///
/// | versión  | Connection   | longitud conocida | keep-alive |
/// |----------|--------------|-------------------|------------|
/// | 1.1      | (ninguno)    | sí                | sí         |
/// | 1.1      | close        | -                 | no         |
/// | 1.0      | keep-alive   | sí                | sí         |
/// | 1.0      | (ninguno)    | -                 | no         |
/// | cualquiera | -          | no                | no         |
pub fn keep_alive_eligible(version: Version, connection: Option<&str>, length_known: bool) -> bool {
    if !length_known {
        return false;
    }
    let has_token = |token: &str| {
        connection
            .map(|value| value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    };
    match version {
        Version::Http11 => !has_token("close"),
        Version::Http10 => has_token("keep-alive"),
    }
}

/// Lee una línea terminada en LF (con o sin CR) de como máximo `max` bytes
///
/// Retorna `None` si el stream terminó antes de leer cualquier byte.
pub(crate) fn read_line(
    reader: &mut dyn BufRead,
    max: usize,
    too_long: StatusCode,
) -> Result<Option<String>> {
    let mut line = Vec::new();

    loop {
        let (found, used) = {
            let available = reader.fill_buf()?;
            if available.is_empty() {
                if line.is_empty() {
                    return Ok(None);
                }
                break;
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    line.extend_from_slice(&available[..i]);
                    (true, i + 1)
                }
                None => {
                    line.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);

        if line.len() > max + 1 {
            return Err(Error::protocol(
                too_long,
                format!("Line exceeds {} bytes", max),
            ));
        }
        if found {
            break;
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if line.len() > max {
        return Err(Error::protocol(too_long, format!("Line exceeds {} bytes", max)));
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Decodifica `%XX` (y `+` como espacio si se pide)
pub fn percent_decode(s: &str, plus_as_space: bool) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                out.push(hex_value(bytes[i + 1]) << 4 | hex_value(bytes[i + 2]));
                i += 3;
                continue;
            }
            b'+' if plus_as_space => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}

/// Request HTTP parseado
#[derive(Debug, Default)]
pub struct Request {
    method: Method,
    version: Version,
    /// Request-target tal como llegó
    uri: String,
    /// Path decodificado, sin query ni `;sessionid=`
    path: String,
    query: Option<String>,
    query_params: HashMap<String, String>,
    request_line: String,
    raw_headers: Vec<String>,
    headers: HeaderMap,
    cookies: Vec<Cookie>,
    content_length: Option<usize>,
    chunked: bool,
    body: Vec<u8>,
    keep_alive: bool,
    locales: Vec<Locale>,
    accepts_gzip: bool,
    character_encoding: String,

    // === Conexión ===
    scheme: Option<Scheme>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,

    // === Sesión ===
    requested_session_id: Option<String>,
    session_id_from_cookie: bool,
    session_id_from_url: bool,
    sessions: Option<Arc<SessionManager>>,
    session: Option<Arc<Session>>,

    // === Ruteo (lo completa el dispatcher) ===
    route_prefix: String,
    path_info: Option<String>,
}

impl Poolable for Request {
    fn create() -> Self {
        Request::default()
    }

    fn reset(&mut self) {
        self.method = Method::GET;
        self.version = Version::Http10;
        self.uri.clear();
        self.path.clear();
        self.query = None;
        self.query_params.clear();
        self.request_line.clear();
        self.raw_headers.clear();
        self.headers.clear();
        self.cookies.clear();
        self.content_length = None;
        self.chunked = false;
        self.body.clear();
        self.keep_alive = false;
        self.locales.clear();
        self.accepts_gzip = false;
        self.character_encoding.clear();
        self.scheme = None;
        self.local_addr = None;
        self.remote_addr = None;
        self.requested_session_id = None;
        self.session_id_from_cookie = false;
        self.session_id_from_url = false;
        self.sessions = None;
        self.session = None;
        self.route_prefix.clear();
        self.path_info = None;
    }
}

impl Request {
    /// Parsea un request completo desde bytes
    ///
    /// Útil para tests y para procesar requests fuera de una conexión.
    ///
    /// # Ejemplo
    ///
    /// ```
    /// use embedded_httpd::config::Config;
    /// use embedded_httpd::http::Request;
    ///
    /// let raw = b"GET /search?q=rust HTTP/1.0\r\n\r\n";
    /// let request = Request::parse(raw, &Config::default()).unwrap();
    ///
    /// assert_eq!(request.path(), "/search");
    /// assert_eq!(request.query_param("q"), Some("rust"));
    /// ```
    pub fn parse(raw: &[u8], config: &Config) -> Result<Self> {
        let mut request = Request::create();
        let mut reader = Cursor::new(raw);
        if request.init(&mut reader, config, &ConnectionInfo::default(), None)? {
            Ok(request)
        } else {
            Err(Error::protocol(StatusCode::BAD_REQUEST, "Empty request"))
        }
    }

    /// Lee y parsea el siguiente request del stream
    ///
    /// Retorna `Ok(false)` si el cliente cerró la conexión antes de enviar
    /// un nuevo request.
    pub fn init(
        &mut self,
        reader: &mut dyn BufRead,
        config: &Config,
        connection: &ConnectionInfo,
        sessions: Option<Arc<SessionManager>>,
    ) -> Result<bool> {
        self.scheme = Some(connection.scheme);
        self.local_addr = connection.local_addr;
        self.remote_addr = connection.remote_addr;
        self.sessions = sessions;
        self.character_encoding = config.default_charset.clone();

        // Se toleran líneas vacías antes de la request line
        let line = loop {
            match read_line(reader, config.max_request_line, StatusCode::URI_TOO_LONG)? {
                None => return Ok(false),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
            }
        };

        self.parse_request_line(&line)?;
        self.request_line = line;
        self.parse_headers(reader, config)?;

        if self.version == Version::Http11 && !self.headers.contains("host") {
            return Err(Error::protocol(
                StatusCode::BAD_REQUEST,
                "HTTP/1.1 request without Host header",
            ));
        }

        self.read_body(reader, config)?;

        let length_known = self.content_length.is_some()
            || matches!(self.method, Method::GET | Method::HEAD);
        let connection_header = self
            .headers
            .get("connection")
            .or_else(|| self.headers.get("proxy-connection"));
        self.keep_alive = keep_alive_eligible(self.version, connection_header, length_known);

        self.cookies = parse_cookies(self.headers.get_all("cookie").iter().map(|s| s.as_str()));
        self.locales = parse_accept_language(self.headers.get("accept-language").unwrap_or(""));
        self.accepts_gzip = prefers_gzip(self.headers.get("accept-encoding"));

        if let Some(charset) = self.content_type().and_then(charset_param) {
            self.character_encoding = charset;
        }

        if let Some(cookie) = self.cookies.iter().find(|c| c.name == SESSION_COOKIE) {
            self.requested_session_id = Some(cookie.value.clone());
            self.session_id_from_cookie = true;
            self.session_id_from_url = false;
        }

        Ok(true)
    }

    /// Parsea la request line
    ///
    /// Formato: `GET /path?query HTTP/1.1`
    fn parse_request_line(&mut self, line: &str) -> Result<()> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(Error::protocol(
                StatusCode::BAD_REQUEST,
                "Invalid request line format",
            ));
        }

        self.method = Method::parse(parts[0]).ok_or_else(|| {
            Error::protocol(
                StatusCode::NOT_IMPLEMENTED,
                format!("Unsupported HTTP method: {}", parts[0]),
            )
        })?;

        self.version = match parts[2] {
            "HTTP/1.0" => Version::Http10,
            "HTTP/1.1" => Version::Http11,
            v if v.starts_with("HTTP/") => {
                return Err(Error::protocol(
                    StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                    format!("Invalid HTTP version: {}", v),
                ))
            }
            v => {
                return Err(Error::protocol(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid HTTP version: {}", v),
                ))
            }
        };

        self.uri = parts[1].to_string();
        self.parse_uri()
    }

    /// Separa path y query en el primer `?` y extrae `;sessionid=`
    fn parse_uri(&mut self) -> Result<()> {
        let mut target = self.uri.as_str();

        // Forma absoluta: http://host:port/path
        if let Some(rest) = target
            .strip_prefix("http://")
            .or_else(|| target.strip_prefix("https://"))
        {
            target = rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
        }

        let (raw_path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (target, None),
        };

        if !raw_path.starts_with('/') && raw_path != "*" {
            return Err(Error::protocol(
                StatusCode::BAD_REQUEST,
                format!("Invalid request URI: {}", self.uri),
            ));
        }

        let raw_path = match raw_path.find(SESSION_URL_PARAM) {
            Some(i) => {
                let after = &raw_path[i + SESSION_URL_PARAM.len()..];
                let end = after.find([';', '/']).unwrap_or(after.len());
                if end > 0 {
                    self.requested_session_id = Some(after[..end].to_string());
                    self.session_id_from_url = true;
                }
                format!("{}{}", &raw_path[..i], &after[end..])
            }
            None => raw_path.to_string(),
        };

        self.path = percent_decode(&raw_path, false);
        if let Some(q) = query {
            self.query_params = parse_query_string(q);
            self.query = Some(q.to_string());
        }
        Ok(())
    }

    /// Lee headers hasta la línea vacía
    fn parse_headers(&mut self, reader: &mut dyn BufRead, config: &Config) -> Result<()> {
        let mut count = 0usize;
        let mut last_name: Option<String> = None;

        loop {
            let line = read_line(reader, config.max_request_line, StatusCode::BAD_REQUEST)?
                .ok_or_else(|| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed inside headers",
                    ))
                })?;
            if line.is_empty() {
                return Ok(());
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                let appended = last_name
                    .as_deref()
                    .map(|name| self.headers.extend_last(name, &line))
                    .unwrap_or(false);
                if !appended {
                    return Err(Error::protocol(
                        StatusCode::BAD_REQUEST,
                        "Continuation line without a header",
                    ));
                }
                self.raw_headers.push(line);
                continue;
            }

            count += 1;
            if count > config.max_headers {
                return Err(Error::protocol(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("More than {} headers", config.max_headers),
                ));
            }

            let (name, value) = line.split_once(':').ok_or_else(|| {
                Error::protocol(StatusCode::BAD_REQUEST, format!("Invalid header: {}", line))
            })?;
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() {
                return Err(Error::protocol(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid header: {}", line),
                ));
            }
            self.headers.append(&name, value.trim());
            last_name = Some(name);
            self.raw_headers.push(line);
        }
    }

    /// Lee el body según `Content-Length` o chunked
    fn read_body(&mut self, reader: &mut dyn BufRead, config: &Config) -> Result<()> {
        if let Some(raw) = self.headers.get("content-length") {
            let length: usize = raw.trim().parse().map_err(|_| {
                Error::protocol(StatusCode::BAD_REQUEST, format!("Invalid Content-Length: {}", raw))
            })?;
            let consistent = self
                .headers
                .get_all("content-length")
                .iter()
                .all(|v| v.trim() == raw.trim());
            if !consistent {
                return Err(Error::protocol(
                    StatusCode::BAD_REQUEST,
                    "Conflicting Content-Length headers",
                ));
            }
            if length > config.max_post_size {
                return Err(Error::protocol(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("Body exceeds {} bytes", config.max_post_size),
                ));
            }

            self.body.clear();
            self.body.resize(length, 0);
            reader.read_exact(&mut self.body)?;
            self.content_length = Some(length);
            return Ok(());
        }

        let chunked = self
            .headers
            .get_all("transfer-encoding")
            .iter()
            .flat_map(|v| v.split(','))
            .last()
            .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);

        if chunked {
            let mut trailers = HeaderMap::new();
            self.body = decode_chunked(
                reader,
                config.max_post_size,
                config.max_request_line,
                config.max_headers,
                &mut trailers,
            )?;
            for (name, value) in trailers.iter() {
                self.headers.append(name, value);
            }
            self.chunked = true;
            self.content_length = Some(self.body.len());
            return Ok(());
        }

        if self.method.has_body() {
            return Err(Error::protocol(
                StatusCode::LENGTH_REQUIRED,
                format!("{} without Content-Length", self.method.as_str()),
            ));
        }
        Ok(())
    }

    // === Sesión ===

    /// Sesión del request, creándola si `create` y no existe una válida
    pub fn session(&mut self, create: bool) -> Option<Arc<Session>> {
        if let Some(session) = &self.session {
            if session.is_valid() {
                return Some(Arc::clone(session));
            }
            self.session = None;
        }

        let sessions = self.sessions.as_ref()?;
        if let Some(id) = &self.requested_session_id {
            if let Some(session) = sessions.get(id) {
                self.session = Some(Arc::clone(&session));
                return Some(session);
            }
        }

        if create {
            let session = sessions.create();
            self.session = Some(Arc::clone(&session));
            return Some(session);
        }
        None
    }

    /// Sesión ya asociada a este intercambio, sin buscar ni crear
    pub fn current_session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref().filter(|s| s.is_valid())
    }

    pub fn requested_session_id(&self) -> Option<&str> {
        self.requested_session_id.as_deref()
    }

    pub fn is_session_id_from_cookie(&self) -> bool {
        self.session_id_from_cookie
    }

    pub fn is_session_id_from_url(&self) -> bool {
        self.session_id_from_url
    }

    /// Agrega `;sessionid=` al path de `url` si el cliente no usa la cookie
    pub fn encode_url(&self, url: &str) -> String {
        let session = match self.current_session() {
            Some(s) if !self.session_id_from_cookie => s,
            _ => return url.to_string(),
        };
        let split = url.find(['?', '#']).unwrap_or(url.len());
        format!(
            "{}{}{}{}",
            &url[..split],
            SESSION_URL_PARAM,
            session.id(),
            &url[split..]
        )
    }

    // === Ruteo ===

    pub(crate) fn set_route(&mut self, prefix: &str, path_info: Option<String>) {
        self.route_prefix.clear();
        self.route_prefix.push_str(prefix);
        self.path_info = path_info;
    }

    /// Prefijo registrado que atendió el request
    pub fn route_prefix(&self) -> &str {
        &self.route_prefix
    }

    /// Resto del path después del prefijo registrado
    pub fn path_info(&self) -> Option<&str> {
        self.path_info.as_deref()
    }

    /// Datos del intercambio que necesita la respuesta
    pub fn exchange_info(&self) -> ExchangeInfo {
        ExchangeInfo {
            version: self.version,
            head_only: self.method == Method::HEAD,
            keep_alive: self.keep_alive,
            accepts_gzip: self.accepts_gzip,
        }
    }

    // === Métodos públicos para acceder a los campos ===

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Request-target original
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    /// Obtiene un query parameter específico
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(|s| s.as_str())
    }

    pub fn request_line(&self) -> &str {
        &self.request_line
    }

    /// Líneas de headers tal como llegaron
    pub fn raw_headers(&self) -> &[String] {
        &self.raw_headers
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Primer valor de un header (nombre case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers.get_all(name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Obtiene el body del request como String
    pub fn body_string(&self) -> Option<String> {
        String::from_utf8(self.body.clone()).ok()
    }

    /// Reader sobre el body ya recibido
    pub fn input(&self) -> impl Read + '_ {
        self.body.as_slice()
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Locales aceptados, de mayor a menor preferencia
    pub fn locales(&self) -> &[Locale] {
        &self.locales
    }

    /// Locale preferido (o `en` si el cliente no envió ninguno)
    pub fn locale(&self) -> Locale {
        self.locales.first().cloned().unwrap_or_default()
    }

    pub fn accepts_gzip(&self) -> bool {
        self.accepts_gzip
    }

    pub fn character_encoding(&self) -> &str {
        &self.character_encoding
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme.unwrap_or(Scheme::Http)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

/// Parsea una query string en un HashMap
///
/// Ejemplo: "num=10&text=hello%20world"
/// Retorna: {"num": "10", "text": "hello world"}
fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for param in query.split('&') {
        if param.is_empty() {
            continue;
        }
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        params
            .entry(percent_decode(key, true))
            .or_insert_with(|| percent_decode(value, true));
    }
    params
}

/// Extrae `charset=` de un Content-Type
fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}
