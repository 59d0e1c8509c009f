//! # Configuración del Servidor
//! src/config.rs
//!
//! Este módulo define la configuración del servidor HTTP con soporte completo
//! para argumentos CLI, variables de entorno y actualizaciones en caliente
//! como mapa clave/valor.
//!
//! ## Modelo
//!
//! - [`Config`]: snapshot inmutable de todos los parámetros.
//! - [`ConfigStore`]: guarda el snapshot actual en un `ArcSwap`. Los lectores
//!   nunca bloquean; cada update reemplaza el snapshot completo.
//! - [`ConfigView`]: vista por esquema (http/https) sobre el mismo store.
//!
//! ## Ejemplos de uso
//!
//! ### CLI
//! ```bash
//! ./embedded_httpd --port 8080 --root ./www --max-connections 64
//! ```
//!
//! ### Variables de entorno
//! ```bash
//! HTTPD_PORT=8080 HTTPD_HOST=0.0.0.0 ./embedded_httpd
//! ```
//!
//! ### Archivo JSON (`--config`)
//! ```json
//! { "http.port": 8080, "mime.md": "text/markdown", "compressible_types": "text/,application/json" }
//! ```

use crate::error::{Error, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Esquema de un listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parámetros de bind propios de cada esquema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemeSettings {
    pub enabled: bool,
    pub port: u16,
    pub host: String,
    /// Solo aplica a https
    pub need_client_auth: bool,
}

impl Default for SchemeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
            host: "127.0.0.1".to_string(),
            need_client_auth: false,
        }
    }
}

/// Snapshot de configuración del servidor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: SchemeSettings,
    pub https: SchemeSettings,

    // === Conexiones ===
    /// Máximo de transacciones activas simultáneas
    pub max_connections: usize,

    /// Timeout de lectura del socket en ms (0 = sin timeout)
    pub connection_timeout_ms: u64,

    /// Tiempo de inactividad tras el cual una sesión expira
    pub session_timeout_secs: u64,

    // === Buffers y límites ===
    /// Bytes de body que la respuesta acumula antes de hacer commit
    pub buffer_size: usize,

    pub default_charset: String,

    /// Largo máximo de la request line y de cada línea de header
    pub max_request_line: usize,

    /// Máximo de headers por request
    pub max_headers: usize,

    /// Tamaño máximo del body de un request
    pub max_post_size: usize,

    // === Contenido ===
    /// Extensión (sin punto) -> MIME type
    pub mime_types: BTreeMap<String, String>,

    /// Prefijos de MIME type que se comprimen con gzip
    pub compressible_types: Vec<String>,

    /// Extensión de archivos procesados con server-side includes
    pub ssi_extension: String,

    pub server_name: String,

    // === Workers ===
    /// Tamaño del stack de cada thread de transacción (0 = default del sistema)
    pub worker_stack_size_kb: usize,

    pub worker_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        let https = SchemeSettings {
            enabled: false,
            port: 8443,
            ..SchemeSettings::default()
        };

        Self {
            http: SchemeSettings::default(),
            https,
            max_connections: 50,
            connection_timeout_ms: 30_000,
            session_timeout_secs: 1800,
            buffer_size: 8192,
            default_charset: "UTF-8".to_string(),
            max_request_line: 8192,
            max_headers: 100,
            max_post_size: 2 * 1024 * 1024,
            mime_types: default_mime_types(),
            compressible_types: vec![
                "text/".to_string(),
                "application/javascript".to_string(),
                "application/json".to_string(),
                "application/xml".to_string(),
                "image/svg+xml".to_string(),
            ],
            ssi_extension: ".shtml".to_string(),
            server_name: concat!("embedded_httpd/", env!("CARGO_PKG_VERSION")).to_string(),
            worker_stack_size_kb: 0,
            worker_name_prefix: "http-worker".to_string(),
        }
    }
}

fn default_mime_types() -> BTreeMap<String, String> {
    [
        ("html", "text/html"),
        ("htm", "text/html"),
        ("shtml", "text/html"),
        ("txt", "text/plain"),
        ("css", "text/css"),
        ("js", "application/javascript"),
        ("json", "application/json"),
        ("xml", "application/xml"),
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("gif", "image/gif"),
        ("svg", "image/svg+xml"),
        ("ico", "image/x-icon"),
        ("pdf", "application/pdf"),
        ("wasm", "application/wasm"),
    ]
    .into_iter()
    .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
    .collect()
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {}: {:?}", key, value)))
}

impl Config {
    /// Settings del esquema pedido
    pub fn scheme(&self, scheme: Scheme) -> &SchemeSettings {
        match scheme {
            Scheme::Http => &self.http,
            Scheme::Https => &self.https,
        }
    }

    fn scheme_mut(&mut self, scheme: Scheme) -> &mut SchemeSettings {
        match scheme {
            Scheme::Http => &mut self.http,
            Scheme::Https => &mut self.https,
        }
    }

    /// Obtiene la dirección completa para bind (host:port)
    ///
    /// # Ejemplo
    /// ```rust
    /// use embedded_httpd::config::{Config, Scheme};
    ///
    /// let config = Config::default();
    /// assert_eq!(config.address(Scheme::Http), "127.0.0.1:8080");
    /// ```
    pub fn address(&self, scheme: Scheme) -> String {
        let settings = self.scheme(scheme);
        format!("{}:{}", settings.host, settings.port)
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        match self.connection_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// MIME type según la extensión del path
    pub fn mime_type(&self, path: &str) -> Option<&str> {
        let file = path.rsplit('/').next().unwrap_or(path);
        let (_, ext) = file.rsplit_once('.')?;
        self.mime_types
            .get(&ext.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    /// Verifica si un MIME type está en el conjunto comprimible
    pub fn is_compressible(&self, mime: &str) -> bool {
        let mime = mime.trim().to_ascii_lowercase();
        self.compressible_types
            .iter()
            .any(|prefix| !prefix.is_empty() && mime.starts_with(&prefix.to_ascii_lowercase()))
    }

    /// Valida la configuración
    ///
    /// Retorna errores si hay valores inválidos
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be >= 1".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be >= 1".to_string()));
        }
        if self.max_request_line < 16 {
            return Err(Error::Config("max_request_line must be >= 16".to_string()));
        }
        if self.max_headers == 0 {
            return Err(Error::Config("max_headers must be >= 1".to_string()));
        }
        if self.default_charset.trim().is_empty() {
            return Err(Error::Config("default_charset must not be empty".to_string()));
        }
        if !self.ssi_extension.starts_with('.') {
            return Err(Error::Config("ssi_extension must start with '.'".to_string()));
        }
        if self.http.enabled
            && self.https.enabled
            && self.http.port != 0
            && self.http.port == self.https.port
            && self.http.host == self.https.host
        {
            return Err(Error::Config(format!(
                "http and https cannot share {}",
                self.address(Scheme::Http)
            )));
        }
        Ok(())
    }

    /// Aplica un update clave/valor y retorna el nuevo snapshot validado
    ///
    /// Las claves desconocidas se rechazan; el snapshot actual no cambia.
    pub fn apply_update(&self, properties: &BTreeMap<String, String>) -> Result<Config> {
        let mut next = self.clone();
        for (key, value) in properties {
            next.apply_property(key, value)?;
        }
        next.validate()?;
        Ok(next)
    }

    fn apply_property(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some((scheme, field)) = key.split_once('.') {
            let scheme = match scheme {
                "http" => Some(Scheme::Http),
                "https" => Some(Scheme::Https),
                _ => None,
            };
            if let Some(scheme) = scheme {
                let settings = self.scheme_mut(scheme);
                match field {
                    "enabled" => settings.enabled = parse_value(key, value)?,
                    "port" => settings.port = parse_value(key, value)?,
                    "host" => settings.host = value.trim().to_string(),
                    "need_client_auth" => settings.need_client_auth = parse_value(key, value)?,
                    _ => return Err(Error::Config(format!("unknown configuration key: {}", key))),
                }
                return Ok(());
            }
        }

        if let Some(ext) = key.strip_prefix("mime.") {
            let ext = ext.trim_start_matches('.').to_ascii_lowercase();
            if value.trim().is_empty() {
                self.mime_types.remove(&ext);
            } else {
                self.mime_types.insert(ext, value.trim().to_string());
            }
            return Ok(());
        }

        match key {
            "max_connections" => self.max_connections = parse_value(key, value)?,
            "connection_timeout_ms" => self.connection_timeout_ms = parse_value(key, value)?,
            "session_timeout_secs" => self.session_timeout_secs = parse_value(key, value)?,
            "buffer_size" => self.buffer_size = parse_value(key, value)?,
            "default_charset" => self.default_charset = value.trim().to_string(),
            "max_request_line" => self.max_request_line = parse_value(key, value)?,
            "max_headers" => self.max_headers = parse_value(key, value)?,
            "max_post_size" => self.max_post_size = parse_value(key, value)?,
            "compressible_types" => {
                self.compressible_types = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }
            "ssi_extension" => self.ssi_extension = value.trim().to_string(),
            "server_name" => self.server_name = value.trim().to_string(),
            "worker_stack_size_kb" => self.worker_stack_size_kb = parse_value(key, value)?,
            "worker_name_prefix" => self.worker_name_prefix = value.trim().to_string(),
            _ => return Err(Error::Config(format!("unknown configuration key: {}", key))),
        }
        Ok(())
    }

    /// Configuración efectiva aplanada en el mismo formato de los updates
    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        for scheme in [Scheme::Http, Scheme::Https] {
            let s = self.scheme(scheme);
            props.insert(format!("{}.enabled", scheme), s.enabled.to_string());
            props.insert(format!("{}.port", scheme), s.port.to_string());
            props.insert(format!("{}.host", scheme), s.host.clone());
            props.insert(format!("{}.need_client_auth", scheme), s.need_client_auth.to_string());
        }
        props.insert("max_connections".into(), self.max_connections.to_string());
        props.insert("connection_timeout_ms".into(), self.connection_timeout_ms.to_string());
        props.insert("session_timeout_secs".into(), self.session_timeout_secs.to_string());
        props.insert("buffer_size".into(), self.buffer_size.to_string());
        props.insert("default_charset".into(), self.default_charset.clone());
        props.insert("max_request_line".into(), self.max_request_line.to_string());
        props.insert("max_headers".into(), self.max_headers.to_string());
        props.insert("max_post_size".into(), self.max_post_size.to_string());
        props.insert("compressible_types".into(), self.compressible_types.join(","));
        props.insert("ssi_extension".into(), self.ssi_extension.clone());
        props.insert("server_name".into(), self.server_name.clone());
        props.insert("worker_stack_size_kb".into(), self.worker_stack_size_kb.to_string());
        props.insert("worker_name_prefix".into(), self.worker_name_prefix.clone());
        for (ext, mime) in &self.mime_types {
            props.insert(format!("mime.{}", ext), mime.clone());
        }
        props
    }

    /// Loguea un resumen de la configuración
    pub fn log_summary(&self) {
        for scheme in [Scheme::Http, Scheme::Https] {
            let s = self.scheme(scheme);
            info!(
                scheme = %scheme,
                enabled = s.enabled,
                address = %self.address(scheme),
                "listener configuration"
            );
        }
        info!(
            max_connections = self.max_connections,
            connection_timeout_ms = self.connection_timeout_ms,
            session_timeout_secs = self.session_timeout_secs,
            buffer_size = self.buffer_size,
            max_post_size = self.max_post_size,
            "limits"
        );
    }
}

/// Canal de salida hacia el proveedor externo de configuración
pub trait ConfigPublisher: Send + Sync {
    /// Recibe la configuración efectiva (ej: el puerto real tras bind a 0)
    fn publish(&self, properties: &BTreeMap<String, String>);
}

/// Store con el snapshot actual, reemplazado atómicamente en cada update
pub struct ConfigStore {
    current: ArcSwap<Config>,
    publisher: Mutex<Option<Arc<dyn ConfigPublisher>>>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            publisher: Mutex::new(None),
        }
    }

    /// Snapshot actual, sin locks
    pub fn snapshot(&self) -> Arc<Config> {
        self.current.load_full()
    }

    pub fn set_publisher(&self, publisher: Arc<dyn ConfigPublisher>) {
        let mut slot = self.publisher.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(publisher);
    }

    /// Valida y publica un update clave/valor (last-write-wins)
    pub fn update(&self, properties: &BTreeMap<String, String>) -> Result<Arc<Config>> {
        let next = Arc::new(self.snapshot().apply_update(properties)?);
        self.current.store(Arc::clone(&next));
        Ok(next)
    }

    /// Reemplaza el snapshot completo
    pub fn replace(&self, config: Config) -> Result<Arc<Config>> {
        config.validate()?;
        let next = Arc::new(config);
        self.current.store(Arc::clone(&next));
        Ok(next)
    }

    /// Registra el puerto realmente asignado y republica la configuración
    pub fn set_effective_port(&self, scheme: Scheme, port: u16) {
        self.current.rcu(|current| {
            let mut next = Config::clone(current);
            next.scheme_mut(scheme).port = port;
            next
        });
        self.republish();
    }

    /// Envía la configuración efectiva al proveedor, si hay uno
    pub fn republish(&self) {
        let publisher = self
            .publisher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(publisher) = publisher {
            publisher.publish(&self.snapshot().to_properties());
        }
    }

    /// Vista por esquema sobre este store
    pub fn view(self: &Arc<Self>, scheme: Scheme) -> ConfigView {
        ConfigView {
            scheme,
            store: Arc::clone(self),
        }
    }
}

/// Vista de un esquema (http o https) sobre el store compartido
#[derive(Clone)]
pub struct ConfigView {
    scheme: Scheme,
    store: Arc<ConfigStore>,
}

impl ConfigView {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.store.snapshot()
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn enabled(&self) -> bool {
        self.snapshot().scheme(self.scheme).enabled
    }

    pub fn port(&self) -> u16 {
        self.snapshot().scheme(self.scheme).port
    }

    pub fn host(&self) -> String {
        self.snapshot().scheme(self.scheme).host.clone()
    }

    pub fn need_client_auth(&self) -> bool {
        self.scheme == Scheme::Https && self.snapshot().https.need_client_auth
    }

    pub fn address(&self) -> String {
        self.snapshot().address(self.scheme)
    }
}

/// Argumentos de línea de comandos
///
/// Los valores omitidos conservan lo que venga del archivo `--config` o del
/// default de [`Config`].
#[derive(Debug, Clone, Parser)]
#[command(name = "embedded_httpd")]
#[command(about = "Servidor HTTP/1.0-1.1 embebible con pools de transacciones")]
#[command(version)]
pub struct Cli {
    /// Puerto del listener http
    #[arg(short, long, env = "HTTPD_PORT")]
    pub port: Option<u16>,

    /// Host/IP del listener http
    #[arg(long, env = "HTTPD_HOST")]
    pub host: Option<String>,

    /// Habilita o deshabilita el listener http
    #[arg(long = "http-enabled", env = "HTTPD_HTTP_ENABLED")]
    pub http_enabled: Option<bool>,

    /// Puerto del listener https
    #[arg(long = "https-port", env = "HTTPD_HTTPS_PORT")]
    pub https_port: Option<u16>,

    /// Host/IP del listener https
    #[arg(long = "https-host", env = "HTTPD_HTTPS_HOST")]
    pub https_host: Option<String>,

    /// Habilita el listener https (requiere un proveedor TLS)
    #[arg(long = "https-enabled", env = "HTTPD_HTTPS_ENABLED")]
    pub https_enabled: Option<bool>,

    /// Exigir certificado de cliente en https
    #[arg(long = "need-client-auth", env = "HTTPD_NEED_CLIENT_AUTH")]
    pub need_client_auth: Option<bool>,

    /// Máximo de transacciones simultáneas
    #[arg(long = "max-connections", env = "HTTPD_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    /// Timeout de lectura de cada conexión en ms
    #[arg(long = "connection-timeout-ms", env = "HTTPD_CONNECTION_TIMEOUT_MS")]
    pub connection_timeout_ms: Option<u64>,

    /// Timeout de sesión en segundos
    #[arg(long = "session-timeout-secs", env = "HTTPD_SESSION_TIMEOUT_SECS")]
    pub session_timeout_secs: Option<u64>,

    /// Tamaño del buffer de respuesta
    #[arg(long = "buffer-size", env = "HTTPD_BUFFER_SIZE")]
    pub buffer_size: Option<usize>,

    /// Charset por defecto
    #[arg(long, env = "HTTPD_CHARSET")]
    pub charset: Option<String>,

    /// Directorio servido en "/"
    #[arg(long, default_value = "./www", env = "HTTPD_ROOT")]
    pub root: String,

    /// Archivo JSON con claves de configuración
    #[arg(long, env = "HTTPD_CONFIG")]
    pub config: Option<String>,

    /// Nivel de log (error, warn, info, debug, trace)
    #[arg(long = "log-level", default_value = "info", env = "HTTPD_LOG")]
    pub log_level: String,
}

impl Cli {
    /// Combina default, archivo `--config` y flags, en ese orden
    pub fn to_config(&self) -> Result<Config> {
        let mut props = match &self.config {
            Some(path) => load_properties(path)?,
            None => BTreeMap::new(),
        };

        let mut set = |key: &str, value: Option<String>| {
            if let Some(v) = value {
                props.insert(key.to_string(), v);
            }
        };
        set("http.port", self.port.map(|v| v.to_string()));
        set("http.host", self.host.clone());
        set("http.enabled", self.http_enabled.map(|v| v.to_string()));
        set("https.port", self.https_port.map(|v| v.to_string()));
        set("https.host", self.https_host.clone());
        set("https.enabled", self.https_enabled.map(|v| v.to_string()));
        set("https.need_client_auth", self.need_client_auth.map(|v| v.to_string()));
        set("max_connections", self.max_connections.map(|v| v.to_string()));
        set("connection_timeout_ms", self.connection_timeout_ms.map(|v| v.to_string()));
        set("session_timeout_secs", self.session_timeout_secs.map(|v| v.to_string()));
        set("buffer_size", self.buffer_size.map(|v| v.to_string()));
        set("default_charset", self.charset.clone());

        Config::default().apply_update(&props)
    }
}

/// Lee un archivo JSON plano `{"clave": valor}` como mapa de strings
pub fn load_properties(path: &str) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path)?;
    parse_properties(&text)
}

/// Convierte un objeto JSON plano en propiedades (números y booleanos a texto)
pub fn parse_properties(json: &str) -> Result<BTreeMap<String, String>> {
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)
        .map_err(|e| Error::Config(format!("invalid configuration JSON: {}", e)))?;

    raw.into_iter()
        .map(|(key, value)| {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Array(items) => items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect::<Vec<_>>()
                    .join(","),
                other => other.to_string(),
            };
            Ok((key, text))
        })
        .collect()
}
