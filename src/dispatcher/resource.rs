//! # Recursos Estáticos
//! src/dispatcher/resource.rs
//!
//! Servido de archivos con GET condicional (`If-Modified-Since`, resolución
//! de un segundo) y delegación a SSI para la extensión configurada.

use super::{ssi, DispatchGuard, HttpContext, Route};
use crate::error::Result;
use crate::http::{Method, Request, Response, StatusCode};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// MIME type cuando ni el contexto ni la tabla conocen la extensión
const FALLBACK_MIME: &str = "application/octet-stream";

enum Source {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

/// Recurso resuelto por un [`HttpContext`]
pub struct Resource {
    name: String,
    last_modified: Option<SystemTime>,
    length: u64,
    source: Source,
}

impl Resource {
    /// Recurso respaldado por un archivo regular
    pub fn from_file(name: &str, path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let meta = fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        }
        Ok(Self {
            name: name.to_string(),
            last_modified: meta.modified().ok(),
            length: meta.len(),
            source: Source::File(path),
        })
    }

    /// Recurso en memoria (ej: embebido con `include_bytes!`)
    pub fn from_bytes(name: &str, bytes: impl Into<Arc<[u8]>>, last_modified: Option<SystemTime>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.to_string(),
            last_modified,
            length: bytes.len() as u64,
            source: Source::Memory(bytes),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.source {
            Source::File(path) => Ok(Box::new(File::open(path)?)),
            Source::Memory(bytes) => Ok(Box::new(io::Cursor::new(Arc::clone(bytes)))),
        }
    }

    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.length as usize);
        self.open()?.read_to_end(&mut data)?;
        Ok(data)
    }
}

/// Contexto por defecto: recursos bajo un directorio del filesystem
#[derive(Debug, Clone)]
pub struct DirectoryContext {
    root: PathBuf,
}

impl DirectoryContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Traduce un nombre a un path dentro de `root`
    ///
    /// `..` se resuelve contra los componentes ya vistos; si sale de la
    /// raíz el nombre se rechaza.
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let mut path = self.root.clone();
        let mut depth = 0usize;
        for component in Path::new(name.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir if depth > 0 => {
                    path.pop();
                    depth -= 1;
                }
                _ => return None,
            }
        }
        Some(path)
    }
}

impl HttpContext for DirectoryContext {
    fn resource(&self, name: &str) -> Option<Resource> {
        let path = self.resolve(name)?;
        Resource::from_file(name, path).ok()
    }
}

/// Trunca a segundos, la resolución de las fechas HTTP
fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Clave de un recurso en la pila de dispatch del thread
pub(crate) fn resource_key(name: &str) -> String {
    format!("resource:{}", name)
}

/// Sirve el recurso `name` del contexto del registro
pub(crate) fn serve(route: &Route, name: &str, request: &mut Request, response: &mut Response) -> Result<()> {
    if !matches!(request.method(), Method::GET | Method::HEAD) {
        response.set_header("Allow", "GET, HEAD");
        return response.send_error(
            StatusCode::METHOD_NOT_ALLOWED,
            &format!("{} not allowed on static resources", request.method().as_str()),
        );
    }

    let resource = match route.context().resource(name) {
        Some(resource) => resource,
        None => {
            debug!(resource = name, "resource not found");
            return response.send_error(
                StatusCode::NOT_FOUND,
                &format!("{} not found", request.path()),
            );
        }
    };
    let _guard = DispatchGuard::enter(&resource_key(name))?;

    let last_modified =
        truncate_to_seconds(resource.last_modified().unwrap_or(route.registered_at()));

    let since = request
        .header("if-modified-since")
        .and_then(|v| httpdate::parse_http_date(v.trim()).ok());
    if let Some(since) = since {
        if last_modified <= since {
            response.set_status(StatusCode::NOT_MODIFIED);
            response.set_date_header("Last-Modified", last_modified);
            return Ok(());
        }
    }

    let config = Arc::clone(response.config());
    let mime = route
        .context()
        .mime_type(name)
        .or_else(|| config.mime_type(name).map(str::to_string))
        .unwrap_or_else(|| FALLBACK_MIME.to_string());
    response.set_content_type(&mime);
    response.set_date_header("Last-Modified", last_modified);

    if name.ends_with(&config.ssi_extension) {
        return ssi::render(&resource, route.context(), response);
    }

    response.set_content_length(resource.len());
    let mut reader = resource.open()?;
    let mut chunk = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        response.write(&chunk[..n])?;
    }
    Ok(())
}
