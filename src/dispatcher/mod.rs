//! # Dispatcher
//! src/dispatcher/mod.rs
//!
//! Mapea el path de un request al handler registrado con el prefijo más
//! largo que coincida (respetando límites de segmento).
//!
//! ## Arquitectura
//!
//! ```text
//! Request → Dispatcher → handle_security → Handler | recurso estático (+SSI) → Response
//! ```
//!
//! Los registros asocian un prefijo a un [`Handler`] o a un árbol de recursos,
//! junto con un [`HttpContext`] que autoriza el request y resuelve recursos.
//! Si ningún prefijo coincide se responde 404.
//!
//! Los includes y forwards internos se apilan por thread; repetir el mismo
//! URI dentro de la misma pila es un [`Error::RecursiveInclude`].

pub mod resource;
pub mod ssi;

pub use resource::{DirectoryContext, Resource};

use crate::error::{Error, Result};
use crate::http::{Method, Request, Response, StatusCode};
use std::cell::RefCell;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::{debug, info};

/// Componente que atiende requests bajo un prefijo
///
/// Cualquier closure `Fn(&mut Request, &mut Response) -> Result<()>` sirve.
///
/// # Ejemplo
/// ```
/// use embedded_httpd::dispatcher::{Dispatcher, DirectoryContext};
/// use embedded_httpd::http::{Request, Response};
/// use std::sync::Arc;
///
/// let dispatcher = Dispatcher::new();
/// let context = Arc::new(DirectoryContext::new("./www"));
/// dispatcher
///     .register_handler(
///         "/hello",
///         |_req: &mut Request, res: &mut Response| res.print("hello"),
///         context,
///     )
///     .unwrap();
/// ```
pub trait Handler: Send + Sync {
    fn service(&self, request: &mut Request, response: &mut Response) -> Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&mut Request, &mut Response) -> Result<()> + Send + Sync,
{
    fn service(&self, request: &mut Request, response: &mut Response) -> Result<()> {
        self(request, response)
    }
}

/// Hooks de un registro: autorización y resolución de recursos
pub trait HttpContext: Send + Sync {
    /// Se invoca antes del handler; `false` rechaza el request
    ///
    /// Si el hook rechaza sin escribir una respuesta, se envía un 401.
    fn handle_security(&self, _request: &mut Request, _response: &mut Response) -> Result<bool> {
        Ok(true)
    }

    /// Resuelve un nombre de recurso (`/css/site.css`)
    fn resource(&self, name: &str) -> Option<Resource>;

    /// MIME type propio del contexto; `None` usa la tabla configurada
    fn mime_type(&self, _name: &str) -> Option<String> {
        None
    }
}

#[derive(Clone)]
enum Target {
    Handler(Arc<dyn Handler>),
    /// Prefijo interno de los nombres de recurso
    Resources(String),
}

/// Un registro del dispatcher
#[derive(Clone)]
pub(crate) struct Route {
    prefix: String,
    target: Target,
    context: Arc<dyn HttpContext>,
    registered_at: SystemTime,
}

impl Route {
    fn matches(&self, path: &str) -> bool {
        self.prefix == "/"
            || path == self.prefix
            || (path.starts_with(&self.prefix) && path.as_bytes()[self.prefix.len()] == b'/')
    }

    /// Resto del path después del prefijo
    fn path_info<'a>(&self, path: &'a str) -> &'a str {
        if self.prefix == "/" {
            path
        } else {
            &path[self.prefix.len()..]
        }
    }

    pub(crate) fn context(&self) -> &dyn HttpContext {
        self.context.as_ref()
    }

    pub(crate) fn registered_at(&self) -> SystemTime {
        self.registered_at
    }
}

thread_local! {
    /// URIs en proceso de dispatch/include en este worker
    static DISPATCH_STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Entrada en la pila de dispatch del thread; sale en `Drop`
pub(crate) struct DispatchGuard;

impl DispatchGuard {
    pub(crate) fn enter(key: &str) -> Result<Self> {
        DISPATCH_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.iter().any(|k| k == key) {
                return Err(Error::RecursiveInclude(key.to_string()));
            }
            stack.push(key.to_string());
            Ok(DispatchGuard)
        })
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCH_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Registro de handlers y recursos
pub struct Dispatcher {
    routes: RwLock<Vec<Route>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Registra un handler bajo `prefix`
    pub fn register_handler(
        &self,
        prefix: &str,
        handler: impl Handler + 'static,
        context: Arc<dyn HttpContext>,
    ) -> Result<()> {
        self.register(prefix, Target::Handler(Arc::new(handler)), context)
    }

    /// Publica recursos de `context` bajo `alias`
    ///
    /// `/alias/x/y` se resuelve como el recurso `name + /x/y`.
    pub fn register_resources(
        &self,
        alias: &str,
        name: &str,
        context: Arc<dyn HttpContext>,
    ) -> Result<()> {
        let name = name.trim_end_matches('/').to_string();
        self.register(alias, Target::Resources(name), context)
    }

    fn register(&self, prefix: &str, target: Target, context: Arc<dyn HttpContext>) -> Result<()> {
        if !prefix.starts_with('/') || (prefix.len() > 1 && prefix.ends_with('/')) {
            return Err(Error::Config(format!("invalid alias: {:?}", prefix)));
        }
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if routes.iter().any(|r| r.prefix == prefix) {
            return Err(Error::IllegalState(format!("alias already registered: {}", prefix)));
        }
        routes.push(Route {
            prefix: prefix.to_string(),
            target,
            context,
            registered_at: SystemTime::now(),
        });
        info!(alias = prefix, "registered");
        Ok(())
    }

    /// Elimina el registro de `prefix`; retorna false si no existía
    pub fn unregister(&self, prefix: &str) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let before = routes.len();
        routes.retain(|r| r.prefix != prefix);
        let removed = routes.len() != before;
        if removed {
            info!(alias = prefix, "unregistered");
        }
        removed
    }

    /// Prefijos registrados
    pub fn aliases(&self) -> Vec<String> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.prefix.clone())
            .collect()
    }

    /// Registro con el prefijo más largo que coincide con `path`
    fn lookup(&self, path: &str) -> Option<Route> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.matches(path))
            .max_by_key(|r| r.prefix.len())
            .cloned()
    }

    /// Atiende un request completo
    pub fn dispatch(&self, request: &mut Request, response: &mut Response) -> Result<()> {
        if request.method() == Method::TRACE {
            return trace(request, response);
        }
        let path = request.path().to_string();
        self.serve(&path, request, response)
    }

    /// Inserta la salida de `uri` en la respuesta actual
    pub fn include(&self, uri: &str, request: &mut Request, response: &mut Response) -> Result<()> {
        let prefix = request.route_prefix().to_string();
        let path_info = request.path_info().map(str::to_string);
        let result = self.serve(strip_query(uri), request, response);
        request.set_route(&prefix, path_info);
        result
    }

    /// Delega el request completo en `uri`, descartando lo ya escrito
    pub fn forward(&self, uri: &str, request: &mut Request, response: &mut Response) -> Result<()> {
        if response.is_committed() {
            return Err(Error::IllegalState("cannot forward after commit".to_string()));
        }
        response.reset_buffer()?;
        self.serve(strip_query(uri), request, response)
    }

    fn serve(&self, uri: &str, request: &mut Request, response: &mut Response) -> Result<()> {
        let _guard = DispatchGuard::enter(uri)?;

        let route = match self.lookup(uri) {
            Some(route) => route,
            None => {
                debug!(uri, "no handler");
                return response.send_error(StatusCode::NOT_FOUND, &format!("No handler for {}", uri));
            }
        };

        let path_info = route.path_info(uri);
        request.set_route(
            &route.prefix,
            (!path_info.is_empty()).then(|| path_info.to_string()),
        );

        if !route.context.handle_security(request, response)? {
            let untouched = !response.is_committed()
                && response.bytes_written() == 0
                && response.status() == StatusCode::OK;
            if untouched {
                response.send_error(StatusCode::UNAUTHORIZED, "")?;
            }
            return Ok(());
        }

        match &route.target {
            Target::Handler(handler) => handler.service(request, response),
            Target::Resources(base) => {
                let name = format!("{}{}", base, path_info);
                resource::serve(&route, &name, request, response)
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_query(uri: &str) -> &str {
    uri.split('?').next().unwrap_or(uri)
}

/// TRACE: devuelve el request tal como llegó
fn trace(request: &Request, response: &mut Response) -> Result<()> {
    let mut echo = String::with_capacity(256);
    echo.push_str(request.request_line());
    echo.push_str("\r\n");
    for line in request.raw_headers() {
        echo.push_str(line);
        echo.push_str("\r\n");
    }
    response.set_content_type("message/http");
    response.write(echo.as_bytes())
}
