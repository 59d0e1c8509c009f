//! # Embedded HTTP Server
//! src/lib.rs
//!
//! Servidor HTTP/1.0-1.1 embebible: un thread por conexión, pools de
//! objetos para request/response/transacción, control de admisión y
//! configuración que se puede cambiar en caliente.
//!
//! ## Arquitectura
//!
//! El servidor está dividido en módulos especializados:
//! - `config`: CLI, snapshot de configuración y vistas por esquema
//! - `pool`: pools tipados de objetos reutilizables
//! - `http`: parsing de requests y escritura de responses (chunked, gzip, cookies)
//! - `session`: sesiones por cookie o por URL
//! - `dispatcher`: ruteo por prefijo, recursos estáticos, SSI y TRACE
//! - `server`: listeners, manager de transacciones y la máquina de estados
//!   de cada conexión
//!
//! ## Ejemplo de uso
//!
//! ```no_run
//! use embedded_httpd::config::Config;
//! use embedded_httpd::dispatcher::Dispatcher;
//! use embedded_httpd::http::{Request, Response};
//! use embedded_httpd::dispatcher::DirectoryContext;
//! use embedded_httpd::server::HttpServer;
//! use std::sync::Arc;
//!
//! let dispatcher = Arc::new(Dispatcher::new());
//! dispatcher
//!     .register_handler(
//!         "/hello",
//!         |_req: &mut Request, res: &mut Response| res.print("hello"),
//!         Arc::new(DirectoryContext::new("./www")),
//!     )
//!     .expect("alias válido");
//!
//! let server = HttpServer::new(Config::default(), dispatcher).expect("config válida");
//! server.start().expect("Error al iniciar servidor");
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod pool;
pub mod server;
pub mod session;

pub use config::{Config, ConfigStore, Scheme};
pub use dispatcher::{Dispatcher, Handler, HttpContext};
pub use error::{Error, Result};
pub use http::{Request, Response, StatusCode};
pub use server::HttpServer;
