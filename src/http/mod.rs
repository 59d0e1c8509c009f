//! # Módulo HTTP
//! src/http/mod.rs
//!
//! Protocolo HTTP/1.0 y HTTP/1.1 implementado sobre streams de bytes, sin
//! librerías de alto nivel. Incluye:
//!
//! - Parsing de requests (continuaciones, headers duplicados, chunked)
//! - Escritura de responses (Content-Length, chunked, gzip, commit diferido)
//! - Status codes, cookies y negociación de `Accept-*`
//!
//! ### Formato de Request
//!
//! ```text
//! GET /path?query=value HTTP/1.1\r\n
//! Host: localhost\r\n
//! Header-Name: Header-Value\r\n
//! \r\n
//! ```
//!
//! ### Formato de Response
//!
//! ```text
//! HTTP/1.1 200 OK\r\n
//! Content-Type: application/json\r\n
//! Content-Length: 13\r\n
//! \r\n
//! {"ok": true}
//! ```

pub mod chunked; // Transfer-Encoding: chunked
pub mod cookie; // Cookie / Set-Cookie
pub mod headers; // Multimapa case-insensitive
pub mod negotiation; // Accept-Language / Accept-Encoding
pub mod request; // Parsing de HTTP requests
pub mod response; // Escritura de HTTP responses
pub mod status; // Códigos de estado HTTP

// Re-exportamos los tipos principales para facilitar su uso
// Esto permite usar `http::Request` en vez de `http::request::Request`
pub use cookie::Cookie;
pub use headers::HeaderMap;
pub use negotiation::Locale;
pub use request::{Method, Request, Version};
pub use response::{ExchangeInfo, Response};
pub use status::StatusCode;
