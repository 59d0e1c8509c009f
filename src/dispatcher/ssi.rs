//! # Server-Side Includes
//! src/dispatcher/ssi.rs
//!
//! Procesa `<!--#include file="..." -->` en documentos con la extensión SSI.
//! El archivo se resuelve relativo al directorio del documento que lo
//! incluye; si también es SSI se expande recursivamente.
//!
//! Cualquier otra directiva, o un include mal formado o inexistente, se
//! reemplaza por [`ERROR_MARKER`] sin abortar la respuesta. Un include
//! recursivo sí aborta con [`Error::RecursiveInclude`].

use super::resource::resource_key;
use super::{DispatchGuard, HttpContext, Resource};
use crate::error::{Error, Result};
use crate::http::Response;
use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

/// Texto insertado en lugar de una directiva que falló
pub const ERROR_MARKER: &str = "[an error occurred while processing this directive]";

const DIRECTIVE_PATTERN: &str = r"(?s)<!--#(\w+)(.*?)-->";
const ATTRIBUTE_PATTERN: &str = r#"(\w+)\s*=\s*"([^"]*)""#;

struct Patterns {
    directive: Regex,
    attribute: Regex,
}

static PATTERNS: OnceLock<std::result::Result<Patterns, regex::Error>> = OnceLock::new();

fn patterns() -> Result<&'static Patterns> {
    PATTERNS
        .get_or_init(|| {
            Ok(Patterns {
                directive: Regex::new(DIRECTIVE_PATTERN)?,
                attribute: Regex::new(ATTRIBUTE_PATTERN)?,
            })
        })
        .as_ref()
        .map_err(|e| Error::Handler(format!("invalid SSI pattern: {}", e)))
}

/// Expande un documento SSI completo en la respuesta
pub(crate) fn render(resource: &Resource, context: &dyn HttpContext, response: &mut Response) -> Result<()> {
    let text = String::from_utf8_lossy(&resource.read_all()?).into_owned();
    expand(&text, resource.name(), context, response)
}

fn expand(text: &str, name: &str, context: &dyn HttpContext, response: &mut Response) -> Result<()> {
    let patterns = patterns()?;
    let mut last = 0;

    for caps in patterns.directive.captures_iter(text) {
        let (whole, directive, args) = match (caps.get(0), caps.get(1), caps.get(2)) {
            (Some(w), Some(d), Some(a)) => (w, d.as_str(), a.as_str()),
            _ => continue,
        };
        response.write(text[last..whole.start()].as_bytes())?;
        last = whole.end();

        match include_target(patterns, directive, args) {
            Some(file) => include(&file, name, context, response)?,
            None => {
                warn!(document = name, directive, "unsupported SSI directive");
                response.write(ERROR_MARKER.as_bytes())?;
            }
        }
    }

    response.write(text[last..].as_bytes())
}

/// `file` de un `include` con exactamente ese atributo
fn include_target(patterns: &Patterns, directive: &str, args: &str) -> Option<String> {
    if directive != "include" {
        return None;
    }
    let attrs: Vec<(String, String)> = patterns
        .attribute
        .captures_iter(args)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();
    match attrs.as_slice() {
        [(key, value)] if key == "file" && !value.is_empty() => Some(value.clone()),
        _ => None,
    }
}

fn include(file: &str, including: &str, context: &dyn HttpContext, response: &mut Response) -> Result<()> {
    let resource = resolve_relative(including, file)
        .and_then(|target| context.resource(&target).map(|resource| (target, resource)));
    let (target, resource) = match resource {
        Some(found) => found,
        None => {
            warn!(document = including, file, "SSI include not found");
            return response.write(ERROR_MARKER.as_bytes());
        }
    };

    let _guard = DispatchGuard::enter(&resource_key(&target))?;
    let content = match resource.read_all() {
        Ok(content) => content,
        Err(e) => {
            warn!(document = including, file, error = %e, "SSI include unreadable");
            return response.write(ERROR_MARKER.as_bytes());
        }
    };

    let ssi_extension = response.config().ssi_extension.clone();
    if target.ends_with(&ssi_extension) {
        expand(&String::from_utf8_lossy(&content), &target, context, response)
    } else {
        response.write(&content)
    }
}

/// `file` relativo al directorio de `including` (o a la raíz si empieza en `/`)
///
/// Normaliza `.` y `..`; `None` si el resultado sale de la raíz.
fn resolve_relative(including: &str, file: &str) -> Option<String> {
    let joined = if file.starts_with('/') {
        file.to_string()
    } else {
        let dir = including.rfind('/').map(|i| &including[..i]).unwrap_or("");
        format!("{}/{}", dir, file)
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            part => segments.push(part),
        }
    }
    Some(format!("/{}", segments.join("/")))
}
