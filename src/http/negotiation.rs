//! # Negociación de Contenido
//! src/http/negotiation.rs
//!
//! Parser de listas con prioridad (`Accept-Language`, `Accept-Encoding`):
//!
//! ```text
//! Accept-Language: da, en-GB;q=0.8, en;q=0.7
//! Accept-Encoding: gzip;q=1.0, identity;q=0.5
//! ```
//!
//! Los elementos se ordenan por `q` descendente. Con igual `q` gana el
//! primero que apareció.

/// Elemento de una lista `Accept-*` con su peso
#[derive(Debug, Clone, PartialEq)]
pub struct QualityItem {
    pub value: String,
    pub q: f32,
}

/// Parsea una lista `valor;q=x, valor2` ordenada por prioridad
pub fn parse_quality_list(header: &str) -> Vec<QualityItem> {
    let mut items: Vec<QualityItem> = Vec::new();

    for part in header.split(',') {
        let mut params = part.split(';');
        let value = params.next().unwrap_or("").trim();
        if value.is_empty() {
            continue;
        }

        let mut q = 1.0f32;
        for param in params {
            if let Some((name, raw)) = param.split_once('=') {
                if name.trim().eq_ignore_ascii_case("q") {
                    q = raw.trim().parse::<f32>().unwrap_or(0.0).clamp(0.0, 1.0);
                }
            }
        }

        // Se inserta antes del primero con q estrictamente menor
        let position = items.iter().position(|it| it.q < q).unwrap_or(items.len());
        items.insert(
            position,
            QualityItem {
                value: value.to_string(),
                q,
            },
        );
    }

    items
}

/// Locale negociado: idioma, país y variante
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locale {
    pub language: String,
    pub country: String,
    pub variant: String,
}

impl Locale {
    pub fn new(language: &str, country: &str, variant: &str) -> Self {
        Self {
            language: language.to_ascii_lowercase(),
            country: country.to_ascii_uppercase(),
            variant: variant.to_string(),
        }
    }

    /// Parsea `en`, `en-US`, `de-CH-1996` (también con `_`)
    pub fn parse(tag: &str) -> Option<Self> {
        let mut parts = tag.split(['-', '_']);
        let language = parts.next().filter(|l| !l.is_empty() && *l != "*")?;
        let country = parts.next().unwrap_or("");
        let variant = parts.collect::<Vec<_>>().join("-");
        Some(Self::new(language, country, &variant))
    }
}

impl Default for Locale {
    fn default() -> Self {
        Locale::new("en", "", "")
    }
}

impl std::fmt::Display for Locale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.language)?;
        if !self.country.is_empty() {
            write!(f, "_{}", self.country)?;
        }
        if !self.variant.is_empty() {
            write!(f, "_{}", self.variant)?;
        }
        Ok(())
    }
}

/// Locales de `Accept-Language` en orden de preferencia (q=0 se descarta)
pub fn parse_accept_language(header: &str) -> Vec<Locale> {
    parse_quality_list(header)
        .into_iter()
        .filter(|item| item.q > 0.0)
        .filter_map(|item| Locale::parse(&item.value))
        .collect()
}

/// Decide si el cliente prefiere gzip frente a identity
///
/// gzip se elige si su q es >= al de identity. identity vale 1.0 salvo que
/// el cliente lo baje explícitamente.
///
/// # Ejemplo
/// ```
/// use embedded_httpd::http::negotiation::prefers_gzip;
/// assert!(prefers_gzip(Some("gzip")));
/// assert!(!prefers_gzip(Some("gzip;q=0,identity;q=1")));
/// assert!(!prefers_gzip(None));
/// ```
pub fn prefers_gzip(accept_encoding: Option<&str>) -> bool {
    let header = match accept_encoding {
        Some(h) if !h.trim().is_empty() => h,
        _ => return false,
    };

    let mut gzip = None;
    let mut identity = None;
    let mut wildcard = None;

    for item in parse_quality_list(header) {
        let slot = match item.value.to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => &mut gzip,
            "identity" => &mut identity,
            "*" => &mut wildcard,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(item.q);
        }
    }

    let gzip_q = gzip.or(wildcard).unwrap_or(0.0);
    let identity_q = identity.unwrap_or(1.0);
    gzip_q > 0.0 && gzip_q >= identity_q
}
