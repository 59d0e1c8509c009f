//! # Cookies
//! src/http/cookie.rs
//!
//! Parsing del header `Cookie` (incluida la sintaxis con `$Version`,
//! `$Path` y `$Domain`) y serialización de `Set-Cookie`.
//!
//! ```text
//! Cookie: $Version="1"; Customer="WILE_E_COYOTE"; $Path="/acme"
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Cookie HTTP
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub comment: Option<String>,
    /// 0 = Netscape, 1 = RFC 2109
    pub version: u8,
    /// `None` = cookie de sesión del navegador, `Some(0)` = borrar
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    /// Valor del header `Set-Cookie`
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, quote_if_needed(&self.value));

        if self.version > 0 {
            out.push_str(&format!("; Version={}", self.version));
            if let Some(comment) = &self.comment {
                out.push_str(&format!("; Comment={}", quote_if_needed(comment)));
            }
        }
        if let Some(domain) = &self.domain {
            out.push_str(&format!("; Domain={}", domain));
        }
        if let Some(path) = &self.path {
            out.push_str(&format!("; Path={}", path));
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={}", max_age.max(0)));
            let expires = if max_age <= 0 {
                UNIX_EPOCH
            } else {
                SystemTime::now() + Duration::from_secs(max_age as u64)
            };
            out.push_str(&format!("; Expires={}", httpdate::fmt_http_date(expires)));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }
}

fn quote_if_needed(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| matches!(c, ' ' | '\t' | ';' | ',' | '"' | '\\'));
    if needs_quotes {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Inverso de `quote`: saca las comillas y los escapes `\`
fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() < 2 || !value.starts_with('"') || !value.ends_with('"') {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() - 2);
    let mut chars = value[1..value.len() - 1].chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Separa en `;` o `,` que no estén dentro de un valor entre comillas
fn split_tokens(header: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;

    for (i, c) in header.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' | ',' if !quoted => {
                tokens.push(&header[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    tokens.push(&header[start..]);
    tokens
}

/// Parsea los valores de uno o más headers `Cookie`
///
/// Los atributos `$Path`/`$Domain` decoran la cookie real anterior;
/// `$Version` aplica a las cookies que le siguen.
pub fn parse_cookies<'a>(headers: impl IntoIterator<Item = &'a str>) -> Vec<Cookie> {
    let mut cookies: Vec<Cookie> = Vec::new();

    for header in headers {
        let mut version = 0u8;
        for token in split_tokens(header) {
            let (name, value) = match token.split_once('=') {
                Some((n, v)) => (n.trim(), unquote(v)),
                None => (token.trim(), String::new()),
            };
            if name.is_empty() {
                continue;
            }

            if let Some(attribute) = name.strip_prefix('$') {
                match attribute.to_ascii_lowercase().as_str() {
                    "version" => version = value.parse().unwrap_or(0),
                    "path" => {
                        if let Some(last) = cookies.last_mut() {
                            last.path = Some(value);
                        }
                    }
                    "domain" => {
                        if let Some(last) = cookies.last_mut() {
                            last.domain = Some(value);
                        }
                    }
                    _ => {}
                }
                continue;
            }

            let mut cookie = Cookie::new(name, &value);
            cookie.version = version;
            cookies.push(cookie);
        }
    }

    cookies
}
