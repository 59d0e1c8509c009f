//! Tests de integración para el servidor HTTP
//! tests/integration_test.rs
//!
//! Cada test levanta su propio servidor en 127.0.0.1 con puerto efímero y
//! habla HTTP crudo por TCP.

use embedded_httpd::config::{Config, Scheme};
use embedded_httpd::dispatcher::{DirectoryContext, Dispatcher};
use embedded_httpd::http::chunked::decode_chunked;
use embedded_httpd::http::{HeaderMap, Request, Response};
use embedded_httpd::server::{CancelToken, Connection, HttpServer, NetStream, TransactionManager};
use embedded_httpd::session::SessionManager;
use embedded_httpd::Result;
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, BufRead, BufReader, Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;

struct Fixture {
    server: HttpServer,
    addr: SocketAddr,
    root: TempDir,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

fn big_text() -> String {
    (0..2000).map(|i| format!("line {}\n", i)).collect()
}

fn start(max_connections: usize) -> Fixture {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("index.html"), "<h1>home</h1>").unwrap();
    fs::write(root.path().join("big.txt"), big_text()).unwrap();
    fs::write(root.path().join("small.txt"), "small but compressible text, text, text").unwrap();
    fs::write(root.path().join("a.shtml"), "a<!--#include file=\"b.shtml\" -->").unwrap();
    fs::write(root.path().join("b.shtml"), "b<!--#include file=\"a.shtml\" -->").unwrap();
    fs::write(root.path().join("page.shtml"), "[<!--#include file=\"index.html\" -->]").unwrap();

    let context = Arc::new(DirectoryContext::new(root.path()));
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register_resources("/", "", context.clone()).unwrap();

    dispatcher
        .register_handler(
            "/echo",
            |req: &mut Request, res: &mut Response| {
                let body = req.body().to_vec();
                res.set_content_type("application/octet-stream");
                res.write(&body)
            },
            context.clone(),
        )
        .unwrap();
    dispatcher
        .register_handler(
            "/len",
            |req: &mut Request, res: &mut Response| {
                let text = format!("{}:{}", req.body().len(), req.body_string().unwrap_or_default());
                res.print(&text)
            },
            context.clone(),
        )
        .unwrap();
    dispatcher
        .register_handler(
            "/panic",
            |_: &mut Request, _: &mut Response| -> Result<()> { panic!("kaboom") },
            context.clone(),
        )
        .unwrap();
    dispatcher
        .register_handler(
            "/counter",
            |req: &mut Request, res: &mut Response| {
                let session = req
                    .session(true)
                    .ok_or_else(|| embedded_httpd::Error::Handler("sessions unavailable".into()))?;
                let count = session.attribute("count").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
                session.set_attribute("count", serde_json::json!(count));
                res.print(&count.to_string())
            },
            context.clone(),
        )
        .unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (slow_active, slow_peak) = (Arc::clone(&active), Arc::clone(&peak));
    dispatcher
        .register_handler(
            "/slow",
            move |_: &mut Request, res: &mut Response| {
                let now = slow_active.fetch_add(1, Ordering::SeqCst) + 1;
                slow_peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(300));
                slow_active.fetch_sub(1, Ordering::SeqCst);
                res.print("done")
            },
            context,
        )
        .unwrap();

    let mut config = Config::default();
    config.http.host = "127.0.0.1".to_string();
    config.http.port = 0;
    config.max_connections = max_connections;
    config.connection_timeout_ms = 5_000;

    let server = HttpServer::new(config, dispatcher).unwrap();
    server.start().unwrap();
    let addr = server.local_addr(Scheme::Http).unwrap();
    Fixture {
        server,
        addr,
        root,
        active,
        peak,
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

/// Request completo y la response hasta que el servidor cierra
fn exchange(addr: SocketAddr, raw: &[u8]) -> Vec<u8> {
    let mut stream = connect(addr);
    stream.write_all(raw).unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    out
}

fn text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

struct Parsed {
    status_line: String,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Parsed {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

/// Lee una response respetando su framing
fn read_response(reader: &mut BufReader<TcpStream>) -> Parsed {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();
    let mut headers = HeaderMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(": ").unwrap();
        headers.append(name, value);
    }

    let mut body = Vec::new();
    if status_line.contains(" 304 ") {
        // sin body
    } else if headers.get("transfer-encoding") == Some("chunked") {
        let mut trailers = HeaderMap::new();
        body = decode_chunked(reader, usize::MAX, 1024, 100, &mut trailers).unwrap();
    } else if let Some(length) = headers.get("content-length") {
        body.resize(length.parse().unwrap(), 0);
        reader.read_exact(&mut body).unwrap();
    } else {
        reader.read_to_end(&mut body).unwrap();
    }
    Parsed {
        status_line: status_line.trim_end().to_string(),
        headers,
        body,
    }
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

#[test]
fn test_content_length_body_is_exact() {
    let fx = start(10);
    let payload: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
    let mut stream = connect(fx.addr);
    stream
        .write_all(format!("POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n", payload.len()).as_bytes())
        .unwrap();
    stream.write_all(&payload).unwrap();

    let mut reader = BufReader::new(stream);
    let response = read_response(&mut reader);
    assert_eq!(response.status_line, "HTTP/1.1 200 OK");
    assert_eq!(response.body, payload);
}

#[test]
fn test_chunked_request_body() {
    let fx = start(10);
    let out = exchange(
        fx.addr,
        b"POST /len HTTP/1.0\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    );
    let out = text(&out);
    assert!(out.starts_with("HTTP/1.0 200 OK\r\n"), "got: {}", out);
    assert!(out.ends_with("\r\n\r\n9:Wikipedia"));
}

#[test]
fn test_conditional_get() {
    let fx = start(10);
    let modified = fs::metadata(fx.root.path().join("index.html")).unwrap().modified().unwrap();

    let same = httpdate::fmt_http_date(modified);
    let out = text(&exchange(
        fx.addr,
        format!("GET /index.html HTTP/1.0\r\nIf-Modified-Since: {}\r\n\r\n", same).as_bytes(),
    ));
    assert!(out.starts_with("HTTP/1.0 304 Not Modified\r\n"), "got: {}", out);
    assert!(out.ends_with("\r\n\r\n"));

    let earlier = httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(1_000_000));
    let out = text(&exchange(
        fx.addr,
        format!("GET /index.html HTTP/1.0\r\nIf-Modified-Since: {}\r\n\r\n", earlier).as_bytes(),
    ));
    assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(out.contains(&format!("Last-Modified: {}\r\n", same)));
    assert!(out.ends_with("<h1>home</h1>"));
}

#[test]
fn test_keep_alive_reuses_connection() {
    let fx = start(10);
    let stream = connect(fx.addr);
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    writer.write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let first = read_response(&mut reader);
    assert_eq!(first.status_line, "HTTP/1.1 200 OK");
    assert_eq!(first.header("connection"), None);
    assert_eq!(first.body, b"<h1>home</h1>");

    writer
        .write_all(b"POST /len HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
        .unwrap();
    let second = read_response(&mut reader);
    assert_eq!(second.header("connection"), Some("Close"));
    assert_eq!(second.body, b"2:ok");

    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_http10_keep_alive_header() {
    let fx = start(10);
    let stream = connect(fx.addr);
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    writer
        .write_all(b"GET /index.html HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n")
        .unwrap();
    let first = read_response(&mut reader);
    assert_eq!(first.header("connection"), Some("Keep-Alive"));

    writer.write_all(b"GET /index.html HTTP/1.0\r\n\r\n").unwrap();
    let second = read_response(&mut reader);
    assert_eq!(second.header("connection"), Some("Close"));
    assert_eq!(second.body, b"<h1>home</h1>");
}

#[test]
fn test_admission_limits_concurrency() {
    let fx = start(2);
    let addr = fx.addr;
    let clients: Vec<_> = (0..3)
        .map(|_| thread::spawn(move || text(&exchange(addr, b"GET /slow HTTP/1.0\r\n\r\n"))))
        .collect();
    for client in clients {
        let out = client.join().unwrap();
        assert!(out.ends_with("done"), "got: {}", out);
    }
    assert_eq!(fx.peak.load(Ordering::SeqCst), 2);
    assert_eq!(fx.active.load(Ordering::SeqCst), 0);
}

#[test]
fn test_ssi_include_and_recursion() {
    let fx = start(10);
    let out = text(&exchange(fx.addr, b"GET /page.shtml HTTP/1.0\r\n\r\n"));
    assert!(out.ends_with("[<h1>home</h1>]"), "got: {}", out);

    let out = text(&exchange(fx.addr, b"GET /a.shtml HTTP/1.0\r\n\r\n"));
    assert!(out.starts_with("HTTP/1.0 500 Internal Server Error\r\n"), "got: {}", out);
}

#[test]
fn test_trace_echoes_request() {
    let fx = start(10);
    let out = text(&exchange(
        fx.addr,
        b"TRACE /anything HTTP/1.1\r\nHost: x\r\nX-Probe: 42\r\nConnection: close\r\n\r\n",
    ));
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Content-Type: message/http"));
    assert!(out.contains("\r\n\r\nTRACE /anything HTTP/1.1\r\nHost: x\r\nX-Probe: 42\r\n"));
}

#[test]
fn test_gzip_small_and_streamed() {
    let fx = start(10);

    let raw = exchange(fx.addr, b"GET /small.txt HTTP/1.0\r\nAccept-Encoding: gzip\r\n\r\n");
    let split = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    let head = text(&raw[..split]);
    assert!(head.contains("Content-Encoding: gzip"));
    assert!(head.contains("Vary: Accept-Encoding"));
    assert_eq!(gunzip(&raw[split + 4..]), b"small but compressible text, text, text");

    let stream = connect(fx.addr);
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    writer
        .write_all(b"GET /big.txt HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_response(&mut reader);
    assert_eq!(response.header("transfer-encoding"), Some("chunked"));
    assert_eq!(response.header("content-encoding"), Some("gzip"));
    assert_eq!(gunzip(&response.body), big_text().as_bytes());

    let plain = text(&exchange(fx.addr, b"GET /small.txt HTTP/1.0\r\nAccept-Encoding: gzip;q=0, identity\r\n\r\n"));
    assert!(!plain.contains("Content-Encoding"));
    assert!(plain.ends_with("text, text"));
}

#[test]
fn test_head_sends_headers_only() {
    let fx = start(10);
    let out = text(&exchange(fx.addr, b"HEAD /big.txt HTTP/1.0\r\n\r\n"));
    assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(out.contains(&format!("Content-Length: {}\r\n", big_text().len())));
    assert!(out.ends_with("\r\n\r\n"));
}

#[test]
fn test_protocol_errors() {
    let fx = start(10);
    let out = text(&exchange(fx.addr, b"POST /len HTTP/1.1\r\nHost: x\r\n\r\n"));
    assert!(out.starts_with("HTTP/1.1 411 Length Required\r\n"), "got: {}", out);
    assert!(out.contains("Connection: Close\r\n"));

    let out = text(&exchange(fx.addr, b"GET / HTTP/2.0\r\n\r\n"));
    assert!(out.contains(" 505 HTTP Version Not Supported\r\n"), "got: {}", out);

    let out = text(&exchange(fx.addr, b"GET /index.html HTTP/1.1\r\n\r\n"));
    assert!(out.contains(" 400 Bad Request\r\n"), "got: {}", out);

    let out = text(&exchange(fx.addr, b"BREW /pot HTTP/1.0\r\n\r\n"));
    assert!(out.contains(" 501 Not Implemented\r\n"), "got: {}", out);
}

#[test]
fn test_not_found_and_method_not_allowed() {
    let fx = start(10);
    let out = text(&exchange(fx.addr, b"GET /missing.html HTTP/1.0\r\n\r\n"));
    assert!(out.starts_with("HTTP/1.0 404 Not Found\r\n"));

    let out = text(&exchange(fx.addr, b"DELETE /index.html HTTP/1.0\r\n\r\n"));
    assert!(out.starts_with("HTTP/1.0 405 Method Not Allowed\r\n"));
    assert!(out.contains("Allow: GET, HEAD\r\n"));
}

#[test]
fn test_handler_panic_is_contained() {
    let fx = start(10);
    let out = text(&exchange(fx.addr, b"GET /panic HTTP/1.1\r\nHost: x\r\n\r\n"));
    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(!out.contains("kaboom"));

    // El servidor sigue atendiendo
    let out = text(&exchange(fx.addr, b"GET /index.html HTTP/1.0\r\n\r\n"));
    assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
}

#[test]
fn test_session_cookie_round_trip() {
    let fx = start(10);
    let out = text(&exchange(fx.addr, b"GET /counter HTTP/1.0\r\n\r\n"));
    assert!(out.ends_with("\r\n\r\n1"));
    let cookie = out
        .lines()
        .find_map(|l| l.strip_prefix("Set-Cookie: SESSIONID="))
        .and_then(|v| v.split(';').next())
        .unwrap()
        .to_string();

    let out = text(&exchange(
        fx.addr,
        format!("GET /counter HTTP/1.0\r\nCookie: SESSIONID={}\r\n\r\n", cookie).as_bytes(),
    ));
    assert!(out.ends_with("\r\n\r\n2"), "got: {}", out);
    assert!(out.contains(&format!("Set-Cookie: SESSIONID={};", cookie)));

    let out = text(&exchange(
        fx.addr,
        format!("GET /counter;sessionid={} HTTP/1.0\r\n\r\n", cookie).as_bytes(),
    ));
    assert!(out.ends_with("\r\n\r\n3"), "got: {}", out);
    assert_eq!(fx.server.sessions().len(), 1);
}

#[test]
fn test_shutdown_stops_accepting() {
    let fx = start(10);
    let idle = connect(fx.addr);
    thread::sleep(Duration::from_millis(100));

    let started = SystemTime::now();
    fx.server.shutdown(Duration::from_secs(5));
    assert!(started.elapsed().unwrap() < Duration::from_secs(5));
    assert!(TcpStream::connect(fx.addr).is_err());

    let mut buf = Vec::new();
    let mut idle = idle;
    let _ = idle.read_to_end(&mut buf);
    assert!(buf.is_empty());
}

/// Socket en memoria cuya lectura falla al agotarse la entrada
#[derive(Clone)]
struct BrokenSocket {
    input: Arc<Mutex<Cursor<Vec<u8>>>>,
    output: Arc<Mutex<Vec<u8>>>,
}

impl Read for BrokenSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.input.lock().unwrap().read(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::Other, "device failure"));
        }
        Ok(n)
    }
}

impl Write for BrokenSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl NetStream for BrokenSocket {
    fn try_clone_box(&self) -> io::Result<Box<dyn NetStream>> {
        Ok(Box::new(self.clone()))
    }

    fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "in memory"))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "in memory"))
    }
}

#[test]
fn test_unexpected_read_error_gets_500() {
    let manager = TransactionManager::new(
        Arc::new(Dispatcher::new()),
        Arc::new(SessionManager::new(Duration::from_secs(60))),
        2,
        CancelToken::new(),
    );
    let socket = BrokenSocket {
        input: Arc::new(Mutex::new(Cursor::new(b"GET / HTTP/1.1\r\nHost: x\r\n".to_vec()))),
        output: Arc::new(Mutex::new(Vec::new())),
    };
    let permit = manager.admission().acquire_timeout(Duration::from_secs(1)).unwrap();
    manager
        .start_transaction(
            Connection::new(Box::new(socket.clone()), Scheme::Http),
            Arc::new(Config::default()),
            permit,
        )
        .unwrap();

    let deadline = SystemTime::now() + Duration::from_secs(5);
    while manager.active_count() > 0 && SystemTime::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(manager.active_count(), 0);

    let out = String::from_utf8_lossy(&socket.output.lock().unwrap()).into_owned();
    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "got: {}", out);
    assert!(out.contains("Connection: Close\r\n"));
    manager.shutdown(Duration::from_secs(5));
}
