//! # Embedded HTTP Server - Entry Point
//! src/main.rs
//!
//! Sirve un directorio estático (con SSI) usando la configuración de la
//! línea de comandos, variables `HTTPD_*` o un archivo JSON (`--config`).

use clap::Parser;
use embedded_httpd::config::{Cli, Scheme};
use embedded_httpd::dispatcher::{DirectoryContext, Dispatcher};
use embedded_httpd::server::HttpServer;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_names(true)
        .init();

    if let Err(e) = run(&cli) {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> embedded_httpd::Result<()> {
    let config = cli.to_config()?;

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register_resources("/", "", Arc::new(DirectoryContext::new(&cli.root)))?;
    info!(root = %cli.root, "serving static files");

    let server = HttpServer::new(config, dispatcher)?;
    server.start()?;
    if let Some(addr) = server.local_addr(Scheme::Http) {
        info!(%addr, "ready");
    }

    // Los listeners corren en sus propios threads
    loop {
        thread::park();
    }
}
