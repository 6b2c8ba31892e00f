//! smartwire Server Binary
//!
//! Serves the smart protocol over TCP with a few demonstration verbs.

use bytes::Bytes;
use clap::Parser;
use smartwire::network::Server;
use smartwire::{Config, Result, SmartServerRequest, SmartServerResponse, Value, VerbRegistry};
use tracing_subscriber::{fmt, EnvFilter};

/// smartwire Server
#[derive(Parser, Debug)]
#[command(name = "smartwire-server")]
#[command(about = "Bazaar smart protocol server")]
#[command(version)]
struct Args {
    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:4155")]
    listen: String,

    /// Worker threads serving connections
    #[arg(short, long, default_value = "16")]
    workers: usize,

    /// Read timeout in milliseconds (0 disables)
    #[arg(long, default_value = "300000")]
    read_timeout_ms: u64,

    /// Write timeout in milliseconds (0 disables)
    #[arg(long, default_value = "300000")]
    write_timeout_ms: u64,

    /// Debug flags to enable (hpss, hpssdetail)
    #[arg(short = 'D', long = "debug-flag")]
    debug_flags: Vec<String>,
}

/// `echo arg...` answers `("ok", arg...)`.
struct EchoRequest;

impl SmartServerRequest for EchoRequest {
    fn execute(&mut self, args: &[Value]) -> Result<Option<SmartServerResponse>> {
        let mut response = vec![Value::from("ok")];
        response.extend_from_slice(args);
        Ok(Some(SmartServerResponse::success(response)))
    }
}

/// `echo_body` takes a body and sends it straight back.
struct EchoBodyRequest;

impl SmartServerRequest for EchoBodyRequest {
    fn execute(&mut self, _args: &[Value]) -> Result<Option<SmartServerResponse>> {
        Ok(None)
    }

    fn do_body(&mut self, body: Bytes) -> Result<Option<SmartServerResponse>> {
        Ok(Some(
            SmartServerResponse::success(vec![Value::from("ok")]).with_body(body),
        ))
    }
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,smartwire=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("smartwire server v{}", smartwire::VERSION);
    tracing::info!("Listen address: {}", args.listen);

    let mut builder = Config::builder()
        .listen_addr(&args.listen)
        .workers(args.workers)
        .read_timeout_ms(args.read_timeout_ms)
        .write_timeout_ms(args.write_timeout_ms);
    for flag in &args.debug_flags {
        builder = builder.debug_flag(flag);
    }
    let config = builder.build();
    config.apply_debug_flags();

    let mut registry = VerbRegistry::with_defaults();
    registry.register(b"echo", || Box::new(EchoRequest));
    registry.register(b"echo_body", || Box::new(EchoBodyRequest));
    tracing::info!("Serving {} verbs", registry.len());

    let server = match Server::bind(config, registry) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Server stopped");
}
