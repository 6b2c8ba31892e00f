//! smartwire CLI Client
//!
//! Command-line interface for calling verbs on a smart server.

use clap::{Parser, Subcommand};
use smartwire::{SmartClient, SmartClientMedium, TcpChannel, Value};
use tracing_subscriber::{fmt, EnvFilter};

/// smartwire CLI
#[derive(Parser, Debug)]
#[command(name = "smartwire-cli")]
#[command(about = "CLI for Bazaar smart protocol servers")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:4155")]
    server: String,

    /// Debug flags to enable (hpss, hpssdetail, noretry)
    #[arg(short = 'D', long = "debug-flag")]
    debug_flags: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask the server which protocol it speaks
    Hello,

    /// Call a verb
    Call {
        /// The verb to call
        verb: String,

        /// Arguments to the verb
        args: Vec<String>,

        /// Request body to send
        #[arg(short, long)]
        body: Option<String>,

        /// Read and print a response body
        #[arg(short, long)]
        expect_body: bool,
    },
}

fn format_value(value: &Value) -> String {
    match value.as_bytes() {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => format!("{:?}", value),
    }
}

fn print_tuple(result: &[Value]) {
    let parts: Vec<String> = result.iter().map(format_value).collect();
    println!("({})", parts.join(", "));
}

fn run(args: Args) -> smartwire::Result<()> {
    let medium = SmartClientMedium::new(TcpChannel::new(&args.server), format!("bzr://{}/", args.server));
    let client = SmartClient::new(medium);

    match args.command {
        Commands::Hello => {
            let result = client.call(b"hello", &[])?;
            print_tuple(&result);
            if let Some(version) = client.medium().protocol_version() {
                println!("protocol version {}", version);
            }
        }
        Commands::Call {
            verb,
            args: verb_args,
            body,
            expect_body,
        } => {
            let verb_args: Vec<&[u8]> = verb_args.iter().map(|a| a.as_bytes()).collect();
            let (result, mut handler) = match body {
                Some(body) => client.call_with_body_bytes_expecting_body(
                    verb.as_bytes(),
                    &verb_args,
                    body.as_bytes(),
                )?,
                None => client.call_expecting_body(verb.as_bytes(), &verb_args)?,
            };
            print_tuple(&result);
            if expect_body {
                let body = handler.read_body_bytes(None)?;
                println!("{}", String::from_utf8_lossy(&body));
            } else {
                handler.cancel_read_body()?;
            }
        }
    }
    Ok(())
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    for flag in &args.debug_flags {
        smartwire::debug::enable(flag);
    }

    if let Err(e) = run(args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
