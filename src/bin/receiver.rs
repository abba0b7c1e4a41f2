//! Command-line receiver: writes an incoming transfer to a file (or
//! stdout).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use tokio::io::AsyncWrite;
use tokio::net::UdpSocket;

use trtp::net;
use trtp::receiver::ReceiverEngine;
use trtp::MAX_WINDOW;

/// Receive a file reliably over UDP.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Write the received data to FILE instead of stdout.
    #[arg(short, long, value_name = "FILE")]
    filename: Option<PathBuf>,

    /// Cap on the advertised receive window (at most 31).
    #[arg(short = 'b', long = "buf", value_name = "N", default_value_t = MAX_WINDOW as u32)]
    buf: u32,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Hostname or IPv6 address to bind.
    #[arg(default_value = "::")]
    hostname: String,

    /// UDP port to bind.
    #[arg(default_value_t = 1341)]
    port: u16,
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    // Logs go to stderr; stdout may carry the received data.
    let _ = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );
}

async fn run<W: AsyncWrite + Unpin>(socket: UdpSocket, output: W, max_window: u8) -> Result<()> {
    ReceiverEngine::new(socket, output, max_window)
        .run()
        .await
        .context("transmission aborted")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);
    let max_window = args.buf.min(u32::from(MAX_WINDOW)) as u8;

    let socket = net::bind(&args.hostname, args.port).await?;
    match &args.filename {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("cannot write to {}", path.display()))?;
            log::info!("writing the received data to {}", path.display());
            run(socket, file, max_window).await
        }
        None => run(socket, tokio::io::stdout(), max_window).await,
    }
}
