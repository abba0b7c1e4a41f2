//! Command-line sender: streams a file (or stdin) to a receiver.

use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use tokio::io::AsyncRead;
use tokio::net::UdpSocket;

use trtp::buffer::PacketBuffer;
use trtp::net;
use trtp::sender::SenderEngine;

/// Send a file reliably over UDP.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Send the content of FILE instead of stdin.
    #[arg(short, long, value_name = "FILE")]
    filename: Option<PathBuf>,

    /// Send buffer capacity in packets; must be a power of two.
    #[arg(short = 'b', long = "buf", value_name = "N", default_value_t = 32)]
    buf: u32,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Receiver hostname or IPv6 address.
    #[arg(default_value = "::1")]
    hostname: String,

    /// Receiver UDP port.
    #[arg(default_value_t = 1341)]
    port: u16,
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    // Logs go to stderr; stdout is reserved for transfer data.
    let _ = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );
}

async fn run<R: AsyncRead + Unpin>(socket: UdpSocket, input: R, buf: PacketBuffer) -> Result<()> {
    SenderEngine::new(socket, input, buf)
        .run()
        .await
        .context("transmission aborted")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);
    ensure!(
        args.buf.is_power_of_two(),
        "buffer capacity {} is not a power of 2",
        args.buf
    );

    let socket = net::connect(&args.hostname, args.port).await?;
    let buf = PacketBuffer::new(args.buf);
    match &args.filename {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("cannot read the content of {}", path.display()))?;
            log::info!("sending the content of {}", path.display());
            run(socket, file, buf).await
        }
        None => run(socket, tokio::io::stdin(), buf).await,
    }
}
