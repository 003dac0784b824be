use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use relay::{
    Backoff, IngestClient, IngestConfig, PublishPolicy, RelayConfig, RelayServer, ServerConfig,
};
use relay::client::RtspConnector;

#[derive(Parser)]
#[command(
    name = "rtsp-relay",
    version,
    about = "RTSP relay server and H.264 ingest client"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept one publisher and relay its stream to every subscriber
    Relay {
        /// Listen port
        #[arg(long, short, default_value_t = 8554, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
        /// Refuse a new publisher while one is active instead of replacing it
        #[arg(long)]
        reject_replace: bool,
        /// Offer interleaved TCP delivery only
        #[arg(long)]
        no_udp: bool,
    },
    /// Pull H.264 from an RTSP source and write it as an Annex B stream
    Ingest {
        /// Source URL, rtsp://[user:pass@]host[:port]/path
        #[arg(long, short)]
        url: String,
        /// Seconds between reconnect attempts, 0 to stop at the first error
        #[arg(long, default_value_t = 1)]
        retry_interval: u64,
        /// Double the retry interval on consecutive failures, up to this many seconds
        #[arg(long)]
        max_retry_interval: Option<u64>,
        /// Output file (stdout when omitted)
        #[arg(long, short)]
        output: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let result = match args.command {
        Command::Relay {
            port,
            reject_replace,
            no_udp,
        } => run_relay(port, reject_replace, no_udp),
        Command::Ingest {
            url,
            retry_interval,
            max_retry_interval,
            output,
        } => run_ingest(&url, retry_interval, max_retry_interval, output),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Block until a line is read on stdin. Returns `false` when stdin is closed
/// (daemonized), in which case the caller keeps running until its own exit.
fn wait_for_enter() -> bool {
    let mut input = String::new();
    matches!(io::stdin().read_line(&mut input), Ok(n) if n > 0)
}

fn run_relay(port: u16, reject_replace: bool, no_udp: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = RelayConfig {
        server: ServerConfig {
            enable_udp: !no_udp,
            ..Default::default()
        },
        publish_policy: if reject_replace {
            PublishPolicy::RejectWhileActive
        } else {
            PublishPolicy::ReplaceExisting
        },
    };
    let server = RelayServer::with_config(port, config)?;

    let runner = {
        let server = server.clone();
        thread::spawn(move || server.run())
    };

    eprintln!("RTSP relay on port {}, press Enter to stop", port);
    let _stopper = {
        let server = server.clone();
        thread::spawn(move || {
            if wait_for_enter() {
                tracing::info!("stop requested");
                server.close();
            }
        })
    };

    match runner.join() {
        Ok(result) => Ok(result?),
        Err(_) => Err("relay thread panicked".into()),
    }
}

fn run_ingest(
    url: &str,
    retry_interval: u64,
    max_retry_interval: Option<u64>,
    output: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let sink: Box<dyn Write + Send> = match output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout()),
    };
    let sink = Arc::new(Mutex::new(sink));

    let config = IngestConfig {
        backoff: match max_retry_interval {
            Some(max) => Backoff::Exponential {
                max: Duration::from_secs(max),
            },
            None => Backoff::Fixed,
        },
        ..Default::default()
    };
    let connector = Arc::new(RtspConnector::new(config.client.clone()));

    let writer = sink.clone();
    let client = IngestClient::with_config(
        url,
        move |unit: Vec<u8>| {
            writer.lock().write_all(&unit)?;
            Ok(())
        },
        config,
        connector,
    )?;

    let runner = {
        let client = client.clone();
        thread::spawn(move || client.run(Duration::from_secs(retry_interval)))
    };

    eprintln!("Ingesting {}, press Enter to stop", client.url());
    let _stopper = {
        let client = client.clone();
        thread::spawn(move || {
            if wait_for_enter() {
                tracing::info!("stop requested");
                client.close();
            }
        })
    };

    let result = match runner.join() {
        Ok(result) => result,
        Err(_) => return Err("ingest thread panicked".into()),
    };
    // run() may end on its own when retries are disabled
    client.close();

    sink.lock().flush()?;
    Ok(result?)
}
