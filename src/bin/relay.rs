//! Entry point: runs one relay instance per `--bind` spec on a small worker runtime,
//!  all sharing the console handle and the log file.

use anyhow::anyhow;
use clap::Parser;
use duplex_relay::config::RelayConfig;
use duplex_relay::console::SafeConsole;
use duplex_relay::server::RelayServer;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Instrument, Level};

#[derive(Parser)]
#[command(about = "Dual-channel TCP relay for comparing loss and latency across two networks")]
struct Args {
    /// endpoint to serve, as `IP` or `IP%device` - repeat once per network
    #[clap(long = "bind", required = true)]
    bind: Vec<String>,

    #[clap(long, default_value_t = 9050)]
    out_port: u16,

    #[clap(long, default_value_t = 9000)]
    in_port: u16,

    #[clap(long, default_value = "Server.log")]
    log_file: PathBuf,

    /// worker threads shared by all instances
    #[clap(long, default_value_t = 4)]
    workers: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.log_file)
        .map_err(|e| anyhow!("cannot open log file {:?}: {}", args.log_file, e))?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(Arc::new(log_file))
        .try_init()
        .ok();

    let mut endpoints = Vec::new();
    for spec in &args.bind {
        endpoints.push(parse_bind_spec(spec)?);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.workers)
        .enable_all()
        .build()?;
    runtime.block_on(run_instances(endpoints, args.out_port, args.in_port))
}

fn parse_bind_spec(spec: &str) -> anyhow::Result<(IpAddr, Option<String>)> {
    let (host, device) = match spec.split_once('%') {
        Some((host, device)) => (host, Some(device.to_string())),
        None => (spec, None),
    };
    let host = host
        .parse()
        .map_err(|e| anyhow!("invalid bind spec {:?}: {}", spec, e))?;
    Ok((host, device))
}

async fn run_instances(
    endpoints: Vec<(IpAddr, Option<String>)>,
    out_port: u16,
    in_port: u16,
) -> anyhow::Result<()> {
    let console = SafeConsole::stdout();

    let mut handles = Vec::new();
    for (host, device) in endpoints {
        let config = Arc::new(RelayConfig::new(host, out_port, in_port, device.clone()));
        let console = console.clone();
        let span = tracing::info_span!(
            "relay",
            host = %host,
            device = %device.as_deref().unwrap_or("-"),
        );
        handles.push(tokio::spawn(
            async move {
                let mut server = RelayServer::bind(config, console).await?;
                server.run().await
            }
            .instrument(span),
        ));
    }

    for handle in handles {
        handle.await??;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind_spec() {
        let (host, device) = parse_bind_spec("192.168.0.65%enp3s0").unwrap();
        assert_eq!(host, "192.168.0.65".parse::<IpAddr>().unwrap());
        assert_eq!(device.as_deref(), Some("enp3s0"));

        let (host, device) = parse_bind_spec("127.0.0.1").unwrap();
        assert_eq!(host, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(device, None);

        assert!(parse_bind_spec("not-an-ip").is_err());
    }
}
