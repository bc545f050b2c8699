//! Command-line multipath traceroute.

mod runner;

use clap::Parser;
use flowtrace_core::{ProbeParams, Protocol, TraceError, TracerouteResult};
use serde::Serialize;
use std::process::ExitCode;
use std::time::Duration;

/// Discovers load-balanced forward paths by probing many flows per TTL.
#[derive(Parser, Debug)]
#[command(name = "flowtrace")]
#[command(version)]
#[command(about = "NAT-aware multipath traceroute")]
struct Args {
    /// Target hostname or IPv4 address.
    #[arg(required = true)]
    target: String,

    /// Probe protocol (udp, tcp).
    #[arg(short = 'P', long = "proto", default_value = "udp")]
    proto: String,

    /// First source port; each flow uses the next port up.
    #[arg(long = "sport", default_value = "33434")]
    sport: u16,

    /// Destination port (0 selects the protocol default).
    #[arg(short = 'p', long = "dport", default_value = "0")]
    dport: u16,

    /// Number of parallel flows to probe.
    #[arg(short = 'n', long = "npaths", default_value = "4")]
    npaths: u16,

    /// Minimum TTL.
    #[arg(long = "min-ttl", default_value = "1")]
    min_ttl: u8,

    /// Maximum TTL.
    #[arg(short = 'm', long = "max-ttl", default_value = "30")]
    max_ttl: u8,

    /// Probes per hop per flow (above 1 enables MTR statistics).
    #[arg(short = 'c', long = "count", default_value = "1")]
    count: u8,

    /// Per-probe timeout in milliseconds (0 selects the protocol default).
    #[arg(long = "timeout", default_value = "0")]
    timeout_ms: u64,

    /// Delay between probes in milliseconds.
    #[arg(long = "delay", default_value = "10")]
    delay_ms: u64,

    /// Resolve responder hostnames.
    #[arg(long = "reverse-dns")]
    reverse_dns: bool,

    /// Emit per-hop statistics and path analysis instead of the raw trace.
    #[arg(long = "mtr")]
    mtr: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn to_params(&self, protocol: Protocol) -> ProbeParams {
        ProbeParams {
            base_src_port: self.sport,
            dst_port: if self.dport == 0 {
                protocol.default_dst_port()
            } else {
                self.dport
            },
            num_paths: self.npaths,
            min_ttl: self.min_ttl,
            max_ttl: self.max_ttl,
            probe_count: self.count,
            delay: Duration::from_millis(self.delay_ms),
            timeout: (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms)),
        }
    }
}

/// MTR-style report document.
#[derive(Serialize)]
struct MtrReport<'a> {
    target: &'a str,
    stats: Vec<flowtrace_core::HopStats>,
    analysis: flowtrace_core::NetworkAnalysis,
}

fn print_result(result: &TracerouteResult, target: &str, mtr: bool) -> Result<(), String> {
    let json = if mtr {
        let report = MtrReport {
            target,
            stats: result.hop_statistics().into_values().collect(),
            analysis: result.analyze(),
        };
        serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?
    } else {
        result.to_json().map_err(|e| e.to_string())?
    };
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let protocol: Protocol = match args.proto.parse() {
        Ok(protocol) => protocol,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let params = args.to_params(protocol);

    tracing::info!(
        target = %args.target,
        protocol = %protocol,
        num_paths = params.num_paths,
        "starting traceroute"
    );

    match runner::run_traceroute(&args.target, protocol, params, args.reverse_dns).await {
        Ok(result) => match print_result(&result, &args.target, args.mtr) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Failed to serialize results: {e}");
                ExitCode::FAILURE
            }
        },
        Err(TraceError::CaptureEnded {
            partial: Some(partial),
        }) => {
            eprintln!("Warning: packet capture ended mid-run, results are partial");
            let _ = print_result(&partial, &args.target, args.mtr);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Traceroute failed: {e}");
            ExitCode::FAILURE
        }
    }
}
