use anyhow::{Context, Result, anyhow};
use clap::Parser;
use dsync::{Authenticator, RegistryConfig, SessionRegistry};
use std::sync::Arc;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dsyncd",
    version,
    about = "Serve dsync download and upload sessions over TCP",
    long_about = "`dsyncd` exposes the local filesystem to `dsync` clients. Each client transfer runs in its own session rooted at a directory; sessions with overlapping roots are refused.

EXAMPLE:
    # Listen on port 7000 with a generated token
    dsyncd --port 7000 --generate-auth

Once listening, dsyncd prints \"DSYNCD_TCP <address>\" to stderr."
)]
struct Args {
    // Connection options
    /// Address to bind
    #[arg(
        long,
        default_value = "0.0.0.0",
        value_name = "ADDR",
        help_heading = "Connection options"
    )]
    bind: String,

    /// Port to listen on, 0 picks a random free port
    #[arg(
        long,
        default_value = "0",
        value_name = "PORT",
        help_heading = "Connection options"
    )]
    port: u16,

    /// Require clients to present this token
    #[arg(long, value_name = "TOKEN", help_heading = "Connection options")]
    auth_token: Option<String>,

    /// Generate a random token, print it to stdout and require clients to present it
    #[arg(long, conflicts_with = "auth_token", help_heading = "Connection options")]
    generate_auth: bool,

    // Session options
    /// Sessions idle for longer than this are aborted, e.g. "150s", "5min"
    #[arg(
        long,
        default_value = "150s",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Session options"
    )]
    session_expiry: std::time::Duration,

    /// How often to look for idle sessions
    #[arg(
        long,
        default_value = "10s",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Session options"
    )]
    sweep_interval: std::time::Duration,

    /// Maximum number of open handles per transferred file
    #[arg(
        long,
        default_value_t = dsync::registry::DEFAULT_MAX_OPEN_HANDLES,
        value_name = "N",
        help_heading = "Session options"
    )]
    max_open_handles: usize,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print session statistics on shutdown
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Also write logs to this file
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    log_file: Option<std::path::PathBuf>,

    // Performance & throttling
    /// Maximum number of open pooled file handles, 0 or unspecified means no limit
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

fn authenticator(args: &Args) -> Result<Authenticator> {
    if args.generate_auth {
        let token = dsync::auth::generate_token();
        tracing::info!("generated auth token, clients must pass --auth-token {}", token);
        println!("{token}");
        return Ok(Authenticator::Token(token));
    }
    match &args.auth_token {
        Some(token) if token.is_empty() => Err(anyhow!("auth token must not be empty")),
        Some(token) => Ok(Authenticator::Token(token.clone())),
        None => Ok(Authenticator::NoAuth),
    }
}

#[instrument(skip(args))]
async fn async_main(args: Args) -> Result<dsync::registry::RegistryStats> {
    if args.max_open_handles == 0 {
        return Err(anyhow!("--max-open-handles must be greater than 0"));
    }
    let auth = authenticator(&args)?;
    let registry = Arc::new(SessionRegistry::new(
        auth,
        RegistryConfig {
            max_inactivity: args.session_expiry,
            max_open_handles: args.max_open_handles,
        },
    ));
    let listener = tokio::net::TcpListener::bind((args.bind.as_str(), args.port))
        .await
        .with_context(|| format!("cannot listen on {}:{}", args.bind, args.port))?;
    eprintln!("{} {}", remote::SERVER_READY_PREFIX, listener.local_addr()?);
    let expiry = tokio::spawn(registry.clone().run_expiry(args.sweep_interval));
    let result = tokio::select! {
        result = dsync::server::serve(listener, registry.clone()) => result,
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            signal.context("failed waiting for ctrl-c")
        }
    };
    expiry.abort();
    result?;
    Ok(registry.stats())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_open_files: args.max_open_files,
        ops_throttle: 0,
    };
    let tracing = common::TracingConfig {
        log_file: args.log_file.clone(),
    };
    let res = common::run(output, runtime, throttle, tracing, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
