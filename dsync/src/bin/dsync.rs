use anyhow::{Result, anyhow};
use clap::Parser;
use common::progress::{BarProgress, CompositeProgress, LoggingProgress, TransferProgress};
use common::{DigestType, FileIntegrityOptions, IntegrityCheck, TransferMode, TransferOptions};
use dsync::{AbortHook, DownloadExecutor, LocalClient, SessionRegistry, UploadExecutor};
use remote::{DownloadClient, UploadClient};
use std::sync::Arc;
use tracing::instrument;

fn parse_size(value: &str) -> Result<u64, String> {
    value
        .parse::<bytesize::ByteSize>()
        .map(|size| size.as_u64())
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dsync",
    version,
    about = "Synchronize a directory with a remote one, moving only changed chunks",
    long_about = "`dsync` makes one directory match another. Files are split into fixed-size chunks and, when both sides already have a file, only chunks whose digests differ are transferred.

EXAMPLES:
    # Pull a directory from a dsyncd server
    dsync --server host:7000 --mode download --local ./data --remote /srv/data --summary

    # Push a directory, removing remote files that don't exist locally
    dsync --server host:7000 --mode upload --local ./data --remote /srv/data --delete-unexpected

    # Without --server both directories are local
    dsync --mode download --local /backup/data --remote /srv/data"
)]
struct Args {
    // Transfer options
    /// Direction of the transfer: `download` makes LOCAL match REMOTE, `upload` makes REMOTE match LOCAL
    #[arg(long, value_name = "MODE", help_heading = "Transfer options")]
    mode: TransferMode,

    /// Local directory
    #[arg(long, value_name = "PATH", help_heading = "Transfer options")]
    local: std::path::PathBuf,

    /// Directory on the server (or a second local directory when --server is not given)
    #[arg(long, value_name = "PATH", help_heading = "Transfer options")]
    remote: String,

    /// Remove destination files and directories that don't exist in the source
    #[arg(long, help_heading = "Transfer options")]
    delete_unexpected: bool,

    /// Chunk size, e.g. "64KiB", "1MiB"
    #[arg(
        long = "chunk",
        default_value = "1MiB",
        value_name = "SIZE",
        value_parser = parse_size,
        help_heading = "Transfer options"
    )]
    chunk_size: u64,

    /// How to decide whether destination file content is up to date
    #[arg(
        long,
        default_value_t = IntegrityCheck::default(),
        value_name = "CHECK",
        help_heading = "Transfer options"
    )]
    integrity: IntegrityCheck,

    /// Digest used to compare chunks
    #[arg(
        long,
        default_value_t = DigestType::default(),
        value_name = "DIGEST",
        ignore_case = true,
        help_heading = "Transfer options"
    )]
    digest: DigestType,

    // Filtering
    /// Glob pattern for files to include (can be specified multiple times)
    ///
    /// Only files matching at least one include pattern are synchronized. Patterns use glob
    /// syntax: * matches anything except /, ** matches anything including /. Leading / anchors
    /// to the root, trailing / matches only directories.
    #[arg(long, value_name = "PATTERN", action = clap::ArgAction::Append, help_heading = "Filtering")]
    include: Vec<String>,

    /// Glob pattern for files to exclude (can be specified multiple times)
    ///
    /// Excludes are checked before includes.
    #[arg(long, value_name = "PATTERN", action = clap::ArgAction::Append, help_heading = "Filtering")]
    exclude: Vec<String>,

    /// Read filter patterns from file
    #[arg(long, value_name = "PATH", conflicts_with_all = ["include", "exclude"], help_heading = "Filtering")]
    filter_file: Option<std::path::PathBuf>,

    // Connection options
    /// Address of the dsyncd server (host:port); without it both directories are local
    #[arg(long, value_name = "ADDR", help_heading = "Connection options")]
    server: Option<String>,

    /// Token expected by the server
    #[arg(long, value_name = "TOKEN", requires = "server", help_heading = "Connection options")]
    auth_token: Option<String>,

    /// Number of files and chunks transferred concurrently
    #[arg(
        long = "connections",
        default_value_t = common::config::DEFAULT_NUM_CONNECTIONS,
        value_name = "N",
        help_heading = "Connection options"
    )]
    num_connections: usize,

    /// Time limit for one request to the server, e.g. "2min"
    #[arg(
        long,
        default_value = "120s",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Connection options"
    )]
    timeout: std::time::Duration,

    /// Time limit for connecting to the server
    #[arg(
        long,
        default_value = "5s",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Connection options"
    )]
    connect_timeout: std::time::Duration,

    // Progress & output
    /// Show a progress bar
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
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

    /// Throttle the number of chunk transfers per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

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

fn filter_settings(args: &Args) -> Result<common::filter::FilterSettings> {
    if let Some(path) = &args.filter_file {
        return common::filter::FilterSettings::from_file(path);
    }
    let mut filter = common::filter::FilterSettings::new();
    for pattern in &args.include {
        filter.add_include(pattern)?;
    }
    for pattern in &args.exclude {
        filter.add_exclude(pattern)?;
    }
    Ok(filter)
}

fn progress_sink(args: &Args) -> Arc<dyn TransferProgress> {
    let mut sinks: Vec<Arc<dyn TransferProgress>> = Vec::new();
    if args.progress {
        sinks.push(Arc::new(BarProgress::new()));
    }
    if args.verbose > 0 {
        sinks.push(Arc::new(LoggingProgress));
    }
    Arc::new(CompositeProgress::new(sinks))
}

type Clients = (Arc<dyn DownloadClient>, Arc<dyn UploadClient>);

fn clients(args: &Args, options: &TransferOptions) -> Result<Clients> {
    match &args.server {
        Some(address) => {
            let client = Arc::new(remote::TcpClient::new(remote::ClientConfig {
                address: address.clone(),
                auth_token: args.auth_token.clone(),
                // one spare connection for session-level calls while all chunk slots are busy
                max_connections: options.num_connections + 1,
                connect_timeout: options.connect_timeout,
                timeout: options.timeout,
            }));
            let download: Arc<dyn DownloadClient> = client.clone();
            let upload: Arc<dyn UploadClient> = client;
            Ok((download, upload))
        }
        None => {
            let local = dsync::registry::normalize_root(&args.local)?;
            let remote = dsync::registry::normalize_root(&args.remote)?;
            if dsync::registry::paths_overlap(&local, &remote) {
                return Err(anyhow!(
                    "{:?} and {:?} overlap, refusing to sync a directory with itself",
                    local,
                    remote
                ));
            }
            let registry = Arc::new(SessionRegistry::new(
                dsync::Authenticator::NoAuth,
                dsync::RegistryConfig::default(),
            ));
            let client = Arc::new(LocalClient::new(registry, None));
            let download: Arc<dyn DownloadClient> = client.clone();
            let upload: Arc<dyn UploadClient> = client;
            Ok((download, upload))
        }
    }
}

#[instrument(skip(args))]
async fn async_main(args: Args) -> Result<common::progress::Summary> {
    let options = TransferOptions {
        num_connections: args.num_connections,
        timeout: args.timeout,
        connect_timeout: args.connect_timeout,
        delete_unexpected: args.delete_unexpected,
        chunk_size: args.chunk_size,
        integrity: FileIntegrityOptions {
            check: args.integrity,
            digest_type: args.digest,
        },
    };
    options.validate().map_err(|error| anyhow!(error))?;
    if args.auth_token.as_deref().is_some_and(str::is_empty) {
        return Err(anyhow!("auth token must not be empty"));
    }
    let filter = filter_settings(&args)?;
    let (download_client, upload_client) = clients(&args, &options)?;
    let progress = progress_sink(&args);
    let abort_hook = Arc::new(AbortHook::default());
    let transfer = async {
        match args.mode {
            TransferMode::Download => {
                DownloadExecutor::new(
                    download_client,
                    args.local.clone(),
                    args.remote.clone(),
                    filter,
                    options,
                )
                .with_progress(progress)
                .with_abort_hook(abort_hook.clone())
                .execute()
                .await
            }
            TransferMode::Upload => {
                UploadExecutor::new(
                    upload_client,
                    args.local.clone(),
                    args.remote.clone(),
                    filter,
                    options,
                )
                .with_progress(progress)
                .with_abort_hook(abort_hook.clone())
                .execute()
                .await
            }
        }
    };
    tokio::select! {
        result = transfer => match result {
            Ok(summary) => Ok(summary),
            Err(error) => {
                if args.summary {
                    return Err(anyhow!("{:#}\n\n{}", error.source, &error.summary));
                }
                Err(error.source)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, aborting the transfer");
            abort_hook.fire().await;
            Err(anyhow!("interrupted"))
        }
    }
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
        ops_throttle: args.ops_throttle,
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
