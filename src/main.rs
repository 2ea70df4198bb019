/*!
 * Ferry CLI - Command Line Interface
 */

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use ferry::{
    cli_progress::{format_bytes, BarReporter},
    config::{LogLevel, TransferConfig},
    core::{cancel::CancelToken, filter::FilterParams},
    error::{FerryError, EXIT_FATAL, EXIT_SUCCESS},
    logging,
    protocol::s3::{
        parse_duration, CopyAllParams, CopyParams, DeleteAllParams, DownloadAllParams,
        DownloadParams, ListEntry, ListParams, MoveAllParams, MoveParams, PresignMethod,
        PresignParams, S3Client, UploadDirParams, UploadParams, DEFAULT_PRESIGN_EXPIRY,
        MAX_DELETE_BATCH,
    },
    protocol::uri::ObjectUri,
};
use tracing::debug;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(version, about = "Chunked, concurrent transfers for S3-compatible object storage", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/ferry/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Service endpoint, e.g. http://localhost:9000
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Region used for signing
    #[arg(long, global = true)]
    region: Option<String>,

    /// Concurrent workers per transfer
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Multipart chunk size in MiB (min: 5, max: 5120)
    #[arg(long = "chunk-size-mib", value_name = "MIB", global = true)]
    chunk_size_mib: Option<u64>,

    /// Log level
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stderr
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable progress bars
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file
    Upload {
        /// Local file
        source: PathBuf,
        /// Destination key, or prefix ending with '/'
        destination: String,
        /// Content type (default: guessed from the file name)
        #[arg(long)]
        content_type: Option<String>,
        #[arg(long)]
        storage_class: Option<String>,
    },

    /// Upload every file under a local directory
    UploadDir {
        source: PathBuf,
        /// Destination prefix
        destination: String,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long)]
        storage_class: Option<String>,
    },

    /// Download an object
    Download {
        source: String,
        /// Local file or directory (default: current directory)
        destination: Option<PathBuf>,
        #[arg(long)]
        version_id: Option<String>,
    },

    /// Download every object under a prefix into a local directory
    DownloadAll {
        source: String,
        /// Local directory (default: current directory)
        destination: Option<PathBuf>,
        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Copy an object on the server side
    Copy {
        source: String,
        /// Destination key, or prefix ending with '/'
        destination: String,
        #[arg(long)]
        version_id: Option<String>,
        #[arg(long)]
        storage_class: Option<String>,
    },

    /// Copy every object under a prefix to another prefix
    CopyAll {
        source: String,
        destination: String,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long)]
        storage_class: Option<String>,
    },

    /// Move an object: copy it, then delete the source
    Move {
        source: String,
        /// Destination key, or prefix ending with '/'
        destination: String,
        #[arg(long)]
        version_id: Option<String>,
        #[arg(long)]
        storage_class: Option<String>,
    },

    /// Move every object under a prefix to another prefix
    MoveAll {
        source: String,
        destination: String,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long)]
        storage_class: Option<String>,
        /// Keys per DeleteObjects request when removing the sources
        #[arg(long, default_value_t = MAX_DELETE_BATCH)]
        batch_size: usize,
    },

    /// Show object metadata
    Head {
        uri: String,
        #[arg(long)]
        version_id: Option<String>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List objects under a prefix
    List {
        uri: String,
        /// List every key instead of one level
        #[arg(short = 'R', long)]
        recursive: bool,
    },

    /// Delete an object
    Delete {
        uri: String,
        #[arg(long)]
        version_id: Option<String>,
    },

    /// Delete every object under a prefix
    DeleteAll {
        prefix: String,
        /// Keys per DeleteObjects request
        #[arg(long, default_value_t = MAX_DELETE_BATCH)]
        batch_size: usize,
        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Print a presigned URL for an object
    Presign {
        uri: String,
        #[arg(long, value_enum, default_value = "get")]
        method: MethodArg,
        /// URL lifetime, e.g. 30s, 15m, 2h, 7d
        #[arg(long, default_value = DEFAULT_PRESIGN_EXPIRY)]
        expires: String,
        #[arg(long)]
        version_id: Option<String>,
    },
}

#[derive(Args)]
struct FilterArgs {
    /// Only transfer names matching this pattern (glob, or regex:PATTERN)
    #[arg(long)]
    include: Option<String>,

    /// Skip names matching this pattern (glob, or regex:PATTERN)
    #[arg(long)]
    exclude: Option<String>,
}

impl From<FilterArgs> for FilterParams {
    fn from(args: FilterArgs) -> Self {
        FilterParams {
            include: args.include,
            exclude: args.exclude,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum MethodArg {
    Get,
    Put,
}

impl From<MethodArg> for PresignMethod {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Get => PresignMethod::Get,
            MethodArg::Put => PresignMethod::Put,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<FerryError>()
                .map(FerryError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if let Err(e) = logging::init_logging(&config.log, cli.verbose) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(execute(cli, config))
}

/// Config file, then environment, then command-line flags
fn load_config(cli: &Cli) -> anyhow::Result<TransferConfig> {
    let mut config = match &cli.config {
        Some(path) => TransferConfig::from_file(path)?,
        None => TransferConfig::load_default()?,
    };
    config.apply_env();

    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = Some(endpoint.clone());
    }
    if let Some(region) = &cli.region {
        config.region = region.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(chunk_size_mib) = cli.chunk_size_mib {
        config.chunk_size_mib = chunk_size_mib;
    }
    if let Some(level) = cli.log_level {
        config.log.level = level.into();
    }
    if let Some(file) = &cli.log_file {
        config.log.file = Some(file.clone());
    }
    Ok(config)
}

/// Cancel `cancel` on the first Ctrl-C
fn cancel_on_interrupt(cancel: &CancelToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, cancelling transfers...");
            cancel.cancel(FerryError::Cancelled);
        }
    });
}

async fn execute(cli: Cli, config: TransferConfig) -> anyhow::Result<()> {
    let mut client = S3Client::new(&config)?;
    if !cli.no_progress && std::io::stderr().is_terminal() {
        client = client.with_progress(Arc::new(BarReporter::new()));
    }
    debug!(?client, "client ready");

    let cancel = CancelToken::new();
    cancel_on_interrupt(&cancel);

    match cli.command {
        Commands::Upload {
            source,
            destination,
            content_type,
            storage_class,
        } => {
            let params = UploadParams {
                source,
                destination: ObjectUri::parse(&destination)?,
                content_type,
                storage_class,
            };
            let result = client.upload(&cancel, &params).await?;
            println!(
                "uploaded {} ({}, {} part{})",
                result.uri,
                format_bytes(result.size),
                result.parts,
                if result.parts == 1 { "" } else { "s" }
            );
        }

        Commands::UploadDir {
            source,
            destination,
            filters,
            storage_class,
        } => {
            let params = UploadDirParams {
                source,
                destination: ObjectUri::parse(&destination)?,
                filters: filters.into(),
                storage_class,
            };
            let count = client.upload_dir(&cancel, &params).await?;
            println!("uploaded {} files to {}", count, params.destination);
        }

        Commands::Download {
            source,
            destination,
            version_id,
        } => {
            let params = DownloadParams {
                source: ObjectUri::parse(&source)?,
                destination,
                version_id,
            };
            let result = client.download(&cancel, &params).await?;
            println!(
                "downloaded {} to {} ({})",
                params.source,
                result.path.display(),
                format_bytes(result.size)
            );
        }

        Commands::DownloadAll {
            source,
            destination,
            filters,
        } => {
            let params = DownloadAllParams {
                source: ObjectUri::parse(&source)?,
                destination,
                filters: filters.into(),
            };
            let count = client.download_all(&cancel, &params).await?;
            println!("downloaded {} objects from {}", count, params.source);
        }

        Commands::Copy {
            source,
            destination,
            version_id,
            storage_class,
        } => {
            let params = CopyParams {
                source: ObjectUri::parse(&source)?,
                destination: ObjectUri::parse(&destination)?,
                version_id,
                storage_class,
            };
            let result = client.copy(&cancel, &params).await?;
            println!(
                "copied {} to {} ({})",
                result.source,
                result.destination,
                format_bytes(result.size)
            );
        }

        Commands::CopyAll {
            source,
            destination,
            filters,
            storage_class,
        } => {
            let params = CopyAllParams {
                source: ObjectUri::parse(&source)?,
                destination: ObjectUri::parse(&destination)?,
                filters: filters.into(),
                storage_class,
            };
            let count = client.copy_all(&cancel, &params).await?;
            println!("copied {} objects to {}", count, params.destination);
        }

        Commands::Move {
            source,
            destination,
            version_id,
            storage_class,
        } => {
            let params = MoveParams {
                source: ObjectUri::parse(&source)?,
                destination: ObjectUri::parse(&destination)?,
                version_id,
                storage_class,
            };
            let result = client.move_object(&cancel, &params).await?;
            println!("moved {} to {}", result.source, result.destination);
        }

        Commands::MoveAll {
            source,
            destination,
            filters,
            storage_class,
            batch_size,
        } => {
            let params = MoveAllParams {
                source: ObjectUri::parse(&source)?,
                destination: ObjectUri::parse(&destination)?,
                filters: filters.into(),
                storage_class,
                batch_size,
            };
            let count = client.move_all(&cancel, &params).await?;
            println!("moved {} objects to {}", count, params.destination);
        }

        Commands::Head {
            uri,
            version_id,
            json,
        } => {
            let uri = ObjectUri::parse(&uri)?;
            let metadata = client.head(&cancel, &uri, version_id.as_deref()).await?;
            if json {
                let value = serde_json::json!({
                    "uri": metadata.uri.to_string(),
                    "size": metadata.size,
                    "etag": metadata.etag,
                    "content_type": metadata.content_type,
                    "last_modified": metadata.last_modified.map(|t| t.to_rfc3339()),
                    "storage_class": metadata.storage_class,
                    "version_id": metadata.version_id,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("uri:           {}", metadata.uri);
                println!("size:          {} ({})", metadata.size, format_bytes(metadata.size));
                let fields = [
                    ("etag", metadata.etag),
                    ("content type", metadata.content_type),
                    ("last modified", metadata.last_modified.map(|t| t.to_rfc3339())),
                    ("storage class", metadata.storage_class),
                    ("version id", metadata.version_id),
                ];
                for (label, value) in fields {
                    if let Some(value) = value {
                        println!("{:<15}{}", format!("{}:", label), value);
                    }
                }
            }
        }

        Commands::List { uri, recursive } => {
            let uri = ObjectUri::parse(&uri)?;
            let params = ListParams {
                recursive,
                max_keys: None,
            };
            for entry in client.list_all(&cancel, &uri, params).await? {
                match entry {
                    ListEntry::Prefix(prefix) => println!("{:>24} {:>12} {}", "", "PRE", prefix),
                    ListEntry::Object(object) => println!(
                        "{:>24} {:>12} {}",
                        object.last_modified.unwrap_or_default(),
                        object.size,
                        object.key
                    ),
                }
            }
        }

        Commands::Delete { uri, version_id } => {
            let uri = ObjectUri::parse(&uri)?;
            client.delete(&cancel, &uri, version_id.as_deref()).await?;
            println!("deleted {}", uri);
        }

        Commands::DeleteAll {
            prefix,
            batch_size,
            filters,
        } => {
            let params = DeleteAllParams {
                prefix: ObjectUri::parse(&prefix)?,
                batch_size,
                filters: filters.into(),
            };
            let count = client.delete_all(&cancel, &params).await?;
            println!("deleted {} objects under {}", count, params.prefix);
        }

        Commands::Presign {
            uri,
            method,
            expires,
            version_id,
        } => {
            let params = PresignParams {
                uri: ObjectUri::parse(&uri)?,
                method: method.into(),
                expires: parse_duration(&expires)?,
                version_id,
            };
            let url = client.presign(&cancel, &params).await?;
            println!("{}", url);
        }
    }

    Ok(())
}
