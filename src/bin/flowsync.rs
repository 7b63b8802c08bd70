//! flowsync CLI — explode, rebuild, verify, and watch a flows document.

use clap::{Parser, Subcommand};
use flowsync::codec::{self, CodecOptions, ExplodeRunOptions, RebuildRunOptions};
use flowsync::config::{self, FileConfig};
use flowsync::extract::Registry;
use flowsync::graph;
use flowsync::reconcile::NewFileMode;
use flowsync::server::{AuthMode, ServerClient, ServerOptions};
use flowsync::watch::{spawn_stdin_commands, EngineOptions, SyncEngine};
use flowsync::{SyncError, DEFAULT_SERVER_URL};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Keep a flows document, a per-node source tree, and a server in sync.
#[derive(Parser, Debug)]
#[command(name = "flowsync")]
#[command(about = "Sync a flows document with an exploded source tree and a flows server")]
struct Cli {
    /// Path to the flows document
    #[arg(short, long, default_value = "flows.json", env = "FLOWSYNC_FLOWS")]
    flows: PathBuf,

    /// Exploded source tree directory
    #[arg(short, long, default_value = "src", env = "FLOWSYNC_SRC")]
    src: PathBuf,

    /// Optional JSON config file
    #[arg(long, env = "FLOWSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Server URL (e.g. http://127.0.0.1:1880)
    #[arg(long, env = "FLOWSYNC_SERVER")]
    server: Option<String>,

    /// Authentication type: none, basic, or bearer
    #[arg(long, env = "FLOWSYNC_AUTH")]
    auth_type: Option<String>,

    /// Username for basic auth
    #[arg(long, env = "FLOWSYNC_USERNAME")]
    username: Option<String>,

    /// Password for basic auth
    #[arg(long, env = "FLOWSYNC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Token for bearer auth
    #[arg(long, env = "FLOWSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Process nodes sequentially (disable the worker pool)
    #[arg(long)]
    sequential: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Explode the flows document into per-node source files
    Explode {
        /// Delete orphaned files instead of moving them to .orphaned/
        #[arg(long)]
        delete_orphaned: bool,
    },
    /// Rebuild the flows document from source files
    Rebuild {
        /// Move new files (not in the skeleton) to .orphaned/
        #[arg(long, conflicts_with = "delete_new")]
        orphan_new: bool,
        /// Delete new files (not in the skeleton)
        #[arg(long)]
        delete_new: bool,
    },
    /// Verify the document survives an explode/rebuild round trip
    Verify,
    /// List active extractors
    Extractors,
    /// Watch the tree and poll the server, syncing both directions
    Watch {
        /// Server poll interval in seconds
        #[arg(long, env = "FLOWSYNC_POLL_INTERVAL")]
        poll_interval: Option<u64>,
        /// Debounce interval for local changes, in seconds
        #[arg(long, env = "FLOWSYNC_DEBOUNCE")]
        debounce: Option<u64>,
        /// Delete orphaned files instead of moving them to .orphaned/
        #[arg(long)]
        delete_orphaned: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<(), SyncError> {
    let file_config = config::load_config(cli.config.as_deref())?;
    let registry = Arc::new(Registry::builtin(&file_config.extractors));
    let codec_options = CodecOptions {
        max_workers: None,
        parallel: !cli.sequential,
    };

    match &cli.command {
        CliCommand::Explode { delete_orphaned } => {
            if !cli.flows.exists() {
                return Err(SyncError::Config(format!(
                    "flows document not found: {}",
                    cli.flows.display()
                )));
            }
            let report = codec::run_explode(
                &cli.flows,
                &cli.src,
                &registry,
                &ExplodeRunOptions {
                    delete_orphaned: *delete_orphaned,
                    codec: codec_options,
                },
            )
            .await?;
            if report.needs_rebuild {
                info!("Some nodes were unstable; run 'rebuild' to canonicalize the document");
            }
            Ok(())
        }
        CliCommand::Rebuild {
            orphan_new,
            delete_new,
        } => {
            let new_files = if *delete_new {
                NewFileMode::Delete
            } else if *orphan_new {
                NewFileMode::Orphan
            } else {
                NewFileMode::Create
            };
            codec::run_rebuild(
                &cli.flows,
                &cli.src,
                &registry,
                &RebuildRunOptions {
                    new_files,
                    codec: codec_options,
                },
            )
            .await?;
            Ok(())
        }
        CliCommand::Verify => verify_round_trip(&cli.flows, &registry, codec_options).await,
        CliCommand::Extractors => {
            info!("Active extractors (in run order):");
            for extractor in registry.extractors() {
                info!("  {} (priority {})", extractor.name(), extractor.priority());
            }
            Ok(())
        }
        CliCommand::Watch {
            poll_interval,
            debounce,
            delete_orphaned,
        } => {
            let client = Arc::new(build_client(&cli, &file_config)?);
            let options = EngineOptions {
                poll_interval: Duration::from_secs(
                    (*poll_interval)
                        .or(file_config.watch.poll_interval)
                        .unwrap_or(1),
                ),
                debounce: Duration::from_secs(
                    (*debounce).or(file_config.watch.debounce).unwrap_or(2),
                ),
                delete_orphaned: *delete_orphaned,
                codec: codec_options,
                extractors: file_config.extractors.clone(),
                ..EngineOptions::default()
            };

            let registry = Registry::builtin(&file_config.extractors);
            let engine = SyncEngine::new(client, registry, cli.flows, cli.src, options);

            let (tx, rx) = mpsc::channel(16);
            let stdin_task = spawn_stdin_commands(tx);
            let result = engine.run(rx).await;
            stdin_task.abort();
            result
        }
    }
}

/// Resolve server options from CLI arguments over file configuration and
/// construct the client. Bad auth configuration is fatal here.
fn build_client(cli: &Cli, file_config: &FileConfig) -> Result<ServerClient, SyncError> {
    let url = cli
        .server
        .clone()
        .or_else(|| file_config.server.url.clone())
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

    let auth_kind = cli
        .auth_type
        .clone()
        .or_else(|| file_config.server.auth_type.clone())
        .unwrap_or_else(|| "none".to_string());
    let auth = AuthMode::from_config(
        &auth_kind,
        cli.username
            .clone()
            .or_else(|| file_config.server.username.clone()),
        cli.password
            .clone()
            .or_else(|| file_config.server.password.clone()),
        cli.token
            .clone()
            .or_else(|| file_config.server.token.clone()),
    )?;

    let mut options = ServerOptions::new(url, auth);
    options.verify_tls = !cli.insecure && file_config.server.verify_tls.unwrap_or(true);
    ServerClient::new(options)
}

/// Explode into a scratch tree, rebuild, and compare byte-for-byte.
async fn verify_round_trip(
    flows: &PathBuf,
    registry: &Arc<Registry>,
    codec_options: CodecOptions,
) -> Result<(), SyncError> {
    if !flows.exists() {
        return Err(SyncError::Config(format!(
            "flows document not found: {}",
            flows.display()
        )));
    }
    // Compare against the normalized compact form so formatting of the
    // input file does not affect the verdict.
    let original = graph::to_compact_json(&graph::load_document(flows)?);

    let scratch = std::env::temp_dir().join(format!("flowsync-verify-{}", std::process::id()));
    let scratch_src = scratch.join("src");
    let scratch_flows = scratch.join("flows.json");
    std::fs::create_dir_all(&scratch_src)?;
    std::fs::write(&scratch_flows, &original)?;

    let result = async {
        let report = codec::run_explode(
            &scratch_flows,
            &scratch_src,
            registry,
            &ExplodeRunOptions {
                delete_orphaned: true,
                codec: codec_options.clone(),
            },
        )
        .await?;
        codec::run_rebuild(
            &scratch_flows,
            &scratch_src,
            registry,
            &RebuildRunOptions {
                new_files: NewFileMode::Orphan,
                codec: codec_options.clone(),
            },
        )
        .await?;
        let rebuilt = std::fs::read_to_string(&scratch_flows)?;
        Ok::<(bool, bool), SyncError>((original == rebuilt, report.needs_rebuild))
    }
    .await;

    let _ = std::fs::remove_dir_all(&scratch);

    let (identical, any_unstable) = result?;
    if identical && !any_unstable {
        info!("Round trip verified: document is stable");
        Ok(())
    } else {
        Err(SyncError::Verification(
            "document changed during explode/rebuild".to_string(),
        ))
    }
}
