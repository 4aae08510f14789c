//! Sidecar cleaner - stops mesh sidecars once Job pods have finished

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sidecar_cleaner::cleanup::{
    CompletionPolicy, ShutdownCommand, SidecarCleaner, DEFAULT_SIDECAR_HTTP_PORT,
};
use sidecar_cleaner::config::{
    SidecarProfile, DEFAULT_MAX_RETRIES, DEFAULT_OPT_OUT_ANNOTATION,
    DEFAULT_SELF_TERMINATING_CONTAINER, DEFAULT_SIDECAR_CONTAINER, DEFAULT_SIDECAR_PREFIX,
};
use sidecar_cleaner::feed::KubePodFeed;
use sidecar_cleaner::reconciler::TracingErrorReporter;
use sidecar_cleaner::{CleanerConfig, Controller};
use sidecar_cleaner_common::kube_utils::create_client;
use sidecar_cleaner_common::telemetry::{init_telemetry, TelemetryConfig};

/// What to wait for after the shutdown command ran
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum Completion {
    /// Poll until the Pod reports Succeeded
    #[default]
    Confirm,
    /// Return as soon as the command succeeded
    Forget,
}

/// How the sidecar is asked to quit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum Shutdown {
    /// `pilot-agent request POST /quitquitquit`
    #[default]
    PilotAgent,
    /// curl against the agent's local HTTP port
    Http,
}

/// Stops Istio sidecars in Job pods whose workload containers have finished
#[derive(Parser, Debug)]
#[command(name = "sidecar-cleaner", version, about, long_about = None)]
struct Cli {
    /// Path to kubeconfig; in-cluster credentials are used when unset
    #[arg(long, env = "SIDECAR_CLEANER_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "SIDECAR_CLEANER_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Failed attempts per pod before it is dropped
    #[arg(long, env = "SIDECAR_CLEANER_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Upper bound on the shutdown exec, in seconds
    #[arg(long, env = "SIDECAR_CLEANER_EXEC_TIMEOUT_SECS", default_value_t = 2)]
    exec_timeout_secs: u64,

    /// Completion policy after the shutdown command
    #[arg(long, env = "SIDECAR_CLEANER_COMPLETION", value_enum, default_value_t)]
    completion: Completion,

    /// Pod phase polling interval when confirming, in seconds
    #[arg(long, env = "SIDECAR_CLEANER_CONFIRM_INTERVAL_SECS", default_value_t = 1)]
    confirm_interval_secs: u64,

    /// Give up confirming after this many seconds
    #[arg(long, env = "SIDECAR_CLEANER_CONFIRM_TIMEOUT_SECS", default_value_t = 10)]
    confirm_timeout_secs: u64,

    /// Command used to stop the sidecar
    #[arg(long, env = "SIDECAR_CLEANER_SHUTDOWN_COMMAND", value_enum, default_value_t)]
    shutdown_command: Shutdown,

    /// Agent HTTP port for `--shutdown-command http`
    #[arg(long, env = "SIDECAR_CLEANER_SIDECAR_HTTP_PORT", default_value_t = DEFAULT_SIDECAR_HTTP_PORT)]
    sidecar_http_port: u16,

    /// Container that receives the shutdown command
    #[arg(long, env = "SIDECAR_CLEANER_SIDECAR_CONTAINER", default_value = DEFAULT_SIDECAR_CONTAINER)]
    sidecar_container: String,

    /// Containers with this prefix are not workload containers
    #[arg(long, env = "SIDECAR_CLEANER_SIDECAR_PREFIX", default_value = DEFAULT_SIDECAR_PREFIX)]
    sidecar_prefix: String,

    /// Pods carrying this container stop their sidecar themselves
    #[arg(
        long,
        env = "SIDECAR_CLEANER_SELF_TERMINATING_CONTAINER",
        default_value = DEFAULT_SELF_TERMINATING_CONTAINER
    )]
    self_terminating_container: String,

    /// Annotation that opts a pod out when set to `embedded`
    #[arg(long, env = "SIDECAR_CLEANER_OPT_OUT_ANNOTATION", default_value = DEFAULT_OPT_OUT_ANNOTATION)]
    opt_out_annotation: String,

    /// Re-dispatch every cached pod at this period, in seconds; 0 disables
    #[arg(long, env = "SIDECAR_CLEANER_RESYNC_SECS", default_value_t = 0)]
    resync_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "SIDECAR_CLEANER_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn cleaner_config(&self) -> CleanerConfig {
        let completion = match self.completion {
            Completion::Confirm => CompletionPolicy::Confirm {
                interval: Duration::from_secs(self.confirm_interval_secs),
                timeout: Duration::from_secs(self.confirm_timeout_secs),
            },
            Completion::Forget => CompletionPolicy::FireAndForget,
        };
        let shutdown_command = match self.shutdown_command {
            Shutdown::PilotAgent => ShutdownCommand::PilotAgent,
            Shutdown::Http => ShutdownCommand::LocalHttp {
                port: self.sidecar_http_port,
            },
        };

        CleanerConfig {
            workers: self.workers,
            max_retries: self.max_retries,
            profile: SidecarProfile {
                sidecar_container: self.sidecar_container.clone(),
                sidecar_prefix: self.sidecar_prefix.clone(),
                self_terminating_container: self.self_terminating_container.clone(),
                opt_out_annotation: self.opt_out_annotation.clone(),
            },
            shutdown_command,
            completion,
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            resync_period: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Required before any TLS connection to the API server
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json: cli.log_json,
        ..Default::default()
    })?;

    let config = cli.cleaner_config();
    config.validate()?;
    info!(
        workers = config.workers,
        max_retries = config.max_retries,
        completion = ?config.completion,
        shutdown_command = ?config.shutdown_command,
        "Starting sidecar cleaner"
    );

    let client = create_client(cli.kubeconfig.as_deref()).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let feed = Arc::new(KubePodFeed::new(client.clone(), config.resync_period));
    let cleaner = SidecarCleaner::from_client(client, &config);
    Controller::new(config, feed, cleaner, Arc::new(TracingErrorReporter))
        .run(shutdown)
        .await?;

    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    let terminate = async {
        #[cfg(unix)]
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGINT");
                return;
            }
        },
        _ = terminate => info!("Received SIGTERM"),
    }
    token.cancel();
}
