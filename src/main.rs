use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use isecl_k8s_controller::config::{ControllerConfig, ControllerPolicy, RetrySettings, TagPrefix};
use isecl_k8s_controller::controller::{self, ControllerState};
use isecl_k8s_controller::crd::HostAttributes;
use isecl_k8s_controller::leader::{self, LeaderElector};
use isecl_k8s_controller::telemetry::{self, LineCap, DEFAULT_LOG_MAX_LENGTH};
use isecl_k8s_controller::Error;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, CustomResourceExt};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Print the HostAttributes CRD manifest
    Crd,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace holding the HostAttributes objects
    #[arg(long, env = "HOSTATTRIBUTES_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Taint nodes whose host failed attestation
    #[arg(long, env = "TAINT_UNTRUSTED_NODES")]
    taint_untrusted_nodes: bool,

    /// Taint nodes when they register with the cluster
    #[arg(long, env = "TAINT_REGISTERED_NODES")]
    taint_registered_nodes: bool,

    /// Taint nodes when they reboot
    #[arg(long, env = "TAINT_REBOOTED_NODES")]
    taint_rebooted_nodes: bool,

    /// Prefix of the asset tag and hardware feature labels
    #[arg(long, env = "TAG_PREFIX", default_value = "isecl.")]
    tag_prefix: String,

    /// Default log level, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Maximum length of one log line in bytes, 0 for unlimited
    #[arg(long, env = "LOG_MAX_LENGTH", default_value_t = DEFAULT_LOG_MAX_LENGTH)]
    log_max_length: usize,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Concurrent HostAttributes workers
    #[arg(long, env = "WORKERS", default_value_t = 1)]
    workers: usize,

    /// Path to a kubeconfig file instead of in-cluster or default discovery
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Only run while holding the leader lease
    #[arg(long, env = "LEADER_ELECTION")]
    leader_election: bool,

    /// Port of the health and metrics endpoint
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    http_port: u16,

    /// Initial retry delay for failed reconciliations
    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value_t = 1000)]
    retry_base_delay_ms: u64,

    /// Upper bound of the retry delay
    #[arg(long, env = "RETRY_MAX_DELAY_SECS", default_value_t = 300)]
    retry_max_delay_secs: u64,
}

impl RunArgs {
    fn controller_config(&self) -> Result<ControllerConfig, Error> {
        let tag_prefix: TagPrefix = self.tag_prefix.parse()?;
        let config = ControllerConfig {
            namespace: self.namespace.clone(),
            workers: self.workers,
            policy: ControllerPolicy {
                taint_untrusted_nodes: self.taint_untrusted_nodes,
                taint_registered_nodes: self.taint_registered_nodes,
                taint_rebooted_nodes: self.taint_rebooted_nodes,
                tag_prefix,
            },
            retry: RetrySettings {
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_secs(self.retry_max_delay_secs),
            },
            leader_election: self.leader_election,
            http_port: self.http_port,
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("ISecL K8s Controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::Crd => {
            let yaml = serde_yaml::to_string(&HostAttributes::crd())
                .map_err(|e| Error::ConfigError(format!("Failed to render CRD: {}", e)))?;
            print!("{}", yaml);
            Ok(())
        }
        Commands::Run(run_args) => run(run_args).await,
    }
}

fn init_logging(args: &RunArgs) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(args.log_level.into())
        .from_env_lossy();

    let writer = LineCap::new(std::io::stdout, args.log_max_length);
    let json_layer = args
        .log_json
        .then(|| fmt::layer().json().with_writer(writer));
    let text_layer = (!args.log_json).then(|| fmt::layer().with_target(true).with_writer(writer));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer);

    // Only enable OTEL if an endpoint is provided
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        match telemetry::init_telemetry(&registry) {
            Ok(otel_layer) => {
                registry.with(otel_layer).init();
                info!("OpenTelemetry tracing initialized");
            }
            Err(e) => {
                registry.init();
                warn!("OpenTelemetry tracing disabled: {}", e);
            }
        }
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
}

async fn connect(kubeconfig: Option<&PathBuf>) -> Result<Client, Error> {
    let client = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::ConfigError(format!("Cannot read kubeconfig {}: {}", path.display(), e))
            })?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::ConfigError(format!("Invalid kubeconfig: {}", e)))?;
            Client::try_from(config)?
        }
        None => Client::try_default().await?,
    };

    let version = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes cluster (v{}.{})",
        version.major, version.minor
    );
    Ok(client)
}

async fn run(args: RunArgs) -> Result<(), Error> {
    init_logging(&args);

    let config = args.controller_config().map_err(|e| {
        error!("Invalid configuration: {}", e);
        e
    })?;

    info!(
        "Starting ISecL K8s Controller v{} (tag prefix {}, taint untrusted {}, registered {}, rebooted {})",
        env!("CARGO_PKG_VERSION"),
        config.policy.tag_prefix,
        config.policy.taint_untrusted_nodes,
        config.policy.taint_registered_nodes,
        config.policy.taint_rebooted_nodes,
    );

    let client = connect(args.kubeconfig.as_ref()).await.map_err(|e| {
        error!("Cannot connect to Kubernetes: {}", e);
        e
    })?;

    let state = Arc::new(ControllerState::new(client.clone(), config));
    let (stop_tx, stop_rx) = watch::channel(false);
    spawn_signal_handler(stop_tx.clone());

    #[cfg(feature = "rest-api")]
    {
        let server_state = Arc::new(isecl_k8s_controller::rest_api::ServerState {
            status: Arc::clone(&state.status),
            leader_election: state.config.leader_election,
        });
        let port = state.config.http_port;
        let server_stop = stop_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                isecl_k8s_controller::rest_api::run_server(server_state, port, server_stop).await
            {
                error!("HTTP server error: {:?}", e);
            }
        });
    }

    if state.config.leader_election {
        let leader_namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| state.config.namespace.clone());
        let elector = LeaderElector::new(client, &leader_namespace, leader::holder_identity());
        info!("Leader election using holder ID: {}", elector.identity());

        let mut wait_rx = stop_rx.clone();
        if !elector.acquire(&mut wait_rx).await {
            info!("Stopped before acquiring leadership");
            telemetry::shutdown_telemetry();
            return Ok(());
        }
        tokio::spawn(elector.hold(Arc::clone(&state.status), stop_tx.clone()));
    }

    // Run the main controller loop
    let result = controller::run_controller(state, stop_rx).await;
    if let Err(e) = &result {
        error!("Controller failed: {}", e);
    }
    // Releases the HTTP server and lease holder if the controller failed on its own
    stop_tx.send_replace(true);

    // Flush any remaining traces
    telemetry::shutdown_telemetry();

    result
}

/// Raise the stop signal on SIGINT or SIGTERM
fn spawn_signal_handler(stop: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                        _ = term.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!("Cannot install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt");
        }

        stop.send_replace(true);
    });
}
