use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use apiary_admission::SecretLookup;
use apiary_kubehub::{spawn_watchers, KubeSecrets, KubeStore};
use apiary_mgmt::{HttpPlane, PlaneAuth};
use apiary_reconcile::{build, ContextPlanes, Runner, Settings};
use apiary_store::ObjectStore;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing::{info, warn};

mod offline;

#[derive(Parser, Debug)]
#[command(name = "apiaryctl", version, about = "Apiary API-management operator")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, ValueEnum, PartialEq, Eq)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the cluster and reconcile until interrupted
    Run {
        /// Restrict watchers to one namespace
        #[arg(long = "ns", env = "APIARY_WATCH_NAMESPACE")]
        namespace: Option<String>,
        #[arg(long, env = "APIARY_WORKERS")]
        workers: Option<usize>,
        /// Management plane for objects without a context reference
        #[arg(long = "plane-url", env = "APIARY_PLANE_URL")]
        plane_url: Option<String>,
        #[arg(long = "plane-token", env = "APIARY_PLANE_TOKEN", hide_env_values = true)]
        plane_token: Option<String>,
        #[arg(long = "plane-org", env = "APIARY_PLANE_ORG", default_value = "DEFAULT")]
        plane_org: String,
        #[arg(long = "plane-env", env = "APIARY_PLANE_ENV", default_value = "DEFAULT")]
        plane_env: String,
    },
    /// Run admission checks on a manifest file
    Validate {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
    },
    /// Reconcile a manifest file against an in-memory plane and print what would be shipped
    Materialize {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
        #[arg(long = "timeout-secs", default_value_t = 30)]
        timeout_secs: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("APIARY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("APIARY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid APIARY_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_manifest(file: &PathBuf, namespace: &str) -> Result<Vec<apiary_core::Resource>> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    offline::load(&text, namespace).with_context(|| format!("decoding {}", file.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { namespace, workers, plane_url, plane_token, plane_org, plane_env } => {
            let mut settings = Settings::from_env();
            if namespace.is_some() { settings.watch_namespace = namespace; }
            if let Some(w) = workers { settings.workers = w.max(1); }

            let client = kube::Client::try_default().await.context("connecting to the cluster")?;
            let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone(), settings.watch_namespace.clone()));
            let secrets: Arc<dyn SecretLookup> = Arc::new(KubeSecrets::new(client.clone()));
            let mut planes = ContextPlanes::new(store.clone(), secrets.clone(), settings.remote_timeout);
            match (plane_url, plane_token) {
                (Some(url), Some(token)) => {
                    let plane = HttpPlane::new(&url, &plane_org, &plane_env, PlaneAuth::Bearer(token), settings.remote_timeout)?;
                    info!(url = %url, org = %plane_org, env = %plane_env, "default management plane configured");
                    planes = planes.with_fallback(Arc::new(plane));
                }
                (Some(_), None) => warn!("APIARY_PLANE_URL set without a token; objects without a context stay local"),
                _ => {}
            }

            let reconciler = build(store, Arc::new(planes), secrets, &settings).await?;
            let (tx, rx) = mpsc::channel(settings.queue_cap);
            let mut watchers = spawn_watchers(client, settings.watch_namespace.clone(), tx, Duration::from_secs(5));
            let stats = Runner::new(reconciler, &settings)
                .run(rx, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "ctrl-c handler failed; running until the feed closes");
                        std::future::pending::<()>().await;
                    }
                })
                .await;
            watchers.abort_all();
            while watchers.join_next().await.is_some() {}
            info!(attempts = stats.attempts, errors = stats.errors, requeues = stats.requeues, "run finished");
        }
        Commands::Validate { file, namespace } => {
            let objs = read_manifest(&file, &namespace)?;
            let verdicts = offline::validate(&objs).await;
            match cli.output {
                Output::Human => {
                    for v in &verdicts {
                        match &v.error {
                            None => println!("ok        {:<18} {}/{}", v.kind, v.namespace, v.name),
                            Some(e) => println!("rejected  {:<18} {}/{}: {}", v.kind, v.namespace, v.name, e),
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&verdicts)?),
            }
            let rejected = verdicts.iter().filter(|v| v.error.is_some()).count();
            if rejected > 0 {
                bail!("{} of {} objects rejected", rejected, verdicts.len());
            }
        }
        Commands::Materialize { file, namespace, timeout_secs } => {
            let objs = read_manifest(&file, &namespace)?;
            let out = offline::materialize(objs, Duration::from_secs(timeout_secs)).await?;
            match cli.output {
                Output::Human => {
                    for m in &out {
                        println!("# {} {}/{} ({:?})", m.kind, m.namespace, m.name, m.phase);
                        if let Some(msg) = &m.message { println!("# {}", msg); }
                        if let Some(p) = &m.payload { println!("{}", serde_json::to_string_pretty(p)?); }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
            }
        }
    }
    Ok(())
}
