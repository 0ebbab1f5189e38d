use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::core::DynamicObject;
use kubemux_core::{EventKind, Handler, ResourceResolver, WatchSpec};
use kubemux_dispatch::{Dispatcher, DispatcherConfig};
use kubemux_kubehub::{object_key, KubeCacheFactory, KubeResolver};
use kubemux_queue::BackoffPolicy;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kubemuxctl", version, about = "Multiplex Kubernetes watches into one handler queue")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch one or more GVKs and print every dispatched event
    Watch(WatchArgs),
    /// Resolve a GVK through discovery and print its resource
    Resolve {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
}

#[derive(clap::Args, Debug)]
struct WatchArgs {
    /// GVK keys, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
    #[arg(required = true)]
    gvks: Vec<String>,

    /// Namespace to scope namespaced kinds to (default: all namespaces)
    #[arg(long = "ns", env = "KUBEMUX_NAMESPACE")]
    namespace: Option<String>,

    /// Label selector applied to every watch
    #[arg(short = 'l', long = "selector", env = "KUBEMUX_SELECTOR")]
    selector: Option<String>,

    /// Re-deliver every cached object as an update this often
    #[arg(long = "resync-secs", env = "KUBEMUX_RESYNC_SECS")]
    resync_secs: Option<u64>,

    /// Retries after a failed attempt; negative retries forever
    #[arg(long = "max-retries", env = "KUBEMUX_MAX_RETRIES", default_value_t = 5, allow_negative_numbers = true)]
    max_retries: i64,

    /// Concurrent handler workers
    #[arg(long = "workers", env = "KUBEMUX_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Give up if caches have not synced after this long
    #[arg(long = "sync-timeout-secs", env = "KUBEMUX_SYNC_TIMEOUT_SECS")]
    sync_timeout_secs: Option<u64>,

    /// Fail a handler call running longer than this
    #[arg(long = "handler-timeout-secs", env = "KUBEMUX_HANDLER_TIMEOUT_SECS")]
    handler_timeout_secs: Option<u64>,

    /// First per-item retry delay
    #[arg(long = "backoff-base-ms", env = "KUBEMUX_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,

    /// Per-item retry delay cap
    #[arg(long = "backoff-max-ms", env = "KUBEMUX_BACKOFF_MAX_MS", default_value_t = 1_000_000)]
    backoff_max_ms: u64,
}

impl WatchArgs {
    fn config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_retries: self.max_retries,
            backoff: BackoffPolicy {
                base_delay_ms: self.backoff_base_ms,
                max_delay_ms: self.backoff_max_ms.max(self.backoff_base_ms),
                ..BackoffPolicy::default()
            },
            workers: self.workers.max(1),
            sync_timeout_ms: self.sync_timeout_secs.map(|s| s.saturating_mul(1000)),
            handler_timeout_ms: self.handler_timeout_secs.map(|s| s.saturating_mul(1000)),
            ..DispatcherConfig::default()
        }
    }

    fn specs(&self) -> Result<Vec<WatchSpec>> {
        self.gvks
            .iter()
            .map(|key| {
                let mut spec = WatchSpec::from_gvk_key(key)?;
                if let Some(ns) = &self.namespace {
                    spec = spec.namespace(ns.clone());
                }
                if let Some(sel) = &self.selector {
                    spec = spec.selector(sel.clone());
                }
                if let Some(secs) = self.resync_secs.filter(|s| *s > 0) {
                    spec = spec.resync(Duration::from_secs(secs));
                }
                Ok(spec)
            })
            .collect()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("KUBEMUX_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

/// Listener address for the Prometheus exporter; unset disables it.
fn metrics_addr(raw: Option<&str>) -> Result<Option<SocketAddr>> {
    raw.filter(|s| !s.is_empty())
        .map(|s| s.parse::<SocketAddr>().with_context(|| format!("KUBEMUX_METRICS_ADDR={} is not host:port", s)))
        .transpose()
}

fn init_metrics() {
    let raw = std::env::var("KUBEMUX_METRICS_ADDR").ok();
    let installed = metrics_addr(raw.as_deref()).and_then(|addr| match addr {
        Some(sock) => {
            PrometheusBuilder::new().with_http_listener(sock).install().context("installing metrics exporter")?;
            Ok(Some(sock))
        }
        None => Ok(None),
    });
    match installed {
        Ok(Some(sock)) => info!(addr = %sock, "serving Prometheus metrics"),
        Ok(None) => {}
        Err(e) => warn!(error = %format!("{:#}", e), "metrics disabled"),
    }
}

/// Prints each delivered event to stdout.
struct Printer {
    output: Output,
}

#[async_trait::async_trait]
impl Handler<DynamicObject> for Printer {
    async fn handle(
        &self,
        _ctx: &CancellationToken,
        event: EventKind,
        obj: Arc<DynamicObject>,
        retries: usize,
    ) -> anyhow::Result<()> {
        let key = object_key(&obj).map(|k| k.to_string()).unwrap_or_else(|| "<unnamed>".to_string());
        let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
        match self.output {
            Output::Human => {
                let sign = match event {
                    EventKind::Add => '+',
                    EventKind::Update => '~',
                    EventKind::Delete => '-',
                };
                let rv = obj.metadata.resource_version.as_deref().unwrap_or("");
                println!("{} {} {} rv={}", sign, kind, key, rv);
            }
            Output::Json => {
                let line = serde_json::json!({
                    "event": event,
                    "kind": kind,
                    "key": key,
                    "retries": retries,
                    "object": obj.as_ref(),
                });
                println!("{}", serde_json::to_string(&line)?);
            }
        }
        Ok(())
    }
}

async fn watch(args: WatchArgs, output: Output) -> Result<()> {
    let specs = args.specs()?;
    let client = kube::Client::try_default().await.context("building kube client")?;
    let dispatcher = Dispatcher::new(
        args.config(),
        Arc::new(KubeResolver::new(client.clone())),
        Arc::new(KubeCacheFactory::new(client)),
        Arc::new(Printer { output }),
    );
    for spec in specs {
        let handle = dispatcher.register(spec).await?;
        if output == Output::Human {
            eprintln!("watching {} ({})", handle.resource.api_version(), handle.name);
        }
    }

    let ctx = CancellationToken::new();
    tokio::spawn({
        let ctx = ctx.clone();
        async move {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("interrupt received; shutting down");
            ctx.cancel();
        }
    });

    if let Err(e) = dispatcher.run(ctx).await {
        error!(error = %e, fatal = e.is_fatal_startup(), "dispatcher stopped");
        return Err(e.into());
    }
    Ok(())
}

async fn resolve(gvk: &str, output: Output) -> Result<()> {
    let spec = WatchSpec::from_gvk_key(gvk)?;
    let client = kube::Client::try_default().await.context("building kube client")?;
    let resource = KubeResolver::new(client)
        .resolve(&spec.api_version, &spec.kind)
        .await
        .with_context(|| format!("resolving {}", gvk))?;
    match output {
        Output::Human => {
            let scope = if resource.namespaced { "namespaced" } else { "cluster" };
            println!("{} • {} • {} • {}", resource.api_version(), resource.kind, resource.plural, scope);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&resource)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch(args) => {
            info!(gvks = ?args.gvks, ns = ?args.namespace, "watch invoked");
            watch(args, cli.output).await
        }
        Commands::Resolve { gvk } => resolve(&gvk, cli.output).await,
    }
}
