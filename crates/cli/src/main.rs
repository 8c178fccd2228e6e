use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use kinform_core::{InformerConfig, ListOptions, ListerWatcher, Object};
use kinform_kubehub::{KubeSource, SharedInformer};
use kinform_store::ResourceEventHandler;
use kube::core::DynamicObject;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kinformctl", version, about = "kinform CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "KINFORM_NAMESPACE")]
    namespace: Option<String>,

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
    /// Run a shared informer and print every add/update/delete
    Informer {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        #[arg(long = "gvk", env = "KINFORM_GVK", default_value = "apps/v1/Deployment")]
        gvk: String,
        /// Resync period in seconds; 0 disables resync
        #[arg(long = "resync-secs")]
        resync_secs: Option<u64>,
        /// Processor worker count
        #[arg(long = "workers")]
        workers: Option<usize>,
        #[arg(short = 'l', long = "selector")]
        label_selector: Option<String>,
        #[arg(long = "field-selector")]
        field_selector: Option<String>,
    },
    /// List objects once for a GVK key
    List {
        #[arg(long = "gvk", env = "KINFORM_GVK", default_value = "apps/v1/Deployment")]
        gvk: String,
        #[arg(short = 'l', long = "selector")]
        label_selector: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KINFORM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KINFORM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KINFORM_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Informer { gvk, resync_secs, workers, label_selector, field_selector } => {
            let mut config = InformerConfig::from_env();
            if let Some(secs) = resync_secs {
                config = config.with_resync_period(Duration::from_secs(secs));
            }
            if let Some(n) = workers {
                config = config.with_workers(n);
            }
            config.label_selector = label_selector;
            config.field_selector = field_selector;
            info!(gvk = %gvk, ns = ?ns, "informer invoked");
            run_informer(&gvk, ns, config).await
        }
        Commands::List { gvk, label_selector } => {
            info!(gvk = %gvk, ns = ?ns, "list invoked");
            let client = Client::try_default().await.context("building kube client")?;
            let source = KubeSource::for_gvk(client, &gvk, ns).await?;
            let opts = ListOptions { label_selector, field_selector: None };
            let page = source.list(&opts).await.with_context(|| format!("listing {}", gvk))?;
            let mut items = page.items;
            items.sort_by_key(|o| Object::key(o));
            match cli.output {
                Output::Human => print!("{}", render_table(&items, Utc::now())),
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
            Ok(())
        }
    }
}

async fn run_informer(gvk: &str, ns: Option<&str>, config: InformerConfig) -> Result<()> {
    let client = Client::try_default().await.context("building kube client")?;
    let source = KubeSource::for_gvk(client, gvk, ns).await?;
    let informer = Arc::new(SharedInformer::new(Arc::new(source), config));
    informer.add_event_handler(Arc::new(PrintHandler))?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; shutting down informer");
            }
            cancel.cancel();
        }
    });

    let mut runner = tokio::spawn({
        let informer = Arc::clone(&informer);
        let cancel = cancel.clone();
        async move { informer.run(cancel).await }
    });

    tokio::select! {
        synced = informer.wait_for_cache_sync(&cancel) => {
            if synced {
                info!(objects = informer.list().len(), "cache synced; watching");
            } else {
                // cancelled before the initial list was delivered
                let _ = runner.await;
                bail!("informer stopped before cache sync");
            }
        }
        res = &mut runner => return finish(res),
    }
    finish(runner.await)
}

fn finish(res: std::result::Result<std::result::Result<(), kinform_core::InformerError>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "informer failed");
            Err(anyhow!(e))
        }
        Err(e) => Err(anyhow!(e).context("informer task panicked")),
    }
}

struct PrintHandler;

impl ResourceEventHandler<DynamicObject> for PrintHandler {
    fn on_add(&self, obj: &DynamicObject) -> Result<()> {
        println!("{}", event_line("ADDED", obj));
        Ok(())
    }

    fn on_update(&self, _old: &DynamicObject, new: &DynamicObject) -> Result<()> {
        println!("{}", event_line("UPDATED", new));
        Ok(())
    }

    fn on_delete(&self, obj: &DynamicObject) -> Result<()> {
        println!("{}", event_line("DELETED", obj));
        Ok(())
    }
}

fn event_line(verb: &str, obj: &DynamicObject) -> String {
    let key = Object::key(obj);
    let rv = Object::resource_version(obj).map(|v| v.0).unwrap_or_else(|| "-".to_string());
    let ns = key.namespace.as_deref().unwrap_or("-");
    let mut line = format!("{:<8} {} ns={} rv={}", verb, key.name, ns, rv);
    if let Some(desired) = obj.data.pointer("/spec/replicas").and_then(|v| v.as_i64()) {
        let ready = obj.data.pointer("/status/readyReplicas").and_then(|v| v.as_i64()).unwrap_or(0);
        line.push_str(&format!(" replicas={}/{}", ready, desired));
    }
    line
}

/// READY, UP-TO-DATE and AVAILABLE for workloads that carry `spec.replicas`.
fn replica_columns(obj: &DynamicObject) -> Option<[String; 3]> {
    let desired = obj.data.pointer("/spec/replicas").and_then(|v| v.as_i64())?;
    let status = |field: &str| obj.data.pointer(&format!("/status/{}", field)).and_then(|v| v.as_i64()).unwrap_or(0);
    Some([
        format!("{}/{}", status("readyReplicas"), desired),
        status("updatedReplicas").to_string(),
        status("availableReplicas").to_string(),
    ])
}

fn render_table(items: &[DynamicObject], now: DateTime<Utc>) -> String {
    if items.is_empty() {
        return "No resources found.\n".to_string();
    }
    let workloads = items.iter().any(|o| replica_columns(o).is_some());
    let mut out = format!("{:<20} {:<32} {:<12} ", "NAMESPACE", "NAME", "RV");
    if workloads {
        out.push_str(&format!("{:<7} {:<10} {:<9} ", "READY", "UP-TO-DATE", "AVAILABLE"));
    }
    out.push_str("AGE\n");
    for o in items {
        let key = Object::key(o);
        let rv = Object::resource_version(o).map(|v| v.0).unwrap_or_else(|| "-".to_string());
        let created = o.metadata.creation_timestamp.as_ref().map(|t| t.0);
        out.push_str(&format!("{:<20} {:<32} {:<12} ", key.namespace.as_deref().unwrap_or("-"), key.name, rv));
        if workloads {
            let [ready, updated, available] = replica_columns(o).unwrap_or_else(|| ["-".into(), "-".into(), "-".into()]);
            out.push_str(&format!("{:<7} {:<10} {:<9} ", ready, updated, available));
        }
        out.push_str(&render_age(created, now));
        out.push('\n');
    }
    out
}

fn render_age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (now - created).num_seconds().max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
