use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tern_core::{LabelSelector, ListOptions, Resource};
use tern_informer::{CancellationToken, HandlerFns, InformerConfig, InformerFactory};
use tern_kubehub::{PodNetwork, PodNetworkInformer};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ternctl", version, about = "Tern CLI: cached PodNetwork queries")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    source: SourceArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Label selector, e.g. "tier=fast,!legacy"
    #[arg(short = 'l', long = "selector", global = true)]
    selector: Option<String>,

    /// Field selector passed through to the API server
    #[arg(long = "field-selector", global = true)]
    field_selector: Option<String>,

    /// Periodic resync in seconds (0 disables)
    #[arg(long = "resync-secs", env = "TERN_RESYNC_SECS", global = true)]
    resync_secs: Option<u64>,

    /// How long to wait for the initial List to land in the cache
    #[arg(long = "wait-secs", env = "TERN_WAIT_SECS", default_value_t = 8, global = true)]
    wait_secs: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List PodNetworks from a freshly synced cache
    Ls,
    /// Show one PodNetwork by name
    Get { name: String },
    /// Print +/~/- lines for every change until Ctrl-C
    Watch,
}

fn init_tracing() {
    let env = std::env::var("TERN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TERN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TERN_METRICS_ADDR; expected host:port");
        }
    }
}

struct Running {
    networks: PodNetworkInformer,
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Running {
    async fn shutdown(self) {
        self.stop.cancel();
        for h in self.handles {
            if let Err(e) = h.await {
                warn!(error = %e, "informer task failed");
            }
        }
    }
}

fn informer_config(args: &SourceArgs) -> InformerConfig {
    let mut config = InformerConfig::from_env().with_list_options(ListOptions {
        label_selector: args.selector.clone(),
        field_selector: args.field_selector.clone(),
    });
    if let Some(secs) = args.resync_secs {
        config = config.with_resync(Some(Duration::from_secs(secs)));
    }
    config
}

fn parse_selector(raw: Option<&str>) -> Result<LabelSelector> {
    match raw {
        Some(s) => LabelSelector::from_str(s).with_context(|| format!("invalid label selector {:?}", s)),
        None => Ok(LabelSelector::everything()),
    }
}

async fn start(args: &SourceArgs) -> Result<Running> {
    let client = kube::Client::try_default().await.context("building kube client")?;
    let factory = InformerFactory::new(informer_config(args));
    let networks = PodNetworkInformer::from_factory(&factory, client, None);
    let stop = CancellationToken::new();
    let handles = factory.start(&stop);

    let wait = Duration::from_secs(args.wait_secs);
    match tokio::time::timeout(wait, factory.wait_for_cache_sync(&stop)).await {
        Ok(results) => {
            for (name, synced) in results.iter().filter(|(_, s)| !*s) {
                warn!(informer = %name, synced, "informer did not sync");
            }
        }
        Err(_) => warn!(wait_secs = args.wait_secs, "initial sync timed out; showing partial cache"),
    }
    Ok(Running { networks, stop, handles })
}

fn render_age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = now.signed_duration_since(created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

fn print_table(items: &[Arc<PodNetwork>]) {
    let now = Utc::now();
    println!("{:<28} {:<8} {:<32} {:<8} AGE", "NAME", "ENABLED", "DEVICE-CLASS", "READY");
    for pn in items {
        let created = pn.metadata.creation_timestamp.as_ref().map(|t| t.0);
        println!(
            "{:<28} {:<8} {:<32} {:<8} {}",
            pn.name(),
            pn.spec.enabled,
            pn.spec.device_class_name.as_deref().unwrap_or("-"),
            pn.ready().unwrap_or("-"),
            render_age(created, now)
        );
    }
}

fn print_event(sign: &str, pn: &PodNetwork, output: Output) {
    match output {
        Output::Human => println!("{} {}", sign, pn.key()),
        Output::Json => match serde_json::to_string(&serde_json::json!({ "event": sign, "object": pn })) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, key = %pn.key(), "failed to encode event"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let selector = parse_selector(cli.source.selector.as_deref())?;

    match cli.command {
        Commands::Ls => {
            info!(selector = %selector, "ls invoked");
            let running = start(&cli.source).await?;
            let items = running.networks.lister().list(&selector);
            match cli.output {
                Output::Human => print_table(&items),
                Output::Json => {
                    let objs: Vec<&PodNetwork> = items.iter().map(|p| &**p).collect();
                    println!("{}", serde_json::to_string_pretty(&objs)?);
                }
            }
            running.shutdown().await;
        }
        Commands::Get { name } => {
            info!(name = %name, "get invoked");
            let running = start(&cli.source).await?;
            let found = running.networks.lister().get(&name);
            running.shutdown().await;
            let pn = found.ok_or_else(|| anyhow!("podnetwork {:?} not found", name))?;
            match cli.output {
                Output::Human => print_table(&[pn]),
                Output::Json => println!("{}", serde_json::to_string_pretty(&*pn)?),
            }
        }
        Commands::Watch => {
            info!(selector = %selector, "watch invoked");
            let running = start(&cli.source).await?;
            let output = cli.output;
            let matches = move |pn: &Arc<PodNetwork>| selector.matches(pn.labels());
            let (m_add, m_upd, m_del) = (matches.clone(), matches.clone(), matches);
            let handlers = HandlerFns::new()
                .on_add(move |pn: &Arc<PodNetwork>| {
                    if m_add(pn) {
                        print_event("+", pn, output)
                    }
                })
                .on_update(move |old: &Arc<PodNetwork>, new: &Arc<PodNetwork>| {
                    // a re-List or resync replays unchanged objects
                    if m_upd(new) && old.resource_version() != new.resource_version() {
                        print_event("~", new, output)
                    }
                })
                .on_delete(move |pn: &Arc<PodNetwork>| {
                    if m_del(pn) {
                        print_event("-", pn, output)
                    }
                });
            let informer = running.networks.informer();
            let registration = informer.add_handler(handlers);
            info!(handler = %registration.id(), replayed = registration.replayed(), "watching podnetworks");

            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("Ctrl-C received; shutting down watch");
            informer.remove_handler(&registration);
            running.shutdown().await;
        }
    }

    Ok(())
}
