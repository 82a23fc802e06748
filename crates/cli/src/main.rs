#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use ufleet_api::{assemble, ControlPlane, FileResolver};
use ufleet_core::config::Config;
use ufleet_core::kind::parse_kind_list;
use ufleet_core::{Kind, ResourceMeta};
use ufleet_kubehub::{ConfigResolver, KubeConnector, StaticResolver};
use ufleet_persist::SqliteKv;
use ufleet_store::{KvBackend, MemoryKv};

#[derive(Parser, Debug)]
#[command(name = "ufleetd", version, about = "ufleet control plane")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

/// Flags override the `UFLEET_*` environment, which overrides the defaults.
#[derive(Args, Debug)]
struct Settings {
    /// SQLite database holding the store and the registries [env: UFLEET_DB_PATH]
    #[arg(long = "db", global = true)]
    db: Option<String>,
    /// Keep the store in memory; nothing survives the process
    #[arg(long = "memory", global = true)]
    memory: bool,
    /// YAML file mapping group/workspace to cluster connection data
    #[arg(long = "resolver-file", env = "UFLEET_RESOLVER_FILE", global = true)]
    resolver_file: Option<PathBuf>,
    #[arg(long, global = true)]
    resolver_token: Option<String>,
    #[arg(long, global = true)]
    store_root: Option<String>,
    #[arg(long, global = true)]
    group_registry: Option<String>,
    #[arg(long, global = true)]
    workspace_registry: Option<String>,
    /// Comma separated kinds to manage (default: all)
    #[arg(long, global = true)]
    kinds: Option<String>,
    #[arg(long, global = true)]
    watch_retry_ms: Option<u64>,
    #[arg(long, global = true)]
    request_timeout_secs: Option<u64>,
    #[arg(long, global = true)]
    cache_sync_timeout_secs: Option<u64>,
    #[arg(long, global = true)]
    event_queue_cap: Option<usize>,
    #[arg(long, global = true)]
    watch_buffer: Option<usize>,
    #[arg(long, global = true)]
    max_definition_bytes: Option<usize>,
    #[arg(long, global = true)]
    repair_secs: Option<u64>,
}

fn overlay<T: Clone>(slot: &mut T, flag: &Option<T>) {
    if let Some(v) = flag {
        *slot = v.clone();
    }
}

impl Settings {
    fn config(&self) -> Result<Config> {
        let mut c = Config::from_env().context("reading UFLEET_* environment")?;
        if let Some(list) = &self.kinds {
            c.kinds = parse_kind_list(list).context("parsing --kinds")?;
        }
        if c.kinds.is_empty() {
            anyhow::bail!("no kinds to manage");
        }
        overlay(&mut c.store_root, &self.store_root);
        overlay(&mut c.group_registry, &self.group_registry);
        overlay(&mut c.workspace_registry, &self.workspace_registry);
        overlay(&mut c.watch_retry_ms, &self.watch_retry_ms);
        overlay(&mut c.request_timeout_secs, &self.request_timeout_secs);
        overlay(&mut c.cache_sync_timeout_secs, &self.cache_sync_timeout_secs);
        overlay(&mut c.event_queue_cap, &self.event_queue_cap);
        overlay(&mut c.watch_buffer, &self.watch_buffer);
        overlay(&mut c.max_definition_bytes, &self.max_definition_bytes);
        overlay(&mut c.repair_secs, &self.repair_secs);
        overlay(&mut c.resolver_token, &self.resolver_token);
        if self.db.is_some() {
            c.db_path = self.db.clone();
        }
        Ok(c)
    }

    fn open_kv(&self, config: &Config) -> Result<Arc<dyn KvBackend>> {
        if self.memory {
            warn!("in-memory store; state is lost on exit");
            return Ok(Arc::new(MemoryKv::new(config.watch_buffer)));
        }
        let kv = match &config.db_path {
            Some(path) => SqliteKv::open(path, config.watch_buffer),
            None => SqliteKv::open_default(config.watch_buffer),
        }
        .context("opening store database")?;
        Ok(Arc::new(kv))
    }

    fn resolver(&self) -> Result<Arc<dyn ConfigResolver>> {
        match &self.resolver_file {
            Some(path) => {
                let r = FileResolver::load(path).with_context(|| format!("loading resolver file {}", path.display()))?;
                Ok(Arc::new(r))
            }
            None => {
                warn!("no resolver file; no workspace can be attached to a cluster");
                Ok(Arc::new(StaticResolver::new()))
            }
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Boot the control plane and run its watch loops until Ctrl-C
    Serve,
    /// Run one registry reconciliation pass and print the mutation count
    Sweep,
    /// List the kinds this build knows about
    Kinds,
    /// Dump the stored tree of one kind
    Ls {
        /// Kind name or plural, e.g. ConfigMap or deployments
        kind: String,
    },
}

fn init_tracing() {
    let env = std::env::var("UFLEET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("UFLEET_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "UFLEET_METRICS_ADDR is not a socket address");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve => serve(&cli.settings).await,
        Commands::Sweep => sweep(&cli.settings, cli.output).await,
        Commands::Kinds => kinds(cli.output),
        Commands::Ls { kind } => ls(&cli.settings, kind, cli.output).await,
    }
}

async fn serve(settings: &Settings) -> Result<()> {
    let config = settings.config()?;
    let kv = settings.open_kv(&config)?;
    let resolver = settings.resolver()?;
    let plane = ControlPlane::boot(config, kv, resolver, Arc::new(KubeConnector::default())).await?;

    if let Some(mut apps) = plane.take_app_events() {
        tokio::spawn(async move {
            while let Some(ev) = apps.recv().await {
                info!(app = %ev.app, kind = %ev.kind, group = %ev.group, workspace = %ev.workspace, resource = %ev.resource, action = ?ev.action, "application resource changed");
            }
        });
    }

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    plane.shutdown();
    Ok(())
}

async fn sweep(settings: &Settings, output: Output) -> Result<()> {
    let config = settings.config()?;
    let kv = settings.open_kv(&config)?;
    let (store, _, reconciler) = assemble(&config, kv, Arc::new(StaticResolver::new()), Arc::new(KubeConnector::default()));
    for &kind in &config.kinds {
        store.ensure_kind(kind).await?;
    }
    let mutations = reconciler.sweep().await.context("registry sweep")?;
    match output {
        Output::Human => println!("{} store mutations", mutations),
        Output::Json => println!("{}", serde_json::json!({ "mutations": mutations })),
    }
    Ok(())
}

fn kinds(output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for k in Kind::ALL {
                println!("{:<26} {:<28} {}", k.as_str(), k.api().api_version(), k.api().plural);
            }
        }
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Row {
                kind: &'static str,
                api_version: String,
                plural: &'static str,
            }
            let rows: Vec<Row> =
                Kind::ALL.iter().map(|k| Row { kind: k.as_str(), api_version: k.api().api_version(), plural: k.api().plural }).collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

async fn ls(settings: &Settings, kind: &str, output: Output) -> Result<()> {
    let kind: Kind = kind.parse()?;
    let config = settings.config()?;
    let kv = settings.open_kv(&config)?;
    let (store, _, _) = assemble(&config, kv, Arc::new(StaticResolver::new()), Arc::new(KubeConnector::default()));

    let mut tree: BTreeMap<String, BTreeMap<String, Vec<ResourceMeta>>> = BTreeMap::new();
    for (group, workspaces) in store.get_resource_all_group(kind).await? {
        let g = tree.entry(group).or_default();
        for (ws, records) in workspaces {
            let mut metas = Vec::with_capacity(records.len());
            for (name, raw) in records {
                match ResourceMeta::from_record(&raw) {
                    Ok(m) => metas.push(m),
                    Err(e) => warn!(%kind, workspace = %ws, %name, error = %e, "skipping undecodable record"),
                }
            }
            g.insert(ws, metas);
        }
    }

    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&tree)?),
        Output::Human => {
            for (group, workspaces) in &tree {
                println!("{}", group);
                for (ws, metas) in workspaces {
                    println!("  {}", ws);
                    for m in metas {
                        println!("    {:<40} user={} app={} created={}", m.name, m.user, m.app, m.create_time.to_rfc3339());
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_defaults() {
        let cli = Cli::try_parse_from(["ufleetd", "--watch-retry-ms", "5", "--kinds", "ConfigMap,Secret", "--db", "/tmp/x.db", "kinds"]).unwrap();
        let c = cli.settings.config().unwrap();
        assert_eq!(c.watch_retry_ms, 5);
        assert_eq!(c.kinds, vec![Kind::ConfigMap, Kind::Secret]);
        assert_eq!(c.db_path.as_deref(), Some("/tmp/x.db"));
        assert!(Cli::try_parse_from(["ufleetd", "--kinds", "Widget", "kinds"]).unwrap().settings.config().is_err());
    }
}
