use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use deckhand_apply::{
    InstantiationRequest, InstantiationResult, KindRegistry, LegacyInstantiator, NamespaceBundle, ReleaseData, ReleaseManager,
    TracingAudit,
};
use deckhand_core::manifest::{parse_specs, ParseLimits};
use deckhand_core::store::CacheBackend;
use deckhand_core::{AppRelease, EngineConfig, ResourceData, ResourceInstance};
use deckhand_kubehub::{ClientCache, ClientKey, CurrentContext, ResourceDiscovery};
use deckhand_persist::SqliteStore;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "deckhandctl", version, about = "Deckhand release engine CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database (default: DECKHAND_DB_PATH or ~/.deckhand/deckhand.db)
    #[arg(long = "db", global = true, env = "DECKHAND_DB_PATH")]
    db: Option<String>,

    /// Caller token; clients are cached per (token, project, cluster)
    #[arg(long = "token", global = true, env = "DECKHAND_TOKEN", default_value = "local")]
    token: String,

    #[arg(long = "project", global = true, env = "DECKHAND_PROJECT", default_value = "default")]
    project: String,

    /// Concurrent tasks per release
    #[arg(long = "fanout", global = true)]
    fanout: Option<usize>,

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
    /// Resolve a kind to its served group/version/plural
    Discover {
        kind: String,
        /// Pin the lookup to one api version, e.g. "apps/v1"
        #[arg(long = "api-version")]
        api_version: Option<String>,
        #[arg(long = "cluster", default_value = "current")]
        cluster: String,
        /// Ignore cached discovery
        #[arg(long = "refresh", action = ArgAction::SetTrue)]
        refresh: bool,
    },
    /// Apply a namespace bundle in kind-priority order, rolling back on failure
    Instantiate {
        /// Multi-document YAML
        bundle: String,
        #[arg(long = "ns-id")]
        ns_id: String,
        #[arg(long = "cluster", default_value = "current")]
        cluster: String,
        /// Target namespace (default: the ns id)
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Update existing objects; failures are not rolled back
        #[arg(long = "update", action = ArgAction::SetTrue)]
        update: bool,
    },
    /// Releases applied concurrently and tracked as one unit
    Release {
        #[command(subcommand)]
        command: ReleaseCommands,
    },
    /// Discovery cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ReleaseCommands {
    /// Create or update a release from a manifest file
    Apply {
        manifests: String,
        #[arg(long = "name")]
        name: String,
        #[arg(long = "cluster", default_value = "current")]
        cluster: String,
        #[arg(long = "ns")]
        namespace: String,
        #[arg(long = "template-id", default_value_t = 0)]
        template_id: i64,
        /// Template version recorded on every resource
        #[arg(long = "template-version", default_value = "")]
        template_version: String,
        #[arg(long = "revision", default_value_t = 0)]
        revision: i64,
        #[arg(long = "operator", env = "USER", default_value = "deckhandctl")]
        operator: String,
    },
    /// Delete every tracked object, then the release
    Delete {
        #[arg(long = "name")]
        name: String,
        #[arg(long = "cluster", default_value = "current")]
        cluster: String,
        #[arg(long = "ns")]
        namespace: String,
        /// Poll until objects are gone (DECKHAND_DELETE_WAIT_SECS)
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
        #[arg(long = "operator", env = "USER", default_value = "deckhandctl")]
        operator: String,
    },
    /// Show a release and its resources
    Status {
        #[arg(long = "name")]
        name: String,
        #[arg(long = "cluster", default_value = "current")]
        cluster: String,
        #[arg(long = "ns")]
        namespace: String,
    },
    List {
        #[arg(long = "cluster", default_value = "current")]
        cluster: String,
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
    /// Replace one live object out of band; the resource is marked as edited
    Edit {
        resource_id: i64,
        manifest: String,
        #[arg(long = "operator", env = "USER", default_value = "deckhandctl")]
        operator: String,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Drop the persisted discovery for a cluster
    Invalidate {
        #[arg(long = "cluster", default_value = "current")]
        cluster: String,
    },
}

fn init_tracing() {
    let env = std::env::var("DECKHAND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DECKHAND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DECKHAND_METRICS_ADDR; expected host:port");
        }
    }
}

/// Shared handles for one invocation.
struct Engine {
    config: EngineConfig,
    store: Arc<SqliteStore>,
    clients: Arc<ClientCache>,
    token: String,
    project: String,
}

impl Engine {
    fn open(cli: &Cli) -> Result<Self> {
        let mut config = EngineConfig::from_env();
        if let Some(db) = &cli.db {
            config.db_path = db.clone();
        }
        if let Some(n) = cli.fanout {
            config.fanout = n.max(1);
        }
        if let Some(parent) = std::path::Path::new(&config.db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = Arc::new(SqliteStore::open(&config.db_path)?);
        let clients = Arc::new(ClientCache::new(Arc::new(CurrentContext { request_timeout: config.request_timeout }), store.clone()));
        Ok(Self { config, store, clients, token: cli.token.clone(), project: cli.project.clone() })
    }

    fn limits(&self) -> ParseLimits {
        ParseLimits::from(&self.config)
    }

    fn release_manager(&self) -> ReleaseManager {
        let scoped = Arc::new(self.clients.scoped(&self.token, &self.project));
        ReleaseManager::new(scoped, self.store.clone(), Arc::new(TracingAudit), &self.config)
    }

    fn find_release(&self, name: &str, cluster: &str, namespace: &str) -> Result<AppRelease> {
        self.release_manager()
            .get(name, cluster, namespace)?
            .ok_or_else(|| anyhow!("release {} not found in {}/{}", name, cluster, namespace))
    }
}

fn read_file(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path))
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn print_release(r: &AppRelease) {
    let msg = if r.message.is_empty() { "-" } else { r.message.as_str() };
    println!("{:<6} {:<24} {:<12} {:<16} {:<9} {}", r.id, r.name, r.cluster_id, r.namespace, r.status.as_str(), msg);
}

fn print_resources(items: &[ResourceInstance]) {
    println!("ID     KIND                 NAME                         VERSION    REV  EDITED");
    for r in items {
        let version = if r.version.is_empty() { "-" } else { r.version.as_str() };
        println!("{:<6} {:<20} {:<28} {:<10} {:<4} {}", r.id, r.kind, r.name, version, r.revision, if r.edited { "yes" } else { "no" });
    }
}

fn print_instantiation(res: &InstantiationResult) {
    for ok in &res.success {
        println!("ok      {}", ok.ns_id);
    }
    for f in &res.failed {
        println!("failed  {}  {}: {}", f.ns_id, f.res_type, f.err_msg);
        for rb in &f.rollback {
            let state = match (rb.attempted, rb.succeeded) {
                (true, true) => "rolled back",
                (true, false) => "rollback failed",
                _ => "skipped",
            };
            match &rb.error {
                Some(e) if !rb.succeeded => println!("          {} {}: {} ({})", state, rb.kind, rb.name, e),
                _ => println!("          {} {}: {}", state, rb.kind, rb.name),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let engine = Engine::open(&cli)?;

    match &cli.command {
        Commands::Discover { kind, api_version, cluster, refresh } => {
            info!(kind = %kind, api_version = ?api_version, cluster = %cluster, "discover invoked");
            let client = engine.clients.get_or_build(&ClientKey::new(&engine.token, &engine.project, cluster)).await?;
            if *refresh {
                client.discovery().refresh().await?;
            }
            let rt = client.discovery().get_preferred_resource(kind, api_version.as_deref()).await?;
            match cli.output {
                Output::Human => {
                    let scope = if rt.namespaced { "namespaced" } else { "cluster" };
                    println!("{} • {} • {} • {}", rt.api_version(), rt.kind, rt.plural, scope);
                }
                Output::Json => print_json(&rt)?,
            }
        }
        Commands::Instantiate { bundle, ns_id, cluster, namespace, update } => {
            let namespace = namespace.as_deref().unwrap_or(ns_id);
            info!(ns_id = %ns_id, cluster = %cluster, namespace, update, "instantiate invoked");
            let bundle = NamespaceBundle::from_yaml(ns_id, cluster, namespace, &read_file(bundle)?, engine.limits())?;
            let registry = KindRegistry::with_defaults(Arc::new(engine.clients.scoped(&engine.token, &engine.project)));
            let inst = LegacyInstantiator::new(registry, engine.store.clone());
            let res = inst.instantiate(&InstantiationRequest { bundles: vec![bundle], is_update: *update }).await;
            match cli.output {
                Output::Human => print_instantiation(&res),
                Output::Json => print_json(&res)?,
            }
            if !res.is_success() {
                bail!("instantiation failed for {} namespace(s)", res.failed.len());
            }
        }
        Commands::Release { command } => run_release(&engine, command, cli.output).await?,
        Commands::Cache { command: CacheCommands::Invalidate { cluster } } => {
            // drop any live client too so this process would rediscover
            engine.clients.invalidate(&ClientKey::new(&engine.token, &engine.project, cluster));
            let key = ResourceDiscovery::cache_key_for(cluster);
            engine.store.delete(&key)?;
            info!(key = %key, "discovery cache invalidated");
            if cli.output == Output::Json {
                print_json(&serde_json::json!({"invalidated": key}))?;
            } else {
                println!("invalidated {}", key);
            }
        }
    }

    Ok(())
}

async fn run_release(engine: &Engine, command: &ReleaseCommands, output: Output) -> Result<()> {
    match command {
        ReleaseCommands::Apply { manifests, name, cluster, namespace, template_id, template_version, revision, operator } => {
            let specs = parse_specs(&read_file(manifests)?, Some(namespace), engine.limits())?;
            let resource_list = specs
                .into_iter()
                .map(|s| ResourceData {
                    kind: s.kind,
                    name: s.name,
                    namespace: s.namespace.unwrap_or_else(|| namespace.clone()),
                    manifest: s.manifest,
                    version: template_version.clone(),
                    revision: *revision,
                })
                .collect();
            let data = ReleaseData {
                name: name.clone(),
                cluster_id: cluster.clone(),
                namespace: namespace.clone(),
                template_id: *template_id,
                resource_list,
            };
            let rel = engine.release_manager().update_or_create(operator, &data).await?;
            match output {
                Output::Human => print_release(&rel),
                Output::Json => print_json(&rel)?,
            }
        }
        ReleaseCommands::Delete { name, cluster, namespace, wait, operator } => {
            let rel = engine.find_release(name, cluster, namespace)?;
            let mut mgr = engine.release_manager();
            if *wait {
                mgr = mgr.with_delete_wait(engine.config.delete_wait, engine.config.delete_poll);
            }
            mgr.delete(operator, rel.id).await?;
            match output {
                Output::Human => println!("deleted {}", rel.name),
                Output::Json => print_json(&serde_json::json!({"deleted": rel.id}))?,
            }
        }
        ReleaseCommands::Status { name, cluster, namespace } => {
            let rel = engine.find_release(name, cluster, namespace)?;
            let resources = engine.release_manager().resources(rel.id)?;
            match output {
                Output::Human => {
                    print_release(&rel);
                    println!();
                    print_resources(&resources);
                }
                Output::Json => print_json(&serde_json::json!({"release": rel, "resources": resources}))?,
            }
        }
        ReleaseCommands::List { cluster, namespace } => {
            let items = engine.release_manager().list(cluster, namespace.as_deref())?;
            match output {
                Output::Human => {
                    println!("ID     NAME                     CLUSTER      NAMESPACE        STATUS    MESSAGE");
                    for r in &items {
                        print_release(r);
                    }
                }
                Output::Json => print_json(&items)?,
            }
        }
        ReleaseCommands::Edit { resource_id, manifest, operator } => {
            let mut docs = parse_specs(&read_file(manifest)?, None, engine.limits())?;
            if docs.len() != 1 {
                bail!("expected exactly one manifest in {}, found {}", manifest, docs.len());
            }
            let body = docs.remove(0).manifest;
            let res = engine.release_manager().edit(operator, *resource_id, body).await?;
            match output {
                Output::Human => print_resources(std::slice::from_ref(&res)),
                Output::Json => print_json(&res)?,
            }
        }
    }
    Ok(())
}
