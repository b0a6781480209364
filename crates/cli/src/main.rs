use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use meridian_api::{InProcRepository, ListQuery, ResourceRepository, WriteContext};
use meridian_core::{parse_selectors, split_api_version, ApiError, Gvp, MeridianConfig, MeridianError, Resource, ResourceRef};
use meridian_patch::{Patch, PatchType};
use meridian_persist::SqliteKv;
use meridian_schema::{builtin_definitions, ResourceDefinition};
use meridian_watch::{EventBus, WatchFilter};
use meridian_webhook::HttpWebhookClient;
use serde::Deserialize;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "meridianctl", version, about = "Meridian resource repository CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for namespaced kinds
    #[arg(short = 'n', long = "ns", global = true)]
    namespace: Option<String>,

    /// Acting user recorded in admission reviews
    #[arg(long = "as", global = true, default_value = "meridianctl")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create resources from a YAML/JSON file, replacing those that already exist
    Apply {
        #[arg(short = 'f', long = "file")]
        file: String,
    },
    /// Print one resource
    Get {
        /// Kind key, e.g. "example.io/v1/widgets"
        gvp: String,
        name: String,
    },
    /// List resources of a kind
    Ls {
        gvp: String,
        /// Label selectors, e.g. "env=prod,tier in (api,web)"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        /// One of id, createdAt, lastModified, name, namespace
        #[arg(long = "order-by")]
        order_by: Option<String>,
        #[arg(long = "desc")]
        desc: bool,
        #[arg(long = "limit")]
        limit: Option<usize>,
        /// Continuation token from a previous page
        #[arg(long = "continue")]
        continuation: Option<String>,
    },
    /// Patch a resource
    Patch {
        gvp: String,
        name: String,
        /// json | merge | strategic
        #[arg(long = "type", default_value = "merge")]
        patch_type: String,
        /// Patch document (JSON)
        #[arg(short = 'p', long = "patch")]
        patch: String,
        #[arg(long = "subresource")]
        sub_resource: Option<String>,
    },
    /// Delete a resource
    Delete { gvp: String, name: String },
    /// Delete every resource in a namespace
    DeleteNs { namespace: String },
    /// Print committed changes until Ctrl-C
    Watch {
        gvp: String,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("MERIDIAN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MERIDIAN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid MERIDIAN_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_gvp(key: &str) -> Result<Gvp> {
    Gvp::parse(key).ok_or_else(|| anyhow!("invalid kind key {:?}; expected group/version/plural", key))
}

/// Plural for a body's apiVersion/kind: built-ins first, then stored definitions.
async fn plural_for(repo: &InProcRepository, resource: &Resource) -> Result<Gvp> {
    let (group, version) = split_api_version(&resource.api_version);
    let matches = |d: &ResourceDefinition| d.group().eq_ignore_ascii_case(&group) && d.kind().eq_ignore_ascii_case(&resource.kind);
    if let Some(d) = builtin_definitions().iter().find(|d| matches(*d)) {
        return Ok(d.gvp(&version));
    }
    let mut token = None;
    loop {
        let page = repo.list(ListQuery::new(Gvp::definitions()).continue_from(token)).await?;
        for r in &page.items {
            match ResourceDefinition::from_resource(r) {
                Ok(d) if matches(&d) => return Ok(d.gvp(&version)),
                Ok(_) => {}
                Err(e) => warn!(definition = %r.metadata.name, error = %e, "skipping malformed definition"),
            }
        }
        token = page.continuation;
        if token.is_none() { break; }
    }
    bail!("no definition for kind {} in {}", resource.kind, resource.api_version)
}

fn read_documents(path: &str) -> Result<Vec<Resource>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&text) {
        let value = serde_json::Value::deserialize(doc).with_context(|| format!("parsing {}", path))?;
        if value.is_null() { continue; }
        out.push(Resource::from_value(value)?);
    }
    Ok(out)
}

fn render_age(r: &Resource) -> String {
    let Some(created) = r.metadata.created_at else { return "-".to_string() };
    let mut secs = (Utc::now() - created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

fn print_rows(items: &[Resource]) {
    println!("{:<16} {:<32} {:<8} {}", "NAMESPACE", "NAME", "VERSION", "AGE");
    for r in items {
        let ns = r.metadata.namespace.as_deref().unwrap_or("-");
        println!("{:<16} {:<32} {:<8} {}", ns, r.metadata.name, r.state_version(), render_age(r));
    }
}

fn print_resource(output: Output, r: &Resource) -> Result<()> {
    match output {
        Output::Human => println!("{}", serde_yaml::to_string(r)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(r)?),
    }
    Ok(())
}

async fn apply_one(repo: &InProcRepository, ctx: &WriteContext, ns: Option<&str>, mut resource: Resource) -> Result<String> {
    if resource.metadata.namespace.is_none() {
        resource.metadata.namespace = ns.map(String::from);
    }
    let gvp = plural_for(repo, &resource).await?;
    let rref = ResourceRef::new(gvp.clone(), resource.metadata.namespace.as_deref(), resource.metadata.name.clone());
    let exists = !resource.metadata.name.is_empty() && repo.get(&rref).await.is_ok();
    if !exists {
        let created = repo.create(&gvp, resource, ctx).await?;
        return Ok(format!("{} {} created", gvp.plural, created.metadata.name));
    }
    match repo.replace(&rref, resource, ctx).await {
        Ok(w) => Ok(format!("{} {} replaced (+{} ~{} -{})", gvp.plural, w.resource.metadata.name, w.diff.adds, w.diff.updates, w.diff.removes)),
        Err(MeridianError::NotModified { .. }) => Ok(format!("{} {} unchanged", gvp.plural, rref.name)),
        Err(e) => Err(e.into()),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = MeridianConfig::from_env();
    let kv = Arc::new(SqliteKv::open_default()?);
    let client = Arc::new(HttpWebhookClient::new()?);
    let bus = EventBus::started();
    let repo = InProcRepository::new(kv, bus.clone(), client, cfg);
    let ctx = WriteContext::as_user(&cli.user);
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Apply { file } => {
            info!(file = %file, "apply invoked");
            for resource in read_documents(&file)? {
                println!("{}", apply_one(&repo, &ctx, ns, resource).await?);
            }
        }
        Commands::Get { gvp, name } => {
            let r = repo.get(&ResourceRef::new(parse_gvp(&gvp)?, ns, name)).await?;
            print_resource(cli.output, &r)?;
        }
        Commands::Ls { gvp, selector, order_by, desc, limit, continuation } => {
            let mut q = ListQuery::new(parse_gvp(&gvp)?).continue_from(continuation);
            if let Some(ns) = ns { q = q.in_namespace(ns); }
            if let Some(sel) = selector { q = q.with_selectors(parse_selectors(&sel)?); }
            if let Some(prop) = order_by { q = q.order_by(&prop, desc); }
            if let Some(n) = limit { q = q.page_size(n); }
            let page = repo.list(q).await?;
            match cli.output {
                Output::Human => {
                    print_rows(&page.items);
                    if let Some(token) = &page.continuation { eprintln!("more: --continue {}", token); }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&serde_json::json!({"items": page.items, "continue": page.continuation}))?),
            }
        }
        Commands::Patch { gvp, name, patch_type, patch, sub_resource } => {
            let kind = PatchType::from_str(&patch_type).map_err(|e| anyhow!("{}", e))?;
            let doc: serde_json::Value = serde_json::from_str(&patch).context("patch document is not valid JSON")?;
            let patch = Patch::from_document(kind, doc).map_err(|e| anyhow!("{}", e))?;
            let rref = ResourceRef::new(parse_gvp(&gvp)?, ns, name);
            let w = repo.patch(&rref, &patch, sub_resource.as_deref(), &ctx).await?;
            match cli.output {
                Output::Human => println!("{} patched (+{} ~{} -{}), stateVersion {}", rref.name, w.diff.adds, w.diff.updates, w.diff.removes, w.resource.state_version()),
                Output::Json => println!("{}", serde_json::to_string_pretty(&w)?),
            }
        }
        Commands::Delete { gvp, name } => {
            let r = repo.delete(&ResourceRef::new(parse_gvp(&gvp)?, ns, name), &ctx).await?;
            match cli.output {
                Output::Human => println!("{} deleted", r.metadata.name),
                Output::Json => println!("{}", serde_json::to_string_pretty(&r)?),
            }
        }
        Commands::DeleteNs { namespace } => {
            let deleted = repo.delete_namespace(&namespace, &ctx).await?;
            match cli.output {
                Output::Human => println!("namespace {}: {} resources deleted", namespace, deleted.len()),
                Output::Json => println!("{}", serde_json::to_string_pretty(&deleted)?),
            }
        }
        Commands::Watch { gvp, selector } => {
            // Only writes made by this process are seen; the bus is in-process.
            let mut filter = WatchFilter::new(parse_gvp(&gvp)?);
            if let Some(ns) = ns { filter = filter.in_namespace(ns); }
            if let Some(sel) = selector { filter = filter.with_selectors(parse_selectors(&sel)?); }
            let mut stream = repo.watch(filter).await?;
            loop {
                tokio::select! {
                    ev = stream.recv() => match ev {
                        Some(ev) => match cli.output {
                            Output::Human => println!("{:?} {}", ev.kind, ev.resource.metadata.name),
                            Output::Json => println!("{}", serde_json::to_string(&ev)?),
                        },
                        None => break,
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; stopping watch");
                        bus.stop();
                    }
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let output = cli.output;
    match run(cli).await {
        Ok(()) => Ok(()),
        Err(e) => {
            // Domain errors print their structured form; plumbing errors keep their chain.
            match e.downcast_ref::<MeridianError>() {
                Some(me) => {
                    let api = ApiError::from(me);
                    match output {
                        Output::Json => eprintln!("{}", serde_json::to_string_pretty(&api)?),
                        Output::Human => {
                            eprintln!("error {} {}: {}", api.status, api.title, api.detail.as_deref().unwrap_or(""));
                            for (code, msgs) in &api.errors {
                                for m in msgs { eprintln!("  {}: {}", code, m); }
                            }
                        }
                    }
                    std::process::exit(1);
                }
                None => Err(e),
            }
        }
    }
}
