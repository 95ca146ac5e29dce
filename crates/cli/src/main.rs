use std::io::{self, Read};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kube::api::PostParams;
use kubeguard_client::{Client, ClientError, KubeClient, ListOptions, Operation, ReadOnlyClient, WritePolicy};
use kubeguard_codec::{parse_objects, parse_registered, serialize_objects};
use kubeguard_config::{ClientConfigBuilder, ConfigEnv};
use kubeguard_core::{gvk_from_types, gvk_key, parse_gvk_key, Object, Registry, Scheme};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kubeguardctl", version, about = "Parse resource streams and talk to clusters read-only")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse a YAML stream and print one line per document
    Parse {
        /// File to read, `-` for stdin
        file: String,
    },
    /// Re-serialize a YAML stream canonically
    Fmt {
        /// File to read, `-` for stdin
        file: String,
        /// Decode through the registered types first
        #[arg(long = "typed", action = ArgAction::SetTrue)]
        typed: bool,
    },
    /// List objects of a kind through a read-only client
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        #[arg(long = "kubeconfig")]
        kubeconfig: Option<PathBuf>,
        #[arg(long = "context")]
        context: Option<String>,
        /// Namespace (default: all namespaces)
        #[arg(long = "ns")]
        namespace: Option<String>,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Send every document of a stream through a read-only client
    Apply {
        /// File to read, `-` for stdin
        file: String,
        /// Swallow denials and print the plan
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KUBEGUARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBEGUARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KUBEGUARD_METRICS_ADDR; expected host:port");
        }
    }
}

fn open(file: &str) -> Result<Box<dyn Read>> {
    if file == "-" {
        return Ok(Box::new(io::stdin()));
    }
    let f = std::fs::File::open(file).with_context(|| format!("opening {file}"))?;
    Ok(Box::new(f))
}

fn describe(obj: &Object) -> String {
    let (api_version, kind) = obj.types().map(|t| (t.api_version, t.kind)).unwrap_or_default();
    let name = obj.name().unwrap_or("");
    match obj.namespace() {
        Some(ns) => format!("{api_version} {kind} {ns}/{name}"),
        None => format!("{api_version} {kind} {name}"),
    }
}

fn print_json(objects: &[Object]) -> Result<()> {
    let docs = objects.iter().map(Object::to_json).collect::<serde_json::Result<Vec<_>>>()?;
    println!("{}", serde_json::to_string_pretty(&docs)?);
    Ok(())
}

/// Outcome of one document sent through `apply`.
#[derive(Debug, serde::Serialize)]
struct PlanStep {
    operation: &'static str,
    object: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    denied: Option<String>,
}

async fn apply_all(client: &ReadOnlyClient, objects: Vec<Object>) -> Result<Vec<PlanStep>> {
    let mut plan = Vec::with_capacity(objects.len());
    for mut obj in objects {
        let object = describe(&obj);
        let gvk = obj.types().map(|t| gvk_key(&gvk_from_types(&t))).unwrap_or_default();
        let denied = match client.create(&mut obj, &PostParams::default()).await {
            Ok(()) => None,
            Err(e @ ClientError::WriteDenied(_)) => {
                warn!(gvk = %gvk, "write denied");
                Some(e.to_string())
            }
            Err(e) => return Err(e).with_context(|| format!("applying {object}")),
        };
        plan.push(PlanStep { operation: Operation::Create.as_str(), object, denied });
    }
    Ok(plan)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let registry: Arc<dyn Registry> = Arc::new(Scheme::with_builtins());

    match cli.command {
        Commands::Parse { file } => {
            info!(file = %file, "parse invoked");
            let objects = parse_objects(open(&file)?, registry.as_ref(), None).with_context(|| format!("parsing {file}"))?;
            match cli.output {
                Output::Human => objects.iter().for_each(|o| println!("{}", describe(o))),
                Output::Json => print_json(&objects)?,
            }
        }
        Commands::Fmt { file, typed } => {
            info!(file = %file, typed, "fmt invoked");
            let input = open(&file)?;
            let objects = if typed {
                parse_registered(input, registry.as_ref())
            } else {
                parse_objects(input, registry.as_ref(), None)
            }
            .with_context(|| format!("parsing {file}"))?;
            match cli.output {
                Output::Human => serialize_objects(registry.as_ref(), io::stdout().lock(), &objects)?,
                Output::Json => print_json(&objects)?,
            }
        }
        Commands::Ls { gvk, kubeconfig, context, namespace, selector } => {
            info!(gvk = %gvk, ns = ?namespace, "ls invoked");
            let key = parse_gvk_key(&gvk).ok_or_else(|| anyhow!("invalid GVK key {gvk:?}; expected v1/Kind or group/v1/Kind"))?;
            let mut builder = ClientConfigBuilder::new(ConfigEnv::from_process());
            if let Some(path) = kubeconfig {
                builder = builder.kubeconfig_path(path);
            }
            if let Some(ctx) = context {
                builder = builder.context(ctx);
            }
            let config = builder.build().await.context("building client config")?;
            let live = KubeClient::try_from_config(config, registry.clone()).await?;
            let client = ReadOnlyClient::new(Arc::new(live));

            let mut opts = ListOptions { namespace, ..Default::default() };
            if let Some(sel) = selector {
                opts = opts.labels(sel);
            }
            let objects = client.list(&key, &opts).await.with_context(|| format!("listing {}", gvk_key(&key)))?;
            match cli.output {
                Output::Human => {
                    println!("{:<20} NAME", "NAMESPACE");
                    for obj in &objects {
                        println!("{:<20} {}", obj.namespace().unwrap_or("-"), obj.name().unwrap_or(""));
                    }
                }
                Output::Json => print_json(&objects)?,
            }
        }
        Commands::Apply { file, dry_run } => {
            info!(file = %file, dry_run, "apply invoked");
            let objects = parse_objects(open(&file)?, registry.as_ref(), None).with_context(|| format!("parsing {file}"))?;
            let policy = if dry_run { WritePolicy::allow_silently() } else { WritePolicy::deny() };
            let client = ReadOnlyClient::detached().with_policy(policy);
            let plan = apply_all(&client, objects).await?;
            match cli.output {
                Output::Human => {
                    for step in &plan {
                        match &step.denied {
                            None => println!("create {} (dry run)", step.object),
                            Some(reason) => eprintln!("{}: {reason}", step.object),
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
            }
            let denied = plan.iter().filter(|s| s.denied.is_some()).count();
            if denied > 0 {
                eprintln!("{denied} write(s) denied; rerun with --dry-run to print the plan");
            }
        }
    }

    Ok(())
}
