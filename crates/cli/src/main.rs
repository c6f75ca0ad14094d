//! The capstan binary: parses flags, wires the client, renderer, checks and
//! triggers together, serves metrics, and runs until a signal arrives.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use capstan_client::Client;
use capstan_db::source::DatabaseSources;
use capstan_db::Connections;
use capstan_render::{FileRenderer, Renderer, Sources};
use capstan_rollout::actions::default_actions;
use capstan_rollout::checks::{default_checks, Reporter, SuccessChecks};
use capstan_rollout::Runner;
use capstan_trigger::database::DatabaseTrigger;
use capstan_trigger::interval::IntervalTrigger;
use capstan_trigger::oneoff::OneOffTrigger;
use capstan_trigger::resource::ResourceTrigger;
use capstan_trigger::Trigger;

use config::ConfigPasser;

#[derive(Parser, Debug)]
#[command(name = "capstan", version, about = "Declarative rollout engine")]
struct Cli {
    /// Log level filter (overridden by RUST_LOG when set).
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// The provider to use for rendering manifests.
    #[arg(long)]
    renderer: String,

    /// The config file whose content to pass to the render provider.
    #[arg(long = "config-file")]
    config_file: Option<PathBuf>,

    /// Only render manifests to be rolled out and print to stdout.
    #[arg(long = "render-only")]
    render_only: bool,

    /// Only render and rollout once, then exit.
    #[arg(long = "one-off")]
    one_off: bool,

    /// File to read database connections from.
    #[arg(long = "database-connections-file")]
    database_connections_file: Option<PathBuf>,

    /// File to read database queries from as input sources.
    #[arg(long = "source-database-file")]
    source_database_file: Option<PathBuf>,

    /// Directory the file renderer reads manifests from.
    #[arg(long = "renderer-file-dir", default_value = "manifests/")]
    renderer_file_dir: PathBuf,

    /// Plain rollout spec the file renderer reads.
    #[arg(long = "renderer-file-rollout", default_value = "rollout.yaml")]
    renderer_file_rollout: PathBuf,

    /// Run the interval trigger with this period (e.g. "5m").
    #[arg(long = "trigger-interval", value_parser = humantime::parse_duration)]
    trigger_interval: Option<Duration>,

    /// Path to the resource trigger configuration.
    #[arg(long = "trigger-resource-config")]
    trigger_resource_config: Option<PathBuf>,

    /// Path to the database trigger configuration.
    #[arg(long = "trigger-database-config")]
    trigger_database_config: Option<PathBuf>,

    /// Whether to write status back to the originating resource.
    #[arg(long = "write-status", default_value_t = true, action = ArgAction::Set)]
    write_status: bool,

    /// Telemetry listen address.
    #[arg(long = "listen-address", default_value = "0.0.0.0:8080")]
    listen_address: SocketAddr,
}

fn init_tracing(level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics(addr: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing Prometheus metrics exporter")?;
    info!(%addr, "metrics endpoint listening");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    if let Err(err) = run(cli).await {
        error!(err = %format!("{:#}", err), "exiting with error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    init_metrics(cli.listen_address)?;

    let kube = match &cli.kubeconfig {
        Some(path) => {
            let kubeconfig =
                kube::config::Kubeconfig::read_from(path).context("reading kubeconfig")?;
            let config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await
            .context("loading kubeconfig")?;
            kube::Client::try_from(config).context("building cluster client")?
        }
        None => kube::Client::try_default()
            .await
            .context("building cluster client")?,
    };
    let client = Arc::new(Client::with_default_chains(kube));

    let mut sources = Sources::new();
    let mut triggers: Vec<Box<dyn Trigger>> = Vec::new();

    if let Some(path) = &cli.trigger_resource_config {
        let trigger = ResourceTrigger::new(client.clone(), path, cli.write_status)
            .await
            .context("failed to create resource trigger")?;
        for (name, source) in trigger.input_sources() {
            debug!(source = %name, "adding dynamic input source");
            sources.insert(name, source);
        }
        triggers.push(Box::new(trigger));
    }

    if let Some(interval) = cli.trigger_interval {
        if !interval.is_zero() {
            triggers.push(Box::new(IntervalTrigger::new(interval)));
        }
    }

    let mut connections: Option<Arc<Connections>> = None;
    if let Some(path) = &cli.database_connections_file {
        let conns = Arc::new(
            Connections::from_file(path)
                .await
                .context("failed to read database connections")?,
        );
        if let Some(source_path) = &cli.source_database_file {
            let db_sources = DatabaseSources::from_file(conns.clone(), source_path)
                .await
                .context("failed to create database sources")?;
            for (name, source) in db_sources.input_sources()? {
                debug!(source = %name, "adding dynamic input source");
                sources.insert(name, source);
            }
        }
        connections = Some(conns);
    }

    if let Some(path) = &cli.trigger_database_config {
        let conns = connections
            .clone()
            .context("database trigger requires --database-connections-file")?;
        let trigger = DatabaseTrigger::new(conns, path)
            .await
            .context("failed to create database trigger")?;
        triggers.push(Box::new(trigger));
    }

    if cli.one_off {
        triggers = vec![Box::new(OneOffTrigger::new())];
    }
    if triggers.is_empty() {
        bail!("no triggers configured");
    }

    let renderer = build_renderer(&cli, sources)?;

    let reporter: Option<Arc<dyn Reporter>> =
        connections.map(|conns| conns as Arc<dyn Reporter>);
    let checks = Arc::new(
        SuccessChecks::new(client.clone(), default_checks(), reporter)
            .context("failed to create checks")?,
    );
    let mut runner = Runner::new(client.clone(), renderer, checks, cli.render_only);
    runner.set_object_actions(default_actions());
    let runner = Arc::new(runner);

    for trigger in triggers.iter_mut() {
        trigger.register(Arc::new(ConfigPasser::new(
            cli.config_file.clone(),
            runner.clone(),
        )));
    }

    info!(renderer = %cli.renderer, "running");
    let mut tasks = JoinSet::new();
    for trigger in triggers {
        tasks.spawn(async move { trigger.run().await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            info!("signal received, shutting down");
            tasks.shutdown().await;
            Ok(())
        }
        finished = tasks.join_next() => {
            // the first trigger to finish ends the process
            match finished {
                Some(res) => res.context("trigger task panicked")?,
                None => Ok(()),
            }
        }
    }
}

fn build_renderer(cli: &Cli, _sources: Sources) -> Result<Arc<dyn Renderer>> {
    match cli.renderer.as_str() {
        "file" => Ok(Arc::new(FileRenderer::new(
            &cli.renderer_file_dir,
            &cli.renderer_file_rollout,
        ))),
        other => bail!("unknown render provider {:?}", other),
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
