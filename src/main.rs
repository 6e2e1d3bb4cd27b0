use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use node_drainer::aws::sdk::{self, SdkAutoScaling, SdkEc2, SdkQueue};
use node_drainer::cache::asg::LifecycleCache;
use node_drainer::cache::ec2::Ec2Source;
use node_drainer::cache::spot::SpotSource;
use node_drainer::cache::SourceCache;
use node_drainer::cli::{format_dry_run, Args, LogFormat};
use node_drainer::config::DrainerConfig;
use node_drainer::k8s::{NodeSource, PodSource, Watches};
use node_drainer::metrics::Metrics;
use node_drainer::reconciler::{Reconciler, Sources};
use node_drainer::signal::Sink;

#[tokio::main]
async fn main() {
    let mut args = Args::parse();

    // Load .env file if specified, then parse again so its values fill
    // flags that were not given on the command line
    if let Some(env_file) = args.env_file.clone() {
        if let Err(e) = dotenvy::from_path(&env_file) {
            eprintln!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
        args = Args::parse();
    }

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    // Dry-run mode: print the effective configuration and exit
    if args.dry_run {
        println!("{}", format_dry_run(&config));
        return;
    }

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(config: DrainerConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let metrics = Metrics::shared();

    let aws = sdk::load_config().await;
    let client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;

    let watches = Watches::start(client, config.namespace.as_deref(), &cancel);

    let ec2_api = Arc::new(SdkEc2::new(&aws));
    let ec2 = Arc::new(SourceCache::new(
        Ec2Source::new(ec2_api.clone()),
        Arc::clone(&metrics),
    ));
    let spot = Arc::new(SourceCache::new(SpotSource::new(ec2_api), Arc::clone(&metrics)));
    let nodes = Arc::new(SourceCache::new(
        NodeSource::new(watches.nodes.clone()),
        Arc::clone(&metrics),
    ));
    let pods = Arc::new(SourceCache::new(
        PodSource::new(watches.pods.clone(), Arc::new(watches.workloads.clone())),
        Arc::clone(&metrics),
    ));
    let asg = Arc::new(LifecycleCache::new(
        Arc::new(SdkQueue::new(&aws, config.queue_url.clone())),
        Arc::new(SdkAutoScaling::new(&aws)),
        config.deletion_grace,
        Arc::clone(&metrics),
    ));

    let reconciler = Reconciler::new(
        config.reconciler(),
        Sources {
            asg: Arc::clone(&asg),
            ec2: ec2.clone(),
            spot: spot.clone(),
            nodes: nodes.clone(),
            pods: pods.clone(),
        },
        Arc::clone(&metrics),
    );

    let node_sink = Sink::new();
    node_sink.subscribe(&watches.node_events);
    let pod_sink = Sink::new();
    pod_sink.subscribe(&watches.pod_events);

    let tasks = vec![
        tokio::spawn(ec2.run_polling(
            config.ec2_poll_interval,
            config.fetch_backoff,
            cancel.clone(),
        )),
        tokio::spawn(spot.run_polling(
            config.spot_poll_interval,
            config.fetch_backoff,
            cancel.clone(),
        )),
        tokio::spawn(nodes.run_on_signal(
            node_sink,
            config.max_wait,
            config.fetch_backoff,
            cancel.clone(),
        )),
        tokio::spawn(pods.run_on_signal(
            pod_sink,
            config.max_wait,
            config.fetch_backoff,
            cancel.clone(),
        )),
        tokio::spawn(asg.run(config.fetch_backoff, cancel.clone())),
        tokio::spawn(reconciler.run(cancel.clone())),
    ];

    info!(queue = %config.queue_url, "node-drainer started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("task ended abnormally: {}", e);
        }
    }

    let snapshot = serde_json::to_string(&metrics.snapshot()).context("failed to encode metrics")?;
    info!(metrics = %snapshot, "final metrics");
    Ok(())
}
