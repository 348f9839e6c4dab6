/// The admission webhook that propagates node labels into pod environment variables.
use std::{
    convert::Infallible,
    future::Future,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use config::Config;
use nodelabels::{
    k8s::{create_client, nodes::NodeCache, pods::KubePods, NodeLookup, PodClient},
    metrics::init_prometheus_server,
    NodeLabelsInjector,
};
use tracing::{info, Level};
use warp::{filters::path::FullPath, hyper::body::Bytes, Filter};

mod config;

type Injector = NodeLabelsInjector<NodeCache, KubePods>;

#[derive(Parser, Debug, Clone)]
#[command(name = "node-labels-exporter")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    /// Path to the configuration file.
    /// Built-in defaults are used when omitted.
    #[arg(short, long)]
    config_file: Option<PathBuf>,
    /// Path to a kubeconfig file.
    /// Defaults to the in-cluster configuration or $KUBECONFIG.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
    /// The path to the TLS certificate.
    #[arg(long)]
    tls_cert: PathBuf,
    /// The path to the TLS key.
    #[arg(long)]
    tls_key: PathBuf,
    /// The port to listen on.
    /// Default is 9443.
    #[arg(short, long, default_value = "9443")]
    port: u16,
    /// The port serving Prometheus metrics under /metrics.
    /// Metrics are disabled when omitted.
    #[arg(long)]
    metrics_port: Option<u16>,
    /// The maximum log level.
    #[arg(long, default_value = "info")]
    log_level: Level,
}

/// Only let requests for the configured webhook path through.
fn webhook_path(
    path: String,
) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone + Send + Sync + 'static {
    let path = Arc::new(path);
    warp::path::full()
        .and_then(move |full: FullPath| {
            let path = path.clone();
            async move {
                if full.as_str() == path.as_str() {
                    Ok(())
                } else {
                    Err(warp::reject::not_found())
                }
            }
        })
        .untuple_one()
}

/// The admission endpoint. The raw body is handed to the injector so that undecodable reviews
/// are still answered with an admission response.
fn webhook<N, P>(
    path: String,
    deadline: Duration,
    injector: Arc<NodeLabelsInjector<N, P>>,
) -> impl Filter<Extract = (warp::reply::Json,), Error = warp::Rejection> + Clone + Send + Sync + 'static
where
    N: NodeLookup + 'static,
    P: PodClient + 'static,
{
    warp::post()
        .and(webhook_path(path))
        .and(warp::body::bytes())
        .and_then(move |body: Bytes| {
            let injector = injector.clone();
            async move {
                let review = injector.review_body(&body, deadline).await;
                Ok::<_, Infallible>(warp::reply::json(&review))
            }
        })
}

fn webhook_task(
    tls_cert: &Path,
    tls_key: &Path,
    port: u16,
    config: &Config,
    injector: Arc<Injector>,
) -> impl Future<Output = ()> + 'static {
    let routes = webhook(
        config.webhook_path.clone(),
        config.request_timeout(),
        injector,
    )
    .with(warp::trace::request());

    info!(
        "Starting webhook server on port {} path {}",
        port, config.webhook_path
    );
    let (_addr, fut) = warp::serve(routes)
        .tls()
        .cert_path(tls_cert)
        .key_path(tls_key)
        .bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for CTRL+C: {}", err);
            }
        });
    fut
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse the CLI arguments
    let args = Args::try_parse()?;

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Parsed CLI arguments: {:?}", args);

    let config = match &args.config_file {
        Some(path) => Config::from_file(path).context("Failed to load configuration file")?,
        None => Config::default(),
    };
    info!("Loaded configuration: {:?}", config);

    if let Some(metrics_port) = args.metrics_port {
        init_prometheus_server(SocketAddr::from(([0, 0, 0, 0], metrics_port)))?;
        info!("Serving metrics on port {}", metrics_port);
    }

    let client = create_client(args.kubeconfig.as_deref()).await?;
    let nodes = NodeCache::start(client.clone()).await?;
    let pods = KubePods::new(client);
    let injector = Arc::new(NodeLabelsInjector::new(
        config.annotation_keys(),
        nodes,
        pods,
    ));

    info!("Starting node labels exporter");
    webhook_task(&args.tls_cert, &args.tls_key, args.port, &config, injector).await;

    info!("Exiting admission server");

    Ok(())
}
