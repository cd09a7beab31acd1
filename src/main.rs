use async_trait::async_trait;
use axum::Json;
use axum::http::StatusCode;
use axum::{Router, extract::Extension, routing::post};
use grid_fabric::checkpoint::CheckpointStores;
use grid_fabric::cluster::gossip::GossipMembership;
use grid_fabric::compute::job::JobContext;
use grid_fabric::compute::task::ComputeTask;
use grid_fabric::compute::types::{JobResult, JobSpec};
use grid_fabric::config::FabricConfig;
use grid_fabric::grid::GridNode;
use grid_fabric::messaging::http::HttpChannel;
use grid_fabric::service::types::{Service, ServiceContext};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const COUNTER_SERVICE: &str = "counter";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>] [--config <file.json>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut config_path: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match (args[i].as_str(), args.get(i + 1)) {
            ("--bind", Some(value)) => {
                bind_addr = Some(value.parse()?);
                i += 2;
            }
            ("--seed", Some(value)) => {
                seed_nodes.push(value.parse()?);
                i += 2;
            }
            ("--config", Some(value)) => {
                config_path = Some(value.clone());
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.ok_or_else(|| anyhow::anyhow!("--bind is required"))?;
    let config = match config_path {
        Some(path) => FabricConfig::from_file(&path)?,
        None => FabricConfig::default(),
    };

    tracing::info!("Starting node on {}", bind_addr);
    if !seed_nodes.is_empty() {
        tracing::info!("Seed nodes: {:?}", seed_nodes);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    let http_port = bind_addr.port() + 1000;
    let http_addr = SocketAddr::new(bind_addr.ip(), http_port);

    // 1. Membership (UDP gossip):
    let membership = GossipMembership::new(bind_addr, http_addr, seed_nodes).await?;
    let node_id = membership.local_node.id.clone();
    tracing::info!("Node ID: {}", node_id);

    // 2. Transport and grid node:
    let channel = HttpChannel::new(node_id, membership.clone(), &config);
    let checkpoints = CheckpointStores::new(config.default_checkpoint_store.clone());
    let grid = GridNode::start(membership.clone(), channel.clone(), checkpoints, config);

    grid.jobs().register_fn("echo", |ctx: JobContext| async move {
        tracing::info!("Echoing {} on {}", ctx.argument(), ctx.node_id());
        Ok(json!({ "value": ctx.argument().clone(), "node": ctx.node_id().to_string() }))
    });
    grid.service_types()
        .register(COUNTER_SERVICE, CounterService::default);

    // 3. HTTP Router:
    let app = Router::new()
        .route("/compute/echo", post(handle_echo))
        .route("/services/counter/deploy", post(handle_deploy_counter))
        .route("/services/counter/increment", post(handle_increment_counter))
        .layer(Extension(grid.clone()))
        .merge(channel.router());

    // 4. Spawn membership service:
    let service_clone = membership.clone();
    tokio::spawn(async move {
        service_clone.start().await;
    });

    // 5. Spawn stats reporter:
    let stats_service = membership.clone();
    let stats_grid = grid.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_service.get_alive_members();
            tracing::info!(
                "Cluster stats: {} alive nodes, {} active task(s), {} running job(s), {} local counter instance(s)",
                alive.len(),
                stats_grid.compute().active_sessions(),
                stats_grid.worker().running_jobs(),
                stats_grid.deployments().local_instance_count(COUNTER_SERVICE)
            );
            for node in alive {
                tracing::info!(
                    "  - {} gossip={} http={} (inc={})",
                    node.id,
                    node.gossip_addr,
                    node.http_addr,
                    node.incarnation
                );
            }
        }
    });

    // 6. Start HTTP server:
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;

    grid.shutdown().await;
    Ok(())
}

/// One `echo` job per element of the submitted array.
struct EchoTask;

impl ComputeTask for EchoTask {
    fn name(&self) -> &str {
        "echo"
    }

    fn requires_argument(&self) -> bool {
        true
    }

    fn split(&self, _grid_size: usize, arg: Option<&Value>) -> anyhow::Result<Vec<JobSpec>> {
        let items = arg
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow::anyhow!("echo expects a JSON array"))?;
        Ok(items.iter().map(|item| JobSpec::new("echo", item.clone())).collect())
    }

    fn reduce(&self, results: &[JobResult]) -> anyhow::Result<Value> {
        Ok(Value::Array(
            results
                .iter()
                .map(|result| result.value.clone().unwrap_or(Value::Null))
                .collect(),
        ))
    }
}

#[derive(Default)]
struct CounterService {
    count: AtomicU64,
}

#[async_trait]
impl Service for CounterService {
    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        tracing::info!("Counter {} instance {} up on {}", ctx.name(), ctx.instance(), ctx.node_id());
        Ok(())
    }

    async fn invoke(&self, method: &str, _args: Value) -> anyhow::Result<Value> {
        match method {
            "increment" => Ok(json!(self.count.fetch_add(1, Ordering::SeqCst) + 1)),
            "get" => Ok(json!(self.count.load(Ordering::SeqCst))),
            other => Err(anyhow::anyhow!("unknown counter method '{}'", other)),
        }
    }
}

async fn handle_echo(
    Extension(grid): Extension<Arc<GridNode>>,
    Json(items): Json<Value>,
) -> (StatusCode, Json<Value>) {
    match grid.compute().execute(Arc::new(EchoTask), Some(items)).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "result": outcome.value().cloned() })),
        ),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    }
}

async fn handle_deploy_counter(Extension(grid): Extension<Arc<GridNode>>) -> (StatusCode, Json<Value>) {
    match grid
        .services()
        .deploy_node_singleton(COUNTER_SERVICE, COUNTER_SERVICE)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({ "deployed": COUNTER_SERVICE }))),
        Err(e) => (StatusCode::CONFLICT, Json(json!({ "error": e.to_string() }))),
    }
}

async fn handle_increment_counter(Extension(grid): Extension<Arc<GridNode>>) -> (StatusCode, Json<Value>) {
    let proxy = match grid.services().proxy(COUNTER_SERVICE, false) {
        Ok(proxy) => proxy,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    };

    match proxy.invoke("increment", Value::Null).await {
        Ok(value) => (StatusCode::OK, Json(json!({ "count": value }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}
