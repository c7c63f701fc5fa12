use clap::Parser;
use log::{error, info};
use node_vpc::{Context, NodeStore};
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// name of the node we're running on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,
    /// API server URL, overriding the inferred one
    #[arg(long, env = "MASTER_URL")]
    master_url: Option<String>,
    #[arg(long)]
    no_api: bool,
    #[arg(long, default_value = "127.0.0.1:2288")]
    api: std::net::SocketAddr,
    #[arg(long, default_value_t = 1)]
    retry_delay_secs: u64,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("RUST_LOG", "info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    info!("starting for node {}", cli.node_name);

    let mut config = kube::Config::infer().await?;
    if let Some(url) = &cli.master_url {
        config.cluster_url = url.parse()?;
    }
    let client: kube::Client = config.try_into()?;

    let ctx = node_vpc::watcher::start(
        client,
        cli.node_name,
        Duration::from_secs(cli.retry_delay_secs),
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {e}");
            }
        },
    )
    .await?;

    if ctx.is_master(&ctx.node_name) {
        info!("running on a master node");
    }

    if cli.no_api {
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    api_server(cli.api, Arc::new(ctx)).await;
    Ok(())
}

async fn api_server(bind: impl Into<std::net::SocketAddr>, ctx: Arc<Context>) {
    use serde_json::json;
    use warp::Filter;

    let with_ctx = warp::any().map(move || ctx.clone());

    let nodes = warp::path!("nodes")
        .and(with_ctx.clone())
        .map(|ctx: Arc<Context>| warp::reply::json(&ctx.nodes.snapshot()));

    let next_hop = warp::path!("next-hop" / String)
        .and(with_ctx.clone())
        .map(|node: String, ctx: Arc<Context>| {
            let address = ctx.next_hop(&node);
            warp::reply::json(&json!({ "node": node, "address": address }))
        });

    let source_next_hop = warp::path!("source" / String / "next-hop")
        .and(with_ctx.clone())
        .map(|source: String, ctx: Arc<Context>| {
            let address = ctx.next_hop_for_source(&source);
            warp::reply::json(&json!({ "source": source, "address": address }))
        });

    let master = warp::path!("master" / String)
        .and(with_ctx.clone())
        .map(|node: String, ctx: Arc<Context>| warp::reply::json(&ctx.is_master(&node)));

    let same_cluster = warp::path!("same-cluster" / String)
        .and(with_ctx)
        .map(|cluster: String, ctx: Arc<Context>| {
            warp::reply::json(&ctx.is_same_cluster(&cluster))
        });

    let server = warp::get().and(
        nodes
            .or(next_hop)
            .or(source_next_hop)
            .or(master)
            .or(same_cluster),
    );

    warp::serve(server).try_bind(bind).await;
}
