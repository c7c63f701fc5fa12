use eyre::{format_err, Result};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1 as core;
use kube::{api::Api, runtime::watcher, Client};
use log::{debug, error, info, trace};
use std::future::Future;
use std::sync::Arc;
use tokio::{sync::watch, time::Duration};

use crate::{Context, Node, Nodes, NodesReceiver};


/// Keeps a snapshot of the cluster nodes up to date.
pub struct NodeWatcher {
    client: Client,
    watcher_config: watcher::Config,
    state: WatcherState,
}
impl NodeWatcher {
    pub fn new(client: Client, watcher_config: watcher::Config) -> (Self, NodesReceiver) {
        let (state, nodes_rx) = WatcherState::new();

        (
            Self {
                client,
                watcher_config,
                state,
            },
            nodes_rx,
        )
    }

    pub async fn run(&mut self, retry_delay: Duration) -> Result<()> {
        loop {
            let Err(e) = self.run_once().await else {
                break;
            };

            error!("nodes watch failed (retrying): {e}");
            tokio::time::sleep(retry_delay).await;
        }
        Ok(())
    }

    async fn run_once(&mut self) -> Result<()> {
        let nodes = Api::<core::Node>::all(self.client.clone());
        let mut stream = watcher(nodes, self.watcher_config.clone()).boxed();

        while let Some(e) = stream.try_next().await? {
            trace!("got node event: {e:?}");
            self.state.ingest(e);
        }
        Ok(())
    }
}

/// The nodes being listed, and the last complete snapshot published from them.
struct WatcherState {
    nodes: Nodes,
    ready: bool,
    tx: watch::Sender<Option<Arc<Nodes>>>,
}
impl WatcherState {
    fn new() -> (Self, NodesReceiver) {
        let (tx, nodes_rx) = watch::channel(None);
        let state = Self {
            nodes: Nodes::new(),
            ready: false,
            tx,
        };
        (state, nodes_rx)
    }

    fn ingest(&mut self, event: watcher::Event<core::Node>) {
        let is_ready = ingest_event(&mut self.nodes, event);

        if is_ready && !self.ready {
            info!("all nodes received ({})", self.nodes.len());
        } else if !is_ready && self.ready {
            info!("nodes watch restarted");
        }
        self.ready = is_ready;
        if !is_ready {
            // keep serving the previous snapshot while listing again
            return;
        }

        self.tx.send_replace(Some(Arc::new(self.nodes.clone())));
    }
}

/// Applies a watch event, returning whether the initial listing is complete.
fn ingest_event(nodes: &mut Nodes, event: watcher::Event<core::Node>) -> bool {
    use watcher::Event::*;
    match event {
        Init => {
            nodes.clear();
            false
        }
        InitApply(node) => {
            upsert(nodes, &node);
            false
        }
        InitDone => true,
        Apply(node) => {
            upsert(nodes, &node);
            true
        }
        Delete(node) => {
            if let Some(name) = node.metadata.name.as_ref() {
                nodes.remove(name);
            }
            true
        }
    }
}

fn upsert(nodes: &mut Nodes, node: &core::Node) {
    match Node::try_from(node) {
        Ok(node) => {
            nodes.insert(node.name.clone(), Arc::new(node));
        }
        Err(e) => debug!("ignoring node: {e}"),
    }
}

/// Starts watching nodes and waits for the initial sync, or for `shutdown`.
///
/// The watch is retried every `retry_delay` on failure. The returned context answers for
/// `node_name`.
pub async fn start(
    client: Client,
    node_name: impl Into<String>,
    retry_delay: Duration,
    shutdown: impl Future<Output = ()>,
) -> Result<Context> {
    let (mut watcher, mut nodes_rx) = NodeWatcher::new(client, watcher::Config::default());

    let task = tokio::spawn(async move { watcher.run(retry_delay).await });

    if let Err(e) = wait_for_sync(&mut nodes_rx, shutdown).await {
        task.abort();
        return Err(e);
    }

    info!("nodes watch synced");
    Ok(Context::new(nodes_rx, node_name))
}

async fn wait_for_sync(
    nodes_rx: &mut NodesReceiver,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::select!(
        synced = nodes_rx.wait_for(Option::is_some) => match synced {
            Ok(_) => Ok(()),
            Err(_) => Err(format_err!("nodes watch stopped before initial sync")),
        },
        _ = shutdown => Err(format_err!("nodes watch: shutdown before initial sync")),
    )
}
