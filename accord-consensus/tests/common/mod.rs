#![allow(dead_code)]

use accord_common::config::RaftConfig;
use accord_common::error::AccordError;
use accord_common::types::{Configuration, Member, NodeId};
use accord_consensus::protocol::{CommandRequest, QueryRequest, RaftRequest, RaftResponse};
use accord_consensus::raft::{
    spawn, KeyValueStore, KvCommand, KvQuery, MemLog, NodeHandle, NodeRole, NodeStatus, RaftNode,
    Transport,
};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

pub fn address(id: NodeId) -> String {
    format!("127.0.0.1:{}", 7000 + id)
}

#[derive(Default)]
struct Routes {
    handles: HashMap<NodeId, NodeHandle>,
    isolated: HashSet<NodeId>,
}

/// In-process transport; each node gets its own copy tagged with its id so
/// isolation cuts both directions.
#[derive(Clone)]
pub struct LocalTransport {
    from: NodeId,
    routes: Arc<Mutex<Routes>>,
}

impl Transport for LocalTransport {
    fn call(&self, target: &Member, frame: Bytes) -> impl Future<Output = accord_common::Result<Bytes>> + Send {
        let handle = {
            let routes = self.routes.lock().unwrap();
            if routes.isolated.contains(&self.from) || routes.isolated.contains(&target.id) {
                None
            } else {
                routes.handles.get(&target.id).cloned()
            }
        };
        let target = target.id;
        async move {
            match handle {
                Some(handle) => handle.handle_frame(frame).await,
                None => Err(AccordError::Transport(format!("node {} unreachable", target))),
            }
        }
    }
}

pub struct TestCluster {
    routes: Arc<Mutex<Routes>>,
    handles: BTreeMap<NodeId, NodeHandle>,
    tasks: Vec<JoinHandle<()>>,
    next_request: u64,
}

impl TestCluster {
    /// Start `n` voting members with ids `1..=n`
    pub fn start(n: u64) -> Self {
        init_tracing();
        let bootstrap =
            Configuration::new((1..=n).map(|id| Member::voting(id, address(id))).collect());
        let mut cluster = Self {
            routes: Arc::new(Mutex::new(Routes::default())),
            handles: BTreeMap::new(),
            tasks: Vec::new(),
            next_request: 1,
        };
        for id in 1..=n {
            cluster.launch(id, bootstrap.clone());
        }
        cluster
    }

    /// Start a node that is not part of the cluster yet
    pub fn add(&mut self, id: NodeId) {
        self.launch(id, Configuration::default());
    }

    fn launch(&mut self, id: NodeId, bootstrap: Configuration) {
        let node = RaftNode::new(
            id,
            RaftConfig::default(),
            bootstrap,
            MemLog::new(),
            KeyValueStore::default(),
        )
        .unwrap()
        .with_seed(id);
        let transport = LocalTransport {
            from: id,
            routes: self.routes.clone(),
        };
        let (handle, task) = spawn(node, transport);
        self.routes.lock().unwrap().handles.insert(id, handle.clone());
        self.handles.insert(id, handle);
        self.tasks.push(task);
    }

    pub fn handle(&self, id: NodeId) -> &NodeHandle {
        &self.handles[&id]
    }

    pub fn isolate(&self, id: NodeId) {
        self.routes.lock().unwrap().isolated.insert(id);
    }

    pub fn heal(&self) {
        self.routes.lock().unwrap().isolated.clear();
    }

    pub fn request_id(&mut self) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    pub async fn status(&self, id: NodeId) -> Result<NodeStatus> {
        Ok(self.handle(id).status().await?)
    }

    pub async fn call(&self, id: NodeId, request: RaftRequest) -> Result<RaftResponse> {
        Ok(self.handle(id).call(request).await?)
    }

    /// Wait for a leader among `candidates` that every other candidate
    /// agrees on
    pub async fn wait_for_leader(&self, candidates: &[NodeId]) -> Result<NodeId> {
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut statuses = Vec::new();
            for id in candidates {
                statuses.push(self.status(*id).await?);
            }
            let leader = statuses
                .iter()
                .filter(|s| s.role == NodeRole::Leader)
                .max_by_key(|s| s.term)
                .map(|s| (s.id, s.term));
            if let Some((leader, term)) = leader {
                if statuses
                    .iter()
                    .all(|s| s.term == term && s.leader == Some(leader))
                {
                    return Ok(leader);
                }
            }
        }
        Err(anyhow!("no stable leader among {:?}", candidates))
    }

    /// Poll `id` until `check` holds
    pub async fn wait_until<F>(&self, id: NodeId, check: F) -> Result<NodeStatus>
    where
        F: Fn(&NodeStatus) -> bool,
    {
        for _ in 0..200 {
            let status = self.status(id).await?;
            if check(&status) {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Err(anyhow!("node {} never reached the expected state", id))
    }

    pub fn set(&mut self, key: &str, value: &str) -> RaftRequest {
        RaftRequest::Command(CommandRequest {
            id: self.request_id(),
            command: KvCommand::Set(key.into(), value.into()).to_bytes().unwrap(),
        })
    }

    pub fn get(&mut self, key: &str) -> RaftRequest {
        RaftRequest::Query(QueryRequest {
            id: self.request_id(),
            query: KvQuery::Get(key.into()).to_bytes().unwrap(),
        })
    }

    pub async fn shutdown(self) {
        for handle in self.handles.values() {
            let _ = handle.shutdown();
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
