//! The replica facade: one process's view of the replicated store.
//!
//! [`Replica`] owns the engine, the raft instance, and the raft transport
//! listener. Everything above it (RPC dispatch, the server orchestrator)
//! talks through this surface:
//!
//! - `append_log` maps a typed [`Operation`] onto the replicated log and
//!   hands back an [`AppendHandle`] that resolves exactly once;
//! - `read` is a synchronous local engine lookup that never consults raft;
//! - `add_server`, `get_leader`, `get_all_servers` expose membership;
//! - `register_thread` / `deregister_thread` carry the engine's
//!   per-thread discipline.
//!
//! The handle's return mode (`Blocking` vs `AsyncCallback`) is fixed at
//! construction; calling the other mode's accessor is a programming error
//! and panics. `append_log` never retries — retry policy belongs to the
//! client driver.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use openraft::storage::Adaptor;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tonic::transport::Server;
use tracing::{error, info, warn};

use crate::config::{ReturnMethod, ServerConfig};
use crate::engine::{SledEngine, StorageEngine};
use crate::errors::{write_error_to_rc, ReplicaError};
use crate::operation::Operation;
use crate::proto::join_service_client::JoinServiceClient;
use crate::proto::raft_service_server::RaftServiceServer;
use crate::proto::JoinRequest;
use crate::raft::{
    EncodedOperation, GrpcNetworkFactory, NodeId, PeerNode, RaftInstance, RaftTransportService,
};
use crate::store::KvStore;
use crate::types::{
    MutationResult, ServerInfo, NO_LIVE_LEADER, RC_COMMIT_UNCERTAIN, RC_OK, RC_REQUEST_CANCELLED,
};

// ── Append handle ─────────────────────────────────────────────────────────────

/// The pending result of one `append_log`. Resolves exactly once, through
/// the accessor matching the replica's return mode.
pub struct AppendHandle {
    mode: ReturnMethod,
    rx: oneshot::Receiver<MutationResult>,
}

fn dropped_result() -> MutationResult {
    MutationResult {
        engine_rc: 0,
        raft_rc: RC_REQUEST_CANCELLED,
        raft_msg: "append task dropped before completion".to_string(),
    }
}

impl AppendHandle {
    /// Await the commit result. Only valid in `Blocking` mode.
    pub async fn wait(self) -> MutationResult {
        assert_eq!(
            self.mode,
            ReturnMethod::Blocking,
            "AppendHandle::wait called on a replica constructed in async_callback mode"
        );
        self.rx.await.unwrap_or_else(|_| dropped_result())
    }

    /// Register a one-shot callback invoked with the commit result. Only
    /// valid in `AsyncCallback` mode. The callback runs on a raft-adjacent
    /// task and must not block.
    pub fn on_ready<F>(self, callback: F)
    where
        F: FnOnce(MutationResult) + Send + 'static,
    {
        assert_eq!(
            self.mode,
            ReturnMethod::AsyncCallback,
            "AppendHandle::on_ready called on a replica constructed in blocking mode"
        );
        let rx = self.rx;
        tokio::spawn(async move {
            let result = rx.await.unwrap_or_else(|_| dropped_result());
            callback(result);
        });
    }
}

// ── Replica ───────────────────────────────────────────────────────────────────

/// One peer: engine + raft instance + raft transport listener.
pub struct Replica {
    server_id: i32,
    raft: RaftInstance,
    engine: Arc<dyn StorageEngine>,
    return_method: ReturnMethod,
    client_req_timeout: Duration,
    raft_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Replica {
    /// Open the engine, start raft and its transport listener, and either
    /// bootstrap a fresh single-member cluster or leave membership to a
    /// later join (see [`ServerConfig::join_seed`]).
    pub async fn start(config: &ServerConfig) -> Result<Arc<Self>, ReplicaError> {
        let engine: Arc<dyn StorageEngine> = Arc::new(SledEngine::open(&config.engine)?);

        let raft_config = Arc::new(
            openraft::Config {
                cluster_name: "replicated-kv".to_string(),
                heartbeat_interval: config.heartbeat_interval_ms,
                election_timeout_min: config.election_timeout_lower_ms,
                election_timeout_max: config.election_timeout_upper_ms,
                snapshot_policy: if config.snapshot_distance > 0 {
                    openraft::SnapshotPolicy::LogsSinceLast(config.snapshot_distance)
                } else {
                    openraft::SnapshotPolicy::Never
                },
                max_in_snapshot_log_to_keep: config.reserved_log_items,
                ..Default::default()
            }
            .validate()
            .map_err(|e| ReplicaError::RaftConfig(e.to_string()))?,
        );

        let (store, _applied_rx) = KvStore::new(engine.clone());
        let (log_store, state_machine) = Adaptor::new(store);

        let node_id = config.server_id as NodeId;
        let raft = openraft::Raft::new(
            node_id,
            raft_config,
            GrpcNetworkFactory,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ReplicaError::RaftInit(e.to_string()))?;

        let raft_shutdown = spawn_raft_transport(&config.raft_addr, raft.clone())?;

        if config.join_seed.is_none() {
            // Fresh single-member cluster. Restarts land here too; openraft
            // rejects re-initialization and we keep the existing state.
            let members: BTreeMap<NodeId, PeerNode> = BTreeMap::from([(
                node_id,
                PeerNode {
                    raft_addr: config.raft_addr.clone(),
                    client_addr: config.advertise_client_addr.clone(),
                },
            )]);
            if let Err(e) = raft.initialize(members).await {
                info!(error = %e, "raft already initialized (ignoring on restart)");
            }
        }

        let replica = Arc::new(Self {
            server_id: config.server_id,
            raft: raft.clone(),
            engine,
            return_method: config.return_method,
            client_req_timeout: Duration::from_millis(config.client_req_timeout_ms),
            raft_shutdown: Mutex::new(Some(raft_shutdown)),
        });

        spawn_metrics_watcher(config.server_id, raft);

        info!(
            server_id = config.server_id,
            raft_addr = %config.raft_addr,
            mode = ?config.return_method,
            "replica started"
        );

        Ok(replica)
    }

    /// Ask `seed` (an existing peer's join port) to add this replica to the
    /// cluster.
    pub async fn join_via(&self, seed: &str, config: &ServerConfig) -> Result<(), ReplicaError> {
        let (rc, message) = request_join(
            seed,
            config.server_id,
            &config.raft_addr,
            &config.advertise_client_addr,
        )
        .await?;

        if rc != RC_OK {
            return Err(ReplicaError::JoinFailed {
                seed: seed.to_string(),
                message: format!("rc={rc}: {message}"),
            });
        }
        info!(seed, server_id = self.server_id, "joined cluster");
        Ok(())
    }

    // ── Log append ────────────────────────────────────────────────────────────

    /// Serialize `op`, submit it to raft, and return the pending result.
    /// Surfaces failures through the handle; never retries.
    pub fn append_log(&self, op: Operation) -> AppendHandle {
        let (tx, rx) = oneshot::channel();
        let raft = self.raft.clone();
        let req_timeout = self.client_req_timeout;

        tokio::spawn(async move {
            let write = raft.client_write(EncodedOperation(op.encode()));
            let result = match tokio::time::timeout(req_timeout, write).await {
                Ok(Ok(resp)) => MutationResult {
                    engine_rc: resp.data.engine_rc,
                    raft_rc: RC_OK,
                    raft_msg: String::new(),
                },
                Ok(Err(e)) => {
                    let (raft_rc, raft_msg) = write_error_to_rc(&e);
                    MutationResult {
                        engine_rc: 0,
                        raft_rc,
                        raft_msg,
                    }
                }
                Err(_) => MutationResult {
                    engine_rc: 0,
                    raft_rc: RC_COMMIT_UNCERTAIN,
                    raft_msg: format!(
                        "no state-machine result within {} ms; commit state uncertain",
                        req_timeout.as_millis()
                    ),
                },
            };
            // The receiver may be gone if the caller was cancelled.
            let _ = tx.send(result);
        });

        AppendHandle {
            mode: self.return_method,
            rx,
        }
    }

    // ── Local reads ───────────────────────────────────────────────────────────

    /// Synchronous lookup against the local engine. Reflects some committed
    /// prefix of the log; never consults raft.
    pub fn read(&self, key: &[u8]) -> (Option<Vec<u8>>, i32) {
        self.engine.lookup(key)
    }

    // ── Membership ────────────────────────────────────────────────────────────

    /// Add a peer as a voter. Idempotent for an id that is already one.
    pub async fn add_server(
        &self,
        server_id: i32,
        raft_endpoint: &str,
        client_endpoint: &str,
    ) -> (i32, String) {
        let node_id = server_id as NodeId;
        let membership = {
            let metrics = self.raft.metrics().borrow().clone();
            metrics.membership_config.membership().clone()
        };

        if membership.voter_ids().any(|v| v == node_id) {
            return (RC_OK, format!("server {server_id} is already a member"));
        }

        let node = PeerNode {
            raft_addr: raft_endpoint.to_string(),
            client_addr: client_endpoint.to_string(),
        };

        if let Err(e) = self.raft.add_learner(node_id, node, true).await {
            let (rc, msg) = write_error_to_rc(&e);
            error!(server_id, rc, message = %msg, "failed to add learner");
            return (rc, msg);
        }

        let mut voters: BTreeSet<NodeId> = membership.voter_ids().collect();
        voters.insert(node_id);

        match self.raft.change_membership(voters, false).await {
            Ok(_) => {
                info!(
                    server_id,
                    raft_endpoint, client_endpoint, "add_server succeeded"
                );
                (RC_OK, String::new())
            }
            Err(e) => {
                let (rc, msg) = write_error_to_rc(&e);
                error!(server_id, rc, message = %msg, "failed to change membership");
                (rc, msg)
            }
        }
    }

    /// This peer's id.
    pub fn get_server_id(&self) -> i32 {
        self.server_id
    }

    /// The current leader's id, or [`NO_LIVE_LEADER`].
    pub fn get_leader(&self) -> i32 {
        self.raft
            .metrics()
            .borrow()
            .current_leader
            .map(|id| id as i32)
            .unwrap_or(NO_LIVE_LEADER)
    }

    /// Current membership with each peer's advertised client endpoint.
    pub fn get_all_servers(&self) -> Vec<ServerInfo> {
        let metrics = self.raft.metrics().borrow().clone();
        metrics
            .membership_config
            .membership()
            .nodes()
            .map(|(id, node)| ServerInfo {
                id: *id as i32,
                client_endpoint: node.client_addr.clone(),
            })
            .collect()
    }

    /// Block until some peer holds leadership, up to `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        let mut metrics = self.raft.metrics();
        loop {
            let leader = metrics.borrow_and_update().current_leader;
            if let Some(id) = leader {
                return Some(id as i32);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match tokio::time::timeout(remaining, metrics.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }

    // ── Engine discipline ─────────────────────────────────────────────────────

    /// Must be called once per worker thread that will call [`read`] or
    /// reach the engine through the apply path.
    ///
    /// [`read`]: Replica::read
    pub fn register_thread(&self) {
        self.engine.register_thread();
    }

    pub fn deregister_thread(&self) {
        self.engine.deregister_thread();
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Stop raft and its transport listener. If raft does not come down
    /// within `time_limit`, abandon it and return.
    pub async fn shutdown(&self, time_limit: Duration) {
        if let Some(tx) = self.raft_shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }

        match tokio::time::timeout(time_limit, self.raft.shutdown()).await {
            Ok(Ok(())) => info!(server_id = self.server_id, "replica shut down"),
            Ok(Err(e)) => error!(server_id = self.server_id, error = %e, "raft shutdown error"),
            Err(_) => warn!(
                server_id = self.server_id,
                "raft shutdown exceeded {} s; force-abandoning",
                time_limit.as_secs()
            ),
        }
    }
}

/// Serve the raft transport on `raft_addr`; returns the shutdown trigger.
fn spawn_raft_transport(
    raft_addr: &str,
    raft: RaftInstance,
) -> Result<oneshot::Sender<()>, ReplicaError> {
    let addr: SocketAddr = raft_addr
        .parse()
        .map_err(|e: std::net::AddrParseError| ReplicaError::InvalidAddress {
            addr: raft_addr.to_string(),
            message: e.to_string(),
        })?;

    let (tx, rx) = oneshot::channel::<()>();
    let service = RaftServiceServer::new(RaftTransportService::new(raft));

    tokio::spawn(async move {
        let result = Server::builder()
            .add_service(service)
            .serve_with_shutdown(addr, async {
                let _ = rx.await;
            })
            .await;
        if let Err(e) = result {
            error!(addr = %addr, error = %e, "raft transport server error");
        }
    });

    info!(addr = %addr, "raft transport listening");
    Ok(tx)
}

/// Log leadership and term changes as they happen.
fn spawn_metrics_watcher(server_id: i32, raft: RaftInstance) {
    let mut rx = raft.metrics();
    tokio::spawn(async move {
        let mut last_leader = None;
        loop {
            let m = rx.borrow_and_update().clone();
            if m.current_leader != last_leader {
                info!(
                    server_id,
                    leader = ?m.current_leader,
                    term = m.current_term,
                    state = ?m.state,
                    "raft leadership changed"
                );
                last_leader = m.current_leader;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    });
}

/// Call `Join` on an existing peer's join port.
pub async fn request_join(
    seed: &str,
    server_id: i32,
    raft_endpoint: &str,
    client_endpoint: &str,
) -> Result<(i32, String), ReplicaError> {
    let uri = if seed.starts_with("http") {
        seed.to_string()
    } else {
        format!("http://{seed}")
    };

    let mut client = JoinServiceClient::connect(uri).await?;
    let reply = client
        .join(JoinRequest {
            server_id,
            raft_endpoint: raft_endpoint.to_string(),
            client_endpoint: client_endpoint.to_string(),
        })
        .await
        .map_err(|e| ReplicaError::JoinFailed {
            seed: seed.to_string(),
            message: e.to_string(),
        })?
        .into_inner();

    Ok((reply.rc, reply.message))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
