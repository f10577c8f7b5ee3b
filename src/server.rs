//! The server orchestrator: RPC services, dispatcher wiring, lifecycle.
//!
//! One [`KvServer`] per replica process. It owns the [`Replica`], the
//! [`Dispatcher`] with its worker pool, and two tonic listeners: the
//! client RPC port (`KvService`) and the cluster-join port
//! (`JoinService`). The raft transport listener belongs to the replica.
//!
//! `Get`, `Put`, `Update`, `Delete`, `GetLeaderId`, and
//! `GetClusterEndpoints` are routed through the dispatch state machine;
//! `Ping`, `GetServerId`, and the cache administration RPCs are served
//! inline, mirroring how the original surface splits pending calls from
//! trivial binds.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tonic::transport::Server as TonicServer;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::config::{ReturnMethod, ServerConfig};
use crate::dispatch::{CallReply, CallRequest, Completion, Dispatcher, RequestHandler};
use crate::errors::ReplicaError;
use crate::operation::Operation;
use crate::proto::join_service_server::{JoinService, JoinServiceServer};
use crate::proto::kv_service_server::{KvService, KvServiceServer};
use crate::proto::{
    Ack, ClusterEndpoints, Directory, Empty, JoinReply, JoinRequest, Key, KvPair, MutationReply,
    PingReply, ReadReply, ServerId, ServerInfo as ProtoServerInfo,
};
use crate::replica::Replica;
use crate::types::ReadResult;

/// Timeout for bringing the replica down during shutdown.
const REPLICA_SHUTDOWN_LIMIT: Duration = Duration::from_secs(5);

// ── Request handler ───────────────────────────────────────────────────────────

/// Production [`RequestHandler`]: runs dispatched calls against the
/// replica. Mutations follow the replica's return mode: blocking awaits
/// the commit on the worker; callback mode frees the worker and lets the
/// commit callback store the reply.
pub struct ReplicaHandler {
    replica: Arc<Replica>,
    return_method: ReturnMethod,
}

impl ReplicaHandler {
    pub fn new(replica: Arc<Replica>, return_method: ReturnMethod) -> Self {
        Self {
            replica,
            return_method,
        }
    }

    async fn mutate(&self, op: Operation, completion: Completion) {
        let handle = self.replica.append_log(op);
        match self.return_method {
            ReturnMethod::Blocking => {
                let result = handle.wait().await;
                completion.complete(CallReply::Mutation(result));
            }
            ReturnMethod::AsyncCallback => {
                handle.on_ready(move |result| {
                    completion.complete(CallReply::Mutation(result));
                });
            }
        }
    }
}

impl RequestHandler for ReplicaHandler {
    async fn handle(&self, request: CallRequest, completion: Completion) {
        match request {
            CallRequest::Get { key } => {
                let (value, rc) = self.replica.read(&key);
                completion.complete(CallReply::Read(ReadResult { value, rc }));
            }
            CallRequest::Put { key, value } => {
                self.mutate(Operation::put(key, value), completion).await;
            }
            CallRequest::Update { key, value } => {
                self.mutate(Operation::update(key, value), completion).await;
            }
            CallRequest::Delete { key } => {
                self.mutate(Operation::delete(key), completion).await;
            }
            CallRequest::GetLeaderId => {
                completion.complete(CallReply::LeaderId(self.replica.get_leader()));
            }
            CallRequest::GetClusterEndpoints => {
                completion.complete(CallReply::ClusterEndpoints(self.replica.get_all_servers()));
            }
        }
    }

    fn worker_started(&self) {
        self.replica.register_thread();
    }

    fn worker_stopped(&self) {
        self.replica.deregister_thread();
    }
}

// ── Client RPC service ────────────────────────────────────────────────────────

struct KvRpcService {
    replica: Arc<Replica>,
    dispatcher: Arc<Dispatcher<ReplicaHandler>>,
}

impl KvRpcService {
    async fn dispatch(&self, request: CallRequest) -> Result<CallReply, Status> {
        self.dispatcher
            .submit(request)
            .await
            .map_err(|_| Status::unavailable("server is shutting down"))
    }
}

fn reply_mismatch(reply: CallReply) -> Status {
    error!(?reply, "dispatcher returned a mismatched reply kind");
    Status::internal("mismatched reply kind")
}

fn check_mutation_key(key: &[u8]) -> Result<(), Status> {
    if key.is_empty() {
        Err(Status::invalid_argument("key must be non-empty"))
    } else {
        Ok(())
    }
}

#[tonic::async_trait]
impl KvService for KvRpcService {
    async fn ping(&self, _req: Request<Empty>) -> Result<Response<PingReply>, Status> {
        Ok(Response::new(PingReply {
            message: "pong".to_string(),
        }))
    }

    async fn get_server_id(&self, _req: Request<Empty>) -> Result<Response<ServerId>, Status> {
        Ok(Response::new(ServerId {
            id: self.replica.get_server_id(),
        }))
    }

    async fn get_leader_id(&self, _req: Request<Empty>) -> Result<Response<ServerId>, Status> {
        match self.dispatch(CallRequest::GetLeaderId).await? {
            CallReply::LeaderId(id) => Ok(Response::new(ServerId { id })),
            other => Err(reply_mismatch(other)),
        }
    }

    async fn get_cluster_endpoints(
        &self,
        _req: Request<Empty>,
    ) -> Result<Response<ClusterEndpoints>, Status> {
        match self.dispatch(CallRequest::GetClusterEndpoints).await? {
            CallReply::ClusterEndpoints(servers) => Ok(Response::new(ClusterEndpoints {
                endpoints: servers
                    .into_iter()
                    .map(|s| ProtoServerInfo {
                        id: s.id,
                        endpoint: s.client_endpoint,
                    })
                    .collect(),
            })),
            other => Err(reply_mismatch(other)),
        }
    }

    async fn get(&self, req: Request<Key>) -> Result<Response<ReadReply>, Status> {
        let key = req.into_inner().key;
        match self.dispatch(CallRequest::Get { key }).await? {
            CallReply::Read(result) => Ok(Response::new(ReadReply {
                value: result.value,
                engine_rc: result.rc,
            })),
            other => Err(reply_mismatch(other)),
        }
    }

    async fn put(&self, req: Request<KvPair>) -> Result<Response<MutationReply>, Status> {
        let pair = req.into_inner();
        check_mutation_key(&pair.key)?;
        match self
            .dispatch(CallRequest::Put {
                key: pair.key,
                value: pair.value,
            })
            .await?
        {
            CallReply::Mutation(m) => Ok(Response::new(MutationReply {
                engine_rc: m.engine_rc,
                raft_rc: m.raft_rc,
                raft_msg: m.raft_msg,
            })),
            other => Err(reply_mismatch(other)),
        }
    }

    async fn update(&self, req: Request<KvPair>) -> Result<Response<MutationReply>, Status> {
        let pair = req.into_inner();
        check_mutation_key(&pair.key)?;
        match self
            .dispatch(CallRequest::Update {
                key: pair.key,
                value: pair.value,
            })
            .await?
        {
            CallReply::Mutation(m) => Ok(Response::new(MutationReply {
                engine_rc: m.engine_rc,
                raft_rc: m.raft_rc,
                raft_msg: m.raft_msg,
            })),
            other => Err(reply_mismatch(other)),
        }
    }

    async fn delete(&self, req: Request<Key>) -> Result<Response<MutationReply>, Status> {
        let key = req.into_inner().key;
        check_mutation_key(&key)?;
        match self.dispatch(CallRequest::Delete { key }).await? {
            CallReply::Mutation(m) => Ok(Response::new(MutationReply {
                engine_rc: m.engine_rc,
                raft_rc: m.raft_rc,
                raft_msg: m.raft_msg,
            })),
            other => Err(reply_mismatch(other)),
        }
    }

    async fn dump_cache(&self, req: Request<Directory>) -> Result<Response<Ack>, Status> {
        let directory = req.into_inner().directory;
        let ok = self.replica.engine().dump_stats(&directory);
        Ok(Response::new(Ack { ok }))
    }

    async fn clear_cache(&self, _req: Request<Empty>) -> Result<Response<Ack>, Status> {
        let ok = self.replica.engine().clear_cache();
        Ok(Response::new(Ack { ok }))
    }
}

// ── Join RPC service ──────────────────────────────────────────────────────────

struct JoinRpcService {
    replica: Arc<Replica>,
}

#[tonic::async_trait]
impl JoinService for JoinRpcService {
    async fn join(&self, req: Request<JoinRequest>) -> Result<Response<JoinReply>, Status> {
        let join = req.into_inner();
        info!(
            server_id = join.server_id,
            raft_endpoint = %join.raft_endpoint,
            client_endpoint = %join.client_endpoint,
            "join request received"
        );
        let (rc, message) = self
            .replica
            .add_server(join.server_id, &join.raft_endpoint, &join.client_endpoint)
            .await;
        Ok(Response::new(JoinReply { rc, message }))
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// A running replica process: replica + dispatcher + both listeners.
pub struct KvServer {
    replica: Arc<Replica>,
    dispatcher: Arc<Dispatcher<ReplicaHandler>>,
    client_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    join_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl KvServer {
    /// Bring up the replica (bootstrapping or joining per the config),
    /// start the dispatch workers, and serve both RPC ports.
    pub async fn start(config: &ServerConfig) -> Result<Arc<Self>, ReplicaError> {
        let replica = Replica::start(config).await?;

        if let Some(seed) = &config.join_seed {
            replica.join_via(seed, config).await?;
        }

        let handler = Arc::new(ReplicaHandler::new(replica.clone(), config.return_method));
        let dispatcher = Dispatcher::new(handler);
        dispatcher.run_workers(config.dispatch_workers);

        let client_service = KvServiceServer::new(KvRpcService {
            replica: replica.clone(),
            dispatcher: dispatcher.clone(),
        });
        let client_shutdown = serve(&config.client_addr, "client RPC", move |addr, rx| {
            TonicServer::builder()
                .add_service(client_service)
                .serve_with_shutdown(addr, async {
                    let _ = rx.await;
                })
        })?;

        let join_service = JoinServiceServer::new(JoinRpcService {
            replica: replica.clone(),
        });
        let join_shutdown = serve(&config.join_addr, "cluster join RPC", move |addr, rx| {
            TonicServer::builder()
                .add_service(join_service)
                .serve_with_shutdown(addr, async {
                    let _ = rx.await;
                })
        })?;

        info!(
            server_id = config.server_id,
            client_addr = %config.client_addr,
            join_addr = %config.join_addr,
            workers = config.dispatch_workers,
            "server running"
        );

        Ok(Arc::new(Self {
            replica,
            dispatcher,
            client_shutdown: Mutex::new(Some(client_shutdown)),
            join_shutdown: Mutex::new(Some(join_shutdown)),
        }))
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// Stop accepting client RPCs, drain the dispatcher, stop the join
    /// listener, then bring the replica down within a bounded timeout.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.client_shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.dispatcher.shutdown();
        if let Some(tx) = self.join_shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.replica.shutdown(REPLICA_SHUTDOWN_LIMIT).await;
        info!("server stopped");
    }
}

/// Parse `addr`, spawn the given tonic serve future, return its shutdown
/// trigger.
fn serve<F, Fut>(addr: &str, what: &'static str, f: F) -> Result<oneshot::Sender<()>, ReplicaError>
where
    F: FnOnce(SocketAddr, oneshot::Receiver<()>) -> Fut,
    Fut: std::future::Future<Output = Result<(), tonic::transport::Error>> + Send + 'static,
{
    let socket_addr: SocketAddr =
        addr.parse()
            .map_err(|e: std::net::AddrParseError| ReplicaError::InvalidAddress {
                addr: addr.to_string(),
                message: e.to_string(),
            })?;

    let (tx, rx) = oneshot::channel();
    let fut = f(socket_addr, rx);
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(error = %e, "{what} server error");
        }
    });
    info!(addr = %socket_addr, "{what} listening");
    Ok(tx)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// A client RPC service over a real single-node replica on loopback.
    async fn test_service() -> (KvRpcService, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig::new(
            7,
            format!("127.0.0.1:{}", free_port()),
            format!("127.0.0.1:{}", free_port()),
            format!("127.0.0.1:{}", free_port()),
            tmp.path().join("db").to_string_lossy().into_owned(),
        );

        let replica = Replica::start(&config).await.unwrap();
        let dispatcher = Dispatcher::new(Arc::new(ReplicaHandler::new(
            replica.clone(),
            config.return_method,
        )));
        dispatcher.run_workers(2);

        (KvRpcService { replica, dispatcher }, tmp)
    }

    // ── Inline helpers ────────────────────────────────────────────────────

    #[test]
    fn empty_mutation_keys_are_rejected() {
        let err = check_mutation_key(b"").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(check_mutation_key(b"k").is_ok());
    }

    #[test]
    fn mismatched_reply_kinds_are_internal_errors() {
        let status = reply_mismatch(CallReply::LeaderId(1));
        assert_eq!(status.code(), Code::Internal);
    }

    // ── Inline RPCs ───────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ping_replies_pong() {
        let (svc, _tmp) = test_service().await;
        let reply = svc.ping(Request::new(Empty {})).await.unwrap().into_inner();
        assert_eq!(reply.message, "pong");
        svc.replica.shutdown(REPLICA_SHUTDOWN_LIMIT).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn get_server_id_reports_this_peer() {
        let (svc, _tmp) = test_service().await;
        let reply = svc
            .get_server_id(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.id, 7);
        svc.replica.shutdown(REPLICA_SHUTDOWN_LIMIT).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cache_rpcs_acknowledge() {
        let (svc, _tmp) = test_service().await;

        let dump_dir = tempfile::tempdir().unwrap();
        let reply = svc
            .dump_cache(Request::new(Directory {
                directory: dump_dir.path().to_string_lossy().into_owned(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(reply.ok);
        assert!(dump_dir.path().join("engine-stats.txt").exists());

        let reply = svc
            .clear_cache(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert!(reply.ok);

        svc.replica.shutdown(REPLICA_SHUTDOWN_LIMIT).await;
    }

    // ── Dispatched RPCs ───────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leader_id_flows_through_the_dispatcher() {
        let (svc, _tmp) = test_service().await;
        let leader = svc.replica.wait_for_leader(Duration::from_secs(10)).await;
        assert_eq!(leader, Some(7), "single node must elect itself");

        let reply = svc
            .get_leader_id(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.id, 7);
        svc.replica.shutdown(REPLICA_SHUTDOWN_LIMIT).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_keys_never_reach_the_log() {
        let (svc, _tmp) = test_service().await;

        let err = svc
            .put(Request::new(KvPair {
                key: Vec::new(),
                value: b"v".to_vec(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = svc
            .delete(Request::new(Key { key: Vec::new() }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        svc.replica.shutdown(REPLICA_SHUTDOWN_LIMIT).await;
    }
}
