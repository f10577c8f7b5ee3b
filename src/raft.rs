//! Raft type configuration and the peer-to-peer transport plane.
//!
//! Consensus is provided by the `openraft` crate (version 0.9); this module
//! wires it to the rest of the system:
//!
//! - the `declare_raft_types!` configuration (application payloads are
//!   codec-encoded operations, responses carry the engine return code);
//! - [`PeerNode`], the membership datum holding both the raft endpoint and
//!   the client-facing endpoint advertised to drivers;
//! - [`GrpcNetwork`] / [`GrpcNetworkFactory`], the outbound transport:
//!   openraft requests are JSON-serialized and carried in the
//!   `RaftService` proto `payload: bytes` field;
//! - [`RaftTransportService`], the inbound side, forwarding decoded
//!   requests to the local raft instance.
//!
//! ## Implementation note on async traits
//!
//! openraft 0.9 traits use RPITIT (return-position impl Trait in Trait).
//! Implementations must use plain `async fn` — NOT `#[async_trait]` — to
//! match the expected signatures. The tonic service below is the opposite
//! case and keeps `#[tonic::async_trait]`.

use std::io::Cursor;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{AnyError, Entry, TokioRuntime};
use serde::{Deserialize, Serialize};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::raft_service_server::RaftService;
use crate::proto::{RaftReply, RaftRequest};

// ── Type configuration ────────────────────────────────────────────────────────

/// A log entry payload: an [`Operation`](crate::operation::Operation) in
/// its wire encoding. Kept as raw bytes so every peer applies exactly what
/// the log carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedOperation(pub Vec<u8>);

/// State machine response after applying one committed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub engine_rc: i32,
}

/// Membership datum for one peer: where raft traffic goes and where
/// clients should connect. Both addresses are `host:port`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    pub raft_addr: String,
    pub client_addr: String,
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = EncodedOperation,
        R            = ApplyResponse,
        NodeId       = u64,
        Node         = PeerNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

// ── Outbound transport ────────────────────────────────────────────────────────

/// Per-peer gRPC channel implementing openraft's `RaftNetwork`.
pub struct GrpcNetwork {
    target_addr: String,
    client: Option<RaftServiceClient<Channel>>,
}

impl GrpcNetwork {
    fn get_client(&mut self) -> Result<&mut RaftServiceClient<Channel>, String> {
        if self.client.is_none() {
            let uri = if self.target_addr.starts_with("http") {
                self.target_addr.clone()
            } else {
                format!("http://{}", self.target_addr)
            };
            // connect_lazy() returns immediately; tonic dials on the first
            // RPC and reconnects automatically on failure. connect_timeout
            // bounds the TCP handshake, timeout bounds each RPC so
            // heartbeats fail fast instead of hanging past a follower's
            // election timer.
            let ch = Endpoint::from_shared(uri)
                .map_err(|e| e.to_string())?
                .connect_timeout(Duration::from_secs(3))
                .timeout(Duration::from_secs(4))
                .connect_lazy();
            self.client = Some(RaftServiceClient::new(ch));
        }
        Ok(self.client.as_mut().unwrap())
    }
}

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

impl RaftNetwork<TypeConfig> for GrpcNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, PeerNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let reply = client
            .append_entries(RaftRequest { payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&reply.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, PeerNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let reply = client
            .vote(RaftRequest { payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&reply.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, PeerNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let reply = client
            .install_snapshot(RaftRequest { payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&reply.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates [`GrpcNetwork`] instances per target peer.
pub struct GrpcNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = GrpcNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &PeerNode) -> Self::Network {
        GrpcNetwork {
            target_addr: node.raft_addr.clone(),
            client: None,
        }
    }
}

// ── Inbound transport ─────────────────────────────────────────────────────────

/// Server side of the raft transport: decodes the JSON payload and hands
/// the request to the local raft instance.
pub struct RaftTransportService {
    raft: RaftInstance,
}

impl RaftTransportService {
    pub fn new(raft: RaftInstance) -> Self {
        Self { raft }
    }
}

#[tonic::async_trait]
impl RaftService for RaftTransportService {
    async fn append_entries(
        &self,
        req: Request<RaftRequest>,
    ) -> Result<Response<RaftReply>, Status> {
        let raft_req: AppendEntriesRequest<TypeConfig> =
            serde_json::from_slice(&req.into_inner().payload).map_err(|e| {
                Status::invalid_argument(format!("failed to decode AppendEntriesRequest: {e}"))
            })?;

        let resp = self
            .raft
            .append_entries(raft_req)
            .await
            .map_err(|e| Status::internal(format!("raft AppendEntries error: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))?;

        Ok(Response::new(RaftReply { payload }))
    }

    async fn vote(&self, req: Request<RaftRequest>) -> Result<Response<RaftReply>, Status> {
        let raft_req: VoteRequest<NodeId> = serde_json::from_slice(&req.into_inner().payload)
            .map_err(|e| Status::invalid_argument(format!("failed to decode VoteRequest: {e}")))?;

        let resp = self
            .raft
            .vote(raft_req)
            .await
            .map_err(|e| Status::internal(format!("raft Vote error: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))?;

        Ok(Response::new(RaftReply { payload }))
    }

    async fn install_snapshot(
        &self,
        req: Request<RaftRequest>,
    ) -> Result<Response<RaftReply>, Status> {
        let raft_req: InstallSnapshotRequest<TypeConfig> =
            serde_json::from_slice(&req.into_inner().payload).map_err(|e| {
                Status::invalid_argument(format!("failed to decode InstallSnapshotRequest: {e}"))
            })?;

        let resp = self
            .raft
            .install_snapshot(raft_req)
            .await
            .map_err(|e| Status::internal(format!("raft InstallSnapshot error: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))?;

        Ok(Response::new(RaftReply { payload }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;

    #[test]
    fn encoded_operation_serializes_roundtrip() {
        let op = Operation::put(&b"k"[..], &b"v"[..]);
        let entry = EncodedOperation(op.encode());
        let json = serde_json::to_vec(&entry).unwrap();
        let back: EncodedOperation = serde_json::from_slice(&json).unwrap();
        assert_eq!(Operation::decode(&back.0).unwrap(), op);
    }

    #[test]
    fn peer_node_carries_both_endpoints() {
        let node = PeerNode {
            raft_addr: "127.0.0.1:9000".into(),
            client_addr: "127.0.0.1:9001".into(),
        };
        let json = serde_json::to_string(&node).unwrap();
        let back: PeerNode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }
}
