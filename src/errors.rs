//! Error taxonomies and the raft-to-wire code mapping.
//!
//! Two families of failures exist: typed errors (`ClientError`,
//! `ReplicaError`) that surface through `Result`, and numeric return codes
//! that ride RPC replies (see [`crate::types`]). Raft write failures are
//! folded into `(raft_rc, raft_msg)` pairs here so every surface reports
//! identical codes.

use openraft::error::{ClientWriteError, RaftError};
use thiserror::Error;

use crate::raft::{NodeId, PeerNode};
use crate::types::{RC_APPEND_REJECTED, RC_NOT_LEADER, RC_REQUEST_CANCELLED};

/// Failures surfaced by the client driver.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid endpoint \"{0}\": expected host:port with port in [1, 65535]")]
    InvalidEndpoint(String),

    #[error("server returned unexpected ping response: {0:?}")]
    UnexpectedPingReply(String),

    #[error("transport error talking to server {server_id}: {status}")]
    Transport {
        server_id: i32,
        status: tonic::Status,
    },

    #[error("failed to connect to {endpoint}: {source}")]
    ConnectFailed {
        endpoint: String,
        source: tonic::transport::Error,
    },

    #[error("no live leader after {attempts} attempts")]
    NoLiveLeader { attempts: u32 },

    #[error("no known peer handle for server {0}")]
    UnknownServer(i32),

    #[error("failed to connect to any server")]
    AllPeersUnreachable,

    #[error(transparent)]
    Policy(#[from] crate::read_policy::PolicyError),

    #[error("the fixed read policy requires a key-to-peer mapping")]
    MissingFixedMapping,
}

/// Failures bringing a replica up or tearing it down.
#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("failed to open engine: {0}")]
    EngineOpen(#[from] sled::Error),

    #[error("invalid raft configuration: {0}")]
    RaftConfig(String),

    #[error("failed to create raft instance: {0}")]
    RaftInit(String),

    #[error("invalid listen address \"{addr}\": {message}")]
    InvalidAddress { addr: String, message: String },

    #[error("cluster join via {seed} failed: {message}")]
    JoinFailed { seed: String, message: String },

    #[error("raft transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Fold an openraft write error into the `(raft_rc, raft_msg)` pair that
/// rides mutation replies. Leadership loss maps to `RC_NOT_LEADER` with a
/// leader hint when one is known; a fatal raft error maps to
/// `RC_REQUEST_CANCELLED`; everything else is an append rejection.
pub fn write_error_to_rc(
    err: &RaftError<NodeId, ClientWriteError<NodeId, PeerNode>>,
) -> (i32, String) {
    if let Some(fwd) = err.forward_to_leader() {
        let msg = match fwd.leader_id {
            Some(leader) => format!("not leader; current leader is {leader}"),
            None => "not leader; no live leader known".to_string(),
        };
        return (RC_NOT_LEADER, msg);
    }

    match err {
        RaftError::Fatal(fatal) => (RC_REQUEST_CANCELLED, format!("request cancelled: {fatal}")),
        RaftError::APIError(api) => (RC_APPEND_REJECTED, api.to_string()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
