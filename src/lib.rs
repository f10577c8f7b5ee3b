//! A replicated key-value store.
//!
//! A fixed-membership cluster of peers, each hosting an embedded sled
//! engine, coordinates writes through an openraft consensus log and
//! exposes a gRPC surface for reads, writes, and cluster administration.
//! Clients connect to any peer, discover the cluster, direct mutations to
//! the current leader, and spread reads across peers with a pluggable
//! policy.
//!
//! The moving parts:
//!
//! - [`operation`]: typed mutations and the log-entry codec;
//! - [`engine`]: the embedded store behind every replica;
//! - [`store`]: the raft log + engine-backed state machine;
//! - [`raft`]: openraft type config and the gRPC transport plane;
//! - [`replica`]: the per-process facade over all of the above;
//! - [`dispatch`]: the per-call state machine behind the RPC surface;
//! - [`server`]: the orchestrator serving the client and join ports;
//! - [`client`]: the driver with read routing and leader retry;
//! - [`read_policy`]: the routing strategies.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod operation;
pub mod raft;
pub mod read_policy;
pub mod replica;
pub mod server;
pub mod store;
pub mod types;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("repkv");
}

pub use client::{ClientOptions, KvClient};
pub use config::{ReadAlgorithm, ReturnMethod, ServerConfig};
pub use server::KvServer;
pub use types::{MutationResult, ReadResult, ServerInfo};
