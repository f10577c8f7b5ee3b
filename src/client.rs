//! The client driver: discovery, read routing, and leader-directed writes.
//!
//! Construction connects to any one peer, verifies it with `Ping`, pulls
//! the cluster view, opens a handle per advertised peer, and caches the
//! leader id. Reads go to whichever peer the configured
//! [`ReadPolicy`](crate::read_policy::ReadPolicy) picks; a non-zero
//! `engine_rc` (a missing key) is a result, not a failure to retry.
//! Writes go to the cached leader and loop on leadership errors:
//! rediscover, back off exponentially from 100 ms, retry up to
//! `max_retries`.
//!
//! The `999` commit-uncertain code is surfaced with a warning and
//! normalized to success; the caller must verify the key if it matters.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use crate::config::ReadAlgorithm;
use crate::errors::ClientError;
use crate::proto::kv_service_client::KvServiceClient;
use crate::proto::{Directory, Empty, Key, KvPair, MutationReply};
use crate::read_policy::{
    FixedPolicy, HashPolicy, RandomTokenPolicy, RandomUniformPolicy, ReadPolicy, RoundRobinPolicy,
};
use crate::types::{
    MutationResult, ReadResult, ServerInfo, NO_LIVE_LEADER, RC_COMMIT_UNCERTAIN, RC_NOT_LEADER,
    RC_REQUEST_CANCELLED,
};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Driver settings beyond the seed address.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub read_algorithm: ReadAlgorithm,
    /// Ring tokens per peer for the hash and random-token policies.
    pub num_tokens: usize,
    /// Key-to-peer-index mapping, required by the fixed policy.
    pub fixed_mapping: Option<HashMap<Vec<u8>, usize>>,
    /// Per-call RPC timeout.
    pub timeout: Duration,
    pub max_retries: u32,
    /// Log retry progress, not just failures.
    pub verbose: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            read_algorithm: ReadAlgorithm::Hash,
            num_tokens: 3,
            fixed_mapping: None,
            timeout: Duration::from_secs(10),
            max_retries: 3,
            verbose: false,
        }
    }
}

enum MutationOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Update { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// A connected driver holding one RPC handle per reachable peer.
pub struct KvClient {
    peers: BTreeMap<i32, KvServiceClient<Channel>>,
    read_policy: Mutex<Box<dyn ReadPolicy>>,
    leader_id: Mutex<i32>,
    max_retries: u32,
    verbose: bool,
}

impl KvClient {
    /// Discover the cluster through the peer at `host:port` and connect to
    /// every advertised endpoint. Peers that cannot be reached are skipped
    /// with a warning; at least one must remain.
    pub async fn connect(
        host: &str,
        port: u16,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let mut seed = open_channel(&format!("{host}:{port}"), options.timeout).await?;

        let ping = seed
            .ping(Empty {})
            .await
            .map_err(|status| ClientError::Transport {
                server_id: 0,
                status,
            })?
            .into_inner()
            .message;
        if ping != "pong" {
            return Err(ClientError::UnexpectedPingReply(ping));
        }

        let endpoints = seed
            .get_cluster_endpoints(Empty {})
            .await
            .map_err(|status| ClientError::Transport {
                server_id: 0,
                status,
            })?
            .into_inner()
            .endpoints;

        let mut peers = BTreeMap::new();
        for info in endpoints {
            let (peer_host, peer_port) = parse_endpoint(&info.endpoint)?;
            let addr = format!("{peer_host}:{peer_port}");
            match open_channel(&addr, options.timeout).await {
                Ok(client) => {
                    peers.insert(info.id, client);
                }
                Err(e) => {
                    warn!(
                        server_id = info.id,
                        endpoint = %info.endpoint,
                        error = %e,
                        "failed to connect to peer, skipping"
                    );
                }
            }
        }
        if peers.is_empty() {
            return Err(ClientError::AllPeersUnreachable);
        }

        let leader_id = seed
            .get_leader_id(Empty {})
            .await
            .map_err(|status| ClientError::Transport {
                server_id: 0,
                status,
            })?
            .into_inner()
            .id;

        let server_ids: Vec<i32> = peers.keys().copied().collect();
        let read_policy = build_policy(&options, server_ids)?;

        info!(
            peers = peers.len(),
            leader_id,
            algorithm = ?options.read_algorithm,
            "client connected"
        );

        Ok(Self {
            peers,
            read_policy: Mutex::new(read_policy),
            leader_id: Mutex::new(leader_id),
            max_retries: options.max_retries,
            verbose: options.verbose,
        })
    }

    /// Server ids with an open handle, in ascending order.
    pub fn connected_servers(&self) -> Vec<i32> {
        self.peers.keys().copied().collect()
    }

    /// The cached leader id. May be stale; writes rediscover on demand.
    pub fn cached_leader_id(&self) -> i32 {
        *self.leader_id.lock().unwrap()
    }

    fn peer(&self, server_id: i32) -> Result<KvServiceClient<Channel>, ClientError> {
        self.peers
            .get(&server_id)
            .cloned()
            .ok_or(ClientError::UnknownServer(server_id))
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    /// Read `key` from the peer chosen by the read policy.
    pub async fn get(&self, key: &[u8]) -> Result<ReadResult, ClientError> {
        let server_id = self.read_policy.lock().unwrap().next_server(key);
        self.get_from(key, server_id).await
    }

    /// Read `key` from a specific peer, bypassing the policy.
    pub async fn get_from(&self, key: &[u8], server_id: i32) -> Result<ReadResult, ClientError> {
        let mut client = self.peer(server_id)?;
        let reply = client
            .get(Key { key: key.to_vec() })
            .await
            .map_err(|status| ClientError::Transport { server_id, status })?
            .into_inner();

        Ok(ReadResult {
            value: reply.value,
            rc: reply.engine_rc,
        })
    }

    // ── Writes ────────────────────────────────────────────────────────────────

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<MutationResult, ClientError> {
        self.retry_mutation(MutationOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })
        .await
    }

    pub async fn update(&self, key: &[u8], value: &[u8]) -> Result<MutationResult, ClientError> {
        self.retry_mutation(MutationOp::Update {
            key: key.to_vec(),
            value: value.to_vec(),
        })
        .await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<MutationResult, ClientError> {
        self.retry_mutation(MutationOp::Delete { key: key.to_vec() })
            .await
    }

    async fn call_leader(&self, op: &MutationOp) -> Result<MutationReply, ClientError> {
        let leader = self.cached_leader_id();
        let mut client = self.peer(leader)?;
        let reply = match op {
            MutationOp::Put { key, value } => {
                client
                    .put(KvPair {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .await
            }
            MutationOp::Update { key, value } => {
                client
                    .update(KvPair {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .await
            }
            MutationOp::Delete { key } => client.delete(Key { key: key.clone() }).await,
        };
        reply
            .map(|r| r.into_inner())
            .map_err(|status| ClientError::Transport {
                server_id: leader,
                status,
            })
    }

    async fn retry_mutation(&self, op: MutationOp) -> Result<MutationResult, ClientError> {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut last_result: Option<MutationResult> = None;
        let mut last_error: Option<ClientError> = None;

        for attempt in 1..=self.max_retries.max(1) {
            match self.call_leader(&op).await {
                Ok(reply) => {
                    let mut result = MutationResult {
                        engine_rc: reply.engine_rc,
                        raft_rc: reply.raft_rc,
                        raft_msg: reply.raft_msg,
                    };

                    if result.was_accepted() {
                        return Ok(result);
                    }

                    if result.raft_rc == RC_COMMIT_UNCERTAIN {
                        warn!(
                            attempt,
                            msg = %result.raft_msg,
                            "commit state uncertain; verify that the key was mutated"
                        );
                        result.raft_rc = 0;
                        return Ok(result);
                    }

                    if result.raft_rc == RC_NOT_LEADER
                        || result.raft_rc == RC_REQUEST_CANCELLED
                    {
                        if self.verbose {
                            warn!(attempt, raft_rc = result.raft_rc, "leader changed, retrying");
                        }
                        last_result = Some(result);
                        self.rediscover_leader().await;
                    } else {
                        // Rejected for a non-leadership reason; surface it.
                        return Ok(result);
                    }
                }
                Err(e) => {
                    if self.verbose {
                        warn!(attempt, error = %e, "leader call failed, retrying");
                    }
                    last_error = Some(e);
                    self.rediscover_leader().await;
                }
            }

            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        match (last_result, last_error) {
            (Some(result), _) => Ok(result),
            (None, Some(e)) => Err(e),
            (None, None) => Err(ClientError::NoLiveLeader {
                attempts: self.max_retries,
            }),
        }
    }

    async fn rediscover_leader(&self) {
        match self.leader_id_with_backoff().await {
            Ok(new_leader) => {
                let old = {
                    let mut cached = self.leader_id.lock().unwrap();
                    std::mem::replace(&mut *cached, new_leader)
                };
                if self.verbose && old != new_leader {
                    info!(old, new = new_leader, "leader changed");
                }
            }
            Err(e) => warn!(error = %e, "leader rediscovery failed"),
        }
    }

    // ── Cluster queries ───────────────────────────────────────────────────────

    /// Ask each peer in turn for the leader id, backing off exponentially
    /// from 100 ms while a peer answers `-1` (election in progress). A
    /// transport failure moves on to the next peer.
    pub async fn leader_id_with_backoff(&self) -> Result<i32, ClientError> {
        for (&server_id, client) in &self.peers {
            let mut client = client.clone();
            let mut delay = INITIAL_RETRY_DELAY;

            for _ in 0..self.max_retries.max(1) {
                match client.get_leader_id(Empty {}).await {
                    Ok(reply) => {
                        let id = reply.into_inner().id;
                        if id != NO_LIVE_LEADER {
                            return Ok(id);
                        }
                        if self.verbose {
                            warn!(server_id, "no live leader, retrying");
                        }
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    Err(status) => {
                        warn!(server_id, error = %status, "leader query failed, trying next peer");
                        break;
                    }
                }
            }
        }

        Err(ClientError::NoLiveLeader {
            attempts: self.max_retries,
        })
    }

    /// The cluster view from the first peer that answers.
    pub async fn all_servers(&self) -> Result<Vec<ServerInfo>, ClientError> {
        for (&server_id, client) in &self.peers {
            let mut client = client.clone();
            match client.get_cluster_endpoints(Empty {}).await {
                Ok(reply) => {
                    return Ok(reply
                        .into_inner()
                        .endpoints
                        .into_iter()
                        .map(|e| ServerInfo {
                            id: e.id,
                            client_endpoint: e.endpoint,
                        })
                        .collect());
                }
                Err(status) => {
                    warn!(server_id, error = %status, "cluster query failed, trying next peer");
                }
            }
        }
        Err(ClientError::AllPeersUnreachable)
    }

    // ── Cache administration ──────────────────────────────────────────────────

    /// Ask every peer to dump engine statistics into `directory`.
    pub async fn trigger_cache_dumps(&self, directory: &str) {
        for (&server_id, client) in &self.peers {
            let mut client = client.clone();
            match client
                .dump_cache(Directory {
                    directory: directory.to_string(),
                })
                .await
            {
                Ok(reply) => {
                    if !reply.into_inner().ok {
                        warn!(server_id, "failed to dump cache");
                    }
                }
                Err(status) => warn!(server_id, error = %status, "dump cache call failed"),
            }
        }
    }

    /// Ask every peer to flush its engine cache.
    pub async fn trigger_cache_clear(&self) {
        for (&server_id, client) in &self.peers {
            let mut client = client.clone();
            match client.clear_cache(Empty {}).await {
                Ok(reply) => {
                    if !reply.into_inner().ok {
                        warn!(server_id, "failed to clear cache");
                    }
                }
                Err(status) => warn!(server_id, error = %status, "clear cache call failed"),
            }
        }
    }
}

async fn open_channel(
    addr: &str,
    timeout: Duration,
) -> Result<KvServiceClient<Channel>, ClientError> {
    let endpoint = Endpoint::from_shared(format!("http://{addr}"))
        .map_err(|_| ClientError::InvalidEndpoint(addr.to_string()))?
        .connect_timeout(Duration::from_secs(5))
        .timeout(timeout);

    let channel = endpoint
        .connect()
        .await
        .map_err(|source| ClientError::ConnectFailed {
            endpoint: addr.to_string(),
            source,
        })?;

    Ok(KvServiceClient::new(channel))
}

/// Split `host:port` and validate the port range.
fn parse_endpoint(endpoint: &str) -> Result<(&str, u16), ClientError> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ClientError::InvalidEndpoint(endpoint.to_string()))?;

    let port: u32 = port
        .parse()
        .map_err(|_| ClientError::InvalidEndpoint(endpoint.to_string()))?;
    if host.is_empty() || !(1..=65535).contains(&port) {
        return Err(ClientError::InvalidEndpoint(endpoint.to_string()));
    }

    Ok((host, port as u16))
}

fn build_policy(
    options: &ClientOptions,
    server_ids: Vec<i32>,
) -> Result<Box<dyn ReadPolicy>, ClientError> {
    let policy: Box<dyn ReadPolicy> = match options.read_algorithm {
        ReadAlgorithm::RoundRobin => Box::new(RoundRobinPolicy::new(server_ids)?),
        ReadAlgorithm::Hash => Box::new(HashPolicy::new(server_ids, options.num_tokens)?),
        ReadAlgorithm::RandomToken => {
            Box::new(RandomTokenPolicy::new(server_ids, options.num_tokens)?)
        }
        ReadAlgorithm::RandomUniform => Box::new(RandomUniformPolicy::new(server_ids)?),
        ReadAlgorithm::Fixed => {
            let mapping = options
                .fixed_mapping
                .clone()
                .ok_or(ClientError::MissingFixedMapping)?;
            Box::new(FixedPolicy::new(server_ids, mapping)?)
        }
    };
    Ok(policy)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoint_accepts_host_port() {
        assert_eq!(parse_endpoint("10.0.0.1:9001").unwrap(), ("10.0.0.1", 9001));
        assert_eq!(parse_endpoint("localhost:1").unwrap(), ("localhost", 1));
        assert_eq!(
            parse_endpoint("localhost:65535").unwrap(),
            ("localhost", 65535)
        );
    }

    #[test]
    fn parse_endpoint_rejects_bad_input() {
        for bad in ["nohost", "host:", "host:0", "host:65536", ":9001", "host:abc"] {
            assert!(
                matches!(parse_endpoint(bad), Err(ClientError::InvalidEndpoint(_))),
                "expected rejection of {bad:?}"
            );
        }
    }

    #[test]
    fn fixed_policy_requires_a_mapping() {
        let options = ClientOptions {
            read_algorithm: ReadAlgorithm::Fixed,
            ..ClientOptions::default()
        };
        assert!(matches!(
            build_policy(&options, vec![1, 2]),
            Err(ClientError::MissingFixedMapping)
        ));
    }

    #[test]
    fn policy_construction_covers_every_algorithm() {
        for algorithm in [
            ReadAlgorithm::RoundRobin,
            ReadAlgorithm::Hash,
            ReadAlgorithm::RandomToken,
            ReadAlgorithm::RandomUniform,
        ] {
            let options = ClientOptions {
                read_algorithm: algorithm,
                ..ClientOptions::default()
            };
            assert!(build_policy(&options, vec![1, 2, 3]).is_ok());
        }
    }

    #[test]
    fn default_options_match_the_driver_contract() {
        let options = ClientOptions::default();
        assert_eq!(options.read_algorithm, ReadAlgorithm::Hash);
        assert_eq!(options.timeout, Duration::from_secs(10));
        assert_eq!(options.max_retries, 3);
        assert!(!options.verbose);
    }
}
