//! Shared result types and return codes.
//!
//! Every RPC reply is built from these records. A mutation is *accepted*
//! when Raft committed it (`raft_rc == 0`) and a *success* when the engine
//! also applied it cleanly (`engine_rc == 0`). The numeric codes travel
//! verbatim over the wire so clients on any peer see identical values.

use serde::{Deserialize, Serialize};

// ── Raft return codes ─────────────────────────────────────────────────────────

/// The write was committed and applied.
pub const RC_OK: i32 = 0;

/// The contacted peer is not the current leader.
pub const RC_NOT_LEADER: i32 = -3;

/// The append was rejected before commit for a reason other than
/// leadership or cancellation.
pub const RC_APPEND_REJECTED: i32 = 1;

/// The append was cancelled mid-flight (leader change, raft shutdown).
pub const RC_REQUEST_CANCELLED: i32 = -1;

/// The append was accepted but no state-machine result surfaced.
/// Commit state is uncertain; callers must verify the key themselves.
pub const RC_COMMIT_UNCERTAIN: i32 = 999;

/// `GetLeaderId` reply when no live leader exists.
pub const NO_LIVE_LEADER: i32 = -1;

// ── Engine return codes ───────────────────────────────────────────────────────

pub const ENGINE_OK: i32 = 0;

/// Lookup miss, or update of an absent key.
pub const ENGINE_KEY_NOT_FOUND: i32 = 2;

/// The underlying store reported an I/O failure.
pub const ENGINE_IO_ERROR: i32 = 5;

/// Key exceeds the configured maximum key size.
pub const ENGINE_KEY_TOO_LARGE: i32 = 7;

// ── Result records ────────────────────────────────────────────────────────────

/// Outcome of a read served from a peer's local engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub value: Option<Vec<u8>>,
    pub rc: i32,
}

impl ReadResult {
    pub fn found(value: Vec<u8>) -> Self {
        Self {
            value: Some(value),
            rc: ENGINE_OK,
        }
    }

    pub fn missed(rc: i32) -> Self {
        Self { value: None, rc }
    }

    pub fn is_found(&self) -> bool {
        self.value.is_some() && self.rc == ENGINE_OK
    }
}

/// Outcome of a replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResult {
    pub engine_rc: i32,
    pub raft_rc: i32,
    pub raft_msg: String,
}

impl MutationResult {
    /// Raft committed the entry.
    pub fn was_accepted(&self) -> bool {
        self.raft_rc == RC_OK
    }

    /// Raft committed the entry and the engine applied it cleanly.
    pub fn is_success(&self) -> bool {
        self.was_accepted() && self.engine_rc == ENGINE_OK
    }
}

/// One row of the cluster view: a peer id and its advertised client endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: i32,
    pub client_endpoint: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_requires_zero_raft_rc() {
        let r = MutationResult {
            engine_rc: 0,
            raft_rc: RC_NOT_LEADER,
            raft_msg: "not leader".into(),
        };
        assert!(!r.was_accepted());
        assert!(!r.is_success());
    }

    #[test]
    fn success_requires_both_codes_zero() {
        let accepted_engine_err = MutationResult {
            engine_rc: ENGINE_KEY_NOT_FOUND,
            raft_rc: RC_OK,
            raft_msg: String::new(),
        };
        assert!(accepted_engine_err.was_accepted());
        assert!(!accepted_engine_err.is_success());

        let ok = MutationResult {
            engine_rc: ENGINE_OK,
            raft_rc: RC_OK,
            raft_msg: String::new(),
        };
        assert!(ok.is_success());
    }

    #[test]
    fn read_result_constructors() {
        assert!(ReadResult::found(b"v".to_vec()).is_found());
        let miss = ReadResult::missed(ENGINE_KEY_NOT_FOUND);
        assert!(!miss.is_found());
        assert_eq!(miss.rc, ENGINE_KEY_NOT_FOUND);
    }
}
