//! Web-of-trust engine ("baptism")
//!
//! Devices earn the `verified` flag through endorsements from devices that
//! are themselves already verified. Trust is a derived view, never a stored
//! fact: every mutation recomputes the target's score from its current
//! incoming edges.
//!
//! Score formula: sort incoming endorsement levels descending; the edge at
//! zero-based rank `i` contributes `level / (1 + i * 0.3)`. Broad
//! endorsement beats a pile of edges from one clique.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{BaptismRequest, BaptismRequestStatus, DeviceKey, Endorsement, TrustStatus};

/// Rank-decay factor applied per position in the sorted edge list
const RANK_DECAY: f64 = 0.3;

/// Highest trust level an endorser can carry
pub const MAX_TRUST_LEVEL: u8 = 5;

/// An endorser's own trust level, derived from how endorsed *they* are:
/// `min(5, 1 + floor(incoming / 2))`
pub fn trust_level(incoming_count: usize) -> u8 {
    let level = 1 + (incoming_count / 2) as u8;
    level.min(MAX_TRUST_LEVEL)
}

/// Rank-decayed trust score over a set of endorsement levels
pub fn trust_score(levels: &[u8]) -> f64 {
    let mut sorted: Vec<u8> = levels.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));

    sorted
        .iter()
        .enumerate()
        .map(|(i, &level)| level as f64 / (1.0 + i as f64 * RANK_DECAY))
        .sum()
}

/// Result of recomputing a target's standing after an edge mutation
#[derive(Debug, Clone, Copy)]
pub struct TrustEvaluation {
    pub endorsement_count: usize,
    pub score: f64,
    pub eligible: bool,
}

/// All endorsement edges and open baptism requests.
///
/// Edges are stored under the *endorsed* device, since every computation
/// walks a device's incoming edges.
pub struct TrustGraph {
    incoming: DashMap<DeviceKey, Vec<Endorsement>>,
    requests: DashMap<DeviceKey, BaptismRequest>,
    min_endorsements: usize,
    trust_threshold: f64,
}

#[derive(Serialize, Deserialize)]
pub struct TrustSnapshot {
    pub endorsements: Vec<Endorsement>,
    pub requests: Vec<BaptismRequest>,
}

impl TrustGraph {
    pub fn new(min_endorsements: usize, trust_threshold: f64) -> Self {
        Self {
            incoming: DashMap::new(),
            requests: DashMap::new(),
            min_endorsements,
            trust_threshold,
        }
    }

    pub fn min_endorsements(&self) -> usize {
        self.min_endorsements
    }

    pub fn trust_threshold(&self) -> f64 {
        self.trust_threshold
    }

    /// Number of incoming edges a device has
    pub fn incoming_count(&self, public_key: &str) -> usize {
        self.incoming.get(public_key).map(|v| v.len()).unwrap_or(0)
    }

    /// The trust level a device carries when endorsing others
    pub fn endorser_level(&self, public_key: &str) -> u8 {
        trust_level(self.incoming_count(public_key))
    }

    /// Whether an endorser→target edge already exists
    pub fn has_edge(&self, endorser: &str, target: &str) -> bool {
        self.incoming
            .get(target)
            .map(|edges| edges.iter().any(|e| e.endorser_public_key == endorser))
            .unwrap_or(false)
    }

    /// Insert a new edge. Returns false (no change) if the ordered pair
    /// already has one; re-endorsement is a no-op, not an error.
    pub fn add_edge(&self, endorsement: Endorsement) -> bool {
        let mut edges = self
            .incoming
            .entry(endorsement.endorsed_public_key.clone())
            .or_default();
        if edges
            .iter()
            .any(|e| e.endorser_public_key == endorsement.endorser_public_key)
        {
            return false;
        }
        edges.push(endorsement);
        true
    }

    /// Delete an endorser→target edge. Missing edge is a no-op.
    pub fn remove_edge(&self, endorser: &str, target: &str) -> bool {
        let Some(mut edges) = self.incoming.get_mut(target) else {
            return false;
        };
        let before = edges.len();
        edges.retain(|e| e.endorser_public_key != endorser);
        edges.len() != before
    }

    /// Recompute a target's standing from its current incoming edges
    pub fn evaluate(&self, public_key: &str) -> TrustEvaluation {
        let levels: Vec<u8> = self
            .incoming
            .get(public_key)
            .map(|edges| edges.iter().map(|e| e.trust_level).collect())
            .unwrap_or_default();

        let score = trust_score(&levels);
        TrustEvaluation {
            endorsement_count: levels.len(),
            score,
            eligible: levels.len() >= self.min_endorsements && score >= self.trust_threshold,
        }
    }

    /// Open a pending request unless one already exists. The pair of calls
    /// is idempotent: an existing request (pending or approved) wins.
    pub fn open_request(&self, public_key: &str, message: String) -> bool {
        if self.requests.contains_key(public_key) {
            return false;
        }
        self.requests.insert(
            public_key.to_string(),
            BaptismRequest {
                public_key: public_key.to_string(),
                message,
                status: BaptismRequestStatus::Pending,
                created_at: Utc::now(),
            },
        );
        true
    }

    pub fn has_pending_request(&self, public_key: &str) -> bool {
        self.requests
            .get(public_key)
            .map(|r| r.status == BaptismRequestStatus::Pending)
            .unwrap_or(false)
    }

    /// Advisory bookkeeping once the threshold is met
    pub fn approve_request(&self, public_key: &str) {
        if let Some(mut req) = self.requests.get_mut(public_key) {
            req.status = BaptismRequestStatus::Approved;
        }
    }

    pub fn pending_requests(&self) -> Vec<BaptismRequest> {
        let mut requests: Vec<BaptismRequest> = self
            .requests
            .iter()
            .filter(|r| r.status == BaptismRequestStatus::Pending)
            .map(|r| r.value().clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Progress view returned from every baptism action
    pub fn status(&self, public_key: &str, baptized: bool) -> TrustStatus {
        let eval = self.evaluate(public_key);
        TrustStatus {
            public_key: public_key.to_string(),
            baptized,
            endorsement_count: eval.endorsement_count,
            required_endorsements: self.min_endorsements,
            trust_score: eval.score,
            trust_threshold: self.trust_threshold,
            pending_request: self.has_pending_request(public_key),
        }
    }

    pub fn endorsement_count_total(&self) -> usize {
        self.incoming.iter().map(|r| r.value().len()).sum()
    }

    pub fn pending_request_count(&self) -> usize {
        self.requests
            .iter()
            .filter(|r| r.status == BaptismRequestStatus::Pending)
            .count()
    }

    pub fn snapshot(&self) -> TrustSnapshot {
        TrustSnapshot {
            endorsements: self
                .incoming
                .iter()
                .flat_map(|r| r.value().clone())
                .collect(),
            requests: self.requests.iter().map(|r| r.value().clone()).collect(),
        }
    }

    pub fn restore(&self, snapshot: TrustSnapshot) {
        for endorsement in snapshot.endorsements {
            self.add_edge(endorsement);
        }
        for request in snapshot.requests {
            self.requests.insert(request.public_key.clone(), request);
        }
    }
}
