//! Client-side request driver.
//!
//! Holds at most one outstanding request. `submit` signs the request with
//! a strictly increasing timestamp and targets the suspected primary
//! (initially replica 0, later whichever replica's replies carried the
//! highest view). If no quorum forms in time the request is multicast to
//! every replica; a second timeout gives up.
//!
//! A reply is accepted once `2f + 1` REPLIEs agree on
//! `(view, timestamp, result, hcv)`. If `f + 1` agree on
//! `(timestamp, result)` but their HCVs diverge, the histories behind
//! those replies have forked: the driver raises a fork-* alarm and
//! refuses to report the operation as linearizable.
//!
//! The driver is sans-I/O like the replica engine: every call returns the
//! actions (sends, timer arms) for the embedding runtime to perform.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use pyrite_crypto::SigningKey;
use pyrite_types::{ClientId, Hash, ReplicaId, RequestTimestamp, ViewNumber};

use crate::config::ClusterConfig;
use crate::message::{Message, Payload, Reply, Request};

// ============================================================================
// Actions and Outcomes
// ============================================================================

/// Something the runtime should do on the driver's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// Send to one replica.
    Send { to: ReplicaId, message: Message },

    /// Send to every replica.
    Multicast { message: Message },

    /// Arm the retransmission timer.
    Schedule { delay: Duration },

    /// Disarm the retransmission timer.
    Cancel,
}

/// Final outcome of one submitted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// `2f + 1` replies matched; the operation is linearizable.
    Committed { result: Vec<u8>, hcv: Hash },

    /// Enough replicas agree on the result but their hash chains
    /// diverge: fork-* has manifested. The result is surfaced but must
    /// not be treated as linearizable, and the operation is not retried.
    ForkAlarm {
        result: Vec<u8>,
        /// The distinct HCVs observed among the agreeing replies.
        conflicting: Vec<Hash>,
    },

    /// No quorum formed even after multicasting.
    TimedOut,
}

/// Driver misuse errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// `submit` while a request is already outstanding.
    #[error("a request is already outstanding")]
    Busy,
}

// ============================================================================
// Driver
// ============================================================================

#[derive(Debug, Clone)]
struct Outstanding {
    request: Request,
    /// Replies by sender; first reply per sender wins.
    replies: BTreeMap<ReplicaId, Reply>,
    /// Whether the timeout escalation (multicast) already happened.
    multicast: bool,
}

/// The client driver state machine.
pub struct ClientDriver {
    client_id: ClientId,
    config: ClusterConfig,
    signing: SigningKey,
    last_timestamp: RequestTimestamp,
    suspected_primary: ReplicaId,
    highest_view: ViewNumber,
    outstanding: Option<Outstanding>,
}

impl ClientDriver {
    pub fn new(client_id: ClientId, config: ClusterConfig, signing: SigningKey) -> Self {
        let suspected_primary = config.primary_for(ViewNumber::ZERO);
        Self {
            client_id,
            config,
            signing,
            last_timestamp: RequestTimestamp::ZERO,
            suspected_primary,
            highest_view: ViewNumber::ZERO,
            outstanding: None,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// The replica the driver currently believes is primary.
    pub fn suspected_primary(&self) -> ReplicaId {
        self.suspected_primary
    }

    /// True while a request is in flight.
    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Signs and submits one operation.
    pub fn submit(&mut self, operation: Vec<u8>) -> Result<Vec<ClientAction>, ClientError> {
        if self.outstanding.is_some() {
            return Err(ClientError::Busy);
        }

        self.last_timestamp = self.last_timestamp.next();
        let request = Request::new(self.client_id, self.last_timestamp, operation)
            .sign(&self.signing);

        tracing::debug!(
            client = %self.client_id,
            ts = %self.last_timestamp,
            primary = %self.suspected_primary,
            "submitting request"
        );

        self.outstanding = Some(Outstanding {
            request: request.clone(),
            replies: BTreeMap::new(),
            multicast: false,
        });

        Ok(vec![
            ClientAction::Send {
                to: self.suspected_primary,
                message: Message::new(self.client_id, Payload::Request(request)),
            },
            ClientAction::Schedule {
                delay: self.config.request_timeout,
            },
        ])
    }

    // ========================================================================
    // Reply Collation
    // ========================================================================

    /// Feeds one REPLY into the collation. Returns the final outcome once
    /// the reply set decides one.
    pub fn on_reply(&mut self, reply: Reply) -> (Option<SubmitOutcome>, Vec<ClientAction>) {
        let Some(outstanding) = self.outstanding.as_mut() else {
            return (None, Vec::new());
        };
        if reply.client_id != self.client_id
            || reply.timestamp != outstanding.request.timestamp
            || !self.config.is_member(reply.sender)
        {
            return (None, Vec::new());
        }

        // First reply per sender wins; a replica rewriting its reply is
        // not given a second voice.
        outstanding.replies.entry(reply.sender).or_insert(reply.clone());

        // Track the newest view so retargeting follows the cluster.
        if reply.view > self.highest_view {
            self.highest_view = reply.view;
            self.suspected_primary = self.config.primary_for(reply.view);
        }

        let quorum = self.config.quorum_commit();
        let weak = self.config.quorum_weak();

        // Full acceptance: 2f + 1 matching (view, timestamp, result, hcv).
        let mut full: BTreeMap<(ViewNumber, &[u8], Hash), usize> = BTreeMap::new();
        for r in outstanding.replies.values() {
            *full
                .entry((r.view, r.result.as_slice(), r.hcv_sender))
                .or_default() += 1;
        }
        let committed = full
            .iter()
            .find(|(_, count)| **count >= quorum)
            .map(|((_, result, hcv), _)| (result.to_vec(), *hcv));
        if let Some((result, hcv)) = committed {
            tracing::debug!(client = %self.client_id, hcv = %hcv, "request committed");
            self.outstanding = None;
            return (
                Some(SubmitOutcome::Committed { result, hcv }),
                vec![ClientAction::Cancel],
            );
        }

        // Fork detection: f + 1 agree on the result, HCVs diverge.
        let mut by_result: BTreeMap<&[u8], Vec<Hash>> = BTreeMap::new();
        for r in outstanding.replies.values() {
            by_result
                .entry(r.result.as_slice())
                .or_default()
                .push(r.hcv_sender);
        }
        let mut alarm: Option<(Vec<u8>, Vec<Hash>)> = None;
        for (result, hcvs) in &by_result {
            let mut distinct: Vec<Hash> = hcvs.clone();
            distinct.sort_unstable();
            distinct.dedup();
            if hcvs.len() >= weak && distinct.len() > 1 {
                alarm = Some((result.to_vec(), distinct));
                break;
            }
        }
        if let Some((result, conflicting)) = alarm {
            tracing::warn!(
                client = %self.client_id,
                hcvs = conflicting.len(),
                "fork-* detected: agreeing replies carry diverging hash chains"
            );
            self.outstanding = None;
            return (
                Some(SubmitOutcome::ForkAlarm { result, conflicting }),
                vec![ClientAction::Cancel],
            );
        }

        (None, Vec::new())
    }

    // ========================================================================
    // Retransmission
    // ========================================================================

    /// The retransmission timer fired. The first timeout escalates to
    /// multicast; a second gives up.
    pub fn on_timeout(&mut self) -> (Option<SubmitOutcome>, Vec<ClientAction>) {
        let Some(outstanding) = self.outstanding.as_mut() else {
            return (None, Vec::new());
        };

        if !outstanding.multicast {
            outstanding.multicast = true;
            let request = outstanding.request.clone();
            tracing::debug!(
                client = %self.client_id,
                ts = %request.timestamp,
                "reply quorum timeout; multicasting to all replicas"
            );
            return (
                None,
                vec![
                    ClientAction::Multicast {
                        message: Message::new(self.client_id, Payload::Request(request)),
                    },
                    ClientAction::Schedule {
                        delay: self.config.request_timeout,
                    },
                ],
            );
        }

        tracing::warn!(
            client = %self.client_id,
            ts = %outstanding.request.timestamp,
            replies = outstanding.replies.len(),
            "request timed out without a quorum"
        );
        self.outstanding = None;
        (Some(SubmitOutcome::TimedOut), vec![ClientAction::Cancel])
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        ClusterConfig::new((0..4).map(ReplicaId::new).collect())
    }

    fn driver() -> ClientDriver {
        ClientDriver::new(ClientId::new(1), config(), SigningKey::generate())
    }

    fn reply(sender: u8, view: u64, result: &[u8], hcv: Hash) -> Reply {
        Reply {
            view: ViewNumber::new(view),
            timestamp: RequestTimestamp::new(1),
            client_id: ClientId::new(1),
            sender: ReplicaId::new(sender),
            result: result.to_vec(),
            hcv_sender: hcv,
        }
    }

    #[test]
    fn submit_targets_suspected_primary() {
        let mut driver = driver();
        let actions = driver.submit(b"login".to_vec()).unwrap();
        assert!(matches!(
            actions[0],
            ClientAction::Send { to, .. } if to == ReplicaId::new(0)
        ));
        assert!(matches!(actions[1], ClientAction::Schedule { .. }));
        assert_eq!(driver.submit(b"again".to_vec()), Err(ClientError::Busy));
    }

    #[test]
    fn quorum_of_matching_replies_commits() {
        let mut driver = driver();
        let _ = driver.submit(b"login".to_vec()).unwrap();
        let h = Hash::new([1u8; 32]);

        assert_eq!(driver.on_reply(reply(0, 0, b"ok", h)).0, None);
        assert_eq!(driver.on_reply(reply(1, 0, b"ok", h)).0, None);
        let (outcome, actions) = driver.on_reply(reply(2, 0, b"ok", h));
        assert_eq!(
            outcome,
            Some(SubmitOutcome::Committed {
                result: b"ok".to_vec(),
                hcv: h
            })
        );
        assert_eq!(actions, vec![ClientAction::Cancel]);
        assert!(!driver.is_busy());
    }

    #[test]
    fn duplicate_sender_counts_once() {
        let mut driver = driver();
        let _ = driver.submit(b"login".to_vec()).unwrap();
        let h = Hash::new([1u8; 32]);

        assert_eq!(driver.on_reply(reply(0, 0, b"ok", h)).0, None);
        assert_eq!(driver.on_reply(reply(0, 0, b"ok", h)).0, None);
        assert_eq!(driver.on_reply(reply(0, 0, b"ok", h)).0, None);
        assert!(driver.is_busy());
    }

    #[test]
    fn diverging_hcvs_raise_fork_alarm() {
        let mut driver = driver();
        let _ = driver.submit(b"transfer".to_vec()).unwrap();
        let h1 = Hash::new([1u8; 32]);
        let h2 = Hash::new([2u8; 32]);

        assert_eq!(driver.on_reply(reply(0, 0, b"ok", h1)).0, None);
        let (outcome, _) = driver.on_reply(reply(1, 0, b"ok", h2));
        match outcome {
            Some(SubmitOutcome::ForkAlarm { result, conflicting }) => {
                assert_eq!(result, b"ok".to_vec());
                assert_eq!(conflicting.len(), 2);
                assert!(conflicting.contains(&h1) && conflicting.contains(&h2));
            }
            other => panic!("expected fork alarm, got {other:?}"),
        }
        assert!(!driver.is_busy());
    }

    #[test]
    fn mismatched_timestamp_or_stranger_ignored() {
        let mut driver = driver();
        let _ = driver.submit(b"login".to_vec()).unwrap();
        let h = Hash::new([1u8; 32]);

        let mut stale = reply(0, 0, b"ok", h);
        stale.timestamp = RequestTimestamp::new(9);
        assert_eq!(driver.on_reply(stale).0, None);

        let mut stranger = reply(0, 0, b"ok", h);
        stranger.sender = ReplicaId::new(9);
        assert_eq!(driver.on_reply(stranger).0, None);
        assert!(driver.is_busy());
    }

    #[test]
    fn timeout_escalates_then_gives_up() {
        let mut driver = driver();
        let _ = driver.submit(b"login".to_vec()).unwrap();

        let (outcome, actions) = driver.on_timeout();
        assert_eq!(outcome, None);
        assert!(matches!(actions[0], ClientAction::Multicast { .. }));

        let (outcome, _) = driver.on_timeout();
        assert_eq!(outcome, Some(SubmitOutcome::TimedOut));
        assert!(!driver.is_busy());
    }

    #[test]
    fn replies_from_newer_views_retarget_the_primary() {
        let mut driver = driver();
        let _ = driver.submit(b"login".to_vec()).unwrap();
        let h = Hash::new([1u8; 32]);

        let _ = driver.on_reply(reply(1, 1, b"ok", h));
        assert_eq!(driver.suspected_primary(), ReplicaId::new(1));

        let _ = driver.on_reply(reply(2, 1, b"ok", h));
        let (outcome, _) = driver.on_reply(reply(3, 1, b"ok", h));
        assert!(matches!(outcome, Some(SubmitOutcome::Committed { .. })));

        // The next submission goes to the view-1 primary.
        let actions = driver.submit(b"second".to_vec()).unwrap();
        assert!(matches!(
            actions[0],
            ClientAction::Send { to, .. } if to == ReplicaId::new(1)
        ));
    }

    #[test]
    fn timestamps_strictly_increase() {
        let mut driver = driver();
        let a1 = driver.submit(b"one".to_vec()).unwrap();
        let ts1 = match &a1[0] {
            ClientAction::Send { message, .. } => match &message.payload {
                Payload::Request(r) => r.timestamp,
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        let (_, _) = driver.on_timeout();
        let _ = driver.on_timeout();

        let a2 = driver.submit(b"two".to_vec()).unwrap();
        let ts2 = match &a2[0] {
            ClientAction::Send { message, .. } => match &message.payload {
                Payload::Request(r) => r.timestamp,
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        assert!(ts2 > ts1);
    }
}
