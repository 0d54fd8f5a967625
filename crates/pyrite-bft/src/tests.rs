//! Integration tests for pyrite-bft.
//!
//! These drive whole clusters of pure replica states plus client drivers
//! through an in-memory network, covering the protocol's end-to-end
//! scenarios: the happy path, silent and crashed replicas, an
//! equivocating primary, fork-* detection under collusion, and request
//! deduplication.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use pyrite_crypto::{MacKey, MacKeychain, SigningKey};
use pyrite_types::{ClientId, Hash, ReplicaId, RequestTimestamp, SeqNumber, ViewNumber};

use crate::client::{ClientAction, ClientDriver, SubmitOutcome};
use crate::config::ClusterConfig;
use crate::contracts::EchoStateMachine;
use crate::hcv;
use crate::log::SlotStatus;
use crate::message::{Commit, Message, Payload, Peer, PrePrepare, Prepare, Reply, Request};
use crate::replica::{
    Destination, Effect, ExecutedOp, Outbound, ReplicaEvent, ReplicaKeys, ReplicaState,
    ReplicaStatus, TimeoutKind, TimerRequest, TimerToken,
};

// ============================================================================
// Support
// ============================================================================

type TestReplica = ReplicaState<EchoStateMachine>;

fn four_config() -> ClusterConfig {
    ClusterConfig::new((0..4).map(ReplicaId::new).collect())
}

/// Builds consistent key material for every replica and client: Ed25519
/// keys plus fully meshed pairwise MAC keys.
fn build_keys(
    config: &ClusterConfig,
    clients: &[ClientId],
) -> (Vec<ReplicaKeys>, BTreeMap<ClientId, SigningKey>) {
    let replica_signing: Vec<SigningKey> =
        config.replicas().iter().map(|_| SigningKey::generate()).collect();
    let replica_verifying: BTreeMap<ReplicaId, _> = config
        .replicas()
        .iter()
        .zip(&replica_signing)
        .map(|(id, key)| (*id, key.verifying_key()))
        .collect();

    let client_signing: BTreeMap<ClientId, SigningKey> = clients
        .iter()
        .map(|id| (*id, SigningKey::generate()))
        .collect();
    let client_verifying: BTreeMap<ClientId, _> = client_signing
        .iter()
        .map(|(id, key)| (*id, key.verifying_key()))
        .collect();

    // One symmetric key per unordered peer pair.
    let mut pair_keys: BTreeMap<(Peer, Peer), MacKey> = BTreeMap::new();
    let mut peers: Vec<Peer> = config.replicas().iter().map(|id| Peer::Replica(*id)).collect();
    peers.extend(clients.iter().map(|id| Peer::Client(*id)));

    let keysets = config
        .replicas()
        .iter()
        .map(|id| {
            let me = Peer::Replica(*id);
            let mut keychain = MacKeychain::new();
            for peer in &peers {
                if *peer == me {
                    continue;
                }
                let pair = if me < *peer { (me, *peer) } else { (*peer, me) };
                let key = *pair_keys.entry(pair).or_insert_with(MacKey::generate);
                keychain.insert(*peer, key);
            }
            ReplicaKeys {
                signing: replica_signing[id.as_usize()].clone(),
                replica_keys: replica_verifying.clone(),
                client_keys: client_verifying.clone(),
                keychain,
            }
        })
        .collect();

    (keysets, client_signing)
}

/// An in-memory cluster: pure replica states wired through a FIFO message
/// queue, with hooks for silencing, crashing, and timer firing.
struct TestNet {
    replicas: BTreeMap<ReplicaId, TestReplica>,
    queue: VecDeque<(ReplicaId, Outbound)>,
    client_replies: BTreeMap<ClientId, Vec<Reply>>,
    armed: BTreeMap<ReplicaId, BTreeSet<TimerToken>>,
    effects: BTreeMap<ReplicaId, Vec<Effect>>,
    executed: Vec<(ReplicaId, ExecutedOp)>,
    /// Replicas whose outgoing messages vanish.
    silenced: BTreeSet<ReplicaId>,
    /// Replicas that receive nothing (and therefore send nothing).
    crashed: BTreeSet<ReplicaId>,
}

impl TestNet {
    fn new(
        config: ClusterConfig,
        keys: &[ReplicaKeys],
        participants: impl IntoIterator<Item = u8>,
    ) -> Self {
        let replicas = participants
            .into_iter()
            .map(ReplicaId::new)
            .map(|id| {
                let state = ReplicaState::new(
                    id,
                    config.clone(),
                    keys[id.as_usize()].clone(),
                    EchoStateMachine::new(),
                );
                (id, state)
            })
            .collect();
        Self {
            replicas,
            queue: VecDeque::new(),
            client_replies: BTreeMap::new(),
            armed: BTreeMap::new(),
            effects: BTreeMap::new(),
            executed: Vec::new(),
            silenced: BTreeSet::new(),
            crashed: BTreeSet::new(),
        }
    }

    fn state(&self, id: u8) -> &TestReplica {
        &self.replicas[&ReplicaId::new(id)]
    }

    /// Feeds one event to one replica, queueing its outputs.
    fn feed(&mut self, id: ReplicaId, event: ReplicaEvent) {
        if self.crashed.contains(&id) {
            return;
        }
        let Some(state) = self.replicas.remove(&id) else {
            return;
        };
        let (next, output) = state.on_event(event);
        self.replicas.insert(id, next);

        for outbound in output.messages {
            if !self.silenced.contains(&id) {
                self.queue.push_back((id, outbound));
            }
        }
        for timer in output.timers {
            let armed = self.armed.entry(id).or_default();
            match timer {
                TimerRequest::Schedule { token, .. } => {
                    armed.insert(token);
                }
                TimerRequest::Cancel { token } => {
                    armed.remove(&token);
                }
            }
        }
        self.effects.entry(id).or_default().extend(output.effects);
        self.executed
            .extend(output.executed.into_iter().map(|op| (id, op)));
    }

    /// Injects an externally crafted message to one replica.
    fn inject(&mut self, to: u8, message: Message) {
        self.feed(ReplicaId::new(to), ReplicaEvent::Message(message));
    }

    /// Injects a message to every live participant.
    fn inject_all(&mut self, message: Message) {
        let ids: Vec<ReplicaId> = self.replicas.keys().copied().collect();
        for id in ids {
            self.feed(id, ReplicaEvent::Message(message.clone()));
        }
    }

    /// Fires an armed timer.
    fn fire(&mut self, id: u8, token: TimerToken) {
        let id = ReplicaId::new(id);
        assert!(
            self.armed.get(&id).is_some_and(|set| set.contains(&token)),
            "timer {token:?} not armed on {id}"
        );
        self.armed.get_mut(&id).unwrap().remove(&token);
        self.feed(id, ReplicaEvent::Timeout(token));
    }

    /// Runs the network until no messages are in flight.
    fn deliver_all(&mut self) {
        while let Some((from, outbound)) = self.queue.pop_front() {
            match outbound.to {
                Destination::Broadcast => {
                    let ids: Vec<ReplicaId> = self.replicas.keys().copied().collect();
                    for id in ids {
                        if id != from {
                            self.feed(id, ReplicaEvent::Message(outbound.message.clone()));
                        }
                    }
                }
                Destination::Peer(Peer::Replica(id)) => {
                    self.feed(id, ReplicaEvent::Message(outbound.message.clone()));
                }
                Destination::Peer(Peer::Client(client)) => {
                    if let Payload::Reply(reply) = outbound.message.payload {
                        self.client_replies.entry(client).or_default().push(reply);
                    }
                }
            }
        }
    }

    /// Feeds collected replies for `client` into its driver, returning
    /// the first decisive outcome.
    fn drain_replies_into(
        &mut self,
        client: ClientId,
        driver: &mut ClientDriver,
    ) -> Option<SubmitOutcome> {
        let replies = self.client_replies.remove(&client).unwrap_or_default();
        for reply in replies {
            let (outcome, _) = driver.on_reply(reply);
            if outcome.is_some() {
                return outcome;
            }
        }
        None
    }
}

/// Extracts the request message from a driver's submit actions.
fn submit_message(actions: &[ClientAction]) -> (ReplicaId, Message) {
    match &actions[0] {
        ClientAction::Send { to, message } => (*to, message.clone()),
        other => panic!("expected Send, got {other:?}"),
    }
}

fn request_token(client: ClientId, view: u64) -> TimerToken {
    TimerToken {
        kind: TimeoutKind::Request(client),
        view: ViewNumber::new(view),
    }
}

// ============================================================================
// Scenario 1: Happy Path
// ============================================================================

#[test]
fn happy_path_commits_with_unanimous_hcv() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, mut client_keys) = build_keys(&config, &[c1]);
    let mut net = TestNet::new(config.clone(), &keys, 0..4);
    let mut driver = ClientDriver::new(c1, config, client_keys.remove(&c1).unwrap());

    let actions = driver.submit(b"login".to_vec()).unwrap();
    let (to, message) = submit_message(&actions);
    assert_eq!(to, ReplicaId::new(0));

    net.inject(0, message);
    net.deliver_all();

    // All four replicas executed sequence 1 with identical chains.
    let expected_hcv = net.state(0).hcv();
    for id in 0..4 {
        let state = net.state(id);
        assert_eq!(state.last_executed(), SeqNumber::new(1));
        assert_eq!(state.hcv(), expected_hcv);
        assert_eq!(state.view(), ViewNumber::ZERO);
        assert_eq!(state.state_machine().applied(), &[b"login".to_vec()]);
    }
    assert_ne!(expected_hcv, hcv::genesis());

    // Every replica reported exactly one execution, for this client.
    assert_eq!(net.executed.len(), 4);
    assert!(net.executed.iter().all(|(_, op)| {
        op.seq == SeqNumber::new(1) && op.client == Some((c1, RequestTimestamp::new(1)))
    }));

    // Four matching replies; the client accepts at 2f + 1 = 3.
    assert_eq!(net.client_replies[&c1].len(), 4);
    let outcome = net.drain_replies_into(c1, &mut driver);
    assert_eq!(
        outcome,
        Some(SubmitOutcome::Committed {
            result: b"login".to_vec(),
            hcv: expected_hcv
        })
    );
}

// ============================================================================
// Scenario 2: Silent Backup
// ============================================================================

#[test]
fn silent_backup_does_not_block_acceptance() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, mut client_keys) = build_keys(&config, &[c1]);
    let mut net = TestNet::new(config.clone(), &keys, 0..4);
    net.silenced.insert(ReplicaId::new(3));
    let mut driver = ClientDriver::new(c1, config, client_keys.remove(&c1).unwrap());

    let actions = driver.submit(b"login".to_vec()).unwrap();
    let (_, message) = submit_message(&actions);
    net.inject(0, message);
    net.deliver_all();

    // Only three replies reach the client, and 2f + 1 = 3 suffices.
    assert_eq!(net.client_replies[&c1].len(), 3);
    let outcome = net.drain_replies_into(c1, &mut driver);
    assert!(matches!(outcome, Some(SubmitOutcome::Committed { .. })));
}

// ============================================================================
// Scenario 3: Equivocating Primary
// ============================================================================

#[test]
fn equivocating_primary_is_replaced_and_request_completes() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, mut client_keys) = build_keys(&config, &[c1]);
    // R0 is Byzantine: it exists only as crafted messages.
    let mut net = TestNet::new(config.clone(), &keys, 1..4);
    let client_sk = client_keys.remove(&c1).unwrap();
    let mut driver = ClientDriver::new(c1, config, client_sk.clone());

    let actions = driver.submit(b"login".to_vec()).unwrap();
    let (_, request_msg) = submit_message(&actions);
    let Payload::Request(request) = request_msg.payload.clone() else {
        unreachable!()
    };

    // R0 shows digest A to {R1, R2} and digest B to {R3}. The decoy
    // carries a valid signature (a replayed operation from a colluding
    // client would look the same), so R3 accepts it.
    let decoy = Request::new(c1, request.timestamp, b"evil".to_vec()).sign(&client_sk);
    let pp_a = PrePrepare::new(
        ViewNumber::ZERO,
        SeqNumber::new(1),
        hcv::extend(hcv::genesis(), request.digest(), SeqNumber::new(1), ViewNumber::ZERO),
        request.clone(),
    );
    let pp_b = PrePrepare {
        digest: decoy.digest(),
        request: Some(decoy),
        ..pp_a.clone()
    };
    net.inject(1, Message::new(ReplicaId::new(0), Payload::PrePrepare(pp_a.clone())));
    net.inject(2, Message::new(ReplicaId::new(0), Payload::PrePrepare(pp_a)));
    net.inject(3, Message::new(ReplicaId::new(0), Payload::PrePrepare(pp_b)));
    net.deliver_all();

    // No commit certificate can form: nothing executed anywhere.
    for id in 1..4 {
        assert_eq!(net.state(id).last_executed(), SeqNumber::ZERO);
    }

    // The client times out and multicasts; backups forward to the dead
    // primary and arm suspicion timers.
    let (outcome, timeout_actions) = driver.on_timeout();
    assert_eq!(outcome, None);
    let ClientAction::Multicast { message } = &timeout_actions[0] else {
        panic!("expected multicast");
    };
    net.inject_all(message.clone());
    net.deliver_all();

    for id in 1..4 {
        net.fire(id, request_token(c1, 0));
    }
    net.deliver_all();

    // View 1 with primary R1; the prepared request was carried over.
    for id in 1..4 {
        let state = net.state(id);
        assert_eq!(state.view(), ViewNumber::new(1));
        assert_eq!(state.status(), ReplicaStatus::Active);
        assert_eq!(state.last_executed(), SeqNumber::new(1));
        assert_eq!(state.state_machine().applied(), &[b"login".to_vec()]);
    }

    let outcome = net.drain_replies_into(c1, &mut driver);
    assert!(matches!(outcome, Some(SubmitOutcome::Committed { result, .. }) if result == b"login"));
}

// ============================================================================
// Scenario 4: Fork-* Detection
// ============================================================================

#[test]
fn colluding_replicas_cannot_fork_silently() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let c2 = ClientId::new(2);
    let (keys, mut client_keys) = build_keys(&config, &[c1, c2]);

    // R0 and R1 are Byzantine (f = 1 < 2 <= 2f). They run two forked
    // histories: one with R2 for client 1, one with R3 for client 2.
    let mut fork_a = TestNet::new(config.clone(), &keys, [0, 1, 2]);
    let mut fork_b = TestNet::new(config.clone(), &keys, [0, 1, 3]);

    let mut driver1 = ClientDriver::new(c1, config.clone(), client_keys.remove(&c1).unwrap());
    let mut driver2 = ClientDriver::new(c2, config, client_keys.remove(&c2).unwrap());

    // Fork A commits client 1's operation x.
    let actions = driver1.submit(b"op-x".to_vec()).unwrap();
    let (_, msg_x) = submit_message(&actions);
    fork_a.inject(0, msg_x);
    fork_a.deliver_all();
    let outcome1 = fork_a.drain_replies_into(c1, &mut driver1);
    let Some(SubmitOutcome::Committed { hcv: hcv_fork_a, .. }) = outcome1 else {
        panic!("client 1 should commit in fork A, got {outcome1:?}");
    };

    // Client 2 submits y. The adversary sequences it in BOTH forks.
    let actions = driver2.submit(b"op-y".to_vec()).unwrap();
    let (_, msg_y) = submit_message(&actions);
    fork_a.inject(0, msg_y.clone());
    fork_a.deliver_all();
    fork_b.inject(0, msg_y);
    fork_b.deliver_all();

    // The two histories produced different chains for the same request.
    let reply_from_a = fork_a.client_replies[&c2]
        .iter()
        .find(|r| r.sender == ReplicaId::new(2))
        .cloned()
        .expect("honest R2 replied in fork A");
    let reply_from_b = fork_b.client_replies[&c2]
        .iter()
        .find(|r| r.sender == ReplicaId::new(3))
        .cloned()
        .expect("honest R3 replied in fork B");
    assert_ne!(reply_from_a.hcv_sender, reply_from_b.hcv_sender);
    assert_ne!(hcv_fork_a, reply_from_b.hcv_sender);

    // Client 2 sees both honest replies: same result, diverging chains.
    // f + 1 = 2 agree on the result, so the divergence is fork-*, and the
    // driver refuses to report the operation as linearizable.
    let (outcome, _) = driver2.on_reply(reply_from_a);
    assert_eq!(outcome, None);
    let (outcome, _) = driver2.on_reply(reply_from_b);
    match outcome {
        Some(SubmitOutcome::ForkAlarm { result, conflicting }) => {
            assert_eq!(result, b"op-y".to_vec());
            assert_eq!(conflicting.len(), 2);
        }
        other => panic!("expected fork alarm, got {other:?}"),
    }
}

// ============================================================================
// Scenario 5: Primary Crash and Retransmission
// ============================================================================

#[test]
fn crashed_primary_is_replaced_and_request_completes() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, mut client_keys) = build_keys(&config, &[c1]);
    let mut net = TestNet::new(config.clone(), &keys, 0..4);
    net.crashed.insert(ReplicaId::new(0));
    let mut driver = ClientDriver::new(c1, config, client_keys.remove(&c1).unwrap());

    // The initial send goes to the crashed primary and vanishes.
    let actions = driver.submit(b"login".to_vec()).unwrap();
    let (to, message) = submit_message(&actions);
    assert_eq!(to, ReplicaId::new(0));
    net.inject(0, message);
    net.deliver_all();
    assert!(net.client_replies.get(&c1).is_none());

    // Timeout: multicast. Backups forward to R0 and start suspecting.
    let (_, timeout_actions) = driver.on_timeout();
    let ClientAction::Multicast { message } = &timeout_actions[0] else {
        panic!("expected multicast");
    };
    net.inject_all(message.clone());
    net.deliver_all();

    for id in 1..4 {
        net.fire(id, request_token(c1, 0));
    }
    net.deliver_all();

    // R1 led the view change and re-drove the pending request.
    for id in 1..4 {
        let state = net.state(id);
        assert_eq!(state.view(), ViewNumber::new(1));
        assert_eq!(state.status(), ReplicaStatus::Active);
        assert_eq!(state.last_executed(), SeqNumber::new(1));
    }

    let outcome = net.drain_replies_into(c1, &mut driver);
    assert!(matches!(outcome, Some(SubmitOutcome::Committed { .. })));
    assert_eq!(driver.suspected_primary(), ReplicaId::new(1));
}

// ============================================================================
// Scenario 6: Duplicate Request
// ============================================================================

#[test]
fn duplicate_request_applies_once_and_replays_reply() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, mut client_keys) = build_keys(&config, &[c1]);
    let mut net = TestNet::new(config.clone(), &keys, 0..4);
    let mut driver = ClientDriver::new(c1, config, client_keys.remove(&c1).unwrap());

    let actions = driver.submit(b"login".to_vec()).unwrap();
    let (_, message) = submit_message(&actions);
    net.inject(0, message.clone());
    net.deliver_all();

    let first_replies = net.client_replies.remove(&c1).unwrap();
    assert_eq!(first_replies.len(), 4);

    // The client retransmits the identical request to everyone.
    net.inject_all(message);
    net.deliver_all();

    // apply() ran exactly once per replica; the cached reply came back
    // with the same result and the same hcv.
    let replayed = net.client_replies.remove(&c1).unwrap();
    assert_eq!(replayed.len(), 4);
    for reply in &replayed {
        let original = first_replies
            .iter()
            .find(|r| r.sender == reply.sender)
            .unwrap();
        assert_eq!(reply, original);
    }
    for id in 0..4 {
        assert_eq!(net.state(id).state_machine().applied().len(), 1);
    }
}

// ============================================================================
// Out-of-Order and Validation Edge Cases
// ============================================================================

#[test]
fn commits_buffered_before_pre_prepare_complete_on_arrival() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, client_keys) = build_keys(&config, &[c1]);
    let mut net = TestNet::new(config.clone(), &keys, [1]);

    let request = Request::new(c1, RequestTimestamp::new(1), b"late".to_vec())
        .sign(&client_keys[&c1]);
    let digest = request.digest();
    let seq = SeqNumber::new(1);

    // Commit certificate arrives before anything else.
    for sender in [0u8, 2, 3] {
        let commit = Commit::new(
            ViewNumber::ZERO,
            seq,
            digest,
            hcv::genesis(),
            ReplicaId::new(sender),
        );
        net.inject(1, Message::new(ReplicaId::new(sender), Payload::Commit(commit)));
    }
    {
        let slot = net.state(1).log.slot(seq).unwrap();
        assert_eq!(slot.status, SlotStatus::Committed);
    }
    assert_eq!(net.state(1).last_executed(), SeqNumber::ZERO);

    // The pre-prepare with the body arrives; execution proceeds.
    let pp = PrePrepare::new(ViewNumber::ZERO, seq, hcv::genesis(), request);
    net.inject(1, Message::new(ReplicaId::new(0), Payload::PrePrepare(pp)));
    assert_eq!(net.state(1).last_executed(), seq);
}

#[test]
fn sequence_outside_watermarks_is_dropped() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, client_keys) = build_keys(&config, &[c1]);
    let mut net = TestNet::new(config.clone(), &keys, [1]);

    let request =
        Request::new(c1, RequestTimestamp::new(1), b"far".to_vec()).sign(&client_keys[&c1]);
    let beyond = SeqNumber::new(config.watermark_window + 1);
    let pp = PrePrepare {
        seq: beyond,
        ..PrePrepare::new(ViewNumber::ZERO, SeqNumber::new(1), hcv::genesis(), request)
    };

    net.inject(1, Message::new(ReplicaId::new(0), Payload::PrePrepare(pp)));
    assert!(net.state(1).log.slot(beyond).is_none());
    assert!(net.queue.is_empty());
}

#[test]
fn wrong_view_and_non_primary_pre_prepares_are_dropped() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, client_keys) = build_keys(&config, &[c1]);
    let mut net = TestNet::new(config.clone(), &keys, [1]);

    let request =
        Request::new(c1, RequestTimestamp::new(1), b"op".to_vec()).sign(&client_keys[&c1]);

    // Future view.
    let pp = PrePrepare::new(ViewNumber::new(3), SeqNumber::new(1), hcv::genesis(), request.clone());
    net.inject(1, Message::new(ReplicaId::new(3), Payload::PrePrepare(pp)));
    assert!(net.state(1).log.slot(SeqNumber::new(1)).is_none());

    // Correct view, but the sender is not the view's primary.
    let pp = PrePrepare::new(ViewNumber::ZERO, SeqNumber::new(1), hcv::genesis(), request);
    net.inject(1, Message::new(ReplicaId::new(2), Payload::PrePrepare(pp)));
    assert!(net.state(1).log.slot(SeqNumber::new(1)).is_none());
}

#[test]
fn pre_prepare_equivocation_yields_proof_and_view_change() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, client_keys) = build_keys(&config, &[c1]);
    let mut net = TestNet::new(config.clone(), &keys, [1]);

    let request_a =
        Request::new(c1, RequestTimestamp::new(1), b"a".to_vec()).sign(&client_keys[&c1]);
    let request_b =
        Request::new(c1, RequestTimestamp::new(1), b"b".to_vec()).sign(&client_keys[&c1]);

    let pp_a = PrePrepare::new(ViewNumber::ZERO, SeqNumber::new(1), hcv::genesis(), request_a);
    let pp_b = PrePrepare::new(ViewNumber::ZERO, SeqNumber::new(1), hcv::genesis(), request_b);

    net.inject(1, Message::new(ReplicaId::new(0), Payload::PrePrepare(pp_a)));
    net.inject(1, Message::new(ReplicaId::new(0), Payload::PrePrepare(pp_b)));

    let state = net.state(1);
    assert_eq!(state.status(), ReplicaStatus::ViewChanging);
    assert_eq!(state.view(), ViewNumber::new(1));
    assert_eq!(state.proofs().len(), 1);
    assert_eq!(state.proofs()[0].accused, Peer::Replica(ReplicaId::new(0)));
}

#[test]
fn contradicting_prepare_does_not_count_toward_certificate() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, client_keys) = build_keys(&config, &[c1]);
    let mut net = TestNet::new(config.clone(), &keys, [1]);

    let request =
        Request::new(c1, RequestTimestamp::new(1), b"real".to_vec()).sign(&client_keys[&c1]);
    let decoy =
        Request::new(c1, RequestTimestamp::new(1), b"decoy".to_vec()).sign(&client_keys[&c1]);

    let pp = PrePrepare::new(ViewNumber::ZERO, SeqNumber::new(1), hcv::genesis(), request);
    let digest = pp.digest;
    net.inject(1, Message::new(ReplicaId::new(0), Payload::PrePrepare(pp)));

    // One matching prepare, one contradicting.
    let good = Prepare::new(ViewNumber::ZERO, SeqNumber::new(1), digest, hcv::genesis(), ReplicaId::new(2));
    let bad = Prepare::new(
        ViewNumber::ZERO,
        SeqNumber::new(1),
        decoy.digest(),
        hcv::genesis(),
        ReplicaId::new(3),
    );
    net.inject(1, Message::new(ReplicaId::new(2), Payload::Prepare(good)));
    net.inject(1, Message::new(ReplicaId::new(3), Payload::Prepare(bad)));

    // Own + R2 = 2 matching prepares reach the certificate; the decoy
    // prepare was not admitted into the slot.
    let slot = net.state(1).log.slot(SeqNumber::new(1)).unwrap();
    assert_eq!(slot.status, SlotStatus::Prepared);
    assert_eq!(slot.prepares.len(), 2);
    assert!(!slot.prepares.contains_key(&ReplicaId::new(3)));
}

// ============================================================================
// Checkpoints
// ============================================================================

#[test]
fn checkpoint_interval_stabilizes_and_truncates_log() {
    let mut config = four_config();
    config.checkpoint_interval = 2;
    let c1 = ClientId::new(1);
    let (keys, mut client_keys) = build_keys(&config, &[c1]);
    let mut net = TestNet::new(config.clone(), &keys, 0..4);
    let mut driver = ClientDriver::new(c1, config, client_keys.remove(&c1).unwrap());

    for op in [b"one".to_vec(), b"two".to_vec()] {
        let actions = driver.submit(op).unwrap();
        let (_, message) = submit_message(&actions);
        net.inject(0, message);
        net.deliver_all();
        let outcome = net.drain_replies_into(c1, &mut driver);
        assert!(matches!(outcome, Some(SubmitOutcome::Committed { .. })));
    }

    for id in 0..4 {
        let state = net.state(id);
        assert_eq!(state.last_stable(), SeqNumber::new(2));
        assert!(state.log.is_empty(), "log truncated below the checkpoint");
        let effects = &net.effects[&ReplicaId::new(id)];
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::SaveCheckpoint { seq, .. } if *seq == SeqNumber::new(2)
        )));
    }
}

// ============================================================================
// Recovery
// ============================================================================

#[test]
fn recovering_replica_rejoins_at_stable_checkpoint() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, _) = build_keys(&config, &[c1]);

    let record = crate::superblock::SuperblockRecord {
        replica_id: ReplicaId::new(2),
        sequence: 7,
        view: ViewNumber::ZERO,
        last_executed: SeqNumber::new(4),
        hcv: Hash::new([9u8; 32]),
        last_stable: SeqNumber::new(2),
        stable_proof: vec![],
    };
    let state = ReplicaState::recover(
        ReplicaId::new(2),
        config.clone(),
        keys[2].clone(),
        EchoStateMachine::new(),
        &record,
    );
    assert_eq!(state.status(), ReplicaStatus::Recovering);
    assert_eq!(state.hcv(), Hash::new([9u8; 32]));

    let mut net = TestNet::new(config, &keys, 0..0);
    net.replicas.insert(ReplicaId::new(2), state);

    // The cluster's checkpoint reaches this replica's position.
    let state_digest = Hash::new([5u8; 32]);
    let chain = Hash::new([6u8; 32]);
    for sender in [0u8, 1, 3] {
        let cp = crate::message::Checkpoint {
            seq: SeqNumber::new(4),
            state_digest,
            hcv: chain,
            sender: ReplicaId::new(sender),
        };
        net.inject(2, Message::new(ReplicaId::new(sender), Payload::Checkpoint(cp)));
    }

    let state = net.state(2);
    assert_eq!(state.status(), ReplicaStatus::Active);
    assert_eq!(state.last_stable(), SeqNumber::new(4));
}

// ============================================================================
// Engine Shell
// ============================================================================

#[test]
fn engine_shell_authenticates_and_frames_outgoing_traffic() {
    use crate::contracts::{MemoryCheckpointStore, QueueTransport, RecordingTimers};
    use crate::engine::{EngineError, Replica};

    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, client_keys) = build_keys(&config, &[c1]);

    let state = ReplicaState::new(
        ReplicaId::new(0),
        config.clone(),
        keys[0].clone(),
        EchoStateMachine::new(),
    );
    let mut replica = Replica::new(
        state,
        QueueTransport::new(),
        RecordingTimers::new(),
        MemoryCheckpointStore::new(),
    );

    // A client REQUEST goes over the wire with no MAC vector: its
    // payload signature is the authenticator the ingress checks.
    let request =
        Request::new(c1, RequestTimestamp::new(1), b"login".to_vec()).sign(&client_keys[&c1]);
    let request_wire = Message::new(c1, Payload::Request(request))
        .to_wire()
        .unwrap();

    // Not started yet: frames are refused.
    assert_eq!(
        replica.inject_frame(&request_wire),
        Err(EngineError::Stopped)
    );

    replica.start();
    replica.inject_frame(&request_wire).unwrap();

    // The primary accepted the request through the authenticated ingress
    // and broadcast a pre-prepare, framed and MAC'd per backup.
    let sent = replica.transport_mut().drain();
    assert_eq!(sent.len(), 1);
    let (dest, frame) = &sent[0];
    assert!(dest.is_none(), "pre-prepare goes out as a multicast");

    let message = Message::from_wire(frame).unwrap();
    assert!(matches!(message.payload, Payload::PrePrepare(_)));
    assert!(message.verify(&keys[1].keychain, Peer::Replica(ReplicaId::new(1))));
    assert!(message.verify(&keys[3].keychain, Peer::Replica(ReplicaId::new(3))));
    // A MAC addressed to R1 does not verify as R3's.
    assert!(!message.verify(&keys[1].keychain, Peer::Replica(ReplicaId::new(3))));

    // A request whose signature was stripped is ingress noise.
    let unsigned_wire = Message::new(
        c1,
        Payload::Request(Request::new(c1, RequestTimestamp::new(2), b"x".to_vec())),
    )
    .to_wire()
    .unwrap();
    replica.inject_frame(&unsigned_wire).unwrap();
    assert!(replica.transport_mut().drain().is_empty());

    replica.stop();
    assert!(!replica.is_running());

    // The frame R0 produced is accepted by a backup's authenticated
    // ingress; a tampered copy is dropped on the floor.
    let state1 = ReplicaState::new(
        ReplicaId::new(1),
        config,
        keys[1].clone(),
        EchoStateMachine::new(),
    );
    let mut backup = Replica::new(
        state1,
        QueueTransport::new(),
        RecordingTimers::new(),
        MemoryCheckpointStore::new(),
    );
    backup.start();

    backup.inject_frame(frame).unwrap();
    // The backup accepted the pre-prepare and answered with a prepare.
    assert_eq!(backup.state().last_executed(), SeqNumber::ZERO);
    assert!(!backup.transport_mut().drain().is_empty());

    // Flip a byte inside the payload region (the preamble is 14 bytes);
    // the MAC no longer covers what the frame claims.
    let mut tampered = frame.clone();
    tampered[20] ^= 0xFF;
    backup.inject_frame(&tampered).unwrap();
    assert!(backup.transport_mut().drain().is_empty());
}

// ============================================================================
// Safety Across a Longer Run
// ============================================================================

#[test]
fn chains_stay_identical_across_many_operations() {
    let config = four_config();
    let c1 = ClientId::new(1);
    let (keys, mut client_keys) = build_keys(&config, &[c1]);
    let mut net = TestNet::new(config.clone(), &keys, 0..4);
    let mut driver = ClientDriver::new(c1, config, client_keys.remove(&c1).unwrap());

    for i in 0..10u8 {
        let actions = driver.submit(vec![b'o', b'p', i]).unwrap();
        let (to, message) = submit_message(&actions);
        net.inject(to.as_u8(), message);
        net.deliver_all();
        let outcome = net.drain_replies_into(c1, &mut driver);
        assert!(matches!(outcome, Some(SubmitOutcome::Committed { .. })));
    }

    let expected = net.state(0).hcv();
    for id in 0..4 {
        let state = net.state(id);
        assert_eq!(state.last_executed(), SeqNumber::new(10));
        assert_eq!(state.hcv(), expected);
        assert_eq!(state.state_machine().applied().len(), 10);
    }

    // The chain replays deterministically from genesis over the log.
    let links: Vec<_> = (1..=10u64)
        .map(|n| {
            let slot = net.state(0).log.slot(SeqNumber::new(n)).unwrap();
            (
                SeqNumber::new(n),
                slot.pre_prepare.as_ref().unwrap().origin_view,
                slot.accepted_digest().unwrap(),
            )
        })
        .collect();
    assert_eq!(hcv::recompute(hcv::genesis(), links), expected);
}
