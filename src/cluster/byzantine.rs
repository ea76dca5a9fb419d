//! Byzantine fault detection with oral-message agreement.
//!
//! When a node raises a suspicion against a subject, every participant
//! (Active members, plus the subject while it is Suspected) runs `f + 1`
//! rounds of exponential information gathering:
//!
//! - Round 1: each participant reports its own observation of the subject.
//! - Round k: each participant relays every value it received in round k-1
//!   whose relay chain does not already contain it, extending the chain.
//!
//! After the last round the tree of relayed values is resolved bottom-up by
//! strict majority, giving one agreed observation per participant. With at
//! least `3f + 1` participants every honest node reaches the same verdict even
//! if `f` of them lie.
//!
//! The detector is sans-IO. Rounds advance when every other participant's batch
//! for the round has arrived, or when the engine reports the round timeout.
//!
//! A round that times out without the subject's batch counts against the
//! subject: the values it should have sent are filled in as `Unresponsive`,
//! and a subject that fell silent is judged Faulty. A subject that crashes
//! after round 1 is therefore judged Faulty by every remaining node.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::membership::{MemberStatus, MembershipStore};
use crate::constants::VERDICT_HISTORY_LIMIT;
use crate::error::{CoordError, Result};
use crate::protocol::{Message, Outbound};
use crate::types::NodeId;

/// What one participant saw of the subject.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Observation {
    /// The subject answered; `digest` summarizes what it reported.
    Responsive { digest: u64 },
    Unresponsive,
    #[default]
    NoObservation,
}

/// Source of a node's direct observations.
pub trait ObservationProvider {
    fn observe(&self, subject: NodeId) -> Observation;
}

impl<F> ObservationProvider for F
where
    F: Fn(NodeId) -> Observation,
{
    fn observe(&self, subject: NodeId) -> Observation {
        self(subject)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgreementId {
    pub subject: NodeId,
    pub initiator: NodeId,
    pub nonce: u64,
}

impl std::fmt::Display for AgreementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.subject, self.initiator, self.nonce)
    }
}

/// One participant's batch for one round.
///
/// Each entry is a relay chain (original observer first, sender last) and the
/// value that travelled along it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspicionReport {
    pub id: AgreementId,
    pub round: u32,
    pub participants: Vec<NodeId>,
    pub entries: Vec<(Vec<NodeId>, Observation)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Faulty,
    Honest,
    Inconclusive,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Faulty => write!(f, "faulty"),
            Verdict::Honest => write!(f, "honest"),
            Verdict::Inconclusive => write!(f, "inconclusive"),
        }
    }
}

/// A finalized agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerdictRecord {
    pub id: AgreementId,
    pub verdict: Verdict,
    pub participants: Vec<NodeId>,
    /// Agreed observation per participant.
    pub agreed: BTreeMap<NodeId, Observation>,
    /// Participants whose batch never arrived, with the first round missed.
    pub silent: BTreeMap<NodeId, u32>,
}

/// Output of feeding the detector.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AgreementStep {
    pub outbound: Vec<Outbound>,
    /// Rounds started by this step; the engine arms one timeout per round.
    pub rounds_started: Vec<(AgreementId, u32)>,
    pub verdict: Option<VerdictRecord>,
}

impl AgreementStep {
    fn merge(&mut self, other: AgreementStep) {
        self.outbound.extend(other.outbound);
        self.rounds_started.extend(other.rounds_started);
        if other.verdict.is_some() {
            self.verdict = other.verdict;
        }
    }
}

#[derive(Debug)]
struct Agreement {
    id: AgreementId,
    participants: Vec<NodeId>,
    round: u32,
    tree: BTreeMap<Vec<NodeId>, Observation>,
    batches: BTreeMap<u32, BTreeSet<NodeId>>,
    silent: BTreeMap<NodeId, u32>,
}

#[derive(Debug)]
pub struct ByzantineDetector {
    id: NodeId,
    fault_tolerance: usize,
    next_nonce: u64,
    active: HashMap<AgreementId, Agreement>,
    history: VecDeque<VerdictRecord>,
}

impl ByzantineDetector {
    pub fn new(id: NodeId, fault_tolerance: usize) -> Self {
        Self {
            id,
            fault_tolerance,
            // randomized so a restarted initiator does not reuse finalized ids
            next_nonce: fastrand::u64(..u64::MAX / 2),
            active: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    pub fn fault_tolerance(&self) -> usize {
        self.fault_tolerance
    }

    /// Minimum participants for a conclusive agreement: `3f + 1`.
    pub fn required_participants(&self) -> usize {
        3 * self.fault_tolerance + 1
    }

    fn last_round(&self) -> u32 {
        self.fault_tolerance as u32 + 1
    }

    /// Open an agreement about `subject`.
    ///
    /// Too few participants records an Inconclusive verdict and returns
    /// [`CoordError::AgreementInconclusive`].
    pub fn start(
        &mut self,
        subject: NodeId,
        membership: &MembershipStore,
        provider: &impl ObservationProvider,
    ) -> Result<(AgreementId, AgreementStep)> {
        let status = membership
            .status_of(subject)
            .ok_or(CoordError::UnknownMember(subject))?;

        let mut participants = membership.active_members();
        if status == MemberStatus::Suspected {
            participants.push(subject);
        }
        participants.sort();
        participants.dedup();

        self.next_nonce += 1;
        let id = AgreementId {
            subject,
            initiator: self.id,
            nonce: self.next_nonce,
        };

        let required = self.required_participants();
        if participants.len() < required {
            warn!(
                subject = %subject,
                participants = participants.len(),
                required,
                "Not enough participants for agreement"
            );
            self.archive(VerdictRecord {
                id,
                verdict: Verdict::Inconclusive,
                participants: participants.clone(),
                agreed: BTreeMap::new(),
                silent: BTreeMap::new(),
            });
            return Err(CoordError::AgreementInconclusive {
                subject,
                participants: participants.len(),
                required,
            });
        }

        info!(agreement = %id, participants = ?participants, "Starting agreement");
        let step = self.open(id, participants, provider);
        Ok((id, step))
    }

    fn open(
        &mut self,
        id: AgreementId,
        participants: Vec<NodeId>,
        provider: &impl ObservationProvider,
    ) -> AgreementStep {
        let own = provider.observe(id.subject);
        let mut agreement = Agreement {
            id,
            participants,
            round: 1,
            tree: BTreeMap::new(),
            batches: BTreeMap::new(),
            silent: BTreeMap::new(),
        };
        agreement.tree.insert(vec![self.id], own);

        let mut step = AgreementStep {
            outbound: self.batch(&agreement),
            rounds_started: vec![(id, 1)],
            verdict: None,
        };
        self.active.insert(id, agreement);
        step.merge(self.try_advance(id));
        step
    }

    /// Build this node's batch for the agreement's current round.
    fn batch(&self, agreement: &Agreement) -> Vec<Outbound> {
        let round = agreement.round as usize;
        let entries: Vec<(Vec<NodeId>, Observation)> = agreement
            .tree
            .iter()
            .filter(|(chain, _)| chain.len() == round && chain.last() == Some(&self.id))
            .map(|(chain, value)| (chain.clone(), *value))
            .collect();

        let report = SuspicionReport {
            id: agreement.id,
            round: agreement.round,
            participants: agreement.participants.clone(),
            entries,
        };
        Outbound::broadcast(
            agreement.participants.iter().copied().filter(|p| *p != self.id),
            Message::SuspicionReport(report),
        )
    }

    /// Extend every chain of the previous round that this node has not yet
    /// relayed. The extended chain is stored locally too: a node's relay of a
    /// value to itself is the value it received.
    fn relay(id: NodeId, agreement: &mut Agreement) {
        let previous = agreement.round as usize - 1;
        let extended: Vec<(Vec<NodeId>, Observation)> = agreement
            .tree
            .iter()
            .filter(|(chain, _)| chain.len() == previous && !chain.contains(&id))
            .map(|(chain, value)| {
                let mut chain = chain.clone();
                chain.push(id);
                (chain, *value)
            })
            .collect();
        for (chain, value) in extended {
            agreement.tree.entry(chain).or_insert(value);
        }
    }

    pub fn handle_report(
        &mut self,
        from: NodeId,
        report: SuspicionReport,
        provider: &impl ObservationProvider,
    ) -> AgreementStep {
        let id = report.id;
        if self.history.iter().any(|r| r.id == id) {
            debug!(agreement = %id, "Report for finalized agreement");
            return AgreementStep::default();
        }
        if report.round == 0 || report.round > self.last_round() {
            warn!(agreement = %id, round = report.round, "Report round out of range");
            return AgreementStep::default();
        }

        let mut step = AgreementStep::default();
        if !self.active.contains_key(&id) {
            let mut participants = report.participants.clone();
            participants.sort();
            participants.dedup();
            if !participants.contains(&self.id) || !participants.contains(&from) {
                debug!(agreement = %id, "Not a participant, ignoring report");
                return step;
            }
            if participants.len() < self.required_participants() {
                warn!(agreement = %id, "Report with too few participants");
                return step;
            }
            debug!(agreement = %id, "Joining agreement");
            step = self.open(id, participants, provider);
        }

        let Some(agreement) = self.active.get_mut(&id) else {
            return step;
        };
        if !agreement.participants.contains(&from) {
            warn!(agreement = %id, from = %from, "Report from non-participant");
            return step;
        }
        let batch = agreement.batches.entry(report.round).or_default();
        if !batch.insert(from) {
            debug!(agreement = %id, from = %from, round = report.round, "Duplicate batch");
            return step;
        }

        let round = report.round as usize;
        for (chain, value) in report.entries {
            let valid = chain.len() == round
                && chain.last() == Some(&from)
                && chain.iter().all(|n| agreement.participants.contains(n))
                && chain.iter().collect::<BTreeSet<_>>().len() == chain.len();
            if !valid {
                warn!(agreement = %id, from = %from, chain = ?chain, "Invalid relay chain");
                continue;
            }
            // first value wins
            agreement.tree.entry(chain).or_insert(value);
        }

        step.merge(self.try_advance(id));
        step
    }

    /// The engine's timer for `round` of `id` fired.
    pub fn round_timeout(&mut self, id: AgreementId, round: u32) -> AgreementStep {
        let me = self.id;
        match self.active.get_mut(&id) {
            Some(agreement) if agreement.round == round => {
                let missing = agreement.missing_batches(me);
                debug!(agreement = %id, round, missing = ?missing, "Round timed out, advancing");
                for node in missing {
                    agreement.silent.entry(node).or_insert(round);
                }
                if agreement.silent.contains_key(&id.subject) {
                    agreement.charge_subject();
                }
            }
            _ => return AgreementStep::default(),
        }
        let mut step = self.advance(id);
        step.merge(self.try_advance(id));
        step
    }

    fn try_advance(&mut self, id: AgreementId) -> AgreementStep {
        let mut step = AgreementStep::default();
        loop {
            let complete = match self.active.get(&id) {
                Some(agreement) => {
                    let others = agreement.participants.len() - 1;
                    agreement
                        .batches
                        .get(&agreement.round)
                        .is_some_and(|b| b.len() >= others)
                }
                None => false,
            };
            if !complete {
                return step;
            }
            step.merge(self.advance(id));
        }
    }

    fn advance(&mut self, id: AgreementId) -> AgreementStep {
        let last_round = self.last_round();
        let Some(agreement) = self.active.get_mut(&id) else {
            return AgreementStep::default();
        };
        if agreement.round >= last_round {
            let verdict = self.finalize(id);
            return AgreementStep {
                verdict,
                ..Default::default()
            };
        }

        agreement.round += 1;
        let round = agreement.round;
        Self::relay(self.id, agreement);
        let Some(agreement) = self.active.get(&id) else {
            return AgreementStep::default();
        };
        AgreementStep {
            outbound: self.batch(agreement),
            rounds_started: vec![(id, round)],
            verdict: None,
        }
    }

    fn finalize(&mut self, id: AgreementId) -> Option<VerdictRecord> {
        let agreement = self.active.remove(&id)?;
        let depth = self.last_round() as usize;

        let mut agreed = BTreeMap::new();
        for &p in &agreement.participants {
            let mut chain = vec![p];
            agreed.insert(p, resolve(&agreement, &mut chain, depth));
        }
        let subject_silent = agreement.silent.contains_key(&id.subject)
            || agreed.get(&id.subject) == Some(&Observation::Unresponsive);
        let verdict = if subject_silent {
            Verdict::Faulty
        } else {
            self.decide(id.subject, &agreed)
        };
        info!(
            agreement = %id,
            verdict = %verdict,
            silent = ?agreement.silent,
            "Agreement finalized"
        );

        let record = VerdictRecord {
            id,
            verdict,
            participants: agreement.participants,
            agreed,
            silent: agreement.silent,
        };
        self.archive(record.clone());
        Some(record)
    }

    fn decide(&self, subject: NodeId, agreed: &BTreeMap<NodeId, Observation>) -> Verdict {
        let f = self.fault_tolerance;
        let observers = agreed.iter().filter(|(n, _)| **n != subject).map(|(_, o)| *o);

        let mut unresponsive = 0;
        let mut digests: BTreeMap<u64, usize> = BTreeMap::new();
        for observation in observers {
            match observation {
                Observation::Unresponsive => unresponsive += 1,
                Observation::Responsive { digest } => *digests.entry(digest).or_default() += 1,
                Observation::NoObservation => {}
            }
        }
        if unresponsive > f {
            return Verdict::Faulty;
        }

        // modal digest, smallest on ties
        let modal = digests
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(d, _)| *d);
        let deviating: usize = digests
            .iter()
            .filter(|(d, _)| Some(**d) != modal)
            .map(|(_, c)| *c)
            .sum();
        if deviating > f {
            return Verdict::Faulty;
        }
        Verdict::Honest
    }

    fn archive(&mut self, record: VerdictRecord) {
        crate::cluster::metrics::record_verdict(&record.verdict.to_string());
        self.history.push_back(record);
        while self.history.len() > VERDICT_HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    pub fn active_agreements(&self) -> Vec<AgreementId> {
        let mut ids: Vec<_> = self.active.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn current_round(&self, id: AgreementId) -> Option<u32> {
        self.active.get(&id).map(|a| a.round)
    }

    /// Finalized verdicts, oldest first.
    pub fn verdicts(&self) -> impl Iterator<Item = &VerdictRecord> {
        self.history.iter()
    }

    pub fn verdict_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.history {
            *counts.entry(record.verdict.to_string()).or_default() += 1;
        }
        counts
    }
}

impl Agreement {
    /// Participants other than `me` whose batch for the current round is absent.
    fn missing_batches(&self, me: NodeId) -> Vec<NodeId> {
        let received = self.batches.get(&self.round);
        self.participants
            .iter()
            .copied()
            .filter(|p| *p != me && !received.is_some_and(|b| b.contains(p)))
            .collect()
    }

    /// Fill every value the subject owed for the current round with
    /// `Unresponsive`. In round 1 that is its own report, which honest nodes
    /// then relay, so they agree on it.
    fn charge_subject(&mut self) {
        let subject = self.id.subject;
        let previous = self.round as usize - 1;
        let owed: Vec<Vec<NodeId>> = if previous == 0 {
            vec![vec![subject]]
        } else {
            self.tree
                .keys()
                .filter(|chain| chain.len() == previous && !chain.contains(&subject))
                .map(|chain| {
                    let mut chain = chain.clone();
                    chain.push(subject);
                    chain
                })
                .collect()
        };
        for chain in owed {
            self.tree.entry(chain).or_insert(Observation::Unresponsive);
        }
    }
}

/// Strict-majority resolution of the subtree rooted at `chain`.
fn resolve(agreement: &Agreement, chain: &mut Vec<NodeId>, depth: usize) -> Observation {
    if chain.len() >= depth {
        return agreement.tree.get(chain.as_slice()).copied().unwrap_or_default();
    }

    let mut counts: BTreeMap<Observation, usize> = BTreeMap::new();
    let mut children = 0;
    for &q in &agreement.participants {
        if chain.contains(&q) {
            continue;
        }
        chain.push(q);
        *counts.entry(resolve(agreement, chain, depth)).or_default() += 1;
        chain.pop();
        children += 1;
    }
    if children == 0 {
        return agreement.tree.get(chain.as_slice()).copied().unwrap_or_default();
    }
    counts
        .into_iter()
        .find(|(_, count)| count * 2 > children)
        .map(|(value, _)| value)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(n: u64) -> MembershipStore {
        MembershipStore::with_seeds((1..=n).map(NodeId))
    }

    fn reports(step: &AgreementStep) -> Vec<(NodeId, SuspicionReport)> {
        step.outbound
            .iter()
            .filter_map(|o| match &o.message {
                Message::SuspicionReport(r) => Some((o.to, r.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_too_few_participants_is_inconclusive() {
        let mut d = ByzantineDetector::new(NodeId(1), 1);
        let m = membership(3);
        let err = d
            .start(NodeId(3), &m, &|_: NodeId| Observation::Unresponsive)
            .unwrap_err();
        assert!(matches!(
            err,
            CoordError::AgreementInconclusive { participants: 3, required: 4, .. }
        ));
        assert_eq!(d.verdicts().next().unwrap().verdict, Verdict::Inconclusive);
    }

    #[test]
    fn test_unknown_subject() {
        let mut d = ByzantineDetector::new(NodeId(1), 1);
        let m = membership(4);
        assert!(matches!(
            d.start(NodeId(9), &m, &|_: NodeId| Observation::NoObservation),
            Err(CoordError::UnknownMember(_))
        ));
    }

    #[test]
    fn test_round_one_broadcasts_own_observation() {
        let mut d = ByzantineDetector::new(NodeId(1), 1);
        let m = membership(4);
        let (id, step) = d.start(NodeId(4), &m, &|_: NodeId| Observation::Unresponsive).unwrap();

        let sent = reports(&step);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].1.round, 1);
        assert_eq!(sent[0].1.entries, vec![(vec![NodeId(1)], Observation::Unresponsive)]);
        assert_eq!(step.rounds_started, vec![(id, 1)]);
    }

    #[test]
    fn test_timeouts_finalize_with_missing_entries() {
        let mut d = ByzantineDetector::new(NodeId(1), 1);
        let m = membership(4);
        let (id, _) = d.start(NodeId(4), &m, &|_: NodeId| Observation::Unresponsive).unwrap();

        let step = d.round_timeout(id, 1);
        assert_eq!(step.rounds_started, vec![(id, 2)]);
        let step = d.round_timeout(id, 2);
        let record = step.verdict.unwrap();
        // the subject never sent a batch
        assert_eq!(record.verdict, Verdict::Faulty);
        assert_eq!(record.silent.get(&NodeId(4)), Some(&1));
        assert!(d.active_agreements().is_empty());
    }

    const GOOD: Observation = Observation::Responsive { digest: 5 };

    fn feed(
        d: &mut ByzantineDetector,
        id: AgreementId,
        from: NodeId,
        round: u32,
        entries: Vec<(Vec<NodeId>, Observation)>,
    ) {
        let report = SuspicionReport {
            id,
            round,
            participants: vec![NodeId(1), NodeId(2), NodeId(3), NodeId(4)],
            entries,
        };
        d.handle_report(from, report, &|_: NodeId| GOOD);
    }

    #[test]
    fn test_silent_bystander_does_not_convict_subject() {
        let mut d = ByzantineDetector::new(NodeId(1), 1);
        let m = membership(4);
        let (id, _) = d.start(NodeId(4), &m, &|_: NodeId| GOOD).unwrap();
        let (n1, n2, n4) = (NodeId(1), NodeId(2), NodeId(4));

        // node 3 never takes part
        feed(&mut d, id, n2, 1, vec![(vec![n2], GOOD)]);
        feed(&mut d, id, n4, 1, vec![(vec![n4], Observation::NoObservation)]);
        d.round_timeout(id, 1);
        feed(&mut d, id, n2, 2, vec![(vec![n1, n2], GOOD), (vec![n4, n2], Observation::NoObservation)]);
        feed(&mut d, id, n4, 2, vec![(vec![n1, n4], GOOD), (vec![n2, n4], GOOD)]);

        let record = d.round_timeout(id, 2).verdict.unwrap();
        assert_eq!(record.verdict, Verdict::Honest);
        assert_eq!(record.silent, BTreeMap::from([(NodeId(3), 1)]));
    }

    #[test]
    fn test_subject_silent_after_round_one_is_faulty() {
        let mut d = ByzantineDetector::new(NodeId(1), 1);
        let m = membership(4);
        let (id, _) = d.start(NodeId(2), &m, &|_: NodeId| GOOD).unwrap();
        let (n1, n2, n3, n4) = (NodeId(1), NodeId(2), NodeId(3), NodeId(4));

        feed(&mut d, id, n2, 1, vec![(vec![n2], Observation::NoObservation)]);
        feed(&mut d, id, n3, 1, vec![(vec![n3], GOOD)]);
        feed(&mut d, id, n4, 1, vec![(vec![n4], GOOD)]);
        assert_eq!(d.current_round(id), Some(2));

        // the subject crashes: only nodes 3 and 4 relay
        let none = Observation::NoObservation;
        feed(&mut d, id, n3, 2, vec![(vec![n1, n3], GOOD), (vec![n2, n3], none), (vec![n4, n3], GOOD)]);
        feed(&mut d, id, n4, 2, vec![(vec![n1, n4], GOOD), (vec![n2, n4], none), (vec![n3, n4], GOOD)]);
        assert_eq!(d.current_round(id), Some(2));

        let record = d.round_timeout(id, 2).verdict.unwrap();
        assert_eq!(record.verdict, Verdict::Faulty);
        assert_eq!(record.silent, BTreeMap::from([(n2, 2)]));
        // what the observers saw is still agreed as it was sent
        assert_eq!(record.agreed[&n3], GOOD);
        assert!(d.active_agreements().is_empty());
    }

    #[test]
    fn test_stale_round_timeout_ignored() {
        let mut d = ByzantineDetector::new(NodeId(1), 1);
        let m = membership(4);
        let (id, _) = d.start(NodeId(4), &m, &|_: NodeId| Observation::Unresponsive).unwrap();
        d.round_timeout(id, 1);
        assert_eq!(d.round_timeout(id, 1), AgreementStep::default());
        assert_eq!(d.current_round(id), Some(2));
    }

    #[test]
    fn test_invalid_chain_is_discarded() {
        let mut d = ByzantineDetector::new(NodeId(2), 1);
        let id = AgreementId {
            subject: NodeId(4),
            initiator: NodeId(1),
            nonce: 1,
        };
        let report = SuspicionReport {
            id,
            round: 1,
            participants: vec![NodeId(1), NodeId(2), NodeId(3), NodeId(4)],
            // forged chain claiming to come from node 3
            entries: vec![(vec![NodeId(3)], Observation::Unresponsive)],
        };
        d.handle_report(NodeId(1), report, &|_: NodeId| Observation::Responsive { digest: 1 });
        let agreement = &d.active[&id];
        assert!(!agreement.tree.contains_key(&vec![NodeId(3)]));
    }

    #[test]
    fn test_majority_resolution() {
        let participants = vec![NodeId(1), NodeId(2), NodeId(3), NodeId(4)];
        let mut agreement = Agreement {
            id: AgreementId {
                subject: NodeId(4),
                initiator: NodeId(1),
                nonce: 1,
            },
            participants,
            round: 2,
            tree: BTreeMap::new(),
            batches: BTreeMap::new(),
            silent: BTreeMap::new(),
        };
        agreement.tree.insert(vec![NodeId(2), NodeId(1)], Observation::Unresponsive);
        agreement.tree.insert(vec![NodeId(2), NodeId(3)], Observation::Unresponsive);
        agreement
            .tree
            .insert(vec![NodeId(2), NodeId(4)], Observation::Responsive { digest: 9 });

        let value = resolve(&agreement, &mut vec![NodeId(2)], 2);
        assert_eq!(value, Observation::Unresponsive);

        let nothing = resolve(&agreement, &mut vec![NodeId(3)], 2);
        assert_eq!(nothing, Observation::NoObservation);
    }

    #[test]
    fn test_inconsistent_digests_are_faulty() {
        let d = ByzantineDetector::new(NodeId(1), 1);
        let agreed = BTreeMap::from([
            (NodeId(1), Observation::Responsive { digest: 7 }),
            (NodeId(2), Observation::Responsive { digest: 8 }),
            (NodeId(3), Observation::Responsive { digest: 9 }),
            (NodeId(4), Observation::NoObservation),
        ]);
        assert_eq!(d.decide(NodeId(4), &agreed), Verdict::Faulty);

        let consistent = BTreeMap::from([
            (NodeId(1), Observation::Responsive { digest: 7 }),
            (NodeId(2), Observation::Responsive { digest: 7 }),
            (NodeId(3), Observation::Unresponsive),
            (NodeId(4), Observation::Responsive { digest: 1 }),
        ]);
        assert_eq!(d.decide(NodeId(4), &consistent), Verdict::Honest);
    }
}
