//! # Summary
//!
//! This module defines the `Participant`, which plays all three Paxos roles
//! at once: it proposes decrees for its clients, votes on the proposals of
//! others, and learns every committed outcome.
//!
//! All state sits behind one lock, and every inbound event runs to
//! completion under it. Messages a participant sends to itself are queued
//! on its loopback inbox and handled, in order, before the lock is released.
//! Durable state lives in the `Ledger`; everything else here is per-attempt
//! bookkeeping that may be lost on a crash.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use hashbrown::{HashMap as Map, HashSet as Set};
use parking_lot::Mutex;

use crate::ledger::{Ledger, LedgerError};
use crate::message::{self, ClientRequest, ClientResponse, Message};
use crate::peer::{Inbox, Loopback, Peer, Respond};
use crate::types::{BallotNum, Decree, DecreeNum, ParticipantId, Value, Vote, NOOP};

/// Failures that must stop the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("group of {0} participants must be odd and at least 3")]
    InvalidGroupSize(usize),

    #[error("participant {0} is already registered")]
    DuplicatePeer(ParticipantId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Not pursuing leadership
    Idle,

    /// Phase 1 in progress for `last_tried`
    Trying,

    /// Leader for `last_tried`, may propose without repeating phase 1
    Polling,
}

pub struct Participant {
    id: ParticipantId,
    inbox: Inbox,
    state: Mutex<State>,
}

struct State {
    /// Unique ID of this participant
    id: ParticipantId,

    status: Status,

    /// Durable promises, votes and outcomes
    ledger: Ledger,

    /// Every participant, including self, by ID
    participants: BTreeMap<ParticipantId, Box<dyn Peer>>,

    /// Acknowledgements received in phase 2
    voters_of_current_ballot: Set<ParticipantId>,

    /// Votes reported in phase 1, per slot
    prior_votes_by_decree: BTreeMap<DecreeNum, BTreeSet<Vote>>,

    /// Commit frontier of every acceptor that answered phase 1
    prior_voters_acked: Map<ParticipantId, DecreeNum>,

    /// Proposal set of the current phase 2
    chosen_values_of_current_ballot: BTreeMap<DecreeNum, Value>,

    /// Slot assigned to the request in flight
    chosen_decree_num_for_client: Option<DecreeNum>,

    current_client_request: Option<ClientRequest>,

    current_response_channel: Option<Box<dyn Respond>>,

    pending_client_requests: VecDeque<(ClientRequest, Box<dyn Respond>)>,
}

impl Participant {
    /// Creates an idle participant, owning `ledger` exclusively.
    pub fn new(id: ParticipantId, ledger: Ledger) -> Self {
        let inbox = Inbox::default();
        let mut participants: BTreeMap<ParticipantId, Box<dyn Peer>> = BTreeMap::new();
        participants.insert(id, Box::new(Loopback::new(id, inbox.clone())));
        info!(
            "[{}] starting with commit num {}, max bal {}",
            id,
            ledger.commit_num(),
            ledger.max_bal(),
        );
        Participant {
            id,
            inbox,
            state: Mutex::new(State {
                id,
                status: Status::Idle,
                ledger,
                participants,
                voters_of_current_ballot: Set::default(),
                prior_votes_by_decree: BTreeMap::new(),
                prior_voters_acked: Map::default(),
                chosen_values_of_current_ballot: BTreeMap::new(),
                chosen_decree_num_for_client: None,
                current_client_request: None,
                current_response_channel: None,
                pending_client_requests: VecDeque::new(),
            }),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    /// Registers the other participants of the group. The resulting group
    /// must have an odd size of at least three.
    pub fn add_remotes(&self, peers: Vec<Box<dyn Peer>>) -> Result<(), Error> {
        let mut state = self.state.lock();
        let total = state.participants.len() + peers.len();
        if total < 3 || total % 2 == 0 {
            return Err(Error::InvalidGroupSize(total))
        }
        let mut seen: Set<ParticipantId> = state.participants.keys().copied().collect();
        for peer in &peers {
            if !seen.insert(peer.id()) {
                return Err(Error::DuplicatePeer(peer.id()))
            }
        }
        for peer in peers {
            state.participants.insert(peer.id(), peer);
        }
        info!("[{}] joined group of {}", self.id, total);
        Ok(())
    }

    pub fn quorum_size(&self) -> usize {
        self.state.lock().quorum_size()
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn commit_num(&self) -> DecreeNum {
        self.state.lock().ledger.commit_num()
    }

    pub fn outcome(&self, decree_num: DecreeNum) -> Result<Option<Value>, Error> {
        Ok(self.state.lock().ledger.outcome(decree_num)?)
    }

    pub fn pending_client_requests(&self) -> usize {
        self.state.lock().pending_client_requests.len()
    }

    pub fn has_request_in_flight(&self) -> bool {
        self.state.lock().current_client_request.is_some()
    }

    /// Queues a client request. Never rejected here; see `pump_one_client_request`.
    pub fn submit_client_request(&self, request: ClientRequest, respond: Box<dyn Respond>) {
        trace!("[{}] queueing {:?}", self.id, request);
        self.state.lock().pending_client_requests.push_back((request, respond));
    }

    /// Starts the next queued request, if none is in flight.
    pub fn pump_one_client_request(&self) -> Result<(), Error> {
        self.run(|state| state.pump_one_client_request())
    }

    /// Dispatches a decoded peer message.
    pub fn handle(&self, message: Message) -> Result<(), Error> {
        self.run(|state| state.dispatch(message))
    }

    pub fn on_next_ballot(&self, message: message::NextBallot) -> Result<(), Error> {
        self.run(|state| state.on_next_ballot(message))
    }

    pub fn on_last_vote(&self, message: message::LastVote) -> Result<(), Error> {
        self.run(|state| state.on_last_vote(message))
    }

    pub fn on_begin_ballot(&self, message: message::BeginBallot) -> Result<(), Error> {
        self.run(|state| state.on_begin_ballot(message))
    }

    pub fn on_pending_vote(&self, message: message::PendingVote) -> Result<(), Error> {
        self.run(|state| state.on_pending_vote(message))
    }

    pub fn on_voted(&self, message: message::Voted) -> Result<(), Error> {
        self.run(|state| state.on_voted(message))
    }

    pub fn on_success(&self, message: message::Success) -> Result<(), Error> {
        self.run(|state| state.on_success(message))
    }

    pub fn on_nack(&self, message: message::Nack) -> Result<(), Error> {
        self.run(|state| state.on_nack(message))
    }

    /// Runs one event, then everything it addressed to self, under the lock.
    fn run<F>(&self, event: F) -> Result<(), Error>
        where F: FnOnce(&mut State) -> Result<(), Error>
    {
        let mut state = self.state.lock();
        event(&mut state)?;
        while let Some(message) = self.inbox.pop() {
            state.dispatch(message)?;
        }
        Ok(())
    }
}

impl State {
    fn quorum_size(&self) -> usize {
        (self.participants.len() + 1) / 2
    }

    fn is_leader(&self) -> bool {
        self.ledger.last_tried() == self.ledger.max_bal()
    }

    fn peer(&self, to: ParticipantId) -> Option<&dyn Peer> {
        let peer = self.participants.get(&to).map(|peer| &**peer);
        if peer.is_none() {
            warn!("[{}] no route to unknown participant {}", self.id, to);
        }
        peer
    }

    fn broadcast<F: Fn(&dyn Peer)>(&self, send: F) {
        for peer in self.participants.values() {
            send(&**peer);
        }
    }

    fn dispatch(&mut self, message: Message) -> Result<(), Error> {
        trace!("[{}] received {:?}", self.id, message);
        match message {
        | Message::NextBallot(m) => self.on_next_ballot(m),
        | Message::LastVote(m) => self.on_last_vote(m),
        | Message::BeginBallot(m) => self.on_begin_ballot(m),
        | Message::PendingVote(m) => self.on_pending_vote(m),
        | Message::Voted(m) => self.on_voted(m),
        | Message::Nack(m) => self.on_nack(m),
        | Message::Success(m) => self.on_success(m),
        | Message::ClientRequest(_) | Message::ClientResponse(_) => {
            warn!("[{}] ignoring {} from a peer", self.id, message.name());
            Ok(())
        }
        }
    }

    /// Outstanding votes of this participant, as reported in phase 1.
    fn own_votes(&self) -> Result<Vec<Vote>, Error> {
        let id = self.id;
        Ok(self.ledger
            .undecided_ballots()?
            .into_iter()
            .map(|(ballot, decree)| Vote { owner_id: id, ballot, decree })
            .collect())
    }

    fn chosen_decrees(&self) -> Vec<Decree> {
        self.chosen_values_of_current_ballot
            .iter()
            .map(|(decree_num, value)| Decree::new(*decree_num, *value))
            .collect()
    }

    /// Sends `to` every committed decree past `their_commit_num`.
    fn push_missing_commits(&self, to: ParticipantId, their_commit_num: DecreeNum) -> Result<(), Error> {
        let commit_num = self.ledger.commit_num();
        if to == self.id || their_commit_num >= commit_num {
            return Ok(())
        }
        let decrees = self.ledger.committed_decrees(their_commit_num, commit_num)?;
        debug!("[{}] sending {} committed decrees to {}", self.id, decrees.len(), to);
        if let Some(peer) = self.peer(to) {
            peer.send_success(message::Success { decrees });
        }
        Ok(())
    }

    fn pump_one_client_request(&mut self) -> Result<(), Error> {
        if self.current_client_request.is_some() {
            return Ok(())
        }

        let (request, respond) = match self.pending_client_requests.pop_front() {
        | Some(next) => next,
        | None => return Ok(()),
        };

        let leader = self.status == Status::Polling && self.is_leader();
        if self.status != Status::Idle && !leader {
            warn!(
                "[{}] rejecting {:?} while ballot {} is in flight",
                self.id,
                request,
                self.ledger.last_tried(),
            );
            respond.deliver(ClientResponse::rejected(request.requested_value));
            return Ok(())
        }

        debug!("[{}] starting {:?}", self.id, request);
        self.current_client_request = Some(request);
        self.current_response_channel = Some(respond);
        self.chosen_decree_num_for_client = None;
        self.chosen_values_of_current_ballot.clear();
        self.voters_of_current_ballot.clear();

        if leader {
            // Phase 1 already won for `last_tried`: only our own votes can be pending
            self.prior_votes_by_decree.clear();
            for vote in self.own_votes()? {
                self.prior_votes_by_decree
                    .entry(vote.decree.decree_num)
                    .or_default()
                    .insert(vote);
            }
            self.choose_values()?;
            self.begin_ballot();
            Ok(())
        } else {
            self.try_new_ballot()
        }
    }

    /// Phase 1a.
    fn try_new_ballot(&mut self) -> Result<(), Error> {
        let last_tried = self.ledger.last_tried();
        let max_bal = self.ledger.max_bal();
        let number = std::cmp::max(last_tried.proposal_number, max_bal.proposal_number)
            .max(-1)
            .saturating_add(1);
        let ballot = BallotNum::new(number, self.id);

        self.ledger.set_last_tried(ballot)?;
        self.status = Status::Trying;
        self.prior_votes_by_decree.clear();
        self.prior_voters_acked.clear();

        info!("[{}] trying ballot {}", self.id, ballot);
        let next_ballot = message::NextBallot {
            ballot,
            sender_id: self.id,
            sender_commit_num: self.ledger.commit_num(),
        };
        self.broadcast(|peer| peer.send_next_ballot(next_ballot.clone()));
        Ok(())
    }

    fn on_next_ballot(&mut self, m: message::NextBallot) -> Result<(), Error> {
        self.push_missing_commits(m.sender_id, m.sender_commit_num)?;

        let max_bal = self.ledger.max_bal();
        if m.ballot > max_bal {
            self.ledger.set_max_bal(m.ballot)?;
            if m.ballot.owner_id != self.id && self.status != Status::Idle {
                info!("[{}] preempted by ballot {}", self.id, m.ballot);
                self.reset_to_idle();
            }
            let last_vote = message::LastVote {
                ballot: m.ballot,
                sender_id: self.id,
                sender_commit_num: self.ledger.commit_num(),
                votes: self.own_votes()?,
                committed_decrees: self.ledger.committed_past_frontier()?,
            };
            if let Some(peer) = self.peer(m.ballot.owner_id) {
                peer.send_last_vote(last_vote);
            }
        } else if m.ballot < max_bal {
            self.nack(m.ballot, max_bal);
        }
        Ok(())
    }

    fn nack(&self, ballot: BallotNum, observed_max_bal: BallotNum) {
        if let Some(peer) = self.peer(ballot.owner_id) {
            peer.send_nack(message::Nack {
                ballot,
                observed_max_bal,
                sender_id: self.id,
            });
        }
    }

    fn on_last_vote(&mut self, m: message::LastVote) -> Result<(), Error> {
        if self.status != Status::Trying || m.ballot != self.ledger.last_tried() {
            trace!("[{}] ignoring stale last vote for {}", self.id, m.ballot);
            return Ok(())
        }

        // Outcomes the acceptor learned ahead of its own commit frontier
        for decree in &m.committed_decrees {
            self.ledger.set_outcome(decree.decree_num, decree.value)?;
        }
        for vote in m.votes {
            self.prior_votes_by_decree
                .entry(vote.decree.decree_num)
                .or_default()
                .insert(vote);
        }
        self.prior_voters_acked.insert(m.sender_id, m.sender_commit_num);

        if self.prior_voters_acked.len() >= self.quorum_size() {
            info!("[{}] won ballot {}", self.id, m.ballot);
            self.status = Status::Polling;
            self.choose_values()?;
            self.begin_ballot();
        }
        Ok(())
    }

    /// Fills the proposal set from known outcomes and the gathered votes,
    /// and assigns the client's value to the first slot past all of them.
    fn choose_values(&mut self) -> Result<(), Error> {
        let commit_num = self.ledger.commit_num();
        let max_voted = self.prior_votes_by_decree.keys().next_back().copied();
        let max_committed = self.ledger
            .committed_past_frontier()?
            .last()
            .map(|decree| decree.decree_num);
        let max_seen = std::cmp::max(max_voted, max_committed);

        self.chosen_values_of_current_ballot.clear();
        if let Some(max_seen) = max_seen {
            for decree_num in (commit_num + 1)..=max_seen {
                let value = match self.ledger.outcome(decree_num)? {
                | Some(value) => value,
                | None => {
                    self.prior_votes_by_decree
                        .get(&decree_num)
                        .and_then(|votes| votes.iter().next_back())
                        .map(|vote| vote.decree.value)
                        .unwrap_or(NOOP)
                }
                };
                self.chosen_values_of_current_ballot.insert(decree_num, value);
            }
        }

        let slot = match max_seen {
        | Some(max_seen) => std::cmp::max(commit_num + 1, max_seen + 1),
        | None => commit_num + 1,
        };
        self.chosen_decree_num_for_client = Some(slot);
        if let Some(request) = self.current_client_request {
            self.chosen_values_of_current_ballot.insert(slot, request.requested_value);
        }

        debug!(
            "[{}] proposing {:?} with client slot {}",
            self.id,
            self.chosen_values_of_current_ballot,
            slot,
        );
        Ok(())
    }

    /// Phase 2a.
    fn begin_ballot(&self) {
        let begin_ballot = message::BeginBallot {
            ballot: self.ledger.last_tried(),
            sender_id: self.id,
            sender_commit_num: self.ledger.commit_num(),
            chosen_decrees: self.chosen_decrees(),
            committed_decrees: Vec::new(),
        };
        self.broadcast(|peer| peer.send_begin_ballot(begin_ballot.clone()));
    }

    fn on_begin_ballot(&mut self, m: message::BeginBallot) -> Result<(), Error> {
        let max_bal = self.ledger.max_bal();
        if m.ballot < max_bal {
            self.nack(m.ballot, max_bal);
            return Ok(())
        }

        if m.ballot > max_bal {
            self.ledger.set_max_bal(m.ballot)?;
        }
        if m.ballot.owner_id != self.id && self.status != Status::Idle {
            info!("[{}] preempted by ballot {}", self.id, m.ballot);
            self.reset_to_idle();
        }

        for decree in &m.committed_decrees {
            self.ledger.set_outcome(decree.decree_num, decree.value)?;
        }

        for decree in &m.chosen_decrees {
            match self.ledger.outcome(decree.decree_num)? {
            | Some(value) if value == decree.value => (),
            | _ => self.ledger.set_max_vbal(m.ballot, decree.decree_num, decree.value)?,
            }
        }

        let peer = match self.peer(m.ballot.owner_id) {
        | Some(peer) => peer,
        | None => return Ok(()),
        };
        let commit_num = self.ledger.commit_num();
        if commit_num < m.sender_commit_num {
            debug!("[{}] behind {} at {}, asking for history", self.id, m.sender_id, commit_num);
            peer.send_pending_vote(message::PendingVote {
                ballot: m.ballot,
                sender_id: self.id,
                sender_commit_num: commit_num,
            });
        } else {
            let max_decree_num = m.chosen_decrees
                .iter()
                .map(|decree| decree.decree_num)
                .max()
                .unwrap_or(-1);
            peer.send_voted(message::Voted {
                ballot: m.ballot,
                owner_id: self.id,
                max_decree_num,
            });
        }
        Ok(())
    }

    fn on_pending_vote(&mut self, m: message::PendingVote) -> Result<(), Error> {
        let last_tried = self.ledger.last_tried();
        if m.ballot != last_tried || self.status != Status::Polling {
            return self.push_missing_commits(m.sender_id, m.sender_commit_num)
        }

        let commit_num = self.ledger.commit_num();
        let committed_decrees = self.ledger.committed_decrees(m.sender_commit_num, commit_num)?;
        let chosen_decrees = self.chosen_decrees()
            .into_iter()
            .filter(|decree| decree.decree_num > commit_num)
            .collect();

        debug!(
            "[{}] catching up {} with {} committed decrees",
            self.id,
            m.sender_id,
            committed_decrees.len(),
        );
        if let Some(peer) = self.peer(m.sender_id) {
            peer.send_begin_ballot(message::BeginBallot {
                ballot: last_tried,
                sender_id: self.id,
                sender_commit_num: commit_num,
                chosen_decrees,
                committed_decrees,
            });
        }
        Ok(())
    }

    fn on_voted(&mut self, m: message::Voted) -> Result<(), Error> {
        if self.status != Status::Polling
        || m.ballot != self.ledger.last_tried()
        || self.current_client_request.is_none() {
            trace!("[{}] ignoring vote from {} for {}", self.id, m.owner_id, m.ballot);
            return Ok(())
        }

        // Acknowledgement of an earlier round under the same ballot
        let round = self.chosen_values_of_current_ballot.keys().next_back().copied().unwrap_or(-1);
        if m.max_decree_num != round {
            trace!("[{}] ignoring vote from {} up to {}", self.id, m.owner_id, m.max_decree_num);
            return Ok(())
        }

        self.voters_of_current_ballot.insert(m.owner_id);
        if self.voters_of_current_ballot.len() < self.quorum_size() {
            return Ok(())
        }

        for (decree_num, value) in &self.chosen_values_of_current_ballot {
            self.ledger.set_outcome(*decree_num, *value)?;
        }

        let decrees = self.chosen_decrees();
        info!("[{}] committed {:?} under {}", self.id, decrees, m.ballot);
        let success = message::Success { decrees };
        self.broadcast(|peer| peer.send_success(success.clone()));

        let request = self.current_client_request.take();
        let respond = self.current_response_channel.take();
        let chosen = self.chosen_decree_num_for_client
            .and_then(|slot| {
                self.chosen_values_of_current_ballot
                    .get(&slot)
                    .map(|value| Decree::new(slot, *value))
            });
        if let (Some(request), Some(respond)) = (request, respond) {
            let response = match chosen {
            | Some(decree) => ClientResponse::committed(decree),
            | None => ClientResponse::rejected(request.requested_value),
            };
            respond.deliver(response);
        }

        self.prior_votes_by_decree.clear();
        self.voters_of_current_ballot.clear();
        Ok(())
    }

    fn on_success(&mut self, m: message::Success) -> Result<(), Error> {
        for decree in &m.decrees {
            self.ledger.set_outcome(decree.decree_num, decree.value)?;
        }
        trace!("[{}] learned {} decrees, commit num {}", self.id, m.decrees.len(), self.ledger.commit_num());
        Ok(())
    }

    fn on_nack(&mut self, m: message::Nack) -> Result<(), Error> {
        if self.status != Status::Idle
        && m.ballot == self.ledger.last_tried()
        && m.observed_max_bal > self.ledger.max_bal() {
            self.ledger.set_max_bal(m.observed_max_bal)?;
            info!("[{}] abdicating {} for {}", self.id, m.ballot, m.observed_max_bal);
            self.reset_to_idle();
        }
        Ok(())
    }

    fn reset_to_idle(&mut self) {
        self.status = Status::Idle;
        self.prior_votes_by_decree.clear();
        self.prior_voters_acked.clear();
        self.chosen_values_of_current_ballot.clear();
        self.voters_of_current_ballot.clear();
        self.chosen_decree_num_for_client = None;
        let request = self.current_client_request.take();
        let respond = self.current_response_channel.take();
        if let (Some(request), Some(respond)) = (request, respond) {
            warn!("[{}] abandoning {:?}", self.id, request);
            respond.deliver(ClientResponse::rejected(request.requested_value));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;

    /// Records everything sent to one participant.
    struct Capture {
        id: ParticipantId,
        sent: Arc<Mutex<Vec<Message>>>,
    }

    impl Peer for Capture {
        fn id(&self) -> ParticipantId {
            self.id
        }

        fn send(&self, message: Message) {
            self.sent.lock().push(message);
        }
    }

    fn capture(id: ParticipantId) -> (Box<dyn Peer>, Arc<Mutex<Vec<Message>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (Box::new(Capture { id, sent: sent.clone() }), sent)
    }

    fn participant(dir: &tempfile::TempDir, id: ParticipantId) -> Participant {
        let name = format!("ledger-{:>02}.paxos", id);
        Participant::new(id, Ledger::create(dir.path(), &name, id).unwrap())
    }

    fn request(value: Value) -> ClientRequest {
        ClientRequest {
            correlation_id: value,
            requested_value: value,
        }
    }

    fn submit(participant: &Participant, value: Value) -> mpsc::UnboundedReceiver<ClientResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        participant.submit_client_request(request(value), Box::new(tx));
        rx
    }

    /// A participant of three whose peers 1 and 2 only record messages.
    fn trio(dir: &tempfile::TempDir) -> (Participant, Arc<Mutex<Vec<Message>>>, Arc<Mutex<Vec<Message>>>) {
        let leader = participant(dir, 0);
        let (one, to_one) = capture(1);
        let (two, to_two) = capture(2);
        leader.add_remotes(vec![one, two]).unwrap();
        (leader, to_one, to_two)
    }

    fn last_begin_ballot(sent: &Arc<Mutex<Vec<Message>>>) -> message::BeginBallot {
        sent.lock()
            .iter()
            .rev()
            .find_map(|message| match message {
            | Message::BeginBallot(m) => Some(m.clone()),
            | _ => None,
            })
            .expect("no begin ballot sent")
    }

    #[test]
    fn group_size_must_be_odd_and_at_least_three() {
        let dir = tempfile::tempdir().unwrap();
        let single = participant(&dir, 0);
        assert!(matches!(
            single.add_remotes(vec![capture(1).0, capture(2).0, capture(3).0]),
            Err(Error::InvalidGroupSize(4))
        ));
        assert!(matches!(single.add_remotes(vec![capture(1).0]), Err(Error::InvalidGroupSize(2))));
        assert!(matches!(
            single.add_remotes(vec![capture(0).0, capture(2).0]),
            Err(Error::DuplicatePeer(0))
        ));
        assert_eq!(single.quorum_size(), 1);
        single.add_remotes(vec![capture(1).0, capture(2).0]).unwrap();
        assert_eq!(single.quorum_size(), 2);
    }

    #[test]
    fn single_node_commits_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let single = participant(&dir, 0);

        let mut first = submit(&single, 42);
        let mut second = submit(&single, 44);
        single.pump_one_client_request().unwrap();
        assert_eq!(first.try_recv().unwrap(), ClientResponse { decree_num: 0, value: 42 });
        assert_eq!(single.status(), Status::Polling);

        single.pump_one_client_request().unwrap();
        assert_eq!(second.try_recv().unwrap(), ClientResponse { decree_num: 1, value: 44 });

        assert_eq!(single.outcome(0).unwrap(), Some(42));
        assert_eq!(single.outcome(1).unwrap(), Some(44));
        assert_eq!(single.commit_num(), 1);
        assert!(first.try_recv().is_err());
    }

    #[test]
    fn pump_is_noop_while_request_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, to_one, _) = trio(&dir);
        let _first = submit(&leader, 1);
        let mut second = submit(&leader, 2);

        leader.pump_one_client_request().unwrap();
        assert_eq!(leader.status(), Status::Trying);
        leader.pump_one_client_request().unwrap();
        assert_eq!(leader.pending_client_requests(), 1);
        assert!(second.try_recv().is_err());
        assert_eq!(to_one.lock().len(), 1);
    }

    #[test]
    fn phase_one_without_votes_adds_no_noops() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, to_one, _) = trio(&dir);
        let _response = submit(&leader, 7);
        leader.pump_one_client_request().unwrap();

        let ballot = match &to_one.lock()[0] {
        | Message::NextBallot(m) => m.ballot,
        | other => panic!("unexpected {:?}", other),
        };
        assert_eq!(ballot, BallotNum::new(0, 0));

        leader.on_last_vote(message::LastVote {
            ballot,
            sender_id: 1,
            sender_commit_num: -1,
            votes: vec![],
            committed_decrees: vec![],
        }).unwrap();
        assert_eq!(leader.status(), Status::Polling);
        assert_eq!(last_begin_ballot(&to_one).chosen_decrees, vec![Decree::new(0, 7)]);
    }

    #[test]
    fn gaps_are_filled_with_noops_and_votes_carried_forward() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, to_one, to_two) = trio(&dir);
        let _response = submit(&leader, 9);
        leader.pump_one_client_request().unwrap();
        let ballot = BallotNum::new(0, 0);

        let old = BallotNum::new(-1, 1);
        let vote = |owner_id, ballot, decree_num, value| Vote {
            owner_id,
            ballot,
            decree: Decree::new(decree_num, value),
        };
        leader.on_last_vote(message::LastVote {
            ballot,
            sender_id: 1,
            sender_commit_num: -1,
            votes: vec![vote(1, BallotNum::new(0, 2), 1, 11), vote(1, old, 3, 33)],
            committed_decrees: vec![],
        }).unwrap();
        assert_eq!(leader.status(), Status::Polling);

        let proposal = last_begin_ballot(&to_one);
        assert_eq!(proposal.ballot, ballot);
        assert_eq!(proposal.chosen_decrees, vec![
            Decree::new(0, NOOP),
            Decree::new(1, 11),
            Decree::new(2, NOOP),
            Decree::new(3, 33),
            Decree::new(4, 9),
        ]);
        assert_eq!(last_begin_ballot(&to_two), proposal);
    }

    #[test]
    fn highest_ballot_vote_wins_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::create(dir.path(), "ledger-01.paxos", 1).unwrap();
        ledger.set_max_bal(BallotNum::new(2, 2)).unwrap();
        ledger.set_max_vbal(BallotNum::new(0, 0), 0, 100).unwrap();
        let leader = Participant::new(1, ledger);
        let (zero, to_zero) = capture(0);
        let (two, _) = capture(2);
        leader.add_remotes(vec![zero, two]).unwrap();
        let _response = submit(&leader, 5);
        leader.pump_one_client_request().unwrap();
        let ballot = BallotNum::new(3, 1);
        assert_eq!(leader.status(), Status::Trying);

        // Our own promise reported the vote at (0, 0)
        leader.on_last_vote(message::LastVote {
            ballot,
            sender_id: 2,
            sender_commit_num: -1,
            votes: vec![Vote {
                owner_id: 2,
                ballot: BallotNum::new(1, 2),
                decree: Decree::new(0, 200),
            }],
            committed_decrees: vec![],
        }).unwrap();
        assert_eq!(last_begin_ballot(&to_zero).chosen_decrees, vec![
            Decree::new(0, 200),
            Decree::new(1, 5),
        ]);
    }

    #[test]
    fn promise_reports_outcomes_past_commit_frontier() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::create(dir.path(), "ledger-02.paxos", 2).unwrap();
        ledger.set_max_vbal(BallotNum::new(0, 0), 0, 10).unwrap();
        ledger.set_outcome(1, 11).unwrap();
        let acceptor = Participant::new(2, ledger);
        let (zero, to_zero) = capture(0);
        let (one, _) = capture(1);
        acceptor.add_remotes(vec![zero, one]).unwrap();

        acceptor.on_next_ballot(message::NextBallot {
            ballot: BallotNum::new(1, 0),
            sender_id: 0,
            sender_commit_num: -1,
        }).unwrap();
        match to_zero.lock().last() {
        | Some(Message::LastVote(m)) => {
            assert_eq!(m.sender_commit_num, -1);
            assert_eq!(m.votes.len(), 1);
            assert_eq!(m.committed_decrees, vec![Decree::new(1, 11)]);
        }
        | other => panic!("unexpected {:?}", other),
        };
    }

    #[test]
    fn reported_outcomes_are_reproposed_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, to_one, _) = trio(&dir);
        let _response = submit(&leader, 99);
        leader.pump_one_client_request().unwrap();
        let ballot = BallotNum::new(0, 0);

        leader.on_last_vote(message::LastVote {
            ballot,
            sender_id: 1,
            sender_commit_num: -1,
            votes: vec![Vote {
                owner_id: 1,
                ballot: BallotNum::new(-1, 2),
                decree: Decree::new(0, 10),
            }],
            committed_decrees: vec![Decree::new(1, 11), Decree::new(3, 13)],
        }).unwrap();
        assert_eq!(leader.outcome(1).unwrap(), Some(11));
        assert_eq!(last_begin_ballot(&to_one).chosen_decrees, vec![
            Decree::new(0, 10),
            Decree::new(1, 11),
            Decree::new(2, NOOP),
            Decree::new(3, 13),
            Decree::new(4, 99),
        ]);
    }

    #[test]
    fn higher_next_ballot_abandons_request_once() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, _, to_two) = trio(&dir);
        let mut response = submit(&leader, 3);
        leader.pump_one_client_request().unwrap();
        assert_eq!(leader.status(), Status::Trying);

        leader.on_next_ballot(message::NextBallot {
            ballot: BallotNum::new(5, 2),
            sender_id: 2,
            sender_commit_num: -1,
        }).unwrap();
        assert_eq!(leader.status(), Status::Idle);
        assert_eq!(response.try_recv().unwrap(), ClientResponse::rejected(3));
        assert!(response.try_recv().is_err());
        assert!(matches!(to_two.lock().last(), Some(Message::LastVote(m)) if m.ballot == BallotNum::new(5, 2)));

        // Lower ballot now earns a nack
        leader.on_next_ballot(message::NextBallot {
            ballot: BallotNum::new(4, 2),
            sender_id: 2,
            sender_commit_num: -1,
        }).unwrap();
        assert!(matches!(
            to_two.lock().last(),
            Some(Message::Nack(m)) if m.observed_max_bal == BallotNum::new(5, 2)
        ));
    }

    #[test]
    fn higher_begin_ballot_abandons_leadership() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, _, to_two) = trio(&dir);
        let mut response = submit(&leader, 3);
        leader.pump_one_client_request().unwrap();
        leader.on_last_vote(message::LastVote {
            ballot: BallotNum::new(0, 0),
            sender_id: 1,
            sender_commit_num: -1,
            votes: vec![],
            committed_decrees: vec![],
        }).unwrap();
        assert_eq!(leader.status(), Status::Polling);

        leader.on_begin_ballot(message::BeginBallot {
            ballot: BallotNum::new(1, 2),
            sender_id: 2,
            sender_commit_num: -1,
            chosen_decrees: vec![Decree::new(0, 8)],
            committed_decrees: vec![],
        }).unwrap();
        assert_eq!(leader.status(), Status::Idle);
        assert_eq!(response.try_recv().unwrap(), ClientResponse::rejected(3));
        assert!(matches!(
            to_two.lock().last(),
            Some(Message::Voted(m)) if m.max_decree_num == 0 && m.owner_id == 0
        ));
    }

    #[test]
    fn nack_with_higher_ballot_abdicates() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, _, _) = trio(&dir);
        let mut response = submit(&leader, 3);
        leader.pump_one_client_request().unwrap();

        // Stale nack for some other ballot is ignored
        leader.on_nack(message::Nack {
            ballot: BallotNum::new(7, 0),
            observed_max_bal: BallotNum::new(9, 1),
            sender_id: 1,
        }).unwrap();
        assert_eq!(leader.status(), Status::Trying);

        leader.on_nack(message::Nack {
            ballot: BallotNum::new(0, 0),
            observed_max_bal: BallotNum::new(9, 1),
            sender_id: 1,
        }).unwrap();
        assert_eq!(leader.status(), Status::Idle);
        assert_eq!(response.try_recv().unwrap(), ClientResponse::rejected(3));

        // Next attempt outbids the observed ballot
        let _retry = submit(&leader, 3);
        leader.pump_one_client_request().unwrap();
        assert_eq!(leader.status(), Status::Trying);
        assert_eq!(leader.state.lock().ledger.last_tried(), BallotNum::new(10, 0));
    }

    #[test]
    fn lagging_acceptor_asks_for_history() {
        let dir = tempfile::tempdir().unwrap();
        let acceptor = participant(&dir, 2);
        let (zero, to_zero) = capture(0);
        let (one, _) = capture(1);
        acceptor.add_remotes(vec![zero, one]).unwrap();

        let ballot = BallotNum::new(3, 0);
        acceptor.on_begin_ballot(message::BeginBallot {
            ballot,
            sender_id: 0,
            sender_commit_num: 1,
            chosen_decrees: vec![Decree::new(2, 42)],
            committed_decrees: vec![],
        }).unwrap();
        assert!(matches!(
            to_zero.lock().last(),
            Some(Message::PendingVote(m)) if m.sender_commit_num == -1 && m.ballot == ballot
        ));

        acceptor.on_begin_ballot(message::BeginBallot {
            ballot,
            sender_id: 0,
            sender_commit_num: 1,
            chosen_decrees: vec![Decree::new(2, 42)],
            committed_decrees: vec![Decree::new(0, 100), Decree::new(1, 101)],
        }).unwrap();
        assert!(matches!(
            to_zero.lock().last(),
            Some(Message::Voted(m)) if m.max_decree_num == 2
        ));
        assert_eq!(acceptor.commit_num(), 1);
        assert_eq!(acceptor.outcome(2).unwrap(), None);
    }

    #[test]
    fn stale_acknowledgement_cannot_complete_next_round() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, to_one, _) = trio(&dir);
        let mut first = submit(&leader, 1);
        leader.pump_one_client_request().unwrap();
        let ballot = BallotNum::new(0, 0);
        leader.on_last_vote(message::LastVote {
            ballot,
            sender_id: 1,
            sender_commit_num: -1,
            votes: vec![],
            committed_decrees: vec![],
        }).unwrap();
        leader.on_voted(message::Voted { ballot, owner_id: 1, max_decree_num: 0 }).unwrap();
        assert_eq!(first.try_recv().unwrap(), ClientResponse { decree_num: 0, value: 1 });

        // Fast path: same ballot, next slot, no phase 1
        let mut second = submit(&leader, 2);
        leader.pump_one_client_request().unwrap();
        let proposal = last_begin_ballot(&to_one);
        assert_eq!(proposal.ballot, ballot);
        assert_eq!(proposal.chosen_decrees, vec![Decree::new(1, 2)]);

        leader.on_voted(message::Voted { ballot, owner_id: 2, max_decree_num: 0 }).unwrap();
        assert!(second.try_recv().is_err());
        assert_eq!(leader.outcome(1).unwrap(), None);

        leader.on_voted(message::Voted { ballot, owner_id: 2, max_decree_num: 1 }).unwrap();
        assert_eq!(second.try_recv().unwrap(), ClientResponse { decree_num: 1, value: 2 });
        assert!(matches!(to_one.lock().last(), Some(Message::Success(m)) if m.decrees == vec![Decree::new(1, 2)]));
    }

    #[test]
    fn restart_resumes_from_ledger() {
        let dir = tempfile::tempdir().unwrap();
        {
            let single = participant(&dir, 0);
            let mut response = submit(&single, 42);
            single.pump_one_client_request().unwrap();
            assert_eq!(response.try_recv().unwrap().decree_num, 0);
        }
        let ledger = Ledger::open(dir.path(), "ledger-00.paxos", 0).unwrap();
        let single = Participant::new(0, ledger);
        assert_eq!(single.status(), Status::Idle);
        assert_eq!(single.outcome(0).unwrap(), Some(42));

        let mut response = submit(&single, 43);
        single.pump_one_client_request().unwrap();
        assert_eq!(response.try_recv().unwrap(), ClientResponse { decree_num: 1, value: 43 });
        assert_eq!(single.state.lock().ledger.last_tried(), BallotNum::new(1, 0));
    }
}
