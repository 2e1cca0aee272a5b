// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Embedded Replicated Log Engine.
//!
//! Sans-IO Raft state machine: the owner feeds it the current time (`tick`)
//! and the inbound protocol messages (`step`), and drains the produced
//! events (`take_events`). Outbound messages go through a [Transport].
//!
//! Cluster membership is not configured: only the cluster size is known and
//! the leader learns its followers from their replies. The log is kept in
//! memory, block persistence is the consumer's business.
//!
//! The log is compacted without snapshots: the leader advertises the highest
//! index every cluster member holds and has committed, and each node drops
//! the entries up to there once delivered. A node that loses its log (e.g.
//! restarted with an empty one) cannot be caught up past the compacted
//! prefix.

use super::transport::{Addressed, Transport};
use crate::{Error, ErrorKind, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

/// Randomized election timeout bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElectionTimeout {
    pub min: Duration,
    pub max: Duration,
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// Local node identifier (its peer address).
    pub id: String,
    /// Number of voting nodes.
    pub cluster_size: usize,
    /// How long to wait before declaring the leader dead.
    pub election_timeout: ElectionTimeout,
    /// How often the leader sends heartbeats.
    pub heartbeat_interval: Duration,
    /// Max number of entries carried by a single AppendEntries.
    pub msg_limit: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftState {
    Follower,
    Candidate,
    Leader,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry<E> {
    pub term: u64,
    pub data: E,
}

/// Protocol messages.
/// Replies and catch-up AppendEntries carry their recipient, the adapter
/// drops the ones addressed to another node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RaftMessage<E> {
    RequestVote {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteReply {
        to: String,
        term: u64,
        granted: bool,
    },
    AppendEntries {
        to: Option<String>,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry<E>>,
        leader_commit: u64,
        /// Entries up to this index are held by every node.
        #[serde(default)]
        compact_index: u64,
    },
    AppendEntriesReply {
        to: String,
        term: u64,
        success: bool,
        /// Last matching index on success, retry hint on failure.
        last_index: u64,
    },
}

impl<E> RaftMessage<E> {
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::RequestVoteReply { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesReply { term, .. } => *term,
        }
    }
}

impl<E> Addressed for RaftMessage<E> {
    fn recipient(&self) -> Option<&str> {
        match self {
            RaftMessage::RequestVote { .. } => None,
            RaftMessage::RequestVoteReply { to, .. } => Some(to),
            RaftMessage::AppendEntries { to, .. } => to.as_deref(),
            RaftMessage::AppendEntriesReply { to, .. } => Some(to),
        }
    }
}

/// Engine notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftEvent<E> {
    /// Entry agreed by a quorum. Emitted once per index, in index order.
    Committed { index: u64, data: E },
    /// This node became leader.
    LeaderElected { term: u64 },
}

/// Engine state snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub node_id: String,
    pub state: RaftState,
    pub term: u64,
    pub leader: Option<String>,
    pub votes: Vec<String>,
    pub cluster_size: usize,
    /// Current (randomized) election timeout in milliseconds.
    pub election_timeout: u64,
    pub commit_index: u64,
    pub last_index: u64,
    /// Last index dropped from the in-memory log.
    #[serde(default)]
    pub compacted_index: u64,
}

pub struct RaftNode<E, T> {
    config: RaftConfig,
    transport: T,
    state: RaftState,
    current_term: u64,
    voted_for: Option<String>,
    leader: Option<String>,
    /// Log entries, `log[i]` has index `log_offset + i + 1`.
    log: Vec<LogEntry<E>>,
    /// Last compacted index and its term.
    log_offset: u64,
    offset_term: u64,
    commit_index: u64,
    /// Last index notified with a `Committed` event.
    last_emitted: u64,
    /// Granted votes in the current election, self included.
    votes: HashSet<String>,
    /// Leader bookkeeping, per known follower.
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    election_timeout: Duration,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    events: VecDeque<RaftEvent<E>>,
    rng: StdRng,
    closed: bool,
}

impl<E, T> RaftNode<E, T>
where
    E: Clone,
    T: Transport<RaftMessage<E>>,
{
    pub fn new(config: RaftConfig, mut transport: T, now: Instant) -> Self {
        transport.connect();
        let mut node = RaftNode {
            config,
            transport,
            state: RaftState::Follower,
            current_term: 0,
            voted_for: None,
            leader: None,
            log: Vec::new(),
            log_offset: 0,
            offset_term: 0,
            commit_index: 0,
            last_emitted: 0,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_timeout: Duration::default(),
            election_deadline: now,
            heartbeat_deadline: now,
            events: VecDeque::new(),
            rng: StdRng::from_entropy(),
            closed: false,
        };
        node.reset_election_deadline(now);
        node
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn state(&self) -> RaftState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        !self.closed && self.state == RaftState::Leader
    }

    pub fn term(&self) -> u64 {
        self.current_term
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_index(&self) -> u64 {
        self.log_offset + self.log.len() as u64
    }

    /// Last index dropped by log compaction.
    pub fn compacted_index(&self) -> u64 {
        self.log_offset
    }

    /// Entries still held in memory.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn votes(&self) -> Vec<String> {
        let mut votes: Vec<String> = self.votes.iter().cloned().collect();
        votes.sort();
        votes
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            node_id: self.config.id.clone(),
            state: self.state,
            term: self.current_term,
            leader: self.leader.clone(),
            votes: self.votes(),
            cluster_size: self.config.cluster_size,
            election_timeout: self.election_timeout.as_millis() as u64,
            commit_index: self.commit_index,
            last_index: self.last_index(),
            compacted_index: self.log_offset,
        }
    }

    /// Next instant `tick` has something to do.
    pub fn next_deadline(&self) -> Instant {
        match self.state {
            RaftState::Leader => self.heartbeat_deadline,
            _ => self.election_deadline,
        }
    }

    /// Drains the pending events.
    pub fn take_events(&mut self) -> Vec<RaftEvent<E>> {
        self.events.drain(..).collect()
    }

    /// Stops the engine. Further calls are ignored.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.transport.disconnect();
        }
    }

    /// Appends a new entry to the replicated log. Returns its index.
    ///
    /// # Errors
    ///
    /// `NotLeader` if this node is not the current leader.
    pub fn append(&mut self, data: E) -> Result<u64> {
        if !self.is_leader() {
            return Err(Error::new_ext(
                ErrorKind::NotLeader,
                format!("leader is {:?}", self.leader),
            ));
        }
        self.log.push(LogEntry {
            term: self.current_term,
            data,
        });
        let index = self.last_index();
        trace!("[raft] {}: appended entry {}", self.config.id, index);
        self.advance_commit();
        self.replicate();
        self.compact(self.compact_index());
        Ok(index)
    }

    /// Drives the timers.
    pub fn tick(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        match self.state {
            RaftState::Leader => {
                if now >= self.heartbeat_deadline {
                    self.replicate();
                    self.heartbeat_deadline = now + self.config.heartbeat_interval;
                }
            }
            RaftState::Follower | RaftState::Candidate => {
                if now >= self.election_deadline {
                    self.start_election(now);
                }
            }
        }
    }

    /// Handles an inbound protocol message.
    pub fn step(&mut self, now: Instant, from: &str, msg: RaftMessage<E>) {
        if self.closed || from == self.config.id {
            return;
        }
        if let Some(to) = msg.recipient() {
            if to != self.config.id {
                return;
            }
        }
        if msg.term() > self.current_term {
            debug!(
                "[raft] {}: term {} -> {} (from {})",
                self.config.id,
                self.current_term,
                msg.term(),
                from
            );
            self.become_follower(now, msg.term(), None);
        }
        match msg {
            RaftMessage::RequestVote {
                term,
                last_log_index,
                last_log_term,
            } => self.on_request_vote(now, from, term, last_log_index, last_log_term),
            RaftMessage::RequestVoteReply { term, granted, .. } => {
                self.on_request_vote_reply(now, from, term, granted)
            }
            RaftMessage::AppendEntries {
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                compact_index,
                ..
            } => {
                self.on_append_entries(
                    now,
                    from,
                    term,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                );
                if self.state == RaftState::Follower && self.leader.as_deref() == Some(from) {
                    self.compact(compact_index);
                }
            }
            RaftMessage::AppendEntriesReply {
                term,
                success,
                last_index,
                ..
            } => self.on_append_entries_reply(from, term, success, last_index),
        }
    }

    fn majority(&self) -> usize {
        self.config.cluster_size / 2 + 1
    }

    fn entry(&self, index: u64) -> Option<&LogEntry<E>> {
        if index <= self.log_offset {
            return None;
        }
        self.log.get((index - self.log_offset - 1) as usize)
    }

    fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            0
        } else if index == self.log_offset {
            self.offset_term
        } else {
            self.entry(index).map(|entry| entry.term).unwrap_or_default()
        }
    }

    /// Leader: highest index held by every cluster member and committed.
    /// Zero while some followers are unknown.
    fn compact_index(&self) -> u64 {
        if self.state != RaftState::Leader
            || self.match_index.len() + 1 < self.config.cluster_size
        {
            return 0;
        }
        let replicated = self
            .match_index
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| self.last_index());
        std::cmp::min(replicated, self.commit_index)
    }

    /// Drops the delivered entries up to `index`, in batches of at least
    /// `msg_limit` entries.
    fn compact(&mut self, index: u64) {
        let index = std::cmp::min(index, self.last_emitted);
        if index <= self.log_offset
            || ((index - self.log_offset) as usize) < self.config.msg_limit.max(1)
        {
            return;
        }
        self.offset_term = self.term_at(index);
        let count = (index - self.log_offset) as usize;
        self.log.drain(..count);
        self.log_offset = index;
        debug!(
            "[raft] {}: log compacted up to index {}",
            self.config.id, index
        );
    }

    fn last_term(&self) -> u64 {
        self.term_at(self.last_index())
    }

    fn reset_election_deadline(&mut self, now: Instant) {
        let min = self.config.election_timeout.min.as_millis() as u64;
        let max = self.config.election_timeout.max.as_millis() as u64;
        let millis = if min >= max {
            min
        } else {
            self.rng.gen_range(min, max + 1)
        };
        self.election_timeout = Duration::from_millis(millis);
        self.election_deadline = now + self.election_timeout;
    }

    fn become_follower(&mut self, now: Instant, term: u64, leader: Option<String>) {
        if self.state == RaftState::Leader {
            info!(
                "[raft] {}: stepping down in term {}",
                self.config.id, term
            );
        }
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.votes.clear();
        }
        self.state = RaftState::Follower;
        self.leader = leader;
        self.next_index.clear();
        self.match_index.clear();
        self.reset_election_deadline(now);
    }

    fn start_election(&mut self, now: Instant) {
        self.current_term += 1;
        self.state = RaftState::Candidate;
        self.leader = None;
        self.voted_for = Some(self.config.id.clone());
        self.votes.clear();
        self.votes.insert(self.config.id.clone());
        self.reset_election_deadline(now);
        debug!(
            "[raft] {}: starting election for term {}",
            self.config.id, self.current_term
        );
        if self.votes.len() >= self.majority() {
            self.become_leader(now);
            return;
        }
        let msg = RaftMessage::RequestVote {
            term: self.current_term,
            last_log_index: self.last_index(),
            last_log_term: self.last_term(),
        };
        if let Err(err) = self.transport.broadcast(&msg) {
            warn!("[raft] vote request failure: {}", err.to_string_full());
        }
    }

    fn become_leader(&mut self, now: Instant) {
        info!(
            "[raft] {}: elected leader for term {}",
            self.config.id, self.current_term
        );
        self.state = RaftState::Leader;
        self.leader = Some(self.config.id.clone());
        self.next_index.clear();
        self.match_index.clear();
        let next = self.last_index() + 1;
        for voter in self.votes.iter().filter(|v| **v != self.config.id) {
            self.next_index.insert(voter.clone(), next);
            self.match_index.insert(voter.clone(), 0);
        }
        self.events.push_back(RaftEvent::LeaderElected {
            term: self.current_term,
        });
        self.replicate();
        self.heartbeat_deadline = now + self.config.heartbeat_interval;
    }

    fn on_request_vote(
        &mut self,
        now: Instant,
        candidate: &str,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) {
        let up_to_date = last_log_term > self.last_term()
            || (last_log_term == self.last_term() && last_log_index >= self.last_index());
        let free = match self.voted_for.as_deref() {
            None => true,
            Some(voted) => voted == candidate,
        };
        let granted = term == self.current_term
            && self.state == RaftState::Follower
            && free
            && up_to_date;
        if granted {
            self.voted_for = Some(candidate.to_owned());
            self.reset_election_deadline(now);
        }
        trace!(
            "[raft] {}: vote for {} in term {}: {}",
            self.config.id,
            candidate,
            term,
            granted
        );
        let reply = RaftMessage::RequestVoteReply {
            to: candidate.to_owned(),
            term: self.current_term,
            granted,
        };
        self.send(candidate, &reply);
    }

    fn on_request_vote_reply(&mut self, now: Instant, voter: &str, term: u64, granted: bool) {
        if self.state != RaftState::Candidate || term != self.current_term || !granted {
            return;
        }
        self.votes.insert(voter.to_owned());
        if self.votes.len() >= self.majority() {
            self.become_leader(now);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_append_entries(
        &mut self,
        now: Instant,
        leader: &str,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry<E>>,
        leader_commit: u64,
    ) {
        if term < self.current_term {
            let reply = RaftMessage::AppendEntriesReply {
                to: leader.to_owned(),
                term: self.current_term,
                success: false,
                last_index: self.last_index(),
            };
            self.send(leader, &reply);
            return;
        }
        if self.state == RaftState::Leader {
            // Same term, two leaders: cannot happen with a consistent cluster size.
            error!(
                "[raft] {}: AppendEntries from {} in own term {}",
                self.config.id, leader, term
            );
            return;
        }
        if self.state == RaftState::Candidate || self.leader.as_deref() != Some(leader) {
            self.become_follower(now, term, Some(leader.to_owned()));
        } else {
            self.reset_election_deadline(now);
        }

        // Compacted entries are committed, they always match.
        let mismatch = prev_log_index >= self.log_offset
            && self.term_at(prev_log_index) != prev_log_term;
        if prev_log_index > self.last_index() || mismatch {
            let hint = std::cmp::min(self.last_index(), prev_log_index.saturating_sub(1));
            let reply = RaftMessage::AppendEntriesReply {
                to: leader.to_owned(),
                term: self.current_term,
                success: false,
                last_index: hint,
            };
            self.send(leader, &reply);
            return;
        }

        let mut index = prev_log_index;
        for entry in entries {
            index += 1;
            if index <= self.log_offset {
                continue;
            }
            if index <= self.last_index() {
                if self.term_at(index) == entry.term {
                    continue;
                }
                debug!(
                    "[raft] {}: truncating log from index {}",
                    self.config.id, index
                );
                self.log.truncate((index - self.log_offset - 1) as usize);
            }
            self.log.push(entry);
        }

        if leader_commit > self.commit_index {
            let commit = std::cmp::min(leader_commit, index);
            if commit > self.commit_index {
                self.commit_index = commit;
                self.emit_committed();
            }
        }
        let reply = RaftMessage::AppendEntriesReply {
            to: leader.to_owned(),
            term: self.current_term,
            success: true,
            last_index: index,
        };
        self.send(leader, &reply);
    }

    fn on_append_entries_reply(&mut self, follower: &str, term: u64, success: bool, last_index: u64) {
        if self.state != RaftState::Leader || term != self.current_term {
            return;
        }
        let current_next = self
            .next_index
            .get(follower)
            .copied()
            .unwrap_or(last_index + 1);
        let next = if success {
            let matched = self.match_index.entry(follower.to_owned()).or_insert(0);
            if last_index > *matched {
                *matched = last_index;
            }
            *matched + 1
        } else {
            std::cmp::max(1, std::cmp::min(current_next, last_index + 1))
        };
        self.next_index.insert(follower.to_owned(), next);
        let behind = next <= self.last_index();
        let committed = self.advance_commit();
        if committed {
            // Propagate the new commit index right away.
            self.replicate();
        } else if behind {
            self.send_append_entries(follower);
        }
        self.compact(self.compact_index());
    }

    /// Moves the commit index to the highest current term entry replicated
    /// on a majority. Returns true if it moved.
    fn advance_commit(&mut self) -> bool {
        let majority = self.majority();
        let mut target = self.commit_index;
        for index in (self.commit_index + 1..=self.last_index()).rev() {
            if self.term_at(index) != self.current_term {
                break;
            }
            let replicas = 1 + self.match_index.values().filter(|m| **m >= index).count();
            if replicas >= majority {
                target = index;
                break;
            }
        }
        if target > self.commit_index {
            self.commit_index = target;
            self.emit_committed();
            true
        } else {
            false
        }
    }

    fn emit_committed(&mut self) {
        while self.last_emitted < self.commit_index {
            self.last_emitted += 1;
            let data = match self.entry(self.last_emitted) {
                Some(entry) => entry.data.clone(),
                None => break,
            };
            self.events.push_back(RaftEvent::Committed {
                index: self.last_emitted,
                data,
            });
        }
    }

    /// Leader: sends AppendEntries to every known follower, plus an empty
    /// broadcast one while some followers are still unknown.
    fn replicate(&mut self) {
        if self.state != RaftState::Leader {
            return;
        }
        let followers: Vec<String> = self.next_index.keys().cloned().collect();
        for follower in followers.iter() {
            self.send_append_entries(follower);
        }
        if followers.len() + 1 < self.config.cluster_size {
            let msg = RaftMessage::AppendEntries {
                to: None,
                term: self.current_term,
                prev_log_index: self.last_index(),
                prev_log_term: self.last_term(),
                entries: vec![],
                leader_commit: self.commit_index,
                compact_index: self.compact_index(),
            };
            if let Err(err) = self.transport.broadcast(&msg) {
                warn!("[raft] heartbeat failure: {}", err.to_string_full());
            }
        }
    }

    fn send_append_entries(&self, follower: &str) {
        let mut next = self
            .next_index
            .get(follower)
            .copied()
            .unwrap_or(self.last_index() + 1);
        if next <= self.log_offset {
            warn!(
                "[raft] {}: {} needs compacted entries from {}",
                self.config.id, follower, next
            );
            next = self.log_offset + 1;
        }
        let prev_log_index = next - 1;
        let entries: Vec<LogEntry<E>> = self
            .log
            .iter()
            .skip((prev_log_index - self.log_offset) as usize)
            .take(self.config.msg_limit.max(1))
            .cloned()
            .collect();
        let msg = RaftMessage::AppendEntries {
            to: Some(follower.to_owned()),
            term: self.current_term,
            prev_log_index,
            prev_log_term: self.term_at(prev_log_index),
            entries,
            leader_commit: self.commit_index,
            compact_index: self.compact_index(),
        };
        self.send(follower, &msg);
    }

    fn send(&self, to: &str, msg: &RaftMessage<E>) {
        if let Err(err) = self.transport.send(to, msg) {
            warn!(
                "[raft] send to {} failure: {}",
                to,
                err.to_string_full()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::Mutex;
    use std::sync::Arc;

    type Outbox = Arc<Mutex<Vec<(Option<String>, RaftMessage<u32>)>>>;

    struct MemTransport {
        outbox: Outbox,
    }

    impl Transport<RaftMessage<u32>> for MemTransport {
        fn broadcast(&self, msg: &RaftMessage<u32>) -> Result<()> {
            self.outbox.lock().push((None, msg.clone()));
            Ok(())
        }

        fn send(&self, node_id: &str, msg: &RaftMessage<u32>) -> Result<()> {
            self.outbox.lock().push((Some(node_id.to_owned()), msg.clone()));
            Ok(())
        }
    }

    struct Cluster {
        nodes: Vec<RaftNode<u32, MemTransport>>,
        outboxes: Vec<Outbox>,
        /// Isolated nodes neither send nor receive.
        isolated: HashSet<usize>,
        now: Instant,
    }

    fn create_config(id: &str, cluster_size: usize) -> RaftConfig {
        RaftConfig {
            id: id.to_owned(),
            cluster_size,
            election_timeout: ElectionTimeout {
                min: Duration::from_millis(150),
                max: Duration::from_millis(300),
            },
            heartbeat_interval: Duration::from_millis(50),
            msg_limit: 2,
        }
    }

    impl Cluster {
        fn new(size: usize) -> Self {
            let now = Instant::now();
            let mut nodes = vec![];
            let mut outboxes = vec![];
            for i in 0..size {
                let outbox = Outbox::default();
                let transport = MemTransport {
                    outbox: outbox.clone(),
                };
                let config = create_config(&format!("node{}", i), size);
                nodes.push(RaftNode::new(config, transport, now));
                outboxes.push(outbox);
            }
            Cluster {
                nodes,
                outboxes,
                isolated: HashSet::new(),
                now,
            }
        }

        fn deliver_all(&mut self) {
            loop {
                let mut pending = vec![];
                for (i, outbox) in self.outboxes.iter().enumerate() {
                    let msgs: Vec<_> = outbox.lock().drain(..).collect();
                    if !self.isolated.contains(&i) {
                        pending.extend(msgs.into_iter().map(|(to, msg)| (i, to, msg)));
                    }
                }
                if pending.is_empty() {
                    break;
                }
                for (from, to, msg) in pending {
                    let from_id = self.nodes[from].id().to_owned();
                    for j in 0..self.nodes.len() {
                        if j == from || self.isolated.contains(&j) {
                            continue;
                        }
                        let target = self.nodes[j].id().to_owned();
                        if to.as_deref().map_or(true, |to| to == target) {
                            self.nodes[j].step(self.now, &from_id, msg.clone());
                        }
                    }
                }
            }
        }

        fn advance(&mut self, step: Duration) {
            self.now += step;
            for node in self.nodes.iter_mut() {
                node.tick(self.now);
            }
            self.deliver_all();
        }

        fn leaders(&self) -> Vec<usize> {
            (0..self.nodes.len())
                .filter(|i| !self.isolated.contains(i) && self.nodes[*i].is_leader())
                .collect()
        }

        fn elect(&mut self) -> usize {
            for _ in 0..500 {
                self.advance(Duration::from_millis(10));
                let leaders = self.leaders();
                if leaders.len() == 1 {
                    return leaders[0];
                }
            }
            panic!("no leader elected");
        }

        fn committed(&mut self, i: usize) -> Vec<(u64, u32)> {
            self.nodes[i]
                .take_events()
                .into_iter()
                .filter_map(|event| match event {
                    RaftEvent::Committed { index, data } => Some((index, data)),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn single_node_commits_immediately() {
        let mut cluster = Cluster::new(1);
        let leader = cluster.elect();

        let index = cluster.nodes[leader].append(7).unwrap();

        assert_eq!(index, 1);
        assert_eq!(cluster.committed(leader), vec![(1, 7)]);
    }

    #[test]
    fn three_nodes_elect_one_leader() {
        let mut cluster = Cluster::new(3);

        let leader = cluster.elect();
        cluster.advance(Duration::from_millis(60));

        let leader_id = cluster.nodes[leader].id().to_owned();
        for node in cluster.nodes.iter() {
            assert_eq!(node.leader(), Some(leader_id.as_str()));
        }
        let elected = cluster.nodes[leader]
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, RaftEvent::LeaderElected { .. }))
            .count();
        assert_eq!(elected, 1);
        for (i, node) in cluster.nodes.iter_mut().enumerate() {
            if i != leader {
                assert!(node.take_events().is_empty());
                assert_eq!(node.state(), RaftState::Follower);
            }
        }
    }

    #[test]
    fn append_on_follower_is_refused() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.elect();
        let follower = (leader + 1) % 3;

        let err = cluster.nodes[follower].append(1).unwrap_err();

        assert_eq!(err.kind, ErrorKind::NotLeader);
    }

    #[test]
    fn entries_commit_on_every_node_in_order() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.elect();
        for i in 0..3 {
            cluster.committed(i);
        }

        for data in [10, 20, 30, 40, 50] {
            cluster.nodes[leader].append(data).unwrap();
        }
        cluster.deliver_all();
        cluster.advance(Duration::from_millis(60));

        let expected = vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)];
        for i in 0..3 {
            assert_eq!(cluster.committed(i), expected);
            assert_eq!(cluster.nodes[i].commit_index(), 5);
        }
    }

    #[test]
    fn lagging_follower_catches_up() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.elect();
        let lagging = (leader + 1) % 3;
        cluster.isolated.insert(lagging);

        for data in 1..=5 {
            cluster.nodes[leader].append(data).unwrap();
        }
        cluster.deliver_all();
        assert_eq!(cluster.nodes[leader].commit_index(), 5);
        assert_eq!(cluster.nodes[lagging].last_index(), 0);

        cluster.isolated.clear();
        cluster.nodes[lagging].take_events();
        // Keep the lagging node from starting an election of its own.
        for _ in 0..5 {
            cluster.advance(Duration::from_millis(50));
        }

        let committed = cluster.committed(lagging);
        assert_eq!(committed.len(), 5);
        assert_eq!(committed[4], (5, 5));
    }

    #[test]
    fn conflicting_entries_are_truncated() {
        let now = Instant::now();
        let outbox = Outbox::default();
        let mut node = RaftNode::new(
            create_config("node1", 3),
            MemTransport {
                outbox: outbox.clone(),
            },
            now,
        );
        let entries = |term, data: &[u32]| -> Vec<LogEntry<u32>> {
            data.iter().map(|d| LogEntry { term, data: *d }).collect()
        };
        node.step(
            now,
            "node0",
            RaftMessage::AppendEntries {
                to: Some("node1".to_owned()),
                term: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: entries(1, &[1, 2, 3]),
                leader_commit: 1,
                compact_index: 0,
            },
        );
        assert_eq!(node.last_index(), 3);

        node.step(
            now,
            "node2",
            RaftMessage::AppendEntries {
                to: None,
                term: 2,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: entries(2, &[9]),
                leader_commit: 2,
                compact_index: 0,
            },
        );

        assert_eq!(node.last_index(), 2);
        assert_eq!(node.term(), 2);
        assert_eq!(node.leader(), Some("node2"));
        let committed: Vec<_> = node
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                RaftEvent::Committed { index, data } => Some((index, data)),
                _ => None,
            })
            .collect();
        assert_eq!(committed, vec![(1, 1), (2, 9)]);
        let replies = outbox.lock();
        assert!(matches!(
            replies.last(),
            Some((Some(to), RaftMessage::AppendEntriesReply { success: true, last_index: 2, .. }))
                if to == "node2"
        ));
    }

    #[test]
    fn stale_term_is_rejected() {
        let now = Instant::now();
        let outbox = Outbox::default();
        let mut node = RaftNode::new(
            create_config("node1", 3),
            MemTransport {
                outbox: outbox.clone(),
            },
            now,
        );
        node.step(
            now,
            "node2",
            RaftMessage::RequestVote {
                term: 5,
                last_log_index: 0,
                last_log_term: 0,
            },
        );

        node.step(
            now,
            "node0",
            RaftMessage::AppendEntries {
                to: None,
                term: 3,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry { term: 3, data: 1 }],
                leader_commit: 1,
                compact_index: 0,
            },
        );

        assert_eq!(node.last_index(), 0);
        assert!(matches!(
            outbox.lock().last(),
            Some((_, RaftMessage::AppendEntriesReply { success: false, term: 5, .. }))
        ));
    }

    #[test]
    fn one_vote_per_term() {
        let now = Instant::now();
        let outbox = Outbox::default();
        let mut node = RaftNode::new(
            create_config("node1", 3),
            MemTransport {
                outbox: outbox.clone(),
            },
            now,
        );
        let vote = RaftMessage::RequestVote {
            term: 1,
            last_log_index: 0,
            last_log_term: 0,
        };

        node.step(now, "node0", vote.clone());
        node.step(now, "node2", vote);

        let granted: Vec<bool> = outbox
            .lock()
            .iter()
            .filter_map(|(_, msg)| match msg {
                RaftMessage::RequestVoteReply { granted, .. } => Some(*granted),
                _ => None,
            })
            .collect();
        assert_eq!(granted, vec![true, false]);
    }

    #[test]
    fn messages_for_other_nodes_are_ignored() {
        let now = Instant::now();
        let mut node = RaftNode::new(
            create_config("node1", 3),
            MemTransport {
                outbox: Outbox::default(),
            },
            now,
        );

        node.step(
            now,
            "node0",
            RaftMessage::AppendEntries {
                to: Some("node2".to_owned()),
                term: 4,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry { term: 4, data: 1 }],
                leader_commit: 0,
                compact_index: 0,
            },
        );

        assert_eq!(node.term(), 0);
        assert_eq!(node.last_index(), 0);
    }

    #[test]
    fn leader_steps_down_on_higher_term() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.elect();
        let now = cluster.now;
        let term = cluster.nodes[leader].term();
        let to = cluster.nodes[leader].id().to_owned();

        cluster.nodes[leader].step(
            now,
            "node9",
            RaftMessage::AppendEntriesReply {
                to,
                term: term + 1,
                success: false,
                last_index: 0,
            },
        );

        assert!(!cluster.nodes[leader].is_leader());
        assert_eq!(cluster.nodes[leader].term(), term + 1);
    }

    #[test]
    fn log_is_compacted_once_replicated_everywhere() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.elect();
        for data in 1..=6 {
            cluster.nodes[leader].append(data).unwrap();
            cluster.deliver_all();
        }
        cluster.advance(Duration::from_millis(60));

        for i in 0..3 {
            let committed = cluster.committed(i);
            let expected: Vec<(u64, u32)> = (1..=6).map(|d| (d as u64, d)).collect();
            assert_eq!(committed, expected);
            assert!(cluster.nodes[i].compacted_index() >= 4);
            assert!(cluster.nodes[i].log_len() <= 2);
            assert_eq!(cluster.nodes[i].last_index(), 6);
        }

        cluster.nodes[leader].append(7).unwrap();
        cluster.deliver_all();
        cluster.advance(Duration::from_millis(60));

        for i in 0..3 {
            assert_eq!(cluster.committed(i), vec![(7, 7)]);
            assert_eq!(cluster.nodes[i].last_index(), 7);
        }
    }

    #[test]
    fn lagging_follower_blocks_compaction() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.elect();
        let lagging = (leader + 1) % 3;
        cluster.isolated.insert(lagging);

        for data in 1..=5 {
            cluster.nodes[leader].append(data).unwrap();
            cluster.deliver_all();
        }

        assert_eq!(cluster.nodes[leader].commit_index(), 5);
        assert_eq!(cluster.nodes[leader].compacted_index(), 0);

        cluster.isolated.remove(&lagging);
        cluster.committed(lagging);
        for _ in 0..5 {
            cluster.advance(Duration::from_millis(60));
        }

        let committed = cluster.committed(lagging);
        assert_eq!(committed.len(), 5);
        assert!(cluster.nodes[leader].compacted_index() >= 4);
    }

    #[test]
    fn closed_node_is_inert() {
        let mut cluster = Cluster::new(1);
        let leader = cluster.elect();

        cluster.nodes[leader].close();

        assert!(!cluster.nodes[leader].is_leader());
        assert_eq!(
            cluster.nodes[leader].append(1).unwrap_err().kind,
            ErrorKind::NotLeader
        );
    }
}
