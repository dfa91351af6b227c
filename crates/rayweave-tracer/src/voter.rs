//! Two-phase-commit termination voting.

use std::sync::OnceLock;

use parking_lot::Mutex;
use rayweave_comm::{Communicator, Vote, VoteKind};

/// Rank that coordinates every round.
pub const COORDINATOR: i32 = 0;

/// Where the voter's outbound protocol messages go.
///
/// A narrow seam so the state machine is testable without a live
/// transport; the production implementation is [`Communicator`].
pub trait VoteLink: Send + Sync {
    /// Coordinator to all cohorts.
    fn broadcast(&self, kind: VoteKind);
    /// Cohort to the coordinator.
    fn send_vote(&self, kind: VoteKind);
}

impl VoteLink for Communicator {
    fn broadcast(&self, kind: VoteKind) {
        self.send_all_others(&Vote::new(kind, self.rank()));
    }

    fn send_vote(&self, kind: VoteKind) {
        self.send(&Vote::new(kind, self.rank()), COORDINATOR);
    }
}

impl<T: VoteLink + ?Sized> VoteLink for std::sync::Arc<T> {
    fn broadcast(&self, kind: VoteKind) {
        (**self).broadcast(kind);
    }

    fn send_vote(&self, kind: VoteKind) {
        (**self).send_vote(kind);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    PrepareCoordinator,
    Propose,
    PrepareCohort,
    Vote,
    Terminate,
}

#[derive(Debug)]
struct Inner {
    state: State,
    pending_rays: i64,
    votes_received: i32,
    commit_votes: i32,
    all_votes_available: bool,
    commit_abort_available: bool,
    do_commit: bool,
    propose_available: bool,
    aborted_rounds: u64,
}

/// The distributed quiescence detector.
///
/// Rank 0 coordinates: when it is locally quiescent it proposes, the
/// cohorts vote commit or abort by their own `has_work`, and the
/// coordinator resolves the round. A rank that has voted commit stops
/// exchanging rays ([`communication_allowed`] turns false) until the
/// round resolves, so no ray can slip past a unanimous vote.
///
/// All mutation happens under one lock; the message entry points are
/// called from the communicator's dispatcher thread, `tick` from the
/// frame loop.
///
/// [`communication_allowed`]: TpcVoter::communication_allowed
pub struct TpcVoter {
    rank: i32,
    size: i32,
    link: OnceLock<Box<dyn VoteLink>>,
    inner: Mutex<Inner>,
}

impl TpcVoter {
    /// Voter for `rank` in a world of `size`.
    pub fn new(rank: i32, size: i32) -> Self {
        Self {
            rank,
            size,
            link: OnceLock::new(),
            inner: Mutex::new(Inner {
                state: Self::initial_state(rank),
                pending_rays: 0,
                votes_received: 0,
                commit_votes: 0,
                all_votes_available: false,
                commit_abort_available: false,
                do_commit: false,
                propose_available: false,
                aborted_rounds: 0,
            }),
        }
    }

    fn initial_state(rank: i32) -> State {
        if rank == COORDINATOR {
            State::PrepareCoordinator
        } else {
            State::PrepareCohort
        }
    }

    /// Attach the outbound message link. Must happen before the first
    /// tick; a second bind is ignored.
    pub fn bind_link(&self, link: Box<dyn VoteLink>) {
        let _ = self.link.set(link);
    }

    fn link(&self) -> &dyn VoteLink {
        self.link
            .get()
            .expect("voter used before a link was bound")
            .as_ref()
    }

    /// Rays this rank has sent and not yet seen acknowledged.
    pub fn pending_rays(&self) -> i64 {
        self.inner.lock().pending_rays
    }

    /// Rounds this voter has seen resolve with DO_ABORT.
    pub fn aborted_rounds(&self) -> u64 {
        self.inner.lock().aborted_rounds
    }

    /// Record `n` rays sent to a peer.
    pub fn add_pending(&self, n: usize) {
        self.inner.lock().pending_rays += n as i64;
    }

    /// Record `n` rays acknowledged by a peer.
    ///
    /// Going negative means a grant arrived for a batch never sent; that
    /// is a protocol bug, not a runtime condition.
    pub fn sub_pending(&self, n: usize) {
        let mut inner = self.inner.lock();
        inner.pending_rays -= n as i64;
        assert!(
            inner.pending_rays >= 0,
            "pending ray count went negative on rank {}",
            self.rank
        );
    }

    /// Whether the transfer step may move rays right now.
    ///
    /// True only before this rank has entered a voting round: once a
    /// cohort votes, new sends must wait until the round resolves.
    pub fn communication_allowed(&self) -> bool {
        let state = self.inner.lock().state;
        (self.rank == COORDINATOR && state == State::PrepareCoordinator)
            || (self.rank != COORDINATOR && state == State::PrepareCohort)
    }

    /// A PROPOSE arrived from the coordinator.
    pub fn on_propose(&self) {
        assert_ne!(self.rank, COORDINATOR, "coordinator received a propose");
        self.inner.lock().propose_available = true;
    }

    /// A cohort voted commit.
    pub fn on_vote_commit(&self) {
        assert_eq!(self.rank, COORDINATOR, "cohort received a commit vote");
        let mut inner = self.inner.lock();
        inner.commit_votes += 1;
        inner.votes_received += 1;
        if inner.votes_received == self.size - 1 {
            inner.all_votes_available = true;
        }
    }

    /// A cohort voted abort.
    pub fn on_vote_abort(&self) {
        assert_eq!(self.rank, COORDINATOR, "cohort received an abort vote");
        let mut inner = self.inner.lock();
        inner.votes_received += 1;
        if inner.votes_received == self.size - 1 {
            inner.all_votes_available = true;
        }
    }

    /// The coordinator resolved the round with DO_COMMIT.
    pub fn on_commit(&self) {
        assert_ne!(self.rank, COORDINATOR, "coordinator received do-commit");
        let mut inner = self.inner.lock();
        inner.commit_abort_available = true;
        inner.do_commit = true;
    }

    /// The coordinator resolved the round with DO_ABORT.
    pub fn on_abort(&self) {
        assert_ne!(self.rank, COORDINATOR, "coordinator received do-abort");
        self.inner.lock().commit_abort_available = true;
    }

    /// Route an inbound protocol message to its entry point.
    pub fn on_vote_message(&self, vote: Vote) {
        match vote.kind {
            VoteKind::Propose => self.on_propose(),
            VoteKind::VoteCommit => self.on_vote_commit(),
            VoteKind::VoteAbort => self.on_vote_abort(),
            VoteKind::DoCommit => self.on_commit(),
            VoteKind::DoAbort => self.on_abort(),
        }
    }

    /// Advance the state machine one step.
    ///
    /// `queues_empty` is this rank's local queue emptiness at the call;
    /// `has_work` combines it with the pending-ray count. Returns true
    /// exactly once, when global quiescence has been agreed.
    pub fn tick(&self, queues_empty: bool) -> bool {
        let mut inner = self.inner.lock();
        let has_work = !queues_empty || inner.pending_rays > 0;
        let mut all_done = false;

        match inner.state {
            State::PrepareCoordinator => {
                if !has_work {
                    self.link().broadcast(VoteKind::Propose);
                    inner.state = State::Propose;
                }
            }
            State::Propose => {
                if inner.all_votes_available {
                    if inner.commit_votes == self.size - 1 {
                        self.link().broadcast(VoteKind::DoCommit);
                        inner.state = State::Terminate;
                        all_done = true;
                    } else {
                        self.link().broadcast(VoteKind::DoAbort);
                        inner.state = State::PrepareCoordinator;
                        inner.aborted_rounds += 1;
                    }
                    // Clear the round in one transition so a stale
                    // all-votes flag can never re-trigger a resolution.
                    inner.votes_received = 0;
                    inner.commit_votes = 0;
                    inner.all_votes_available = false;
                }
            }
            State::PrepareCohort => {
                if inner.propose_available {
                    inner.propose_available = false;
                    inner.state = State::Vote;
                    if has_work {
                        self.link().send_vote(VoteKind::VoteAbort);
                    } else {
                        self.link().send_vote(VoteKind::VoteCommit);
                    }
                }
            }
            State::Vote => {
                if inner.commit_abort_available {
                    if inner.do_commit {
                        inner.state = State::Terminate;
                        all_done = true;
                    } else {
                        inner.state = State::PrepareCohort;
                        inner.commit_abort_available = false;
                        inner.aborted_rounds += 1;
                    }
                }
            }
            State::Terminate => {
                *inner = Inner {
                    state: Self::initial_state(self.rank),
                    pending_rays: 0,
                    votes_received: 0,
                    commit_votes: 0,
                    all_votes_available: false,
                    commit_abort_available: false,
                    do_commit: false,
                    propose_available: false,
                    aborted_rounds: inner.aborted_rounds,
                };
            }
        }

        all_done
    }
}
