//! The wire abstraction and the in-process channel mesh.

use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::{CommError, Result};

/// Capacity of each peer-pair lane. Sends block only if a receiver has
/// stalled this far behind, which bounds memory without deadlocking the
/// steady state.
const LANE_CAPACITY: usize = 4096;

/// A framed point-to-point wire over a world of `size` ranks.
///
/// Implementations guarantee per-(src, dst) FIFO delivery and nothing
/// across pairs. `gather` is the collective seam used once per frame by
/// the compositor.
pub trait Transport: Send + Sync {
    /// This endpoint's rank.
    fn rank(&self) -> i32;
    /// Number of ranks in the world.
    fn size(&self) -> i32;
    /// Queue one frame for `dst`. Non-blocking in the steady state.
    fn send(&self, dst: i32, frame: Vec<u8>) -> Result<()>;
    /// Next inbound frame, or `None` on timeout.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;
    /// Collective gather to rank 0: every rank contributes `bytes`;
    /// rank 0 gets all contributions in rank order, others get `None`.
    fn gather(&self, bytes: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>>;
}

/// One rank's endpoint in an in-process world backed by crossbeam
/// channels.
///
/// Each rank owns a single inbound queue; a sender's frames arrive in
/// send order because every rank funnels its traffic through one send
/// thread. The gather lane is a separate channel into rank 0 so bulk
/// framebuffer traffic never interleaves with control messages.
pub struct ChannelWorld {
    rank: i32,
    size: i32,
    peers: Vec<Sender<Vec<u8>>>,
    inbox: Receiver<Vec<u8>>,
    gather_tx: Sender<(i32, Vec<u8>)>,
    gather_rx: Option<Receiver<(i32, Vec<u8>)>>,
}

impl ChannelWorld {
    /// Build a world of `size` connected endpoints, index = rank.
    pub fn new_world(size: usize) -> Vec<ChannelWorld> {
        let mut inboxes = Vec::with_capacity(size);
        let mut peers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = bounded(LANE_CAPACITY);
            peers.push(tx);
            inboxes.push(rx);
        }
        let (gather_tx, gather_rx) = bounded(size.max(1));
        let mut gather_rx = Some(gather_rx);

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelWorld {
                rank: rank as i32,
                size: size as i32,
                peers: peers.clone(),
                inbox,
                gather_tx: gather_tx.clone(),
                gather_rx: if rank == 0 { gather_rx.take() } else { None },
            })
            .collect()
    }
}

impl Transport for ChannelWorld {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn send(&self, dst: i32, frame: Vec<u8>) -> Result<()> {
        let lane = self
            .peers
            .get(dst as usize)
            .ok_or(CommError::PeerUnreachable(dst))?;
        lane.send(frame).map_err(|_| CommError::PeerUnreachable(dst))
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CommError::Closed),
        }
    }

    fn gather(&self, bytes: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>> {
        self.gather_tx
            .send((self.rank, bytes))
            .map_err(|_| CommError::Closed)?;
        let Some(rx) = &self.gather_rx else {
            return Ok(None);
        };
        let mut parts: Vec<Option<Vec<u8>>> = vec![None; self.size as usize];
        for _ in 0..self.size {
            let (rank, bytes) = rx.recv().map_err(|_| CommError::Closed)?;
            parts[rank as usize] = Some(bytes);
        }
        Ok(Some(
            parts
                .into_iter()
                .map(|p| p.expect("every rank contributes exactly once"))
                .collect(),
        ))
    }
}
