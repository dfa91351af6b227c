//! The communicator: one send thread, one dispatcher thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::error;

use crate::message::{Message, SystemTag, Work};
use crate::transport::Transport;
use crate::works::{Command, Vote};
use crate::Result;

const POLL: Duration = Duration::from_millis(10);

/// Receiver side of the dispatcher: where each inbound message class
/// lands.
///
/// Vote traffic is delivered synchronously on the dispatcher thread;
/// the voter's entry points are cheap, lock-protected flag flips. Ray
/// batches go to the tracer's work queue and are drained by the frame
/// loop.
pub trait MessageHandler: Send + Sync {
    /// A vote-protocol message arrived.
    fn on_vote(&self, vote: Vote);
    /// A user-level message (ray batch) arrived.
    fn on_user(&self, msg: Message);
    /// Rank 0 ended the render.
    fn on_quit(&self);
}

/// Asynchronous, tagged message transport endpoint for one rank.
///
/// `send` enqueues and returns; the send thread preserves submission
/// order, which together with the transport's per-pair FIFO gives the
/// ordering guarantee the transfer plane needs. The dispatcher thread
/// decodes inbound frames and routes them by system tag.
pub struct Communicator {
    rank: i32,
    size: i32,
    outbox: Sender<(i32, Vec<u8>)>,
    transport: Arc<dyn Transport>,
    shutdown: Arc<AtomicBool>,
    send_thread: Option<JoinHandle<()>>,
    dispatch_thread: Option<JoinHandle<()>>,
}

impl Communicator {
    /// Start the send and dispatcher threads over `transport`.
    pub fn start(transport: Arc<dyn Transport>, handler: Arc<dyn MessageHandler>) -> Self {
        let rank = transport.rank();
        let size = transport.size();
        let shutdown = Arc::new(AtomicBool::new(false));

        let (outbox, outbox_rx): (Sender<(i32, Vec<u8>)>, Receiver<(i32, Vec<u8>)>) = unbounded();

        let send_transport = transport.clone();
        let send_shutdown = shutdown.clone();
        let send_thread = thread::Builder::new()
            .name(format!("rayweave-send-{rank}"))
            .spawn(move || {
                loop {
                    match outbox_rx.recv_timeout(POLL) {
                        Ok((dst, frame)) => {
                            if let Err(e) = send_transport.send(dst, frame) {
                                error!(rank, dst, error = %e, "send failed; stopping send thread");
                                return;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if send_shutdown.load(Ordering::Relaxed) {
                                return;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .expect("spawn send thread");

        let recv_transport = transport.clone();
        let recv_shutdown = shutdown.clone();
        let dispatch_thread = thread::Builder::new()
            .name(format!("rayweave-dispatch-{rank}"))
            .spawn(move || {
                loop {
                    if recv_shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    let frame = match recv_transport.recv_timeout(POLL) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => continue,
                        Err(e) => {
                            error!(rank, error = %e, "receive failed; stopping dispatcher");
                            return;
                        }
                    };
                    match dispatch(&frame, handler.as_ref()) {
                        Ok(()) => {}
                        Err(e) => {
                            error!(rank, error = %e, "malformed inbound message; stopping dispatcher");
                            return;
                        }
                    }
                }
            })
            .expect("spawn dispatcher thread");

        Self {
            rank,
            size,
            outbox,
            transport,
            shutdown,
            send_thread: Some(send_thread),
            dispatch_thread: Some(dispatch_thread),
        }
    }

    /// This endpoint's rank.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// World size.
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Queue a work item for `dst`. Non-blocking; FIFO per destination.
    pub fn send<W: Work>(&self, work: &W, dst: i32) {
        let frame = Message::pack(work, self.rank, dst).encode();
        // The channel only closes at shutdown; drops after that are moot.
        let _ = self.outbox.send((dst, frame));
    }

    /// Queue a work item for every peer except self.
    pub fn send_all_others<W: Work>(&self, work: &W) {
        for dst in 0..self.size {
            if dst != self.rank {
                self.send(work, dst);
            }
        }
    }

    /// Collective gather to rank 0 (see [`Transport::gather`]).
    pub fn gather(&self, bytes: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>> {
        self.transport.gather(bytes)
    }

    /// Stop both threads after draining queued sends.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(h) = self.send_thread.take() {
            let _ = h.join();
        }
        if let Some(h) = self.dispatch_thread.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(frame: &[u8], handler: &dyn MessageHandler) -> Result<()> {
    let msg = Message::decode(frame)?;
    match msg.system_tag()? {
        SystemTag::ControlVote => handler.on_vote(msg.unpack::<Vote>()?),
        SystemTag::ControlUser => handler.on_user(msg),
        SystemTag::ControlSystem => {
            let Command::Quit = msg.unpack::<Command>()?;
            handler.on_quit();
        }
    }
    Ok(())
}
