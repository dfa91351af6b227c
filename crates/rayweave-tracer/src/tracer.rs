//! The domain-parallel frame loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rayweave_accel::AccelIndex;
use rayweave_adapter::{AdapterCache, TraceContext};
use rayweave_comm::{
    Command, Communicator, Message, MessageHandler, RemoteRays, TransferType, Transport, Vote,
};
use rayweave_core::{Instance, Light, RayKind, RayVector};
use tracing::info;

use crate::{
    FrameBuffer, InstanceMap, RayQueueSet, Result, TpcVoter, TraceError, TracerConfig, COORDINATOR,
};

/// Fraction of the box entry distance a routed ray is advanced, far
/// enough inside the next domain's bounds to route unambiguously while
/// still short of any surface.
const ADVANCE_FACTOR: f32 = 0.8;

/// Inbound ray-batch queue, fed by the dispatcher thread and drained by
/// the frame loop's transfer step.
#[derive(Default)]
struct WorkQueue {
    inner: Mutex<VecDeque<RemoteRays>>,
}

impl WorkQueue {
    fn push(&self, batch: RemoteRays) {
        self.inner.lock().push_back(batch);
    }

    fn drain(&self) -> VecDeque<RemoteRays> {
        std::mem::take(&mut *self.inner.lock())
    }
}

/// Voter-to-communicator link holding a weak handle: the communicator
/// owns a handler that owns the voter, so a strong handle here would
/// cycle and leak the send/dispatch threads. After teardown the
/// upgrade fails and protocol sends become no-ops.
struct CommLink(std::sync::Weak<Communicator>);

impl crate::VoteLink for CommLink {
    fn broadcast(&self, kind: rayweave_comm::VoteKind) {
        if let Some(comm) = self.0.upgrade() {
            crate::VoteLink::broadcast(&*comm, kind);
        }
    }

    fn send_vote(&self, kind: rayweave_comm::VoteKind) {
        if let Some(comm) = self.0.upgrade() {
            crate::VoteLink::send_vote(&*comm, kind);
        }
    }
}

/// Dispatcher-side routing for one rank.
struct Endpoint {
    voter: Option<Arc<TpcVoter>>,
    work: Arc<WorkQueue>,
    quit: Arc<AtomicBool>,
}

impl MessageHandler for Endpoint {
    fn on_vote(&self, vote: Vote) {
        self.voter
            .as_ref()
            .expect("vote message in a world without a voter")
            .on_vote_message(vote);
    }

    fn on_user(&self, msg: Message) {
        match msg.unpack::<RemoteRays>() {
            Ok(batch) => self.work.push(batch),
            // Corrupt ray traffic can poison queues everywhere; halt.
            Err(e) => panic!("malformed ray batch: {e}"),
        }
    }

    fn on_quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
    }
}

/// Per-frame counters and phase timers, logged once per frame and
/// readable afterwards through [`DomainTracer::stats`].
#[derive(Debug, Default, Clone)]
pub struct FrameStats {
    /// Rays handed to adapters.
    pub rays_traced: u64,
    /// Rays shipped to peers in REQUEST batches.
    pub rays_sent: u64,
    /// REQUEST batches sent.
    pub batches_sent: u64,
    /// REQUEST batches received.
    pub batches_received: u64,
    /// GRANT acknowledgements received.
    pub grants_received: u64,
    /// Shadow-ray samples deposited into the framebuffer.
    pub samples_deposited: u64,
    /// Primary/secondary rays that left the scene.
    pub rays_escaped: u64,
    /// Frame-loop iterations until quiescence.
    pub loop_iterations: u64,
    t_filter: Duration,
    t_select: Duration,
    t_trace: Duration,
    t_shuffle: Duration,
    t_send: Duration,
    t_recv: Duration,
    t_vote: Duration,
    t_gather: Duration,
}

/// The per-rank frame driver.
///
/// Owns the scene for the frame: instances, lights, the domain router,
/// the queues, the adapter cache, and (in a multi-rank world) the
/// communicator and termination voter. `render` runs a frame to global
/// quiescence and returns the composited image on rank 0.
pub struct DomainTracer {
    rank: i32,
    world_size: i32,
    config: TracerConfig,
    instances: Vec<Instance>,
    by_id: HashMap<i32, usize>,
    lights: Vec<Light>,
    map: InstanceMap,
    index: AccelIndex,
    queues: RayQueueSet,
    adapters: AdapterCache,
    framebuffer: FrameBuffer,
    voter: Option<Arc<TpcVoter>>,
    comm: Option<Arc<Communicator>>,
    work: Arc<WorkQueue>,
    quit: Arc<AtomicBool>,
    stats: FrameStats,
}

impl std::fmt::Debug for DomainTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainTracer")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish_non_exhaustive()
    }
}

impl DomainTracer {
    /// Build a tracer for one rank.
    ///
    /// With `transport = None` the tracer runs single-rank: no voter,
    /// no transfer plane, termination is local queue emptiness.
    pub fn new(
        instances: Vec<Instance>,
        lights: Vec<Light>,
        config: TracerConfig,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<Self> {
        config.validate().map_err(TraceError::Configuration)?;

        let mut by_id = HashMap::with_capacity(instances.len());
        for (slot, inst) in instances.iter().enumerate() {
            if inst.mesh.triangle_count() == 0 {
                return Err(TraceError::Configuration(format!(
                    "instance {} references an empty mesh",
                    inst.id
                )));
            }
            if by_id.insert(inst.id, slot).is_some() {
                return Err(TraceError::Configuration(format!(
                    "duplicate instance id {}",
                    inst.id
                )));
            }
        }

        let (rank, world_size) = match &transport {
            Some(t) => (t.rank(), t.size()),
            None => (0, 1),
        };

        let map = InstanceMap::build(&instances, world_size);
        let index = AccelIndex::build(&instances);
        let voter = (world_size > 1).then(|| Arc::new(TpcVoter::new(rank, world_size)));
        let work = Arc::new(WorkQueue::default());
        let quit = Arc::new(AtomicBool::new(false));

        let comm = transport.map(|t| {
            Arc::new(Communicator::start(
                t,
                Arc::new(Endpoint {
                    voter: voter.clone(),
                    work: work.clone(),
                    quit: quit.clone(),
                }),
            ))
        });
        if let (Some(voter), Some(comm)) = (&voter, &comm) {
            voter.bind_link(Box::new(CommLink(Arc::downgrade(comm))));
        }

        Ok(Self {
            rank,
            world_size,
            framebuffer: FrameBuffer::new(config.width, config.height),
            config,
            instances,
            by_id,
            lights,
            map,
            index,
            queues: RayQueueSet::new(),
            adapters: AdapterCache::new(),
            voter,
            comm,
            work,
            quit,
            stats: FrameStats::default(),
        })
    }

    /// This rank.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// World size.
    pub fn world_size(&self) -> i32 {
        self.world_size
    }

    /// Rays sent and not yet acknowledged (0 in a single-rank world).
    pub fn pending_rays(&self) -> i64 {
        self.voter.as_ref().map_or(0, |v| v.pending_rays())
    }

    /// Whether rank 0 has ended the render.
    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }

    /// Counters from the most recent frame.
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Vote rounds the coordinator resolved with DO_ABORT (0 on
    /// cohorts and in single-rank worlds).
    pub fn aborted_rounds(&self) -> u64 {
        self.voter.as_ref().map_or(0, |v| v.aborted_rounds())
    }

    /// Trace one frame to quiescence and composite.
    ///
    /// `rays` are this rank's primary rays. Returns the gathered 24-bit
    /// RGB image on rank 0, `None` on other ranks.
    pub fn render(&mut self, rays: RayVector) -> Result<Option<Vec<u8>>> {
        let t_frame = Instant::now();
        self.framebuffer.clear();
        self.stats = FrameStats::default();
        let ctx = TraceContext {
            frame_seed: self.config.frame_seed ^ ((self.rank as u64) << 32),
            threads: self.config.effective_threads(),
        };

        let t = Instant::now();
        self.filter_rays_locally(rays);
        self.stats.t_filter = t.elapsed();

        let mut moved = RayVector::with_capacity(1024);
        loop {
            self.stats.loop_iterations += 1;

            let t = Instant::now();
            let target = self.queues.heaviest_owned(&self.map, self.rank);
            self.stats.t_select += t.elapsed();

            if let Some(instance_id) = target {
                let slot = self.by_id[&instance_id];
                let instance = &self.instances[slot];
                let adapter = self.adapters.resolve(instance);

                let mut input = self.queues.take_all(instance_id);
                self.stats.rays_traced += input.len() as u64;
                moved.reserve(input.len());

                let t = Instant::now();
                adapter.trace(&mut input, &mut moved, instance, &self.lights, &ctx);
                self.stats.t_trace += t.elapsed();

                let t = Instant::now();
                self.shuffle(&mut moved, instance_id);
                self.stats.t_shuffle += t.elapsed();
            }

            if self.transfer_rays()? {
                break;
            }
        }

        let t = Instant::now();
        let image = match &self.comm {
            Some(comm) if self.world_size > 1 => self.framebuffer.gather(comm)?,
            _ => Some(self.framebuffer.composite_local()),
        };
        self.stats.t_gather = t.elapsed();

        if self.rank == COORDINATOR {
            if let Some(comm) = &self.comm {
                comm.send_all_others(&Command::Quit);
            }
        }

        self.log_frame(t_frame.elapsed());
        Ok(image)
    }

    /// Sort primary rays into local queues.
    ///
    /// Rays whose first domain belongs to a peer are dropped, not
    /// forwarded: each rank owns the primaries it generated for its
    /// film region, so a peer generates those same rays itself.
    fn filter_rays_locally(&mut self, rays: RayVector) {
        let hits = self.index.next_domains(&rays, -1);
        let mut local: HashMap<i32, RayVector> = HashMap::new();
        for (mut ray, hit) in rays.into_iter().zip(hits) {
            if hit.next < 0 || !self.map.is_owned_by(hit.next, self.rank) {
                continue;
            }
            ray.advance(ADVANCE_FACTOR * hit.t_enter);
            ray.mark_visited(hit.next);
            local.entry(hit.next).or_default().push(ray);
        }
        for (instance_id, batch) in local {
            self.queues.push_many(instance_id, batch);
        }
    }

    /// Route the adapter's outgoing rays: back into queues (local or
    /// foreign), into the framebuffer (shadow rays that reached their
    /// light), or out of the scene.
    fn shuffle(&mut self, moved: &mut RayVector, from: i32) {
        let hits = self.index.next_domains(moved, from);
        let mut local: HashMap<i32, RayVector> = HashMap::new();
        for (mut ray, hit) in moved.drain(..).zip(hits) {
            if hit.next >= 0 {
                ray.advance(ADVANCE_FACTOR * hit.t_enter);
                ray.mark_visited(hit.next);
                local.entry(hit.next).or_default().push(ray);
            } else if ray.kind() == RayKind::Shadow {
                self.framebuffer.add_sample(ray.id, ray.color);
                self.stats.samples_deposited += 1;
            } else {
                self.stats.rays_escaped += 1;
            }
        }
        for (instance_id, batch) in local {
            self.queues.push_many(instance_id, batch);
        }
    }

    /// One transfer step: exchange rays if the voter allows it, then
    /// advance the termination protocol. Returns true when the frame is
    /// globally done.
    fn transfer_rays(&mut self) -> Result<bool> {
        if self.world_size <= 1 {
            return Ok(self.queues.all_empty());
        }
        let voter = self.voter.clone().expect("multi-rank world has a voter");

        if voter.communication_allowed() {
            let t = Instant::now();
            self.send_rays(&voter);
            self.stats.t_send += t.elapsed();

            let t = Instant::now();
            self.recv_rays(&voter);
            self.stats.t_recv += t.elapsed();
        }

        let t = Instant::now();
        let done = voter.tick(self.queues.all_empty());
        self.stats.t_vote += t.elapsed();
        Ok(done)
    }

    /// Ship every non-empty foreign queue to its owner as a REQUEST.
    fn send_rays(&mut self, voter: &TpcVoter) {
        let comm = self.comm.as_ref().expect("transfer plane without communicator");
        for (instance_id, owner) in self.queues.foreign_nonempty(&self.map, self.rank) {
            let rays = self.queues.take_all(instance_id);
            if rays.is_empty() {
                continue;
            }
            let count = rays.len();
            // Count before the send so a fast grant can never underflow.
            voter.add_pending(count);
            comm.send(&RemoteRays::request(self.rank, instance_id, rays), owner);
            self.stats.rays_sent += count as u64;
            self.stats.batches_sent += 1;
        }
    }

    /// Drain the inbound work queue: enqueue REQUESTed rays and answer
    /// with a GRANT; settle pending counts for GRANTs we receive.
    fn recv_rays(&mut self, voter: &TpcVoter) {
        let comm = self.comm.as_ref().expect("transfer plane without communicator");
        for batch in self.work.drain() {
            match batch.transfer_type {
                TransferType::Request => {
                    assert!(
                        self.map.is_owned_by(batch.instance, self.rank),
                        "rank {} received rays for instance {} owned by rank {}",
                        self.rank,
                        batch.instance,
                        self.map.owner(batch.instance)
                    );
                    let count = batch.num_rays;
                    self.queues.push_many(batch.instance, batch.rays);
                    comm.send(
                        &RemoteRays::grant(self.rank, batch.instance, count),
                        batch.sender,
                    );
                    self.stats.batches_received += 1;
                }
                TransferType::Grant => {
                    voter.sub_pending(batch.num_rays as usize);
                    self.stats.grants_received += 1;
                }
            }
        }
    }

    fn log_frame(&self, elapsed: Duration) {
        let s = &self.stats;
        info!(
            rank = self.rank,
            world_size = self.world_size,
            rays_traced = s.rays_traced,
            rays_sent = s.rays_sent,
            batches_sent = s.batches_sent,
            batches_received = s.batches_received,
            grants_received = s.grants_received,
            samples = s.samples_deposited,
            escaped = s.rays_escaped,
            iterations = s.loop_iterations,
            filter_ms = s.t_filter.as_millis() as u64,
            select_ms = s.t_select.as_millis() as u64,
            trace_ms = s.t_trace.as_millis() as u64,
            shuffle_ms = s.t_shuffle.as_millis() as u64,
            send_ms = s.t_send.as_millis() as u64,
            recv_ms = s.t_recv.as_millis() as u64,
            vote_ms = s.t_vote.as_millis() as u64,
            gather_ms = s.t_gather.as_millis() as u64,
            frame_ms = elapsed.as_millis() as u64,
            "frame complete"
        );
    }
}
