//! Per-rank color accumulation and cross-rank compositing.

use parking_lot::Mutex;
use rayon::prelude::*;
use rayweave_comm::Communicator;

use crate::{Result, TraceError};

/// Rank-local sample accumulator plus the gather to rank 0.
///
/// Shadow rays deposit `[r, g, b, w]` samples as the shuffle retires
/// them; the composite pass flattens the accumulator into 24-bit RGB.
/// The gather assumes a black background, so rank buffers sum per
/// channel (saturating). Deposits take a per-pixel lock; parking_lot
/// mutexes are a byte, so the lock array costs less than one sample
/// row.
pub struct FrameBuffer {
    width: usize,
    height: usize,
    accum: Vec<Mutex<[f32; 4]>>,
}

impl FrameBuffer {
    /// Zeroed buffer for a `width` x `height` film.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            accum: (0..width * height).map(|_| Mutex::new([0.0; 4])).collect(),
        }
    }

    /// Film width.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Film height.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Zero every accumulator; called at frame start.
    pub fn clear(&mut self) {
        for px in &mut self.accum {
            *px.get_mut() = [0.0; 4];
        }
    }

    /// Add one sample for film pixel `id` (ray ids index pixels).
    ///
    /// Out-of-film ids are dropped; primary generators only hand out
    /// valid ids, but remote batches are not trusted blindly.
    pub fn add_sample(&self, id: i32, rgba: [f32; 4]) {
        let Ok(idx) = usize::try_from(id) else {
            return;
        };
        let Some(px) = self.accum.get(idx) else {
            return;
        };
        let mut px = px.lock();
        px[0] += rgba[0];
        px[1] += rgba[1];
        px[2] += rgba[2];
        px[3] += rgba[3];
    }

    /// Flatten the accumulator into a 24-bit RGB buffer, in parallel
    /// pixel chunks.
    pub fn composite_local(&self) -> Vec<u8> {
        let size = self.width * self.height;
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let chunk = (size / (cores * 4)).max(2);

        self.accum
            .par_chunks(chunk)
            .flat_map_iter(|chunk| {
                chunk.iter().flat_map(|px| {
                    let px = px.lock();
                    [
                        (px[0].clamp(0.0, 1.0) * 255.0) as u8,
                        (px[1].clamp(0.0, 1.0) * 255.0) as u8,
                        (px[2].clamp(0.0, 1.0) * 255.0) as u8,
                    ]
                })
            })
            .collect()
    }

    /// Gather every rank's local RGB buffer to rank 0 and sum them.
    ///
    /// Returns the final image on rank 0, `None` elsewhere.
    pub fn gather(&self, comm: &Communicator) -> Result<Option<Vec<u8>>> {
        let local = self.composite_local();
        let expected = local.len();
        let Some(buffers) = comm.gather(local)? else {
            return Ok(None);
        };

        let mut out = vec![0u8; expected];
        for (rank, buf) in buffers.iter().enumerate() {
            if buf.len() != expected {
                return Err(TraceError::Transport(rayweave_comm::CommError::Malformed(
                    format!(
                        "rank {rank} framebuffer is {} bytes, expected {expected}",
                        buf.len()
                    ),
                )));
            }
            for (d, s) in out.iter_mut().zip(buf) {
                *d = d.saturating_add(*s);
            }
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_accumulate() {
        let fb = FrameBuffer::new(4, 4);
        fb.add_sample(5, [0.25, 0.5, 1.0, 1.0]);
        fb.add_sample(5, [0.25, 0.0, 0.5, 1.0]);
        let rgb = fb.composite_local();
        assert_eq!(rgb.len(), 4 * 4 * 3);
        assert_eq!(rgb[5 * 3], 127); // 0.5 * 255
        assert_eq!(rgb[5 * 3 + 1], 127);
        assert_eq!(rgb[5 * 3 + 2], 255); // clamped
    }

    #[test]
    fn test_out_of_film_sample_dropped() {
        let fb = FrameBuffer::new(2, 2);
        fb.add_sample(-1, [1.0; 4]);
        fb.add_sample(100, [1.0; 4]);
        assert!(fb.composite_local().iter().all(|&c| c == 0));
    }

    #[test]
    fn test_clear_zeroes() {
        let mut fb = FrameBuffer::new(2, 2);
        fb.add_sample(0, [1.0; 4]);
        fb.clear();
        assert!(fb.composite_local().iter().all(|&c| c == 0));
    }

    #[test]
    fn test_concurrent_deposits_do_not_lose_samples() {
        let fb = FrameBuffer::new(8, 8);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        fb.add_sample(3, [0.001, 0.0, 0.0, 1.0]);
                    }
                });
            }
        });
        // 400 deposits of 0.001 = 0.4 -> 102.
        let rgb = fb.composite_local();
        assert_eq!(rgb[9], 102);
    }
}
