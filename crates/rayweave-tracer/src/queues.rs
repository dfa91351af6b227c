//! Per-instance ray queues.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use rayweave_core::{Ray, RayVector};

use crate::InstanceMap;

/// Map from instance id to a mutex-guarded FIFO of rays awaiting
/// intersection on this rank.
///
/// Pushes into different instances are independent; the frame loop
/// holds no bucket lock while tracing because [`take_all`] moves the
/// rays out. A ray is in at most one bucket at any time on a rank.
///
/// [`take_all`]: RayQueueSet::take_all
#[derive(Default)]
pub struct RayQueueSet {
    buckets: RwLock<HashMap<i32, Mutex<RayVector>>>,
}

impl RayQueueSet {
    /// Empty queue set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append rays to the bucket for `instance_id`, creating the bucket
    /// the first time a remote batch names an instance this rank has
    /// never seen.
    pub fn push_many(&self, instance_id: i32, rays: impl IntoIterator<Item = Ray>) {
        {
            let buckets = self.buckets.read();
            if let Some(bucket) = buckets.get(&instance_id) {
                bucket.lock().extend(rays);
                return;
            }
        }
        let mut buckets = self.buckets.write();
        buckets
            .entry(instance_id)
            .or_default()
            .get_mut()
            .extend(rays);
    }

    /// Drain the bucket for `instance_id`.
    pub fn take_all(&self, instance_id: i32) -> RayVector {
        let buckets = self.buckets.read();
        match buckets.get(&instance_id) {
            Some(bucket) => std::mem::take(&mut *bucket.lock()),
            None => RayVector::new(),
        }
    }

    /// Rays waiting for `instance_id`.
    pub fn len(&self, instance_id: i32) -> usize {
        let buckets = self.buckets.read();
        buckets.get(&instance_id).map_or(0, |b| b.lock().len())
    }

    /// Whether every bucket is empty.
    pub fn all_empty(&self) -> bool {
        let buckets = self.buckets.read();
        buckets.values().all(|b| b.lock().is_empty())
    }

    /// Total rays across all buckets.
    pub fn total_len(&self) -> usize {
        let buckets = self.buckets.read();
        buckets.values().map(|b| b.lock().len()).sum()
    }

    /// The non-empty bucket with the most rays among those `rank` owns;
    /// ties resolve to the lower instance id so every rank selects
    /// deterministically.
    pub fn heaviest_owned(&self, map: &InstanceMap, rank: i32) -> Option<i32> {
        let buckets = self.buckets.read();
        let mut best: Option<(i32, usize)> = None;
        for (&id, bucket) in buckets.iter() {
            if !map.is_owned_by(id, rank) {
                continue;
            }
            let len = bucket.lock().len();
            if len == 0 {
                continue;
            }
            best = match best {
                None => Some((id, len)),
                Some((bid, blen)) => {
                    if len > blen || (len == blen && id < bid) {
                        Some((id, len))
                    } else {
                        Some((bid, blen))
                    }
                }
            };
        }
        best.map(|(id, _)| id)
    }

    /// Snapshot of non-empty buckets not owned by `rank`:
    /// `(instance_id, owner)` pairs, the send plane's worklist.
    pub fn foreign_nonempty(&self, map: &InstanceMap, rank: i32) -> Vec<(i32, i32)> {
        let buckets = self.buckets.read();
        let mut out: Vec<(i32, i32)> = buckets
            .iter()
            .filter(|(_, b)| !b.lock().is_empty())
            .map(|(&id, _)| (id, map.owner(id)))
            .filter(|&(_, owner)| owner != rank)
            .collect();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayweave_core::{Instance, Material, Mesh};
    use rayweave_math::{Mat4, Point3, Vec3};
    use std::sync::Arc;

    fn ray(id: i32) -> Ray {
        Ray::primary(Point3::origin(), Vec3::new(0.0, 0.0, 1.0), id, 1)
    }

    fn map(n: usize, world: i32) -> InstanceMap {
        let mesh = Arc::new(Mesh::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2]],
            Material::lambert(Vec3::new(1.0, 1.0, 1.0)),
        ));
        let instances: Vec<Instance> = (0..n)
            .map(|i| Instance::new(i as i32, mesh.clone(), i, Mat4::identity()).unwrap())
            .collect();
        InstanceMap::build(&instances, world)
    }

    #[test]
    fn test_push_and_take_moves_rays_once() {
        let queues = RayQueueSet::new();
        queues.push_many(3, (0..10).map(ray));
        assert_eq!(queues.len(3), 10);

        let taken = queues.take_all(3);
        assert_eq!(taken.len(), 10);
        // The bucket is drained: a ray lives in at most one queue.
        assert_eq!(queues.len(3), 0);
        assert!(queues.all_empty());
    }

    #[test]
    fn test_heaviest_owned_prefers_longest() {
        let queues = RayQueueSet::new();
        let map = map(4, 1);
        queues.push_many(0, (0..2).map(ray));
        queues.push_many(2, (0..8).map(ray));
        queues.push_many(3, (0..5).map(ray));
        assert_eq!(queues.heaviest_owned(&map, 0), Some(2));
    }

    #[test]
    fn test_heaviest_owned_tie_breaks_low_id() {
        let queues = RayQueueSet::new();
        let map = map(4, 1);
        queues.push_many(3, (0..4).map(ray));
        queues.push_many(1, (0..4).map(ray));
        assert_eq!(queues.heaviest_owned(&map, 0), Some(1));
    }

    #[test]
    fn test_heaviest_owned_skips_foreign_queues() {
        let queues = RayQueueSet::new();
        let map = map(4, 2); // even ids -> rank 0, odd -> rank 1
        queues.push_many(1, (0..100).map(ray));
        queues.push_many(2, (0..1).map(ray));
        assert_eq!(queues.heaviest_owned(&map, 0), Some(2));
        assert_eq!(queues.heaviest_owned(&map, 1), Some(1));
    }

    #[test]
    fn test_foreign_nonempty_lists_peers_work() {
        let queues = RayQueueSet::new();
        let map = map(4, 2);
        queues.push_many(1, (0..3).map(ray));
        queues.push_many(2, (0..3).map(ray));
        assert_eq!(queues.foreign_nonempty(&map, 0), vec![(1, 1)]);
        assert_eq!(queues.foreign_nonempty(&map, 1), vec![(2, 0)]);
    }

    #[test]
    fn test_empty_select_returns_none() {
        let queues = RayQueueSet::new();
        let map = map(2, 1);
        assert_eq!(queues.heaviest_owned(&map, 0), None);
    }
}
