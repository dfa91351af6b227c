//! Static instance-to-rank ownership.

use std::collections::HashMap;

use rayweave_core::Instance;

/// Total function from instance id to owning rank.
///
/// `owner(i) = data_index(i) % world_size`, computed identically on
/// every rank from the same ordered instance list. Ownership never
/// changes within a frame.
#[derive(Debug, Clone)]
pub struct InstanceMap {
    owners: HashMap<i32, i32>,
    world_size: i32,
}

impl InstanceMap {
    /// Compute ownership for the whole scene.
    pub fn build(instances: &[Instance], world_size: i32) -> Self {
        let owners = instances
            .iter()
            .map(|inst| (inst.id, (inst.data_index % world_size.max(1) as usize) as i32))
            .collect();
        Self { owners, world_size }
    }

    /// The rank owning `instance_id`.
    ///
    /// Every id the router can produce is in the map; anything else is
    /// a scene-construction bug.
    pub fn owner(&self, instance_id: i32) -> i32 {
        *self
            .owners
            .get(&instance_id)
            .unwrap_or_else(|| panic!("no owner for instance {instance_id}"))
    }

    /// Whether `instance_id` belongs to `rank`.
    pub fn is_owned_by(&self, instance_id: i32, rank: i32) -> bool {
        self.owner(instance_id) == rank
    }

    /// World size the map was built for.
    pub fn world_size(&self) -> i32 {
        self.world_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayweave_core::{Material, Mesh};
    use rayweave_math::{Mat4, Point3, Vec3};
    use std::sync::Arc;

    fn instances(n: usize) -> Vec<Instance> {
        let mesh = Arc::new(Mesh::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2]],
            Material::lambert(Vec3::new(1.0, 1.0, 1.0)),
        ));
        (0..n)
            .map(|i| Instance::new(i as i32, mesh.clone(), i, Mat4::identity()).unwrap())
            .collect()
    }

    #[test]
    fn test_owner_is_data_index_mod_world_size() {
        let map = InstanceMap::build(&instances(7), 3);
        for i in 0..7 {
            assert_eq!(map.owner(i as i32), (i % 3) as i32);
        }
    }

    #[test]
    fn test_every_rank_computes_identically() {
        // The map depends only on the shared instance list, so two
        // builds with the same world size must agree everywhere.
        let insts = instances(16);
        for world_size in 1..5 {
            let a = InstanceMap::build(&insts, world_size);
            let b = InstanceMap::build(&insts, world_size);
            for inst in &insts {
                assert_eq!(a.owner(inst.id), b.owner(inst.id));
                assert!(a.owner(inst.id) < world_size);
            }
        }
    }

    #[test]
    #[should_panic(expected = "no owner")]
    fn test_unknown_instance_panics() {
        let map = InstanceMap::build(&instances(2), 2);
        map.owner(99);
    }
}
