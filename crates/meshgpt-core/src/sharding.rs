//! Device mesh and the sharding manager
//!
//! The mesh is a one-axis arrangement of devices (axis `"data"`), passed
//! explicitly to everything that makes placement decisions. Parameters are
//! kept in logical (unsplit) form on the mesh's primary device and carry a
//! [`Placement`] saying how they are laid out across the mesh. Ranks
//! materialize their slice with [`DeviceMesh::scatter`]; inside a step the
//! full working copies are rebuilt from those slices with
//! [`DeviceMesh::all_gather`].

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MeshError, Result};
use crate::tree::{Param, ParamKind, ParamTree};

pub const DATA_AXIS: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Full copy on every device.
    Replicated,
    /// Split evenly along `axis` across the mesh.
    Sharded { axis: usize },
}

#[derive(Debug, Clone)]
pub struct DeviceMesh {
    devices: Vec<Device>,
}

impl DeviceMesh {
    pub fn new(devices: Vec<Device>) -> Result<Self> {
        if devices.is_empty() {
            return Err(MeshError::InsufficientDevices {
                requested: 1,
                available: 0,
            });
        }
        Ok(Self { devices })
    }

    /// `n` logical CPU devices. Useful for exercising sharded layouts
    /// without accelerators.
    pub fn cpu(n: usize) -> Result<Self> {
        Self::new(vec![Device::Cpu; n])
    }

    /// All CUDA devices (or the first `requested` of them). Without CUDA the
    /// mesh is a single CPU device.
    pub fn discover(requested: Option<usize>) -> Result<Self> {
        let mut devices = Vec::new();
        if candle_core::utils::cuda_is_available() {
            for ordinal in 0.. {
                if requested.is_some_and(|n| devices.len() >= n) {
                    break;
                }
                match Device::new_cuda(ordinal) {
                    Ok(device) => devices.push(device),
                    Err(_) => break,
                }
            }
        } else {
            devices.push(Device::Cpu);
        }

        if let Some(n) = requested {
            if devices.len() < n {
                return Err(MeshError::InsufficientDevices {
                    requested: n,
                    available: devices.len(),
                });
            }
        }
        Self::new(devices)
    }

    pub fn size(&self) -> usize {
        self.devices.len()
    }

    pub fn primary(&self) -> &Device {
        &self.devices[0]
    }

    pub fn device(&self, rank: usize) -> &Device {
        &self.devices[rank]
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Name of the mesh's only axis.
    pub fn axis_name(&self) -> &'static str {
        DATA_AXIS
    }

    /// The part of `param` that lives on `rank`.
    pub fn local_shard(&self, param: &Param, rank: usize) -> Result<Tensor> {
        let device = self.device(rank);
        match param.placement {
            None => Err(MeshError::Config(
                "parameter has no placement, run it through the sharding manager".to_string(),
            )),
            Some(Placement::Replicated) => Ok(param.value.to_device(device)?),
            Some(Placement::Sharded { axis }) => {
                let chunk = param.value.dim(axis)? / self.size();
                Ok(param
                    .value
                    .narrow(axis, rank * chunk, chunk)?
                    .to_device(device)?)
            }
        }
    }

    /// What each rank holds of `tree`: sharded leaves narrowed to the rank's
    /// chunk on its device, replicated leaves copied whole. Unplaced leaves
    /// are copied whole, matching [`DeviceMesh::bytes_per_device`].
    pub fn scatter(&self, tree: &ParamTree) -> Result<Vec<ParamTree>> {
        (0..self.size())
            .map(|rank| {
                tree.map(|_, p| {
                    let value = match p.placement {
                        None => p.value.to_device(self.device(rank))?,
                        Some(_) => self.local_shard(p, rank)?,
                    };
                    let mut local = p.with_value(value);
                    local.placement = p.placement;
                    Ok(local)
                })
            })
            .collect()
    }

    /// Reassemble full leaves on `rank`'s device from every rank's slice
    /// (the output of [`DeviceMesh::scatter`]). Sharded leaves are
    /// concatenated along their axis; everything else is the rank's own copy.
    pub fn all_gather(&self, shards: &[ParamTree], rank: usize) -> Result<ParamTree> {
        if shards.len() != self.size() {
            return Err(MeshError::Config(format!(
                "all-gather over {} devices got {} shards",
                self.size(),
                shards.len()
            )));
        }
        let own = &shards[rank];
        for other in shards {
            own.ensure_same_structure(other)?;
        }
        let device = self.device(rank);
        let leaves = shards.iter().map(|t| t.leaves()).collect::<Vec<_>>();

        let mut index = 0;
        own.map(|_, p| {
            let value = match p.placement {
                Some(Placement::Sharded { axis }) => {
                    let parts = leaves
                        .iter()
                        .map(|l| l[index].1.value.to_device(device))
                        .collect::<candle_core::Result<Vec<_>>>()?;
                    Tensor::cat(&parts, axis)?
                }
                _ => p.value.clone(),
            };
            index += 1;
            let mut full = p.with_value(value);
            full.placement = p.placement;
            Ok(full)
        })
    }

    /// One full working copy of `tree` per rank, each rebuilt from the
    /// ranks' slices. Copies are meant to be dropped once the caller is done.
    pub fn gather_replicas(&self, tree: &ParamTree) -> Result<Vec<ParamTree>> {
        let shards = self.scatter(tree)?;
        (0..self.size())
            .map(|rank| self.all_gather(&shards, rank))
            .collect()
    }

    /// Split the leading (batch) axis evenly across ranks.
    pub fn split_rows(&self, batch: &Tensor) -> Result<Vec<Tensor>> {
        let rows = batch.dim(0)?;
        if rows % self.size() != 0 {
            return Err(MeshError::Config(format!(
                "batch of {} rows is not divisible across {} devices",
                rows,
                self.size()
            )));
        }
        let per_rank = rows / self.size();
        (0..self.size())
            .map(|rank| {
                Ok(batch
                    .narrow(0, rank * per_rank, per_rank)?
                    .to_device(self.device(rank))?)
            })
            .collect()
    }

    /// Size of one rank's [`DeviceMesh::scatter`] slice under the tree's
    /// placements. Unplaced leaves count as replicated.
    pub fn bytes_per_device(&self, tree: &ParamTree) -> usize {
        tree.leaves()
            .iter()
            .map(|(_, p)| {
                let bytes = p.value.elem_count() * p.value.dtype().size_in_bytes();
                match p.placement {
                    Some(Placement::Sharded { .. }) => bytes / self.size(),
                    _ => bytes,
                }
            })
            .sum()
    }
}

/// Placement for each tensor class. `None` means the class has no strategy,
/// which the sharding manager treats as a fatal configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRules {
    pub embedding: Option<Placement>,
    pub linear: Option<Placement>,
    pub norm: Option<Placement>,
    pub bias: Option<Placement>,
    pub other: Option<Placement>,
}

impl PlacementRules {
    /// Model-sharded: weight matrices split on their output-feature axis,
    /// norm scales on their only axis. Otherwise everything is replicated
    /// (pure data parallelism). Biases are replicated in both modes.
    pub fn new(shard_model: bool) -> Self {
        if shard_model {
            Self {
                embedding: Some(Placement::Sharded { axis: 1 }),
                linear: Some(Placement::Sharded { axis: 1 }),
                norm: Some(Placement::Sharded { axis: 0 }),
                bias: Some(Placement::Replicated),
                other: None,
            }
        } else {
            Self {
                embedding: Some(Placement::Replicated),
                linear: Some(Placement::Replicated),
                norm: Some(Placement::Replicated),
                bias: Some(Placement::Replicated),
                other: None,
            }
        }
    }

    pub fn for_kind(&self, kind: ParamKind) -> Option<Placement> {
        match kind {
            ParamKind::Embedding => self.embedding,
            ParamKind::LinearWeight => self.linear,
            ParamKind::NormScale => self.norm,
            ParamKind::Bias => self.bias,
            ParamKind::Other => self.other,
        }
    }

    /// Drop the strategy for `kind`.
    pub fn without(mut self, kind: ParamKind) -> Self {
        match kind {
            ParamKind::Embedding => self.embedding = None,
            ParamKind::LinearWeight => self.linear = None,
            ParamKind::NormScale => self.norm = None,
            ParamKind::Bias => self.bias = None,
            ParamKind::Other => self.other = None,
        }
        self
    }
}

/// Assign every leaf its placement and move it onto the mesh's primary
/// device. Idempotent. Fails if any leaf is left without a placement or a
/// sharded axis does not divide evenly across the mesh.
pub fn shard(tree: &ParamTree, mesh: &DeviceMesh, rules: &PlacementRules) -> Result<ParamTree> {
    let mut placed = 0usize;
    let mut unplaced = Vec::new();

    let sharded = tree.map(|path, p| {
        let value = if p.value.device().same_device(mesh.primary()) {
            p.value.clone()
        } else {
            p.value.to_device(mesh.primary())?
        };
        let mut param = p.with_value(value);

        match rules.for_kind(p.kind) {
            Some(placement) => {
                if let Placement::Sharded { axis } = placement {
                    let size = p.value.dims().get(axis).copied().unwrap_or(0);
                    if size == 0 || size % mesh.size() != 0 {
                        return Err(MeshError::IndivisibleAxis {
                            path: path.to_string(),
                            axis,
                            size,
                            devices: mesh.size(),
                        });
                    }
                }
                param.placement = Some(placement);
                placed += 1;
            }
            None => unplaced.push(path.to_string()),
        }
        Ok(param)
    })?;

    let total = tree.num_leaves();
    if placed != total {
        return Err(MeshError::UnplacedParameters {
            placed,
            total,
            unplaced,
        });
    }
    debug!(leaves = total, devices = mesh.size(), "placements enforced");
    Ok(sharded)
}

/// [`shard`] with the default rules for `shard_model`.
pub fn shard_params(tree: &ParamTree, mesh: &DeviceMesh, shard_model: bool) -> Result<ParamTree> {
    shard(tree, mesh, &PlacementRules::new(shard_model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Node;
    use candle_core::DType;

    fn layer(hidden: usize) -> Result<ParamTree> {
        let dev = Device::Cpu;
        let w = Tensor::arange(0f32, (hidden * 2 * hidden) as f32, &dev)?.reshape((hidden, 2 * hidden))?;
        ParamTree::new(vec![
            (
                "wte".to_string(),
                Node::leaf(ParamKind::Embedding, Tensor::ones((6, hidden), DType::F32, &dev)?),
            ),
            ("c_fc".to_string(), Node::leaf(ParamKind::LinearWeight, w)),
            (
                "ln".to_string(),
                Node::leaf(ParamKind::NormScale, Tensor::ones(hidden, DType::F32, &dev)?),
            ),
            (
                "bias".to_string(),
                Node::leaf(ParamKind::Bias, Tensor::zeros(2 * hidden, DType::F32, &dev)?),
            ),
        ])
    }

    fn placements(tree: &ParamTree) -> Vec<Option<Placement>> {
        tree.leaves().iter().map(|(_, p)| p.placement).collect()
    }

    #[test]
    fn test_sharded_mode_placements() -> Result<()> {
        let mesh = DeviceMesh::cpu(2)?;
        let tree = shard_params(&layer(4)?, &mesh, true)?;
        assert_eq!(
            placements(&tree),
            vec![
                Some(Placement::Sharded { axis: 1 }),
                Some(Placement::Sharded { axis: 1 }),
                Some(Placement::Sharded { axis: 0 }),
                Some(Placement::Replicated),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_replicated_mode_placements() -> Result<()> {
        let mesh = DeviceMesh::cpu(4)?;
        let tree = shard_params(&layer(4)?, &mesh, false)?;
        assert!(placements(&tree)
            .iter()
            .all(|p| *p == Some(Placement::Replicated)));
        Ok(())
    }

    #[test]
    fn test_sharding_is_idempotent() -> Result<()> {
        let mesh = DeviceMesh::cpu(2)?;
        for flag in [true, false] {
            let once = shard_params(&layer(4)?, &mesh, flag)?;
            let twice = shard_params(&once, &mesh, flag)?;
            once.ensure_same_structure(&twice)?;
            assert_eq!(placements(&once), placements(&twice));
            for (a, b) in once.values().iter().zip(twice.values().iter()) {
                assert_eq!(a.flatten_all()?.to_vec1::<f32>()?, b.flatten_all()?.to_vec1::<f32>()?);
            }
        }
        Ok(())
    }

    #[test]
    fn test_unplaced_class_is_fatal() -> Result<()> {
        let mesh = DeviceMesh::cpu(1)?;
        let rules = PlacementRules::new(false).without(ParamKind::Bias);
        let err = shard(&layer(4)?, &mesh, &rules).unwrap_err();
        match err {
            MeshError::UnplacedParameters { placed, total, unplaced } => {
                assert_eq!(placed, 3);
                assert_eq!(total, 4);
                assert_eq!(unplaced, vec!["bias".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_indivisible_axis_is_fatal() -> Result<()> {
        let mesh = DeviceMesh::cpu(3)?;
        let err = shard_params(&layer(4)?, &mesh, true).unwrap_err();
        assert!(matches!(err, MeshError::IndivisibleAxis { devices: 3, .. }));
        // replication has no divisibility requirement
        shard_params(&layer(4)?, &mesh, false)?;
        Ok(())
    }

    #[test]
    fn test_local_shards_cover_parameter() -> Result<()> {
        let mesh = DeviceMesh::cpu(2)?;
        let tree = shard_params(&layer(4)?, &mesh, true)?;
        let c_fc = tree.get("c_fc")?;
        let shards = (0..mesh.size())
            .map(|rank| mesh.local_shard(c_fc, rank))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(shards[0].dims(), &[4, 4]);
        let joined = Tensor::cat(&shards, 1)?;
        assert_eq!(
            joined.flatten_all()?.to_vec1::<f32>()?,
            c_fc.value.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_bytes_per_device() -> Result<()> {
        let mesh = DeviceMesh::cpu(2)?;
        let raw = layer(4)?;
        let total_bytes = raw.num_elements() * 4;
        let replicated = shard_params(&raw, &mesh, false)?;
        let sharded = shard_params(&raw, &mesh, true)?;
        assert_eq!(mesh.bytes_per_device(&replicated), total_bytes);
        // only the bias (8 floats) stays whole
        assert_eq!(mesh.bytes_per_device(&sharded), (total_bytes - 32) / 2 + 32);
        Ok(())
    }

    #[test]
    fn test_scattered_slices_match_reported_bytes() -> Result<()> {
        let mesh = DeviceMesh::cpu(2)?;
        for flag in [true, false] {
            let placed = shard_params(&layer(4)?, &mesh, flag)?;
            let slices = mesh.scatter(&placed)?;
            assert_eq!(slices.len(), 2);
            for local in &slices {
                assert_eq!(local.num_bytes(), mesh.bytes_per_device(&placed));
            }
        }

        let placed = shard_params(&layer(4)?, &mesh, true)?;
        let slices = mesh.scatter(&placed)?;
        assert_eq!(slices[1].get("c_fc")?.shape(), &[4, 4]);
        assert_eq!(slices[1].get("ln")?.shape(), &[2]);
        assert_eq!(slices[1].get("bias")?.shape(), &[8]);
        Ok(())
    }

    #[test]
    fn test_all_gather_rebuilds_every_leaf() -> Result<()> {
        let mesh = DeviceMesh::cpu(2)?;
        let placed = shard_params(&layer(4)?, &mesh, true)?;
        let replicas = mesh.gather_replicas(&placed)?;
        for replica in &replicas {
            replica.ensure_same_structure(&placed)?;
            assert_eq!(placements(replica), placements(&placed));
            for (a, b) in replica.values().iter().zip(placed.values().iter()) {
                assert_eq!(a.flatten_all()?.to_vec1::<f32>()?, b.flatten_all()?.to_vec1::<f32>()?);
            }
        }

        let slices = mesh.scatter(&placed)?;
        assert!(matches!(
            mesh.all_gather(&slices[..1], 0),
            Err(MeshError::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_unplaced_leaves_scatter_whole() -> Result<()> {
        let mesh = DeviceMesh::cpu(2)?;
        let raw = layer(4)?;
        for local in mesh.scatter(&raw)? {
            assert_eq!(local.num_bytes(), raw.num_bytes());
        }
        assert!(mesh.local_shard(raw.get("c_fc")?, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_split_rows() -> Result<()> {
        let mesh = DeviceMesh::cpu(2)?;
        assert_eq!(mesh.axis_name(), "data");
        let batch = Tensor::zeros((4, 8), DType::U32, &Device::Cpu)?;
        let parts = mesh.split_rows(&batch)?;
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].dims(), &[2, 8]);
        let odd = Tensor::zeros((3, 8), DType::U32, &Device::Cpu)?;
        assert!(matches!(mesh.split_rows(&odd), Err(MeshError::Config(_))));
        Ok(())
    }

    #[test]
    fn test_empty_mesh_is_resource_error() {
        assert!(matches!(
            DeviceMesh::new(Vec::new()),
            Err(MeshError::InsufficientDevices { .. })
        ));
    }
}
