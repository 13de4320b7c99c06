#![forbid(unsafe_code)]

//! Lowering/runtime boundary for partitioned programs.
//!
//! The partitioning engine hands a graph plus resolved boundary sharding
//! metadata to a [`Lowering`], and gets back a [`PartitionedExecutable`]
//! that runs the program and reports how each output is laid out across
//! mesh slots. The in-process reference implementation lives in [`sim`].

pub mod sim;

use mj_core::{AbstractValue, Graph, Shape, Value};
use mj_interpreters::InterpreterError;
use mj_mesh::{Mesh, MeshError};
use mj_placement::{PlacementError, ShardingMeta};
use std::sync::Arc;

/// Everything a lowering needs to produce an executable honoring input and
/// output shardings and donation flags.
#[derive(Debug)]
pub struct LoweringRequest<'a> {
    pub graph: &'a Graph,
    pub name: &'a str,
    pub mesh: &'a Mesh,
    pub consts: &'a [Value],
    pub in_avals: &'a [AbstractValue],
    pub out_avals: &'a [AbstractValue],
    pub in_shardings: &'a [ShardingMeta],
    pub out_shardings: &'a [ShardingMeta],
    pub donated: &'a [bool],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoweringError {
    InvalidRequest { detail: String },
    Mesh(MeshError),
    Constraint(PlacementError),
    AbstractEval(InterpreterError),
}

impl std::fmt::Display for LoweringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest { detail } => write!(f, "invalid lowering request: {detail}"),
            Self::Mesh(err) => write!(f, "mesh error: {err}"),
            Self::Constraint(err) => write!(f, "sharding constraint error: {err}"),
            Self::AbstractEval(err) => write!(f, "abstract evaluation failed: {err}"),
        }
    }
}

impl std::error::Error for LoweringError {}

impl From<MeshError> for LoweringError {
    fn from(value: MeshError) -> Self {
        Self::Mesh(value)
    }
}

impl From<PlacementError> for LoweringError {
    fn from(value: PlacementError) -> Self {
        Self::Constraint(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    InputArity { expected: usize, actual: usize },
    ArgumentMismatch { index: usize, expected: String, actual: String },
    Interpreter(InterpreterError),
    ShardSlice { detail: String },
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputArity { expected, actual } => {
                write!(f, "executable expects {expected} argument(s), got {actual}")
            }
            Self::ArgumentMismatch {
                index,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "argument {index} does not match the compiled signature: \
                     expected {expected}, got {actual}"
                )
            }
            Self::Interpreter(err) => write!(f, "execution failed: {err}"),
            Self::ShardSlice { detail } => write!(f, "shard slice error: {detail}"),
        }
    }
}

impl std::error::Error for ExecutionError {}

impl From<InterpreterError> for ExecutionError {
    fn from(value: InterpreterError) -> Self {
        Self::Interpreter(value)
    }
}

/// Half-open per-dimension slice of a value owned by one mesh slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub slot: u64,
    pub slices: Vec<(u64, u64)>,
}

/// Per-slot layout of one boundary value: which contiguous block of each
/// dimension every mesh slot holds. Slots not splitting a dimension hold a
/// replica of the full range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    pub shards: Vec<ShardDescriptor>,
}

impl ShardLayout {
    /// Derives the per-slot layout from a value's shape, its sharding
    /// metadata, and the mesh geometry. Slots are enumerated in row-major
    /// mesh order; along each partitioned dimension the shard index is the
    /// row-major combination of the mapped axes' coordinates.
    pub fn build(shape: &Shape, meta: &ShardingMeta, mesh: &Mesh) -> Result<Self, LoweringError> {
        let rank = shape.rank();
        if meta.dim_shards.len() != rank {
            return Err(LoweringError::InvalidRequest {
                detail: format!(
                    "sharding metadata covers {} dimension(s), value has {}",
                    meta.dim_shards.len(),
                    rank
                ),
            });
        }

        let slot_count = mesh.slot_count()?;
        let axis_sizes: Vec<u64> = mesh.axes().iter().map(|axis| axis.size()).collect();

        let mut shards = Vec::with_capacity(slot_count as usize);
        for slot in 0..slot_count {
            // Row-major decomposition of the slot into per-axis coordinates.
            let mut coords = vec![0_u64; axis_sizes.len()];
            let mut rest = slot;
            for (index, size) in axis_sizes.iter().enumerate().rev() {
                coords[index] = rest % size;
                rest /= size;
            }

            let mut slices = Vec::with_capacity(rank);
            for (dim, &dim_size) in shape.dims.iter().enumerate() {
                let dim_size = u64::from(dim_size);
                let shard_count = meta.dim_shards[dim];
                let mut shard_index = 0_u64;
                for (axis, mapped_dim) in meta.mapping.iter() {
                    if mapped_dim != dim {
                        continue;
                    }
                    let axis_pos = mesh.axis_index(axis).ok_or_else(|| {
                        LoweringError::Constraint(PlacementError::UndefinedResourceAxis {
                            what: "sharding metadata".to_owned(),
                            axis: axis.to_owned(),
                        })
                    })?;
                    shard_index = shard_index * axis_sizes[axis_pos] + coords[axis_pos];
                }
                let block = dim_size / shard_count;
                slices.push((shard_index * block, (shard_index + 1) * block));
            }

            shards.push(ShardDescriptor { slot, slices });
        }

        Ok(Self { shards })
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.shards.len()
    }
}

pub trait PartitionedExecutable: Send + Sync + std::fmt::Debug {
    /// Runs the compiled program on global values, returning global results.
    fn execute(&self, args: &[Value]) -> Result<Vec<Value>, ExecutionError>;

    /// Per-output distributed layouts of the results.
    fn output_layouts(&self) -> &[ShardLayout];

    /// Which argument buffers the executable may reuse.
    fn donated(&self) -> &[bool];
}

pub trait Lowering: Send + Sync {
    fn lower_and_compile(
        &self,
        request: &LoweringRequest<'_>,
    ) -> Result<Arc<dyn PartitionedExecutable>, LoweringError>;
}

#[cfg(test)]
mod tests {
    use super::ShardLayout;
    use mj_core::{AbstractValue, DType, Shape};
    use mj_mesh::mesh_from_pairs;
    use mj_placement::{
        DimAssignment, ParsedPlacement, PartitionSpec, PlacementDecl, ValueDescriptor,
        emit_sharding,
    };

    fn meta_for(shape: &Shape, dims: Vec<DimAssignment>, mesh: &mj_mesh::Mesh) -> mj_placement::ShardingMeta {
        let placement = ParsedPlacement::from_decl(
            "test",
            &PlacementDecl::Spec(PartitionSpec::new(dims)),
        )
        .expect("placement should parse");
        emit_sharding(
            "test",
            &ValueDescriptor::Shaped(AbstractValue {
                dtype: DType::F64,
                shape: shape.clone(),
            }),
            &placement,
            mesh,
        )
        .expect("emit should succeed")
    }

    #[test]
    fn one_axis_splits_into_contiguous_blocks() {
        let mesh = mesh_from_pairs(&[("x", 2)]).expect("mesh");
        let shape = Shape::vector(8);
        let meta = meta_for(&shape, vec![DimAssignment::Axis("x".to_owned())], &mesh);
        let layout = ShardLayout::build(&shape, &meta, &mesh).expect("layout should build");

        assert_eq!(layout.slot_count(), 2);
        assert_eq!(layout.shards[0].slices, vec![(0, 4)]);
        assert_eq!(layout.shards[1].slices, vec![(4, 8)]);
    }

    #[test]
    fn unmapped_axes_replicate() {
        let mesh = mesh_from_pairs(&[("x", 2), ("y", 2)]).expect("mesh");
        let shape = Shape::vector(8);
        let meta = meta_for(&shape, vec![DimAssignment::Axis("x".to_owned())], &mesh);
        let layout = ShardLayout::build(&shape, &meta, &mesh).expect("layout should build");

        // Slots 0 and 1 differ only in y, so they hold the same block.
        assert_eq!(layout.slot_count(), 4);
        assert_eq!(layout.shards[0].slices, layout.shards[1].slices);
        assert_ne!(layout.shards[0].slices, layout.shards[2].slices);
    }

    #[test]
    fn two_dims_partition_independently() {
        let mesh = mesh_from_pairs(&[("x", 2), ("y", 2)]).expect("mesh");
        let shape = Shape { dims: vec![4, 6] };
        let meta = meta_for(
            &shape,
            vec![
                DimAssignment::Axis("x".to_owned()),
                DimAssignment::Axis("y".to_owned()),
            ],
            &mesh,
        );
        let layout = ShardLayout::build(&shape, &meta, &mesh).expect("layout should build");

        assert_eq!(layout.shards[0].slices, vec![(0, 2), (0, 3)]);
        assert_eq!(layout.shards[1].slices, vec![(0, 2), (3, 6)]);
        assert_eq!(layout.shards[2].slices, vec![(2, 4), (0, 3)]);
        assert_eq!(layout.shards[3].slices, vec![(2, 4), (3, 6)]);
    }

    #[test]
    fn replicated_scalar_layout_has_empty_slices() {
        let mesh = mesh_from_pairs(&[("x", 2)]).expect("mesh");
        let meta = mj_placement::ShardingMeta::replicated(0);
        let layout =
            ShardLayout::build(&Shape::scalar(), &meta, &mesh).expect("layout should build");
        assert_eq!(layout.slot_count(), 2);
        assert!(layout.shards.iter().all(|shard| shard.slices.is_empty()));
    }
}
