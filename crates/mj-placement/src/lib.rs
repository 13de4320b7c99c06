#![forbid(unsafe_code)]

//! Placement declarations and their resolution against a resource
//! environment.
//!
//! A placement declaration states, per positional dimension of a value,
//! which mesh axes partition that dimension. This crate normalizes user
//! declarations into [`ParsedPlacement`], enforces the per-declaration
//! resource-uniqueness rule, validates array shapes for divisibility
//! against the active mesh, and emits the concrete sharding metadata a
//! lowering backend consumes.

pub mod typing;

use mj_core::tree::ArgTree;
use mj_core::{AbstractValue, Shape};
use mj_mesh::{Mesh, ResourceEnv};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    /// Declaration error: a malformed axis name inside a partition spec.
    InvalidAxisName {
        what: String,
        name: String,
    },
    /// Declaration error: an unparseable canonical placement form.
    MalformedCanonicalForm {
        text: String,
    },
    /// Uniqueness error: one declaration claims a mesh axis twice.
    DuplicateResources {
        what: String,
        spec: String,
        axes: Vec<String>,
    },
    /// The declaration has more partitioned dimensions than the value has axes.
    RankTooSmall {
        what: String,
        spec: String,
        spec_rank: usize,
        rank: usize,
    },
    /// The declaration references a resource axis absent from the mesh.
    UndefinedResourceAxis {
        what: String,
        axis: String,
    },
    /// A dimension's size is not divisible by its assigned resource count.
    NotDivisible {
        what: String,
        spec: String,
        dim: usize,
        size: u64,
        divisor: u64,
    },
    /// A token-typed boundary value carried a non-replicated placement.
    TokenRequiresReplicated {
        what: String,
        spec: String,
    },
    /// Paired value/placement lists of different lengths.
    CountMismatch {
        what: String,
        values: usize,
        placements: usize,
    },
}

impl std::fmt::Display for PlacementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAxisName { what, name } => {
                write!(
                    f,
                    "{what} entries must name mesh axes, but got {name:?}"
                )
            }
            Self::MalformedCanonicalForm { text } => {
                write!(f, "malformed canonical placement form: {text:?}")
            }
            Self::DuplicateResources { what, spec, axes } => {
                write!(
                    f,
                    "a single {what} specification can map each mesh axis to at most one \
                     positional dimension, but {spec} has duplicate entries for {}",
                    axes.join(", ")
                )
            }
            Self::RankTooSmall {
                what,
                spec,
                spec_rank,
                rank,
            } => {
                write!(
                    f,
                    "one of {what} was given the resource assignment {spec}, which implies \
                     a rank of at least {spec_rank}, but it is {rank}"
                )
            }
            Self::UndefinedResourceAxis { what, axis } => {
                write!(
                    f,
                    "one of {what} references resource axis '{axis}', which is undefined. \
                     Was the mesh declared?"
                )
            }
            Self::NotDivisible {
                what,
                spec,
                dim,
                size,
                divisor,
            } => {
                write!(
                    f,
                    "one of {what} was given the resource assignment {spec}, which implies \
                     that the size of its dimension {dim} should be divisible by {divisor}, \
                     but it is equal to {size}"
                )
            }
            Self::TokenRequiresReplicated { what, spec } => {
                write!(
                    f,
                    "one of {what} is a token and must be replicated, but was given {spec}"
                )
            }
            Self::CountMismatch {
                what,
                values,
                placements,
            } => {
                write!(
                    f,
                    "{what}: {values} value(s) paired with {placements} placement(s)"
                )
            }
        }
    }
}

impl std::error::Error for PlacementError {}

/// Per-dimension entry of a user partition spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimAssignment {
    /// Replicate this dimension.
    None,
    /// Partition this dimension along one mesh axis.
    Axis(String),
    /// Partition this dimension along several mesh axes jointly.
    Axes(Vec<String>),
}

/// Ordered per-dimension partition declaration, one entry per leading
/// dimension of the value it describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub dims: Vec<DimAssignment>,
}

impl PartitionSpec {
    #[must_use]
    pub fn new(dims: Vec<DimAssignment>) -> Self {
        Self { dims }
    }

    /// Single-dimension spec partitioned along `axis`.
    #[must_use]
    pub fn axis(axis: &str) -> Self {
        Self::new(vec![DimAssignment::Axis(axis.to_owned())])
    }
}

/// A user placement declaration for one value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlacementDecl {
    /// Replicate on every mesh slot.
    Replicated,
    Spec(PartitionSpec),
}

impl PlacementDecl {
    /// Single-dimension declaration partitioned along `axis`.
    #[must_use]
    pub fn axis(axis: &str) -> Self {
        Self::Spec(PartitionSpec::axis(axis))
    }
}

/// A (possibly nested) tree of placement declarations, matched against the
/// argument or result tree by prefix broadcast.
pub type SpecTree = ArgTree<PlacementDecl>;

impl std::fmt::Display for PlacementDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replicated => f.write_str("None"),
            Self::Spec(spec) => {
                f.write_str("P(")?;
                for (index, dim) in spec.dims.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    match dim {
                        DimAssignment::None => f.write_str("None")?,
                        DimAssignment::Axis(axis) => write!(f, "'{axis}'")?,
                        DimAssignment::Axes(axes) => {
                            f.write_str("(")?;
                            for (axis_index, axis) in axes.iter().enumerate() {
                                if axis_index > 0 {
                                    f.write_str(", ")?;
                                }
                                write!(f, "'{axis}'")?;
                            }
                            f.write_str(")")?;
                        }
                    }
                }
                f.write_str(")")
            }
        }
    }
}

/// Normalized placement: one axis-name list per tensor dimension, an empty
/// list meaning "replicated on that dimension". The original declaration's
/// display form is retained so errors and equality stay user-recognizable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParsedPlacement {
    user_spec: String,
    dims: Vec<Vec<String>>,
}

impl ParsedPlacement {
    /// The unique placement with no partitioned dimensions.
    #[must_use]
    pub fn replicated() -> Self {
        Self {
            user_spec: "None".to_owned(),
            dims: Vec::new(),
        }
    }

    /// Normalizes one user declaration. Fails on malformed axis names,
    /// naming the offending value; duplicate axes are left to
    /// [`check_unique_resources`].
    pub fn from_decl(what: &str, decl: &PlacementDecl) -> Result<Self, PlacementError> {
        let spec = match decl {
            PlacementDecl::Replicated => return Ok(Self::replicated()),
            PlacementDecl::Spec(spec) => spec,
        };

        let mut dims = Vec::with_capacity(spec.dims.len());
        for dim in &spec.dims {
            let axes: Vec<String> = match dim {
                DimAssignment::None => Vec::new(),
                DimAssignment::Axis(axis) => vec![axis.clone()],
                DimAssignment::Axes(axes) => axes.clone(),
            };
            for axis in &axes {
                if axis.trim().is_empty() || axis.contains(['[', ']', ',', '|']) {
                    return Err(PlacementError::InvalidAxisName {
                        what: what.to_owned(),
                        name: axis.clone(),
                    });
                }
            }
            dims.push(axes);
        }

        Ok(Self {
            user_spec: decl.to_string(),
            dims,
        })
    }

    #[must_use]
    pub fn is_replicated(&self) -> bool {
        self.dims.is_empty()
    }

    #[must_use]
    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn dims(&self) -> &[Vec<String>] {
        &self.dims
    }

    #[must_use]
    pub fn user_spec(&self) -> &str {
        &self.user_spec
    }

    /// Bracketed per-dimension form, e.g. `[x][y,z][]`. Round-trips through
    /// [`ParsedPlacement::from_canonical_string`]; the display form is
    /// regenerated on parse.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        for dim in &self.dims {
            out.push('[');
            out.push_str(&dim.join(","));
            out.push(']');
        }
        out
    }

    pub fn from_canonical_string(text: &str) -> Result<Self, PlacementError> {
        if text.is_empty() {
            return Ok(Self::replicated());
        }
        let malformed = || PlacementError::MalformedCanonicalForm {
            text: text.to_owned(),
        };

        let mut dims = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let inner = rest
                .strip_prefix('[')
                .ok_or_else(malformed)?;
            let close = inner.find(']').ok_or_else(malformed)?;
            let (body, tail) = inner.split_at(close);
            if body.is_empty() {
                dims.push(Vec::new());
            } else {
                dims.push(body.split(',').map(str::to_owned).collect());
            }
            rest = &tail[1..];
        }

        let decl_dims = dims
            .iter()
            .map(|axes| match axes.len() {
                0 => DimAssignment::None,
                1 => DimAssignment::Axis(axes[0].clone()),
                _ => DimAssignment::Axes(axes.clone()),
            })
            .collect();
        let user_spec = PlacementDecl::Spec(PartitionSpec::new(decl_dims)).to_string();

        Ok(Self { user_spec, dims })
    }
}

impl std::fmt::Display for ParsedPlacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.user_spec)
    }
}

/// Parses every leaf of a declaration tree and enforces per-declaration
/// resource uniqueness.
pub fn parse_spec_tree(
    what: &str,
    tree: &SpecTree,
) -> Result<ArgTree<ParsedPlacement>, PlacementError> {
    let parsed = map_tree(tree, &mut |decl| ParsedPlacement::from_decl(what, decl))?;
    let (leaves, _) = parsed.flatten_ref();
    for placement in leaves {
        check_unique_resources(what, placement)?;
    }
    Ok(parsed)
}

fn map_tree<T, U, E>(
    tree: &ArgTree<T>,
    f: &mut impl FnMut(&T) -> Result<U, E>,
) -> Result<ArgTree<U>, E> {
    match tree {
        ArgTree::Leaf(value) => Ok(ArgTree::Leaf(f(value)?)),
        ArgTree::Tuple(items) => Ok(ArgTree::Tuple(
            items
                .iter()
                .map(|item| map_tree(item, f))
                .collect::<Result<Vec<_>, E>>()?,
        )),
    }
}

/// One value cannot be partitioned along two positional dimensions by the
/// same physical resource; such a layout is unsatisfiable. Counts every
/// occurrence, so an axis repeated within a single dimension entry is also
/// rejected.
pub fn check_unique_resources(
    what: &str,
    placement: &ParsedPlacement,
) -> Result<(), PlacementError> {
    if placement.is_replicated() {
        return Ok(());
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for dim in placement.dims() {
        for axis in dim {
            *counts.entry(axis.as_str()).or_insert(0) += 1;
        }
    }

    let duplicated: Vec<String> = counts
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(axis, _)| (*axis).to_owned())
        .collect();
    if duplicated.is_empty() {
        Ok(())
    } else {
        Err(PlacementError::DuplicateResources {
            what: what.to_owned(),
            spec: placement.to_string(),
            axes: duplicated,
        })
    }
}

/// Divisor implied by one dimension entry: the product of the assigned
/// resource-axis sizes under `env`.
fn dim_resource_size(
    what: &str,
    env: &ResourceEnv,
    axes: &[String],
) -> Result<u64, PlacementError> {
    axes.iter().try_fold(1_u64, |size, axis| {
        let axis_size = env
            .axis_size(axis)
            .ok_or_else(|| PlacementError::UndefinedResourceAxis {
                what: what.to_owned(),
                axis: axis.clone(),
            })?;
        Ok(size.saturating_mul(axis_size))
    })
}

/// Validates paired shapes against placements: rank coverage, resource
/// existence, and per-dimension divisibility. Runs identically for declared
/// inputs, declared outputs once their shapes are known, and standalone
/// sharding constraints.
pub fn check_shapes_against_resources(
    what: &str,
    env: &ResourceEnv,
    shapes: &[Shape],
    placements: &[ParsedPlacement],
) -> Result<(), PlacementError> {
    if shapes.len() != placements.len() {
        return Err(PlacementError::CountMismatch {
            what: what.to_owned(),
            values: shapes.len(),
            placements: placements.len(),
        });
    }

    for (shape, placement) in shapes.iter().zip(placements.iter()) {
        if shape.rank() < placement.num_dims() {
            return Err(PlacementError::RankTooSmall {
                what: what.to_owned(),
                spec: placement.to_string(),
                spec_rank: placement.num_dims(),
                rank: shape.rank(),
            });
        }
        for (dim, axes) in placement.dims().iter().enumerate() {
            let size = dim_resource_size(what, env, axes)?;
            let dim_size = u64::from(shape.dims[dim]);
            if dim_size % size != 0 {
                return Err(PlacementError::NotDivisible {
                    what: what.to_owned(),
                    spec: placement.to_string(),
                    dim,
                    size: dim_size,
                    divisor: size,
                });
            }
        }
    }

    Ok(())
}

/// Convenience wrapper of [`check_shapes_against_resources`] for abstract
/// descriptors.
pub fn check_avals_against_resources(
    what: &str,
    env: &ResourceEnv,
    avals: &[AbstractValue],
    placements: &[ParsedPlacement],
) -> Result<(), PlacementError> {
    let shapes: Vec<Shape> = avals.iter().map(|aval| aval.shape.clone()).collect();
    check_shapes_against_resources(what, env, &shapes, placements)
}

/// Ordered resource-axis to positional-dimension assignment, built by
/// walking a placement's dimensions in order. Injective within one
/// placement once [`check_unique_resources`] has passed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ArrayMapping {
    entries: Vec<(String, usize)>,
}

impl ArrayMapping {
    #[must_use]
    pub fn entries(&self) -> &[(String, usize)] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries.iter().map(|(axis, dim)| (axis.as_str(), *dim))
    }

    /// Resource axes claimed by this mapping.
    #[must_use]
    pub fn resource_axes(&self) -> Vec<&str> {
        self.entries.iter().map(|(axis, _)| axis.as_str()).collect()
    }
}

#[must_use]
pub fn resolve_array_mapping(placement: &ParsedPlacement) -> ArrayMapping {
    let mut entries = Vec::new();
    for (dim, axes) in placement.dims().iter().enumerate() {
        for axis in axes {
            entries.push((axis.clone(), dim));
        }
    }
    ArrayMapping { entries }
}

/// Boundary value descriptor as seen by the sharding emitter. Tokens carry
/// no data shape and always travel replicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueDescriptor {
    Token,
    Shaped(AbstractValue),
}

/// Lowering-ready description of which resource owns which slice of which
/// dimension: the ordered axis-to-dimension mapping plus the per-dimension
/// shard counts it implies under a concrete mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingMeta {
    pub mapping: ArrayMapping,
    pub dim_shards: Vec<u64>,
}

impl ShardingMeta {
    #[must_use]
    pub fn replicated(rank: usize) -> Self {
        Self {
            mapping: ArrayMapping::default(),
            dim_shards: vec![1; rank],
        }
    }

    #[must_use]
    pub fn is_fully_replicated(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Number of distinct shards of the value (product of per-dimension
    /// shard counts).
    #[must_use]
    pub fn shard_count(&self) -> u64 {
        self.dim_shards.iter().product()
    }

    /// Canonical text form for fingerprints and diagnostics.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        for (axis, dim) in self.mapping.iter() {
            let _ = write!(&mut out, "{axis}->{dim};");
        }
        out.push('/');
        for shards in &self.dim_shards {
            let _ = write!(&mut out, "{shards},");
        }
        out
    }
}

/// Combines a resolved placement with the mesh's axis sizes into concrete
/// sharding metadata for one boundary value.
pub fn emit_sharding(
    what: &str,
    descriptor: &ValueDescriptor,
    placement: &ParsedPlacement,
    mesh: &Mesh,
) -> Result<ShardingMeta, PlacementError> {
    let aval = match descriptor {
        ValueDescriptor::Token => {
            if !placement.is_replicated() {
                return Err(PlacementError::TokenRequiresReplicated {
                    what: what.to_owned(),
                    spec: placement.to_string(),
                });
            }
            return Ok(ShardingMeta::replicated(0));
        }
        ValueDescriptor::Shaped(aval) => aval,
    };

    let rank = aval.shape.rank();
    if rank < placement.num_dims() {
        return Err(PlacementError::RankTooSmall {
            what: what.to_owned(),
            spec: placement.to_string(),
            spec_rank: placement.num_dims(),
            rank,
        });
    }

    let mapping = resolve_array_mapping(placement);
    let mut dim_shards = vec![1_u64; rank];
    for (axis, dim) in mapping.iter() {
        let size = mesh
            .axis_size(axis)
            .ok_or_else(|| PlacementError::UndefinedResourceAxis {
                what: what.to_owned(),
                axis: axis.to_owned(),
            })?;
        dim_shards[dim] = dim_shards[dim].saturating_mul(size);
    }

    Ok(ShardingMeta {
        mapping,
        dim_shards,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        check_shapes_against_resources, check_unique_resources, emit_sharding, parse_spec_tree,
        resolve_array_mapping, DimAssignment, ParsedPlacement, PartitionSpec, PlacementDecl,
        PlacementError, ValueDescriptor,
    };
    use mj_core::tree::ArgTree;
    use mj_core::{AbstractValue, DType, Shape};
    use mj_mesh::{mesh_from_pairs, ResourceEnv};
    use proptest::prelude::*;

    fn env_xy() -> ResourceEnv {
        ResourceEnv::new(mesh_from_pairs(&[("x", 2), ("y", 3)]).expect("mesh should build"))
    }

    fn spec(dims: Vec<DimAssignment>) -> PlacementDecl {
        PlacementDecl::Spec(PartitionSpec::new(dims))
    }

    fn parse(decl: &PlacementDecl) -> ParsedPlacement {
        ParsedPlacement::from_decl("test placement", decl).expect("parse should succeed")
    }

    #[test]
    fn replicated_has_zero_dims_and_always_validates() {
        let replicated = ParsedPlacement::replicated();
        assert!(replicated.is_replicated());
        assert_eq!(replicated.num_dims(), 0);

        let env = env_xy();
        for shape in [Shape::scalar(), Shape::vector(7), Shape { dims: vec![5, 5] }] {
            check_shapes_against_resources(
                "arguments",
                &env,
                &[shape],
                std::slice::from_ref(&replicated),
            )
            .expect("replicated placement should pass any shape");
        }
    }

    #[test]
    fn parse_normalizes_dim_assignments() {
        let decl = spec(vec![
            DimAssignment::Axis("x".to_owned()),
            DimAssignment::None,
            DimAssignment::Axes(vec!["y".to_owned()]),
        ]);
        let parsed = parse(&decl);
        assert_eq!(parsed.num_dims(), 3);
        assert_eq!(parsed.dims()[0], vec!["x".to_owned()]);
        assert!(parsed.dims()[1].is_empty());
        assert_eq!(parsed.dims()[2], vec!["y".to_owned()]);
        assert_eq!(parsed.to_string(), "P('x', None, ('y'))");
    }

    #[test]
    fn parse_rejects_malformed_axis_names() {
        let decl = spec(vec![DimAssignment::Axis("  ".to_owned())]);
        let err = ParsedPlacement::from_decl("in_placements", &decl)
            .expect_err("blank axis name should fail");
        assert!(matches!(err, PlacementError::InvalidAxisName { .. }));
        assert!(err.to_string().contains("in_placements"));
    }

    #[test]
    fn uniqueness_rejects_axis_in_two_dims() {
        let parsed = parse(&spec(vec![
            DimAssignment::Axis("x".to_owned()),
            DimAssignment::Axis("x".to_owned()),
        ]));
        let err =
            check_unique_resources("in_placements", &parsed).expect_err("duplicate should fail");
        match err {
            PlacementError::DuplicateResources { axes, .. } => {
                assert_eq!(axes, vec!["x".to_owned()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn uniqueness_rejects_axis_twice_within_one_dim() {
        let parsed = parse(&spec(vec![DimAssignment::Axes(vec![
            "y".to_owned(),
            "y".to_owned(),
        ])]));
        assert!(check_unique_resources("in_placements", &parsed).is_err());
    }

    #[test]
    fn uniqueness_reports_every_duplicated_axis() {
        let parsed = parse(&spec(vec![
            DimAssignment::Axes(vec!["x".to_owned(), "y".to_owned()]),
            DimAssignment::Axes(vec!["y".to_owned(), "x".to_owned()]),
        ]));
        let err = check_unique_resources("out_placements", &parsed).expect_err("should fail");
        match err {
            PlacementError::DuplicateResources { axes, .. } => {
                assert_eq!(axes, vec!["x".to_owned(), "y".to_owned()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn shape_check_rejects_rank_deficit() {
        let env = env_xy();
        let parsed = parse(&spec(vec![
            DimAssignment::Axis("x".to_owned()),
            DimAssignment::Axis("y".to_owned()),
        ]));
        let err = check_shapes_against_resources("arguments", &env, &[Shape::vector(6)], &[parsed])
            .expect_err("rank 1 cannot satisfy 2 partitioned dims");
        assert!(matches!(err, PlacementError::RankTooSmall { .. }));
    }

    #[test]
    fn shape_check_names_undefined_axis() {
        let env = env_xy();
        let parsed = parse(&spec(vec![DimAssignment::Axis("z".to_owned())]));
        let err = check_shapes_against_resources("arguments", &env, &[Shape::vector(6)], &[parsed])
            .expect_err("axis z is undefined");
        match err {
            PlacementError::UndefinedResourceAxis { axis, .. } => assert_eq!(axis, "z"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn shape_check_reports_divisibility_details() {
        let env = env_xy();
        let parsed = parse(&spec(vec![DimAssignment::Axis("x".to_owned())]));
        let err = check_shapes_against_resources("arguments", &env, &[Shape::vector(7)], &[parsed])
            .expect_err("7 is not divisible by 2");
        match err {
            PlacementError::NotDivisible {
                dim,
                size,
                divisor,
                ..
            } => {
                assert_eq!((dim, size, divisor), (0, 7, 2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn joint_axes_multiply_their_divisor() {
        let env = env_xy();
        let parsed = parse(&spec(vec![DimAssignment::Axes(vec![
            "x".to_owned(),
            "y".to_owned(),
        ])]));
        check_shapes_against_resources("arguments", &env, &[Shape::vector(12)], &[parsed.clone()])
            .expect("12 is divisible by 6");
        assert!(
            check_shapes_against_resources("arguments", &env, &[Shape::vector(8)], &[parsed])
                .is_err()
        );
    }

    #[test]
    fn spec_tree_parse_runs_uniqueness_on_every_leaf() {
        let bad = ArgTree::tuple(vec![
            ArgTree::leaf(PlacementDecl::Replicated),
            ArgTree::leaf(spec(vec![
                DimAssignment::Axis("x".to_owned()),
                DimAssignment::Axis("x".to_owned()),
            ])),
        ]);
        assert!(parse_spec_tree("in_placements", &bad).is_err());
    }

    #[test]
    fn array_mapping_orders_by_dimension_then_declaration() {
        let parsed = parse(&spec(vec![
            DimAssignment::Axes(vec!["y".to_owned(), "x".to_owned()]),
            DimAssignment::Axis("z".to_owned()),
        ]));
        let mapping = resolve_array_mapping(&parsed);
        let entries: Vec<(&str, usize)> = mapping.iter().collect();
        assert_eq!(entries, vec![("y", 0), ("x", 0), ("z", 1)]);
    }

    #[test]
    fn emit_computes_per_dimension_shard_counts() {
        let env = env_xy();
        let parsed = parse(&spec(vec![
            DimAssignment::Axis("x".to_owned()),
            DimAssignment::Axis("y".to_owned()),
        ]));
        let descriptor = ValueDescriptor::Shaped(AbstractValue {
            dtype: DType::F64,
            shape: Shape { dims: vec![4, 9] },
        });
        let meta = emit_sharding("outputs", &descriptor, &parsed, env.mesh())
            .expect("emit should succeed");
        assert_eq!(meta.dim_shards, vec![2, 3]);
        assert_eq!(meta.shard_count(), 6);
        assert!(!meta.is_fully_replicated());
    }

    #[test]
    fn token_boundary_values_must_be_replicated() {
        let env = env_xy();
        let meta = emit_sharding(
            "outputs",
            &ValueDescriptor::Token,
            &ParsedPlacement::replicated(),
            env.mesh(),
        )
        .expect("replicated token should pass");
        assert!(meta.is_fully_replicated());
        assert_eq!(meta.dim_shards.len(), 0);

        let partitioned = parse(&spec(vec![DimAssignment::Axis("x".to_owned())]));
        let err = emit_sharding("outputs", &ValueDescriptor::Token, &partitioned, env.mesh())
            .expect_err("partitioned token should fail");
        assert!(matches!(err, PlacementError::TokenRequiresReplicated { .. }));
    }

    #[test]
    fn canonical_string_roundtrip() {
        let parsed = parse(&spec(vec![
            DimAssignment::Axes(vec!["x".to_owned(), "y".to_owned()]),
            DimAssignment::None,
            DimAssignment::Axis("z".to_owned()),
        ]));
        let canonical = parsed.canonical_string();
        assert_eq!(canonical, "[x,y][][z]");
        let reparsed =
            ParsedPlacement::from_canonical_string(&canonical).expect("roundtrip should parse");
        assert_eq!(reparsed.dims(), parsed.dims());

        assert!(ParsedPlacement::from_canonical_string("").expect("empty").is_replicated());
        assert!(ParsedPlacement::from_canonical_string("[x").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// check passes iff rank covers the declared dims and each declared
        /// dimension size is divisible by its resource product.
        #[test]
        fn shape_check_matches_divisibility_predicate(
            dim0 in 1_u32..64,
            dim1 in 1_u32..64,
            use_x in any::<bool>(),
            use_y in any::<bool>(),
        ) {
            let env = env_xy();
            let mut dims = Vec::new();
            let mut divisors = Vec::new();
            if use_x {
                dims.push(DimAssignment::Axis("x".to_owned()));
                divisors.push(2_u64);
            }
            if use_y {
                dims.push(DimAssignment::Axis("y".to_owned()));
                divisors.push(3_u64);
            }
            let parsed = parse(&spec(dims));
            let shape = Shape { dims: vec![dim0, dim1] };

            let expected = divisors
                .iter()
                .enumerate()
                .all(|(index, divisor)| u64::from(shape.dims[index]) % divisor == 0);
            let actual = check_shapes_against_resources(
                "arguments",
                &env,
                &[shape],
                &[parsed],
            )
            .is_ok();
            prop_assert_eq!(actual, expected);
        }
    }
}
