//! Resource typing across the named-axis and positional-placement
//! mechanisms.
//!
//! A mesh axis can back either a named semantic axis or a positional
//! partition dimension for a given value, never both at once. This pass
//! rejects calls whose positional placements claim mesh axes that an
//! enclosing named-axis partitioning already spent on the same value, and
//! walks the call body so internal sharding constraints are held to the
//! same rule.

use crate::{ParsedPlacement, PlacementError};
use mj_core::{Atom, Graph, PLACEMENT_PARAM, Primitive, VarId};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingError {
    /// A positional placement and a named-axis binding claim the same mesh
    /// axes for one value.
    ResourceConflict {
        what: String,
        spec: String,
        axes: Vec<String>,
    },
    /// Per-input named-axis sets do not pair with the call inputs.
    InputCountMismatch { inputs: usize, named_sets: usize },
    /// Per-output placements do not pair with the call outputs.
    OutputCountMismatch { outputs: usize, placements: usize },
    /// A sharding-constraint equation carried an unreadable placement.
    MalformedConstraint { detail: String },
    /// A constraint equation referenced a variable with no known binding.
    UnboundConstraintInput { var: VarId },
}

impl std::fmt::Display for TypingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResourceConflict { what, spec, axes } => {
                write!(
                    f,
                    "{what} has an axis resources specification of {spec} that uses one or \
                     more mesh axes already used to partition a named axis appearing in its \
                     named shape (both use mesh axes {})",
                    axes.join(", ")
                )
            }
            Self::InputCountMismatch { inputs, named_sets } => {
                write!(
                    f,
                    "named-axis context covers {named_sets} input(s), call has {inputs}"
                )
            }
            Self::OutputCountMismatch {
                outputs,
                placements,
            } => {
                write!(
                    f,
                    "call has {outputs} output(s), but {placements} output placement(s)"
                )
            }
            Self::MalformedConstraint { detail } => {
                write!(f, "sharding constraint carries a malformed placement: {detail}")
            }
            Self::UnboundConstraintInput { var } => {
                write!(f, "sharding constraint input v{} has no binding", var.0)
            }
        }
    }
}

impl std::error::Error for TypingError {}

impl From<PlacementError> for TypingError {
    fn from(value: PlacementError) -> Self {
        Self::MalformedConstraint {
            detail: value.to_string(),
        }
    }
}

/// Named-axis bindings established by an enclosing partitioning mechanism:
/// which mesh resources back each named axis, and which named axes each
/// boundary input carries. Empty at the top level.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NamedAxisContext {
    bindings: BTreeMap<String, BTreeSet<String>>,
    per_input_named: Vec<BTreeSet<String>>,
}

impl NamedAxisContext {
    /// Context with no named axes on any of `num_inputs` inputs.
    #[must_use]
    pub fn empty(num_inputs: usize) -> Self {
        Self {
            bindings: BTreeMap::new(),
            per_input_named: vec![BTreeSet::new(); num_inputs],
        }
    }

    #[must_use]
    pub fn new(
        bindings: BTreeMap<String, BTreeSet<String>>,
        per_input_named: Vec<BTreeSet<String>>,
    ) -> Self {
        Self {
            bindings,
            per_input_named,
        }
    }

    #[must_use]
    pub fn per_input_named(&self) -> &[BTreeSet<String>] {
        &self.per_input_named
    }

    /// Mesh resources backing the given named axes. Named axes without a
    /// binding contribute nothing.
    #[must_use]
    pub fn resources_for(&self, named: &BTreeSet<String>) -> BTreeSet<String> {
        named
            .iter()
            .filter_map(|axis| self.bindings.get(axis))
            .flat_map(|resources| resources.iter().cloned())
            .collect()
    }
}

/// Rejects a positional placement whose resource axes intersect the
/// resources backing the value's named axes.
pub fn check_resources_against_named_axes(
    what: &str,
    named: &BTreeSet<String>,
    placement: &ParsedPlacement,
    ctx: &NamedAxisContext,
) -> Result<(), TypingError> {
    let named_resources = ctx.resources_for(named);
    if named_resources.is_empty() {
        return Ok(());
    }

    let overlap: Vec<String> = placement
        .dims()
        .iter()
        .flatten()
        .filter(|axis| named_resources.contains(*axis))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if overlap.is_empty() {
        Ok(())
    } else {
        Err(TypingError::ResourceConflict {
            what: what.to_owned(),
            spec: placement.to_string(),
            axes: overlap,
        })
    }
}

/// Full typing pass over one partitioned call: every input, every output,
/// and every sharding constraint inside the body. Named axes propagate
/// through equations as the union of their operands' named axes.
pub fn resource_typecheck_call(
    name: &str,
    graph: &Graph,
    ctx: &NamedAxisContext,
    in_placements: &[ParsedPlacement],
    out_placements: &[ParsedPlacement],
) -> Result<(), TypingError> {
    if ctx.per_input_named().len() != graph.invars.len() {
        return Err(TypingError::InputCountMismatch {
            inputs: graph.invars.len(),
            named_sets: ctx.per_input_named().len(),
        });
    }
    if in_placements.len() != graph.invars.len() {
        return Err(TypingError::InputCountMismatch {
            inputs: graph.invars.len(),
            named_sets: in_placements.len(),
        });
    }
    if out_placements.len() != graph.outvars.len() {
        return Err(TypingError::OutputCountMismatch {
            outputs: graph.outvars.len(),
            placements: out_placements.len(),
        });
    }

    let mut named_of: FxHashMap<VarId, BTreeSet<String>> = FxHashMap::default();
    for (var, named) in graph.invars.iter().zip(ctx.per_input_named().iter()) {
        named_of.insert(*var, named.clone());
    }
    for var in &graph.constvars {
        named_of.insert(*var, BTreeSet::new());
    }

    for (named, placement) in ctx.per_input_named().iter().zip(in_placements.iter()) {
        check_resources_against_named_axes(
            &format!("partitioned call '{name}' input"),
            named,
            placement,
            ctx,
        )?;
    }

    for eqn in &graph.equations {
        let mut union: BTreeSet<String> = BTreeSet::new();
        for atom in &eqn.inputs {
            if let Atom::Var(var) = atom {
                let named = named_of
                    .get(var)
                    .ok_or(TypingError::UnboundConstraintInput { var: *var })?;
                union.extend(named.iter().cloned());
            }
        }

        if eqn.primitive == Primitive::ShardingConstraint {
            let text = eqn
                .params
                .get(PLACEMENT_PARAM)
                .map(String::as_str)
                .unwrap_or_default();
            let placement = ParsedPlacement::from_canonical_string(text)?;
            check_resources_against_named_axes(
                &format!("sharding constraint in '{name}'"),
                &union,
                &placement,
                ctx,
            )?;
        }

        for out_var in &eqn.outputs {
            named_of.insert(*out_var, union.clone());
        }
    }

    for (var, placement) in graph.outvars.iter().zip(out_placements.iter()) {
        let named = named_of
            .get(var)
            .ok_or(TypingError::UnboundConstraintInput { var: *var })?;
        check_resources_against_named_axes(
            &format!("partitioned call '{name}' output"),
            named,
            placement,
            ctx,
        )?;
    }

    Ok(())
}
