//! The standalone mid-computation placement constraint.
//!
//! Semantically the identity function, but the placement it carries must be
//! satisfied by the eventual parallel plan at exactly that point. Inserting
//! the constraint validates the declaration eagerly; executing it outside a
//! compiled, partitioned computation is a usage error.

use mj_core::{AbstractValue, Atom, Equation, Graph, PLACEMENT_PARAM, Primitive, Value, VarId};
use mj_mesh::ResourceEnv;
use mj_placement::{
    ParsedPlacement, PlacementDecl, check_shapes_against_resources, check_unique_resources,
};
use smallvec::smallvec;
use std::collections::BTreeMap;

use crate::errors::ApiError;

/// Appends a sharding constraint on `value` to a graph under construction,
/// returning the extended graph and the constrained result variable.
///
/// The placement is validated against `aval` before anything is inserted,
/// so a malformed or unsatisfiable declaration never reaches compilation.
pub fn with_sharding_constraint(
    graph: &Graph,
    value: VarId,
    aval: &AbstractValue,
    decl: &PlacementDecl,
    env: &ResourceEnv,
) -> Result<(Graph, VarId), ApiError> {
    let placement = ParsedPlacement::from_decl("sharding_constraint placement", decl)?;
    check_unique_resources("sharding_constraint placement", &placement)?;
    check_shapes_against_resources(
        "sharding_constraint arguments",
        env,
        std::slice::from_ref(&aval.shape),
        std::slice::from_ref(&placement),
    )?;

    let mut extended = graph.clone();
    let out = VarId(extended.fresh_var_base());
    let mut params = BTreeMap::new();
    params.insert(PLACEMENT_PARAM.to_owned(), placement.canonical_string());
    extended.equations.push(Equation {
        primitive: Primitive::ShardingConstraint,
        inputs: smallvec![Atom::Var(value)],
        outputs: smallvec![out],
        params,
    });
    Ok((extended, out))
}

/// Value-level form of the constraint operator. The declaration is checked
/// eagerly, but the operator has no standalone runtime semantics, so
/// applying it to concrete values always fails.
pub fn sharding_constraint(
    value: &Value,
    decl: &PlacementDecl,
    env: &ResourceEnv,
) -> Result<Value, ApiError> {
    let placement = ParsedPlacement::from_decl("sharding_constraint placement", decl)?;
    check_unique_resources("sharding_constraint placement", &placement)?;
    check_shapes_against_resources(
        "sharding_constraint arguments",
        env,
        &[value.shape()],
        &[placement],
    )?;
    Err(ApiError::ConstraintOutsideCompiledContext)
}
