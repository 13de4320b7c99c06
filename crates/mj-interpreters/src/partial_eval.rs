//! Partial evaluation: split a graph into known and unknown sub-graphs.
//!
//! Given a graph and a boolean mask indicating which inputs are unknown at
//! trace time, partial evaluation produces:
//! - `graph_known`: equations whose inputs all derive from known values
//! - `graph_unknown`: residual equations that depend on unknown inputs
//! - `residual_vars`: values produced by `graph_known` and consumed by
//!   `graph_unknown`, passed between the two as extra outputs/inputs
//!
//! Invariant: eval(graph_known, known) ++ eval(graph_unknown, residuals ++
//! unknown) == eval(graph, all inputs).

use mj_core::{Atom, Equation, Graph, VarId};
use rustc_hash::FxHashSet;

#[derive(Debug, Clone)]
pub struct PartialEvalResult {
    /// Graph containing only equations with all-known inputs. Outputs are
    /// the original known outputs followed by the residuals.
    pub graph_known: Graph,

    /// Graph containing equations that depend on unknown inputs. Inputs are
    /// the residuals followed by the original unknown inputs.
    pub graph_unknown: Graph,

    /// Intermediate values flowing from the known to the unknown graph.
    pub residual_vars: Vec<VarId>,

    /// Which of the original graph's outputs are unknown.
    pub out_unknowns: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialEvalError {
    InputMaskMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for PartialEvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputMaskMismatch { expected, actual } => {
                write!(
                    f,
                    "input mask length mismatch: graph has {} inputs, mask has {} entries",
                    expected, actual
                )
            }
        }
    }
}

impl std::error::Error for PartialEvalError {}

/// Partially evaluate a graph given a mask of which inputs are unknown.
pub fn partial_eval_graph(
    graph: &Graph,
    unknowns: &[bool],
) -> Result<PartialEvalResult, PartialEvalError> {
    if unknowns.len() != graph.invars.len() {
        return Err(PartialEvalError::InputMaskMismatch {
            expected: graph.invars.len(),
            actual: unknowns.len(),
        });
    }

    let mut unknown_vars: FxHashSet<VarId> = FxHashSet::default();
    for (var, &is_unknown) in graph.invars.iter().zip(unknowns.iter()) {
        if is_unknown {
            unknown_vars.insert(*var);
        }
    }

    let mut known_eqns: Vec<Equation> = Vec::new();
    let mut unknown_eqns: Vec<Equation> = Vec::new();

    for eqn in &graph.equations {
        let any_input_unknown = eqn.inputs.iter().any(|atom| match atom {
            Atom::Var(v) => unknown_vars.contains(v),
            Atom::Lit(_) => false,
        });

        if any_input_unknown {
            for out_var in &eqn.outputs {
                unknown_vars.insert(*out_var);
            }
            unknown_eqns.push(eqn.clone());
        } else {
            known_eqns.push(eqn.clone());
        }
    }

    // Known-side values consumed by unknown equations become residuals, in
    // first-use order: known inputs first, then known equation outputs.
    let unknown_input_vars: FxHashSet<VarId> = unknown_eqns
        .iter()
        .flat_map(|eqn| eqn.inputs.iter())
        .filter_map(|atom| match atom {
            Atom::Var(v) => Some(*v),
            Atom::Lit(_) => None,
        })
        .collect();

    let mut residual_vars: Vec<VarId> = Vec::new();
    let mut residual_set: FxHashSet<VarId> = FxHashSet::default();
    for (var, &is_unknown) in graph.invars.iter().zip(unknowns.iter()) {
        if !is_unknown && unknown_input_vars.contains(var) && residual_set.insert(*var) {
            residual_vars.push(*var);
        }
    }
    for var in &graph.constvars {
        if unknown_input_vars.contains(var) && residual_set.insert(*var) {
            residual_vars.push(*var);
        }
    }
    for eqn in &known_eqns {
        for out_var in &eqn.outputs {
            if unknown_input_vars.contains(out_var) && residual_set.insert(*out_var) {
                residual_vars.push(*out_var);
            }
        }
    }

    let known_invars: Vec<VarId> = graph
        .invars
        .iter()
        .zip(unknowns.iter())
        .filter(|(_, is_unknown)| !**is_unknown)
        .map(|(v, _)| *v)
        .collect();

    let known_outvars: Vec<VarId> = {
        let mut outs: Vec<VarId> = graph
            .outvars
            .iter()
            .filter(|v| !unknown_vars.contains(v))
            .copied()
            .collect();
        for res_var in &residual_vars {
            if !outs.contains(res_var) {
                outs.push(*res_var);
            }
        }
        outs
    };

    let graph_known = Graph::new(
        known_invars,
        graph.constvars.clone(),
        known_outvars,
        known_eqns,
    );

    // Var ids are unique across the original graph, so the residuals can
    // keep their ids as free inputs of the unknown graph.
    let mut unknown_invars: Vec<VarId> = residual_vars.clone();
    for (var, &is_unknown) in graph.invars.iter().zip(unknowns.iter()) {
        if is_unknown {
            unknown_invars.push(*var);
        }
    }

    let unknown_outvars: Vec<VarId> = graph
        .outvars
        .iter()
        .filter(|v| unknown_vars.contains(v))
        .copied()
        .collect();

    let graph_unknown = Graph::new(unknown_invars, vec![], unknown_outvars, unknown_eqns);

    let out_unknowns: Vec<bool> = graph
        .outvars
        .iter()
        .map(|v| unknown_vars.contains(v))
        .collect();

    Ok(PartialEvalResult {
        graph_known,
        graph_unknown,
        residual_vars,
        out_unknowns,
    })
}

/// Dead code elimination: removes equations that do not contribute to any
/// used output. Returns the pruned graph and the mask of still-needed
/// inputs.
#[must_use]
pub fn dce_graph(graph: &Graph, used_outputs: &[bool]) -> (Graph, Vec<bool>) {
    let mut needed: FxHashSet<VarId> = FxHashSet::default();
    for (var, &used) in graph.outvars.iter().zip(used_outputs.iter()) {
        if used {
            needed.insert(*var);
        }
    }

    let mut keep_eqn = vec![false; graph.equations.len()];
    for (i, eqn) in graph.equations.iter().enumerate().rev() {
        let outputs_needed = eqn.outputs.iter().any(|v| needed.contains(v));
        if outputs_needed {
            keep_eqn[i] = true;
            for atom in &eqn.inputs {
                if let Atom::Var(v) = atom {
                    needed.insert(*v);
                }
            }
        }
    }

    let retained_eqns: Vec<Equation> = graph
        .equations
        .iter()
        .zip(keep_eqn.iter())
        .filter(|(_, keep)| **keep)
        .map(|(eqn, _)| eqn.clone())
        .collect();

    let used_inputs: Vec<bool> = graph.invars.iter().map(|v| needed.contains(v)).collect();

    let pruned = Graph::new(
        graph.invars.clone(),
        graph.constvars.clone(),
        graph.outvars.clone(),
        retained_eqns,
    );

    (pruned, used_inputs)
}
