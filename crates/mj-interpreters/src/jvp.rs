//! Forward-mode differentiation on graphs.
//!
//! `jvp_graph` builds a new graph computing primal outputs followed by the
//! tangent outputs of results with a structurally nonzero tangent. Zero
//! tangents are tracked symbolically and never materialize as equations.
//! The tangent rule of a sharding constraint applies the same constraint to
//! the tangent, so tangents share their primal's layout.

use mj_core::{Atom, Equation, Graph, Primitive, VarId};
use rustc_hash::FxHashMap;
use smallvec::smallvec;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JvpError {
    InputMaskMismatch { expected: usize, actual: usize },
    UnsupportedOutputArity { primitive: Primitive },
}

impl std::fmt::Display for JvpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputMaskMismatch { expected, actual } => {
                write!(
                    f,
                    "nonzero-tangent mask length mismatch: graph has {} inputs, mask has {}",
                    expected, actual
                )
            }
            Self::UnsupportedOutputArity { primitive } => {
                write!(
                    f,
                    "jvp requires single-output equations, got {}",
                    primitive.as_str()
                )
            }
        }
    }
}

impl std::error::Error for JvpError {}

#[derive(Debug, Clone)]
pub struct JvpResult {
    /// Graph over `original invars ++ tangent invars` (one tangent invar
    /// per nonzero-tangent input), producing `primal outputs ++ tangent
    /// outputs` (one per nonzero-tangent output).
    pub graph: Graph,

    /// Which of the original outputs carry a nonzero tangent.
    pub nz_out: Vec<bool>,
}

struct TangentBuilder {
    next_var: u32,
    equations: Vec<Equation>,
}

impl TangentBuilder {
    fn fresh(&mut self) -> VarId {
        let var = VarId(self.next_var);
        self.next_var += 1;
        var
    }

    fn push_unary(&mut self, primitive: Primitive, input: Atom) -> VarId {
        let out = self.fresh();
        self.equations.push(Equation {
            primitive,
            inputs: smallvec![input],
            outputs: smallvec![out],
            params: BTreeMap::new(),
        });
        out
    }

    fn push_binary(&mut self, primitive: Primitive, left: Atom, right: Atom) -> VarId {
        let out = self.fresh();
        self.equations.push(Equation {
            primitive,
            inputs: smallvec![left, right],
            outputs: smallvec![out],
            params: BTreeMap::new(),
        });
        out
    }
}

pub fn jvp_graph(graph: &Graph, nz_in: &[bool]) -> Result<JvpResult, JvpError> {
    if nz_in.len() != graph.invars.len() {
        return Err(JvpError::InputMaskMismatch {
            expected: graph.invars.len(),
            actual: nz_in.len(),
        });
    }

    let mut builder = TangentBuilder {
        next_var: graph.fresh_var_base(),
        equations: Vec::new(),
    };

    // None = structurally zero tangent.
    let mut tangent_of: FxHashMap<VarId, Option<VarId>> = FxHashMap::default();

    let mut invars = graph.invars.clone();
    let mut tangent_invars = Vec::new();
    for (var, &nonzero) in graph.invars.iter().zip(nz_in.iter()) {
        if nonzero {
            let tangent = builder.fresh();
            tangent_invars.push(tangent);
            tangent_of.insert(*var, Some(tangent));
        } else {
            tangent_of.insert(*var, None);
        }
    }
    invars.extend(tangent_invars);

    for var in &graph.constvars {
        tangent_of.insert(*var, None);
    }

    for eqn in &graph.equations {
        if eqn.outputs.len() != 1 {
            return Err(JvpError::UnsupportedOutputArity {
                primitive: eqn.primitive,
            });
        }
        builder.equations.push(eqn.clone());

        let tangent_atom = |atom: &Atom, map: &FxHashMap<VarId, Option<VarId>>| -> Option<VarId> {
            match atom {
                Atom::Var(var) => map.get(var).copied().flatten(),
                Atom::Lit(_) => None,
            }
        };

        let out_tangent = match eqn.primitive {
            Primitive::Add | Primitive::Sub => {
                let ta = tangent_atom(&eqn.inputs[0], &tangent_of);
                let tb = tangent_atom(&eqn.inputs[1], &tangent_of);
                match (ta, tb) {
                    (None, None) => None,
                    (Some(ta), None) => Some(ta),
                    (None, Some(tb)) => {
                        if eqn.primitive == Primitive::Sub {
                            Some(builder.push_unary(Primitive::Neg, Atom::Var(tb)))
                        } else {
                            Some(tb)
                        }
                    }
                    (Some(ta), Some(tb)) => {
                        Some(builder.push_binary(eqn.primitive, Atom::Var(ta), Atom::Var(tb)))
                    }
                }
            }
            Primitive::Mul | Primitive::Dot => {
                let ta = tangent_atom(&eqn.inputs[0], &tangent_of);
                let tb = tangent_atom(&eqn.inputs[1], &tangent_of);
                let left_term = ta.map(|ta| {
                    builder.push_binary(eqn.primitive, Atom::Var(ta), eqn.inputs[1].clone())
                });
                let right_term = tb.map(|tb| {
                    builder.push_binary(eqn.primitive, eqn.inputs[0].clone(), Atom::Var(tb))
                });
                match (left_term, right_term) {
                    (None, None) => None,
                    (Some(term), None) | (None, Some(term)) => Some(term),
                    (Some(left), Some(right)) => {
                        Some(builder.push_binary(Primitive::Add, Atom::Var(left), Atom::Var(right)))
                    }
                }
            }
            Primitive::Neg => tangent_atom(&eqn.inputs[0], &tangent_of)
                .map(|t| builder.push_unary(Primitive::Neg, Atom::Var(t))),
            Primitive::ReduceSum => tangent_atom(&eqn.inputs[0], &tangent_of)
                .map(|t| builder.push_unary(Primitive::ReduceSum, Atom::Var(t))),
            Primitive::ShardingConstraint => {
                tangent_atom(&eqn.inputs[0], &tangent_of).map(|t| {
                    let out = builder.fresh();
                    builder.equations.push(Equation {
                        primitive: Primitive::ShardingConstraint,
                        inputs: smallvec![Atom::Var(t)],
                        outputs: smallvec![out],
                        params: eqn.params.clone(),
                    });
                    out
                })
            }
        };

        tangent_of.insert(eqn.outputs[0], out_tangent);
    }

    let nz_out: Vec<bool> = graph
        .outvars
        .iter()
        .map(|var| tangent_of.get(var).copied().flatten().is_some())
        .collect();

    let mut outvars = graph.outvars.clone();
    for var in &graph.outvars {
        if let Some(Some(tangent)) = tangent_of.get(var) {
            outvars.push(*tangent);
        }
    }

    let jvp = Graph::new(invars, graph.constvars.clone(), outvars, builder.equations);

    Ok(JvpResult {
        graph: jvp,
        nz_out,
    })
}
