//! Abstract evaluation: propagates shape/dtype descriptors through a graph
//! to obtain the output descriptors before any concrete value exists.
//! Output placements can only be validated once these are known.

use crate::InterpreterError;
use mj_core::{AbstractValue, Atom, DType, Graph, Primitive, Shape, VarId};
use rustc_hash::FxHashMap;

fn promote(a: DType, b: DType) -> DType {
    if a == b { a } else { DType::F64 }
}

/// Computes the abstract values of a graph's outputs from its constant and
/// input descriptors.
pub fn abstract_eval(
    graph: &Graph,
    const_avals: &[AbstractValue],
    in_avals: &[AbstractValue],
) -> Result<Vec<AbstractValue>, InterpreterError> {
    let env = abstract_eval_vars(graph, const_avals, in_avals)?;
    graph
        .outvars
        .iter()
        .map(|var| {
            env.get(var)
                .cloned()
                .ok_or(InterpreterError::MissingVariable(*var))
        })
        .collect()
}

/// Like [`abstract_eval`], but returns the descriptor of every bound
/// variable. Lowering uses this to validate mid-computation constraints.
pub fn abstract_eval_vars(
    graph: &Graph,
    const_avals: &[AbstractValue],
    in_avals: &[AbstractValue],
) -> Result<FxHashMap<VarId, AbstractValue>, InterpreterError> {
    if in_avals.len() != graph.invars.len() {
        return Err(InterpreterError::InputArity {
            expected: graph.invars.len(),
            actual: in_avals.len(),
        });
    }
    if const_avals.len() != graph.constvars.len() {
        return Err(InterpreterError::ConstArity {
            expected: graph.constvars.len(),
            actual: const_avals.len(),
        });
    }

    let mut env: FxHashMap<VarId, AbstractValue> = FxHashMap::default();
    for (var, aval) in graph.invars.iter().zip(in_avals.iter()) {
        env.insert(*var, aval.clone());
    }
    for (var, aval) in graph.constvars.iter().zip(const_avals.iter()) {
        env.insert(*var, aval.clone());
    }

    for eqn in &graph.equations {
        if eqn.outputs.len() != 1 {
            return Err(InterpreterError::UnexpectedOutputArity {
                primitive: eqn.primitive,
                actual: eqn.outputs.len(),
            });
        }

        let mut operands = Vec::with_capacity(eqn.inputs.len());
        for atom in &eqn.inputs {
            match atom {
                Atom::Var(var) => {
                    let aval = env
                        .get(var)
                        .cloned()
                        .ok_or(InterpreterError::MissingVariable(*var))?;
                    operands.push(aval);
                }
                Atom::Lit(lit) => operands.push(AbstractValue::scalar(lit.dtype())),
            }
        }

        let output = abstract_primitive(eqn.primitive, &operands)?;
        env.insert(eqn.outputs[0], output);
    }

    Ok(env)
}

fn abstract_primitive(
    primitive: Primitive,
    operands: &[AbstractValue],
) -> Result<AbstractValue, InterpreterError> {
    let arity = |expected: usize| -> Result<(), InterpreterError> {
        if operands.len() == expected {
            Ok(())
        } else {
            Err(InterpreterError::ArityMismatch {
                primitive,
                expected,
                actual: operands.len(),
            })
        }
    };

    match primitive {
        Primitive::Add | Primitive::Sub | Primitive::Mul => {
            arity(2)?;
            let (a, b) = (&operands[0], &operands[1]);
            let shape = broadcast_shape(primitive, &a.shape, &b.shape)?;
            Ok(AbstractValue {
                dtype: promote(a.dtype, b.dtype),
                shape,
            })
        }
        Primitive::Neg | Primitive::ShardingConstraint => {
            arity(1)?;
            Ok(operands[0].clone())
        }
        Primitive::Dot => {
            arity(2)?;
            let (a, b) = (&operands[0], &operands[1]);
            if a.shape.rank() != 1 || a.shape != b.shape {
                return Err(InterpreterError::DotRequiresEqualVectors);
            }
            Ok(AbstractValue::scalar(promote(a.dtype, b.dtype)))
        }
        Primitive::ReduceSum => {
            arity(1)?;
            Ok(AbstractValue::scalar(operands[0].dtype))
        }
    }
}

fn broadcast_shape(
    primitive: Primitive,
    left: &Shape,
    right: &Shape,
) -> Result<Shape, InterpreterError> {
    if left == right {
        return Ok(left.clone());
    }
    if left.rank() == 0 {
        return Ok(right.clone());
    }
    if right.rank() == 0 {
        return Ok(left.clone());
    }
    Err(InterpreterError::ShapeMismatch {
        primitive,
        left: left.clone(),
        right: right.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::abstract_eval;
    use crate::InterpreterError;
    use mj_core::{AbstractValue, DType, programs};

    #[test]
    fn elementwise_keeps_shape_and_promotes_dtype() {
        let out = abstract_eval(
            &programs::add2(),
            &[],
            &[
                AbstractValue::vector(DType::F64, 8),
                AbstractValue::scalar(DType::I64),
            ],
        )
        .expect("abstract eval should succeed");
        assert_eq!(out, vec![AbstractValue::vector(DType::F64, 8)]);
    }

    #[test]
    fn reduce_sum_collapses_to_scalar() {
        let out = abstract_eval(
            &programs::sum_vec(),
            &[],
            &[AbstractValue::vector(DType::I64, 5)],
        )
        .expect("abstract eval should succeed");
        assert_eq!(out, vec![AbstractValue::scalar(DType::I64)]);
    }

    #[test]
    fn mismatched_tensor_shapes_are_rejected() {
        let err = abstract_eval(
            &programs::add2(),
            &[],
            &[
                AbstractValue::vector(DType::F64, 8),
                AbstractValue::vector(DType::F64, 4),
            ],
        )
        .expect_err("shape mismatch should fail");
        assert!(matches!(err, InterpreterError::ShapeMismatch { .. }));
    }

    #[test]
    fn consts_feed_the_environment() {
        let out = abstract_eval(
            &programs::scaled_pair(),
            &[AbstractValue::scalar(DType::F64)],
            &[AbstractValue::vector(DType::F64, 4)],
        )
        .expect("abstract eval should succeed");
        assert_eq!(
            out,
            vec![
                AbstractValue::vector(DType::F64, 4),
                AbstractValue::vector(DType::F64, 4),
            ]
        );
    }
}
