#![forbid(unsafe_code)]

//! Graph interpreters.
//!
//! Concrete evaluation lives here; shape propagation, partial evaluation
//! and forward-mode differentiation live in the submodules. Direct
//! evaluation of a sharding constraint is a usage error: the constraint
//! only has meaning inside a compiled, partitioned program, where the
//! lowering evaluates it as identity and records the constraint point.

pub mod jvp;
pub mod partial_eval;
pub mod shapes;

use mj_core::{
    Atom, DType, Graph, Literal, PLACEMENT_PARAM, Primitive, Shape, TensorValue, Value, VarId,
};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterError {
    InputArity {
        expected: usize,
        actual: usize,
    },
    ConstArity {
        expected: usize,
        actual: usize,
    },
    MissingVariable(VarId),
    ArityMismatch {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    ShapeMismatch {
        primitive: Primitive,
        left: Shape,
        right: Shape,
    },
    UnexpectedOutputArity {
        primitive: Primitive,
        actual: usize,
    },
    DotRequiresEqualVectors,
    UnsupportedDType {
        primitive: Primitive,
        dtype: DType,
    },
    /// The sharding constraint operator was executed outside a compiled,
    /// partitioned computation.
    ConstraintOutsideCompiledContext,
}

impl std::fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputArity { expected, actual } => {
                write!(
                    f,
                    "input arity mismatch: expected {}, got {}",
                    expected, actual
                )
            }
            Self::ConstArity { expected, actual } => {
                write!(
                    f,
                    "constant arity mismatch: expected {}, got {}",
                    expected, actual
                )
            }
            Self::MissingVariable(var) => write!(f, "missing variable v{}", var.0),
            Self::ArityMismatch {
                primitive,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "{} expects {} operand(s), got {}",
                    primitive.as_str(),
                    expected,
                    actual
                )
            }
            Self::ShapeMismatch {
                primitive,
                left,
                right,
            } => {
                write!(
                    f,
                    "{} operand shapes differ: {:?} vs {:?}",
                    primitive.as_str(),
                    left.dims,
                    right.dims
                )
            }
            Self::UnexpectedOutputArity { primitive, actual } => {
                write!(
                    f,
                    "expected single-output primitive {}, got {} outputs",
                    primitive.as_str(),
                    actual
                )
            }
            Self::DotRequiresEqualVectors => {
                write!(f, "dot expects two rank-1 operands of equal length")
            }
            Self::UnsupportedDType { primitive, dtype } => {
                write!(
                    f,
                    "{} does not support operands of dtype {:?}",
                    primitive.as_str(),
                    dtype
                )
            }
            Self::ConstraintOutsideCompiledContext => {
                write!(
                    f,
                    "sharding_constraint has no direct execution semantics and must be \
                     used inside a compiled, partitioned computation"
                )
            }
        }
    }
}

impl std::error::Error for InterpreterError {}

/// A sharding constraint encountered while evaluating a graph inside a
/// partitioned plan: the constrained variable plus its placement in
/// canonical text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintPoint {
    pub var: VarId,
    pub placement: String,
}

enum ConstraintMode<'a> {
    Reject,
    Collect(&'a mut Vec<ConstraintPoint>),
}

/// Evaluates a graph on concrete values. Sharding constraints are rejected
/// here; see [`eval_graph_in_plan`].
pub fn eval_graph(
    graph: &Graph,
    consts: &[Value],
    args: &[Value],
) -> Result<Vec<Value>, InterpreterError> {
    eval_with_mode(graph, consts, args, ConstraintMode::Reject)
}

/// Evaluates a graph as part of a partitioned plan: sharding constraints
/// act as identity and their placements are collected for the lowering.
pub fn eval_graph_in_plan(
    graph: &Graph,
    consts: &[Value],
    args: &[Value],
) -> Result<(Vec<Value>, Vec<ConstraintPoint>), InterpreterError> {
    let mut constraints = Vec::new();
    let outputs = eval_with_mode(graph, consts, args, ConstraintMode::Collect(&mut constraints))?;
    Ok((outputs, constraints))
}

fn eval_with_mode(
    graph: &Graph,
    consts: &[Value],
    args: &[Value],
    mut mode: ConstraintMode<'_>,
) -> Result<Vec<Value>, InterpreterError> {
    if args.len() != graph.invars.len() {
        return Err(InterpreterError::InputArity {
            expected: graph.invars.len(),
            actual: args.len(),
        });
    }
    if consts.len() != graph.constvars.len() {
        return Err(InterpreterError::ConstArity {
            expected: graph.constvars.len(),
            actual: consts.len(),
        });
    }

    let mut env: FxHashMap<VarId, Value> = FxHashMap::default();
    for (var, value) in graph.invars.iter().zip(args.iter()) {
        env.insert(*var, value.clone());
    }
    for (var, value) in graph.constvars.iter().zip(consts.iter()) {
        env.insert(*var, value.clone());
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
                    let value = env
                        .get(var)
                        .cloned()
                        .ok_or(InterpreterError::MissingVariable(*var))?;
                    operands.push(value);
                }
                Atom::Lit(lit) => operands.push(Value::Scalar(*lit)),
            }
        }

        let output = if eqn.primitive == Primitive::ShardingConstraint {
            match &mut mode {
                ConstraintMode::Reject => {
                    return Err(InterpreterError::ConstraintOutsideCompiledContext);
                }
                ConstraintMode::Collect(points) => {
                    let [operand] = operands.as_slice() else {
                        return Err(InterpreterError::ArityMismatch {
                            primitive: eqn.primitive,
                            expected: 1,
                            actual: operands.len(),
                        });
                    };
                    points.push(ConstraintPoint {
                        var: eqn.outputs[0],
                        placement: eqn
                            .params
                            .get(PLACEMENT_PARAM)
                            .cloned()
                            .unwrap_or_default(),
                    });
                    operand.clone()
                }
            }
        } else {
            eval_primitive(eqn.primitive, &operands)?
        };
        env.insert(eqn.outputs[0], output);
    }

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

pub fn eval_primitive(
    primitive: Primitive,
    operands: &[Value],
) -> Result<Value, InterpreterError> {
    match primitive {
        Primitive::Add | Primitive::Sub | Primitive::Mul => {
            let [a, b] = expect_operands::<2>(primitive, operands)?;
            numeric_binary(primitive, a, b)
        }
        Primitive::Neg => {
            let [a] = expect_operands::<1>(primitive, operands)?;
            numeric_unary(primitive, a)
        }
        Primitive::Dot => {
            let [a, b] = expect_operands::<2>(primitive, operands)?;
            dot(a, b)
        }
        Primitive::ReduceSum => {
            let [a] = expect_operands::<1>(primitive, operands)?;
            reduce_sum(a)
        }
        Primitive::ShardingConstraint => Err(InterpreterError::ConstraintOutsideCompiledContext),
    }
}

fn expect_operands<'a, const N: usize>(
    primitive: Primitive,
    operands: &'a [Value],
) -> Result<[&'a Value; N], InterpreterError> {
    if operands.len() != N {
        return Err(InterpreterError::ArityMismatch {
            primitive,
            expected: N,
            actual: operands.len(),
        });
    }
    let mut iter = operands.iter();
    Ok(std::array::from_fn(|_| {
        iter.next().expect("operand count checked above")
    }))
}

fn scalar_binary(
    primitive: Primitive,
    a: Literal,
    b: Literal,
) -> Result<Literal, InterpreterError> {
    if matches!(a, Literal::Bool(_)) || matches!(b, Literal::Bool(_)) {
        return Err(InterpreterError::UnsupportedDType {
            primitive,
            dtype: DType::Bool,
        });
    }

    if let (Literal::I64(left), Literal::I64(right)) = (a, b) {
        let result = match primitive {
            Primitive::Add => left.wrapping_add(right),
            Primitive::Sub => left.wrapping_sub(right),
            Primitive::Mul => left.wrapping_mul(right),
            _ => unreachable!("scalar_binary is only called for add/sub/mul"),
        };
        return Ok(Literal::I64(result));
    }

    let left = a.as_f64().expect("non-bool literal converts to f64");
    let right = b.as_f64().expect("non-bool literal converts to f64");
    let result = match primitive {
        Primitive::Add => left + right,
        Primitive::Sub => left - right,
        Primitive::Mul => left * right,
        _ => unreachable!("scalar_binary is only called for add/sub/mul"),
    };
    Ok(Literal::from_f64(result))
}

fn numeric_binary(
    primitive: Primitive,
    a: &Value,
    b: &Value,
) -> Result<Value, InterpreterError> {
    match (a, b) {
        (Value::Scalar(left), Value::Scalar(right)) => {
            Ok(Value::Scalar(scalar_binary(primitive, *left, *right)?))
        }
        (Value::Tensor(tensor), Value::Scalar(scalar)) => {
            let elements = tensor
                .elements
                .iter()
                .map(|lit| scalar_binary(primitive, *lit, *scalar))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Tensor(rebuild(tensor, elements)))
        }
        (Value::Scalar(scalar), Value::Tensor(tensor)) => {
            let elements = tensor
                .elements
                .iter()
                .map(|lit| scalar_binary(primitive, *scalar, *lit))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Tensor(rebuild(tensor, elements)))
        }
        (Value::Tensor(left), Value::Tensor(right)) => {
            if left.shape != right.shape {
                return Err(InterpreterError::ShapeMismatch {
                    primitive,
                    left: left.shape.clone(),
                    right: right.shape.clone(),
                });
            }
            let elements = left
                .elements
                .iter()
                .zip(right.elements.iter())
                .map(|(x, y)| scalar_binary(primitive, *x, *y))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Tensor(rebuild(left, elements)))
        }
    }
}

fn numeric_unary(primitive: Primitive, a: &Value) -> Result<Value, InterpreterError> {
    let negate = |lit: Literal| -> Result<Literal, InterpreterError> {
        match lit {
            Literal::I64(value) => Ok(Literal::I64(value.wrapping_neg())),
            Literal::F64Bits(_) => {
                Ok(Literal::from_f64(-lit.as_f64().expect("f64 literal")))
            }
            Literal::Bool(_) => Err(InterpreterError::UnsupportedDType {
                primitive,
                dtype: DType::Bool,
            }),
        }
    };

    match a {
        Value::Scalar(lit) => Ok(Value::Scalar(negate(*lit)?)),
        Value::Tensor(tensor) => {
            let elements = tensor
                .elements
                .iter()
                .map(|lit| negate(*lit))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Tensor(rebuild(tensor, elements)))
        }
    }
}

fn dot(a: &Value, b: &Value) -> Result<Value, InterpreterError> {
    let (Some(left), Some(right)) = (a.as_tensor(), b.as_tensor()) else {
        return Err(InterpreterError::DotRequiresEqualVectors);
    };
    if left.rank() != 1 || right.rank() != 1 || left.len() != right.len() {
        return Err(InterpreterError::DotRequiresEqualVectors);
    }

    let mut acc = Literal::I64(0);
    for (x, y) in left.elements.iter().zip(right.elements.iter()) {
        let product = scalar_binary(Primitive::Mul, *x, *y)?;
        acc = scalar_binary(Primitive::Add, acc, product)?;
    }
    Ok(Value::Scalar(acc))
}

fn reduce_sum(a: &Value) -> Result<Value, InterpreterError> {
    match a {
        Value::Scalar(lit) => Ok(Value::Scalar(*lit)),
        Value::Tensor(tensor) => {
            let mut acc = Literal::I64(0);
            for lit in &tensor.elements {
                acc = scalar_binary(Primitive::Add, acc, *lit)?;
            }
            Ok(Value::Scalar(acc))
        }
    }
}

fn rebuild(template: &TensorValue, elements: Vec<Literal>) -> TensorValue {
    let dtype = if elements
        .iter()
        .all(|lit| matches!(lit, Literal::I64(_)))
    {
        DType::I64
    } else {
        DType::F64
    };
    TensorValue::new(dtype, template.shape.clone(), elements)
        .expect("rebuilt tensor keeps the template's element count")
}
