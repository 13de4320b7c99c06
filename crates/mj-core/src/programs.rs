//! Small ready-made graphs used across the workspace's tests and benches.

use crate::{Atom, Equation, Graph, Literal, Primitive, VarId};
use smallvec::smallvec;
use std::collections::BTreeMap;

/// `(a, b) -> a + b`
#[must_use]
pub fn add2() -> Graph {
    binary(Primitive::Add)
}

/// `x -> x * x`
#[must_use]
pub fn square() -> Graph {
    Graph::new(
        vec![VarId(1)],
        vec![],
        vec![VarId(2)],
        vec![Equation {
            primitive: Primitive::Mul,
            inputs: smallvec![Atom::Var(VarId(1)), Atom::Var(VarId(1))],
            outputs: smallvec![VarId(2)],
            params: BTreeMap::new(),
        }],
    )
}

/// `x -> x + 1`
#[must_use]
pub fn add_one() -> Graph {
    Graph::new(
        vec![VarId(1)],
        vec![],
        vec![VarId(2)],
        vec![Equation {
            primitive: Primitive::Add,
            inputs: smallvec![Atom::Var(VarId(1)), Atom::Lit(Literal::I64(1))],
            outputs: smallvec![VarId(2)],
            params: BTreeMap::new(),
        }],
    )
}

/// `(a, b) -> dot(a, b)`
#[must_use]
pub fn dot2() -> Graph {
    binary(Primitive::Dot)
}

/// `x -> reduce_sum(x)`
#[must_use]
pub fn sum_vec() -> Graph {
    Graph::new(
        vec![VarId(1)],
        vec![],
        vec![VarId(2)],
        vec![Equation {
            primitive: Primitive::ReduceSum,
            inputs: smallvec![Atom::Var(VarId(1))],
            outputs: smallvec![VarId(2)],
            params: BTreeMap::new(),
        }],
    )
}

/// `x -> (c * x, c * x + x)` with one captured constant `c`.
#[must_use]
pub fn scaled_pair() -> Graph {
    Graph::new(
        vec![VarId(1)],
        vec![VarId(2)],
        vec![VarId(3), VarId(4)],
        vec![
            Equation {
                primitive: Primitive::Mul,
                inputs: smallvec![Atom::Var(VarId(2)), Atom::Var(VarId(1))],
                outputs: smallvec![VarId(3)],
                params: BTreeMap::new(),
            },
            Equation {
                primitive: Primitive::Add,
                inputs: smallvec![Atom::Var(VarId(3)), Atom::Var(VarId(1))],
                outputs: smallvec![VarId(4)],
                params: BTreeMap::new(),
            },
        ],
    )
}

fn binary(primitive: Primitive) -> Graph {
    Graph::new(
        vec![VarId(1), VarId(2)],
        vec![],
        vec![VarId(3)],
        vec![Equation {
            primitive,
            inputs: smallvec![Atom::Var(VarId(1)), Atom::Var(VarId(2))],
            outputs: smallvec![VarId(3)],
            params: BTreeMap::new(),
        }],
    )
}
