//! End-to-end scenarios for the partitioned-call surface, from user
//! declarations through compilation on the simulated mesh.

use mj_api::{Engine, parallelize, with_sharding_constraint};
use mj_core::tree::{ArgTree, TreeDef};
use mj_core::{Atom, Equation, Graph, Primitive, Value, VarId, programs};
use mj_interpreters::eval_graph;
use mj_mesh::{ResourceEnv, mesh_from_pairs};
use mj_placement::typing::NamedAxisContext;
use mj_placement::{DimAssignment, PartitionSpec, PlacementDecl, PlacementError};
use mj_runtime::sim::shard_value;
use smallvec::smallvec;
use std::collections::{BTreeMap, BTreeSet};

fn env_x2() -> ResourceEnv {
    ResourceEnv::new(mesh_from_pairs(&[("x", 2)]).expect("mesh should build"))
}

fn p_axis(axis: &str) -> PlacementDecl {
    PlacementDecl::axis(axis)
}

#[test]
fn scenario_a_partitioned_output_splits_into_contiguous_blocks() {
    let engine = Engine::sim();
    let env = env_x2();
    let wrapped = parallelize(programs::add_one())
        .out_placements(ArgTree::leaf(p_axis("x")))
        .named("add_one")
        .build()
        .expect("build should succeed");

    let input = Value::vector_i64(&[10, 20, 30, 40, 50, 60, 70, 80]).expect("vector");
    let args = [ArgTree::leaf(input.clone())];

    // Content equals applying the function to the whole array.
    let result = wrapped
        .call(&engine, &env, &args)
        .expect("call should succeed");
    let direct = eval_graph(&programs::add_one(), &[], &[input])
        .expect("direct eval should succeed");
    assert_eq!(result, ArgTree::leaf(direct[0].clone()));

    // The distributed layout gives each of the 2 slots 4 contiguous elements.
    let executable = wrapped
        .lower(&engine, &env, &args)
        .expect("lower should succeed");
    let layout = &executable.output_layouts()[0];
    assert_eq!(layout.slot_count(), 2);
    assert_eq!(layout.shards[0].slices, vec![(0, 4)]);
    assert_eq!(layout.shards[1].slices, vec![(4, 8)]);

    let ArgTree::Leaf(global) = &result else {
        panic!("expected a leaf result");
    };
    let first = shard_value(global, &layout.shards[0]).expect("shard slice should succeed");
    let second = shard_value(global, &layout.shards[1]).expect("shard slice should succeed");
    assert_eq!(first, Value::vector_i64(&[11, 21, 31, 41]).expect("vector"));
    assert_eq!(second, Value::vector_i64(&[51, 61, 71, 81]).expect("vector"));

    // Lowering reused the artifact compiled by the first call.
    assert_eq!(engine.artifacts().compile_count(), 1);
}

#[test]
fn scenario_b_duplicate_axis_fails_before_any_compilation() {
    let spec = PlacementDecl::Spec(PartitionSpec::new(vec![
        DimAssignment::Axis("x".to_owned()),
        DimAssignment::Axis("x".to_owned()),
    ]));
    let err = parallelize(programs::add_one())
        .out_placements(ArgTree::leaf(spec))
        .build()
        .expect_err("duplicate axis must fail at declaration time");
    let message = err.to_string();
    assert!(message.contains("at most one positional dimension"));
    assert!(message.contains('x'));
}

#[test]
fn scenario_c_undefined_resource_axis_is_named() {
    let engine = Engine::sim();
    let env = env_x2();
    let wrapped = parallelize(programs::add_one())
        .in_placements(ArgTree::leaf(p_axis("rows")))
        .build()
        .expect("build should succeed");

    let err = wrapped
        .call(
            &engine,
            &env,
            &[ArgTree::leaf(Value::vector_i64(&[1, 2, 3, 4]).expect("vector"))],
        )
        .expect_err("axis 'rows' is not part of the mesh");
    assert!(matches!(
        err,
        mj_api::ApiError::Placement(PlacementError::UndefinedResourceAxis { ref axis, .. })
            if axis == "rows"
    ));
    assert_eq!(engine.artifacts().compile_count(), 0);
}

#[test]
fn scenario_d_divisibility_error_reports_dimension_size_and_divisor() {
    let engine = Engine::sim();
    let env = env_x2();
    let wrapped = parallelize(programs::add_one())
        .in_placements(ArgTree::leaf(p_axis("x")))
        .build()
        .expect("build should succeed");

    let err = wrapped
        .call(
            &engine,
            &env,
            &[ArgTree::leaf(
                Value::vector_i64(&[1, 2, 3, 4, 5, 6, 7]).expect("vector"),
            )],
        )
        .expect_err("7 does not divide across 2 slots");
    match err {
        mj_api::ApiError::Placement(PlacementError::NotDivisible {
            dim,
            size,
            divisor,
            ..
        }) => {
            assert_eq!((dim, size, divisor), (0, 7, 2));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(engine.artifacts().compile_count(), 0);
}

#[test]
fn repeated_calls_share_one_compilation_and_agree() {
    let engine = Engine::sim();
    let env = env_x2();
    let wrapped = parallelize(programs::add_one())
        .out_placements(ArgTree::leaf(p_axis("x")))
        .build()
        .expect("build should succeed");
    let args = [ArgTree::leaf(
        Value::vector_i64(&[1, 2, 3, 4, 5, 6, 7, 8]).expect("vector"),
    )];

    let first = wrapped.call(&engine, &env, &args).expect("first call");
    let second = wrapped.call(&engine, &env, &args).expect("second call");
    assert_eq!(first, second);
    assert_eq!(engine.artifacts().compile_count(), 1);
}

#[test]
fn static_arguments_bind_constants_and_key_the_cache() {
    let engine = Engine::sim();
    let env = env_x2();
    // scaled_pair: x -> (c * x, c * x + x) with one captured constant c.
    let wrapped = parallelize(programs::scaled_pair())
        .static_args(&[0])
        .named("scaled_pair")
        .build()
        .expect("build should succeed");

    let result = wrapped
        .call(
            &engine,
            &env,
            &[
                ArgTree::leaf(Value::scalar_i64(3)),
                ArgTree::leaf(Value::scalar_i64(5)),
            ],
        )
        .expect("call should succeed");
    assert_eq!(
        result,
        ArgTree::tuple(vec![
            ArgTree::leaf(Value::scalar_i64(15)),
            ArgTree::leaf(Value::scalar_i64(20)),
        ])
    );
    assert_eq!(engine.artifacts().compile_count(), 1);

    // A different constant value is a different compilation.
    wrapped
        .call(
            &engine,
            &env,
            &[
                ArgTree::leaf(Value::scalar_i64(4)),
                ArgTree::leaf(Value::scalar_i64(5)),
            ],
        )
        .expect("call should succeed");
    assert_eq!(engine.artifacts().compile_count(), 2);
}

#[test]
fn donation_flags_broadcast_over_a_donated_subtree() {
    let engine = Engine::sim();
    let env = env_x2();
    // (a, (b, c)) -> a + b + c
    let graph = Graph::new(
        vec![VarId(1), VarId(2), VarId(3)],
        vec![],
        vec![VarId(5)],
        vec![
            Equation {
                primitive: Primitive::Add,
                inputs: smallvec![Atom::Var(VarId(1)), Atom::Var(VarId(2))],
                outputs: smallvec![VarId(4)],
                params: BTreeMap::new(),
            },
            Equation {
                primitive: Primitive::Add,
                inputs: smallvec![Atom::Var(VarId(4)), Atom::Var(VarId(3))],
                outputs: smallvec![VarId(5)],
                params: BTreeMap::new(),
            },
        ],
    );
    let wrapped = parallelize(graph)
        .donate_args(&[1])
        .build()
        .expect("build should succeed");

    let args = [
        ArgTree::leaf(Value::scalar_i64(1)),
        ArgTree::tuple(vec![
            ArgTree::leaf(Value::scalar_i64(2)),
            ArgTree::leaf(Value::scalar_i64(3)),
        ]),
    ];
    let executable = wrapped
        .lower(&engine, &env, &args)
        .expect("lower should succeed");
    assert_eq!(executable.donated(), &[false, true, true]);

    let result = wrapped.call(&engine, &env, &args).expect("call");
    assert_eq!(result, ArgTree::leaf(Value::scalar_i64(6)));
}

#[test]
fn placement_prefix_broadcasts_over_argument_subtrees() {
    let engine = Engine::sim();
    let env = env_x2();
    // (a, (b, c)) -> a + b + c over vectors; b and c share one declaration.
    let graph = Graph::new(
        vec![VarId(1), VarId(2), VarId(3)],
        vec![],
        vec![VarId(5)],
        vec![
            Equation {
                primitive: Primitive::Add,
                inputs: smallvec![Atom::Var(VarId(1)), Atom::Var(VarId(2))],
                outputs: smallvec![VarId(4)],
                params: BTreeMap::new(),
            },
            Equation {
                primitive: Primitive::Add,
                inputs: smallvec![Atom::Var(VarId(4)), Atom::Var(VarId(3))],
                outputs: smallvec![VarId(5)],
                params: BTreeMap::new(),
            },
        ],
    );
    let wrapped = parallelize(graph)
        .in_placements(ArgTree::tuple(vec![
            ArgTree::leaf(PlacementDecl::Replicated),
            ArgTree::leaf(p_axis("x")),
        ]))
        .build()
        .expect("build should succeed");

    let ok = wrapped.call(
        &engine,
        &env,
        &[
            ArgTree::leaf(Value::vector_i64(&[1, 2]).expect("vector")),
            ArgTree::tuple(vec![
                ArgTree::leaf(Value::vector_i64(&[10, 20]).expect("vector")),
                ArgTree::leaf(Value::vector_i64(&[100, 200]).expect("vector")),
            ]),
        ],
    );
    assert!(ok.is_ok());

    // The broadcast placement applies to c as well, so an odd-length c
    // violates divisibility.
    let err = wrapped
        .call(
            &engine,
            &env,
            &[
                ArgTree::leaf(Value::vector_i64(&[1, 2, 3]).expect("vector")),
                ArgTree::tuple(vec![
                    ArgTree::leaf(Value::vector_i64(&[10, 20]).expect("vector")),
                    ArgTree::leaf(Value::vector_i64(&[100, 200, 300]).expect("vector")),
                ]),
            ],
        )
        .expect_err("broadcast placement must cover every leaf of the subtree");
    assert!(matches!(
        err,
        mj_api::ApiError::Placement(PlacementError::NotDivisible { .. })
    ));
}

#[test]
fn constraint_inside_a_compiled_program_is_honored() {
    let engine = Engine::sim();
    let env = env_x2();

    // square, then pin the squared value onto axis x before returning it.
    let base = programs::square();
    let aval = mj_core::AbstractValue::vector(mj_core::DType::I64, 8);
    let (mut graph, constrained) =
        with_sharding_constraint(&base, VarId(2), &aval, &p_axis("x"), &env)
            .expect("constraint insertion should succeed");
    graph.outvars = vec![constrained];

    let wrapped = parallelize(graph).named("square_pinned").build().expect("build");
    let result = wrapped
        .call(
            &engine,
            &env,
            &[ArgTree::leaf(
                Value::vector_i64(&[1, 2, 3, 4, 5, 6, 7, 8]).expect("vector"),
            )],
        )
        .expect("call should succeed");
    assert_eq!(
        result,
        ArgTree::leaf(Value::vector_i64(&[1, 4, 9, 16, 25, 36, 49, 64]).expect("vector"))
    );
}

#[test]
fn constraint_insertion_validates_eagerly() {
    let env = env_x2();
    let base = programs::square();
    let aval = mj_core::AbstractValue::vector(mj_core::DType::I64, 7);
    let err = with_sharding_constraint(&base, VarId(2), &aval, &p_axis("x"), &env)
        .expect_err("7 elements cannot pin to an axis of size 2");
    assert!(matches!(
        err,
        mj_api::ApiError::Placement(PlacementError::NotDivisible { .. })
    ));
}

#[test]
fn named_axis_and_positional_placement_cannot_share_a_mesh_axis() {
    let engine = Engine::sim();
    let env = env_x2();
    let wrapped = parallelize(programs::add_one())
        .in_placements(ArgTree::leaf(p_axis("x")))
        .build()
        .expect("build should succeed");

    let mut bindings = BTreeMap::new();
    bindings.insert("batch".to_owned(), BTreeSet::from(["x".to_owned()]));
    let named_ctx = NamedAxisContext::new(
        bindings,
        vec![BTreeSet::from(["batch".to_owned()])],
    );

    let err = wrapped
        .call_with_named_axes(
            &engine,
            &env,
            &named_ctx,
            &[ArgTree::leaf(Value::vector_i64(&[1, 2, 3, 4]).expect("vector"))],
        )
        .expect_err("axis x is already backing the named axis");
    assert!(err.to_string().contains("mesh axes"));
    assert_eq!(engine.artifacts().compile_count(), 0);
}

#[test]
fn out_tree_override_reshapes_results() {
    let engine = Engine::sim();
    let env = env_x2();
    let wrapped = parallelize(programs::scaled_pair())
        .static_args(&[0])
        .out_tree(TreeDef::Tuple(vec![TreeDef::Tuple(vec![
            TreeDef::Leaf,
            TreeDef::Leaf,
        ])]))
        .build()
        .expect("build should succeed");

    let result = wrapped
        .call(
            &engine,
            &env,
            &[
                ArgTree::leaf(Value::scalar_i64(2)),
                ArgTree::leaf(Value::scalar_i64(10)),
            ],
        )
        .expect("call should succeed");
    assert_eq!(
        result,
        ArgTree::tuple(vec![ArgTree::tuple(vec![
            ArgTree::leaf(Value::scalar_i64(20)),
            ArgTree::leaf(Value::scalar_i64(30)),
        ])])
    );
}
