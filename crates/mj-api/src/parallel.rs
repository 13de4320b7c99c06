use mj_core::tree::{ArgTree, TreeDef, flatten_against_prefix, unflatten};
use mj_core::{AbstractValue, Graph, Shape, Value};
use mj_dispatch::cache::ArtifactCache;
use mj_dispatch::{CallParams, OutPlacements, PendingOutputs, compile, compile_and_run};
use mj_mesh::ResourceEnv;
use mj_placement::typing::NamedAxisContext;
use mj_placement::{
    ParsedPlacement, PlacementDecl, SpecTree, check_shapes_against_resources, parse_spec_tree,
};
use mj_runtime::sim::SimLowering;
use mj_runtime::{Lowering, PartitionedExecutable};
use std::sync::Arc;

use crate::errors::ApiError;

/// Execution context for partitioned calls: the lowering backend plus the
/// process-wide compilation cache. Threaded explicitly into every call
/// together with the resource environment.
pub struct Engine {
    lowering: Box<dyn Lowering>,
    artifacts: ArtifactCache,
}

impl Engine {
    #[must_use]
    pub fn new(lowering: Box<dyn Lowering>) -> Self {
        Self {
            lowering,
            artifacts: ArtifactCache::new(),
        }
    }

    /// Engine backed by the in-process simulated mesh.
    #[must_use]
    pub fn sim() -> Self {
        Self::new(Box::new(SimLowering::new()))
    }

    #[must_use]
    pub fn lowering(&self) -> &dyn Lowering {
        self.lowering.as_ref()
    }

    #[must_use]
    pub fn artifacts(&self) -> &ArtifactCache {
        &self.artifacts
    }
}

/// Starts wrapping a graph into a compiled, automatically partitioned
/// callable.
#[must_use]
pub fn parallelize(graph: Graph) -> ParallelizeBuilder {
    ParallelizeBuilder {
        graph,
        name: "parallelized_fn".to_owned(),
        in_specs: ArgTree::Leaf(PlacementDecl::Replicated),
        out_specs: ArgTree::Leaf(PlacementDecl::Replicated),
        out_tree: None,
        static_argnums: Vec::new(),
        donate_argnums: Vec::new(),
    }
}

pub struct ParallelizeBuilder {
    graph: Graph,
    name: String,
    in_specs: SpecTree,
    out_specs: SpecTree,
    out_tree: Option<TreeDef>,
    static_argnums: Vec<usize>,
    donate_argnums: Vec<usize>,
}

impl ParallelizeBuilder {
    /// Placement declarations for the inputs, as a tree prefix of the
    /// argument tree.
    #[must_use]
    pub fn in_placements(mut self, specs: SpecTree) -> Self {
        self.in_specs = specs;
        self
    }

    /// Placement declarations for the outputs, as a tree prefix of the
    /// result tree.
    #[must_use]
    pub fn out_placements(mut self, specs: SpecTree) -> Self {
        self.out_specs = specs;
        self
    }

    /// Structure of the result container. Defaults to a single leaf for
    /// one-output programs and a flat tuple otherwise.
    #[must_use]
    pub fn out_tree(mut self, tree: TreeDef) -> Self {
        self.out_tree = Some(tree);
        self
    }

    /// Positions of compile-time-constant arguments.
    #[must_use]
    pub fn static_args(mut self, argnums: &[usize]) -> Self {
        self.static_argnums = argnums.to_vec();
        self
    }

    /// Positions of arguments whose buffers the computation may reuse.
    #[must_use]
    pub fn donate_args(mut self, argnums: &[usize]) -> Self {
        self.donate_argnums = argnums.to_vec();
        self
    }

    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    /// Validates the declarations eagerly and produces the callable.
    /// Placement parse and uniqueness errors, static/donate overlaps and
    /// output-tree mismatches all surface here, before any compilation.
    pub fn build(self) -> Result<Parallelized, ApiError> {
        let parsed_in = parse_spec_tree("in_placements", &self.in_specs)?;
        let parsed_out = parse_spec_tree("out_placements", &self.out_specs)?;

        let mut static_argnums = self.static_argnums;
        static_argnums.sort_unstable();
        static_argnums.dedup();
        let mut donate_argnums = self.donate_argnums;
        donate_argnums.sort_unstable();
        donate_argnums.dedup();

        if let Some(index) = donate_argnums
            .iter()
            .find(|index| static_argnums.contains(index))
        {
            return Err(ApiError::StaticDonateOverlap { index: *index });
        }

        // Donation positions shift down once the constant arguments are
        // peeled off the call.
        let donate_rebased: Vec<usize> = donate_argnums
            .iter()
            .map(|&donated| {
                let removed_before = static_argnums
                    .iter()
                    .filter(|&&fixed| fixed < donated)
                    .count();
                donated - removed_before
            })
            .collect();

        let out_tree = self.out_tree.unwrap_or_else(|| {
            if self.graph.outvars.len() == 1 {
                TreeDef::Leaf
            } else {
                TreeDef::tuple_of_leaves(self.graph.outvars.len())
            }
        });
        if out_tree.leaf_count() != self.graph.outvars.len() {
            return Err(ApiError::OutputTreeMismatch {
                outputs: self.graph.outvars.len(),
                tree_leaves: out_tree.leaf_count(),
            });
        }

        Ok(Parallelized {
            graph: self.graph,
            name: self.name,
            parsed_in,
            parsed_out,
            out_tree,
            static_argnums,
            donate_argnums,
            donate_rebased,
        })
    }
}

/// A compiled-and-partitioned callable. Each call reads the resource
/// environment and engine passed to it; nothing is cached across
/// environments except through the engine's keyed artifact cache.
#[derive(Debug)]
pub struct Parallelized {
    graph: Graph,
    name: String,
    parsed_in: ArgTree<ParsedPlacement>,
    parsed_out: ArgTree<ParsedPlacement>,
    out_tree: TreeDef,
    static_argnums: Vec<usize>,
    donate_argnums: Vec<usize>,
    donate_rebased: Vec<usize>,
}

struct PreparedCall {
    consts: Vec<Value>,
    leaves: Vec<Value>,
    params: CallParams,
}

impl Parallelized {
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Runs the wrapped program on a tree of arguments, compiling a
    /// partitioned executable on first use per (shapes, placements,
    /// environment) combination.
    pub fn call(
        &self,
        engine: &Engine,
        env: &ResourceEnv,
        args: &[ArgTree<Value>],
    ) -> Result<ArgTree<Value>, ApiError> {
        self.call_with_named_axes(engine, env, &NamedAxisContext::empty(self.graph.invars.len()), args)
    }

    /// Like [`Parallelized::call`], for use under an enclosing named-axis
    /// partitioning mechanism that has already bound mesh resources.
    pub fn call_with_named_axes(
        &self,
        engine: &Engine,
        env: &ResourceEnv,
        named_ctx: &NamedAxisContext,
        args: &[ArgTree<Value>],
    ) -> Result<ArgTree<Value>, ApiError> {
        let prepared = self.prepare(env, args)?;
        let results = compile_and_run(
            &self.graph,
            &prepared.consts,
            &prepared.params,
            &self.out_tree,
            env,
            named_ctx,
            engine.lowering(),
            engine.artifacts(),
            &prepared.leaves,
        )?;
        unflatten("results", &self.out_tree, results).map_err(ApiError::from)
    }

    /// Compiles (or fetches) the partitioned executable for these argument
    /// shapes without running it, exposing its output layouts.
    pub fn lower(
        &self,
        engine: &Engine,
        env: &ResourceEnv,
        args: &[ArgTree<Value>],
    ) -> Result<Arc<dyn PartitionedExecutable>, ApiError> {
        let prepared = self.prepare(env, args)?;
        let in_avals: Vec<AbstractValue> =
            prepared.leaves.iter().map(Value::abstract_value).collect();
        compile(
            &self.graph,
            &prepared.consts,
            &prepared.params,
            &self.out_tree,
            env,
            &NamedAxisContext::empty(self.graph.invars.len()),
            engine.lowering(),
            engine.artifacts(),
            &in_avals,
        )
        .map_err(ApiError::from)
    }

    fn prepare(&self, env: &ResourceEnv, args: &[ArgTree<Value>]) -> Result<PreparedCall, ApiError> {
        for &index in &self.static_argnums {
            if index >= args.len() {
                return Err(ApiError::ArgnumOutOfRange {
                    kind: "compile-time-constant",
                    index,
                    arity: args.len(),
                });
            }
        }
        for &index in &self.donate_argnums {
            if index >= args.len() {
                return Err(ApiError::ArgnumOutOfRange {
                    kind: "donated",
                    index,
                    arity: args.len(),
                });
            }
        }

        let mut consts = Vec::with_capacity(self.static_argnums.len());
        let mut dynamic: Vec<&ArgTree<Value>> = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            if self.static_argnums.binary_search(&index).is_ok() {
                match arg {
                    ArgTree::Leaf(value) => consts.push(value.clone()),
                    ArgTree::Tuple(_) => {
                        return Err(ApiError::StaticArgMustBeLeaf { index });
                    }
                }
            } else {
                dynamic.push(arg);
            }
        }
        if consts.len() != self.graph.constvars.len() {
            return Err(ApiError::ArgumentCount {
                what: "compile-time-constant arguments",
                expected: self.graph.constvars.len(),
                actual: consts.len(),
            });
        }

        let dynamic_tree = ArgTree::Tuple(dynamic.iter().map(|tree| (*tree).clone()).collect());
        let (leaves, in_tree) = dynamic_tree.flatten();
        if leaves.len() != self.graph.invars.len() {
            return Err(ApiError::ArgumentCount {
                what: "call arguments",
                expected: self.graph.invars.len(),
                actual: leaves.len(),
            });
        }

        let in_placements = flatten_against_prefix("in_placements", &in_tree, &self.parsed_in)?;

        let shapes: Vec<Shape> = leaves.iter().map(Value::shape).collect();
        check_shapes_against_resources(
            "partitioned call arguments",
            env,
            &shapes,
            &in_placements,
        )?;

        let mut donated = Vec::with_capacity(leaves.len());
        for (position, arg) in dynamic.iter().enumerate() {
            let flag = self.donate_rebased.contains(&position);
            donated.extend(std::iter::repeat_n(flag, arg.leaf_count()));
        }

        let params = CallParams::new(
            in_placements,
            OutPlacements::Pending(PendingOutputs::declared(self.parsed_out.clone())),
            donated,
            self.name.clone(),
        );

        Ok(PreparedCall {
            consts,
            leaves,
            params,
        })
    }
}
