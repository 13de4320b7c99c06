//! In-process reference lowering over a simulated mesh.
//!
//! The simulated backend interprets the graph on global values and derives
//! per-slot shard layouts from the boundary sharding metadata, so callers
//! can observe exactly which mesh slot would own which slice of each
//! result. Sharding constraints inside the body are resolved at compile
//! time against the mesh and checked again when the plan runs.

use crate::{
    ExecutionError, Lowering, LoweringError, LoweringRequest, PartitionedExecutable,
    ShardDescriptor, ShardLayout,
};
use mj_core::{AbstractValue, Graph, Literal, PLACEMENT_PARAM, Primitive, Shape, TensorValue, Value, VarId};
use mj_interpreters::eval_graph_in_plan;
use mj_interpreters::shapes::abstract_eval_vars;
use mj_placement::{ParsedPlacement, ShardingMeta, ValueDescriptor, emit_sharding};
use std::sync::Arc;

/// Reference lowering: one logical process standing in for every mesh slot.
#[derive(Debug, Default)]
pub struct SimLowering;

impl SimLowering {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Lowering for SimLowering {
    fn lower_and_compile(
        &self,
        request: &LoweringRequest<'_>,
    ) -> Result<Arc<dyn PartitionedExecutable>, LoweringError> {
        let graph = request.graph;
        if request.in_avals.len() != graph.invars.len()
            || request.in_shardings.len() != graph.invars.len()
            || request.donated.len() != graph.invars.len()
        {
            return Err(LoweringError::InvalidRequest {
                detail: format!(
                    "input metadata does not cover {} call input(s)",
                    graph.invars.len()
                ),
            });
        }
        if request.out_avals.len() != graph.outvars.len()
            || request.out_shardings.len() != graph.outvars.len()
        {
            return Err(LoweringError::InvalidRequest {
                detail: format!(
                    "output metadata does not cover {} call output(s)",
                    graph.outvars.len()
                ),
            });
        }

        let const_avals: Vec<AbstractValue> = request
            .consts
            .iter()
            .map(Value::abstract_value)
            .collect();
        let var_avals = abstract_eval_vars(graph, &const_avals, request.in_avals)
            .map_err(LoweringError::AbstractEval)?;

        // Resolve every mid-computation constraint against the mesh now, so
        // a bad constraint fails the compilation rather than the run.
        let mut constraint_metas: Vec<(VarId, ShardingMeta)> = Vec::new();
        for eqn in &graph.equations {
            if eqn.primitive != Primitive::ShardingConstraint {
                continue;
            }
            let text = eqn
                .params
                .get(PLACEMENT_PARAM)
                .map(String::as_str)
                .unwrap_or_default();
            let placement = ParsedPlacement::from_canonical_string(text)?;
            let out_var = eqn.outputs[0];
            let aval = var_avals
                .get(&out_var)
                .ok_or_else(|| LoweringError::InvalidRequest {
                    detail: format!("constraint output v{} has no descriptor", out_var.0),
                })?;
            let meta = emit_sharding(
                "sharding constraint",
                &ValueDescriptor::Shaped(aval.clone()),
                &placement,
                request.mesh,
            )?;
            constraint_metas.push((out_var, meta));
        }

        let out_layouts = request
            .out_avals
            .iter()
            .zip(request.out_shardings.iter())
            .map(|(aval, meta)| ShardLayout::build(&aval.shape, meta, request.mesh))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "compiled partitioned program '{}' for mesh with {} slot(s), {} constraint(s)",
            request.name,
            request.mesh.slot_count()?,
            constraint_metas.len(),
        );

        Ok(Arc::new(SimExecutable {
            graph: graph.clone(),
            name: request.name.to_owned(),
            consts: request.consts.to_vec(),
            expected_in_avals: request.in_avals.to_vec(),
            constraint_metas,
            out_layouts,
            donated: request.donated.to_vec(),
        }))
    }
}

#[derive(Debug)]
struct SimExecutable {
    graph: Graph,
    name: String,
    consts: Vec<Value>,
    expected_in_avals: Vec<AbstractValue>,
    constraint_metas: Vec<(VarId, ShardingMeta)>,
    out_layouts: Vec<ShardLayout>,
    donated: Vec<bool>,
}

impl PartitionedExecutable for SimExecutable {
    fn execute(&self, args: &[Value]) -> Result<Vec<Value>, ExecutionError> {
        if args.len() != self.expected_in_avals.len() {
            return Err(ExecutionError::InputArity {
                expected: self.expected_in_avals.len(),
                actual: args.len(),
            });
        }
        for (index, (arg, expected)) in args.iter().zip(self.expected_in_avals.iter()).enumerate()
        {
            let actual = arg.abstract_value();
            if actual != *expected {
                return Err(ExecutionError::ArgumentMismatch {
                    index,
                    expected: expected.canonical_string(),
                    actual: actual.canonical_string(),
                });
            }
        }

        let (outputs, points) = eval_graph_in_plan(&self.graph, &self.consts, args)?;

        // The constraint points observed at run time must be the ones the
        // plan was compiled against.
        if points.len() != self.constraint_metas.len()
            || points
                .iter()
                .zip(self.constraint_metas.iter())
                .any(|(point, (var, _))| point.var != *var)
        {
            return Err(ExecutionError::ShardSlice {
                detail: format!(
                    "program '{}' hit {} constraint point(s), plan has {}",
                    self.name,
                    points.len(),
                    self.constraint_metas.len()
                ),
            });
        }

        Ok(outputs)
    }

    fn output_layouts(&self) -> &[ShardLayout] {
        &self.out_layouts
    }

    fn donated(&self) -> &[bool] {
        &self.donated
    }
}

/// Extracts the slice of `value` owned by one shard of a layout.
pub fn shard_value(value: &Value, shard: &ShardDescriptor) -> Result<Value, ExecutionError> {
    let tensor = match value {
        Value::Scalar(lit) => {
            if !shard.slices.is_empty() {
                return Err(ExecutionError::ShardSlice {
                    detail: "scalar values have no dimensions to slice".to_owned(),
                });
            }
            return Ok(Value::Scalar(*lit));
        }
        Value::Tensor(tensor) => tensor,
    };

    if shard.slices.len() != tensor.rank() {
        return Err(ExecutionError::ShardSlice {
            detail: format!(
                "shard has {} slice range(s), value has rank {}",
                shard.slices.len(),
                tensor.rank()
            ),
        });
    }

    let dims: Vec<u64> = tensor.shape.dims.iter().map(|d| u64::from(*d)).collect();
    for (dim, (start, end)) in shard.slices.iter().enumerate() {
        if start > end || *end > dims[dim] {
            return Err(ExecutionError::ShardSlice {
                detail: format!("slice [{start}, {end}) out of range for dimension {dim}"),
            });
        }
    }

    let shard_dims: Vec<u32> = shard
        .slices
        .iter()
        .map(|(start, end)| (end - start) as u32)
        .collect();
    let mut elements: Vec<Literal> = Vec::new();
    let mut coords: Vec<u64> = shard.slices.iter().map(|(start, _)| *start).collect();

    'outer: loop {
        let mut flat = 0_u64;
        for (coord, dim_size) in coords.iter().zip(dims.iter()) {
            flat = flat * dim_size + coord;
        }
        elements.push(tensor.elements[flat as usize]);

        // Odometer increment over the slice ranges, last dimension fastest.
        for dim in (0..coords.len()).rev() {
            coords[dim] += 1;
            if coords[dim] < shard.slices[dim].1 {
                continue 'outer;
            }
            coords[dim] = shard.slices[dim].0;
        }
        break;
    }

    let shard_tensor = TensorValue::new(tensor.dtype, Shape { dims: shard_dims }, elements)
        .map_err(|err| ExecutionError::ShardSlice {
            detail: err.to_string(),
        })?;
    Ok(Value::Tensor(shard_tensor))
}
