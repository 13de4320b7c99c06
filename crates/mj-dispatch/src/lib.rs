#![forbid(unsafe_code)]

//! Call abstraction for partitioned programs.
//!
//! A partitioned call pairs a graph with resolved input placements, a
//! two-state output-placement value (pending until the output tree is
//! known, resolved afterwards), per-argument donation flags and a name.
//! Compilation is memoized by a single-flight cache keyed on everything
//! that affects the compiled artifact. The call participates in partial
//! evaluation and forward-mode differentiation through the closed rewrite
//! rule set in [`MeshCallRules`].

pub mod cache;

use crate::cache::{ArtifactCache, build_cache_key};
use mj_core::tree::{ArgTree, TreeDef, TreeError, flatten_against_prefix};
use mj_core::{AbstractValue, Graph, Value};
use mj_interpreters::InterpreterError;
use mj_interpreters::shapes::abstract_eval;
use mj_mesh::ResourceEnv;
use mj_placement::typing::{NamedAxisContext, TypingError, resource_typecheck_call};
use mj_placement::{
    ParsedPlacement, PlacementError, ShardingMeta, ValueDescriptor, check_avals_against_resources,
    emit_sharding,
};
use mj_runtime::{
    ExecutionError, Lowering, LoweringError, LoweringRequest, PartitionedExecutable,
};
use std::fmt::Write;
use std::sync::Arc;

// ── Output placements ──────────────────────────────────────────────

/// A derivation applied to pending output placements by a transformation
/// wrapping the call. Structural equality makes re-derived pending states
/// content-equal, which keeps them usable as cache-key components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OutDerivation {
    /// Forward-mode differentiation appended one tangent output per
    /// nonzero-tangent result, each mirroring its primal's placement. The
    /// stored mask is over the call's *inputs*; the matching output mask is
    /// supplied at resolution time.
    AppendNonzeroTangents { nz_tangents: Vec<bool> },
}

/// Output placements not yet resolvable: the declared spec tree plus the
/// derivations stacked on top by enclosing transformations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingOutputs {
    pub base: ArgTree<ParsedPlacement>,
    pub derivations: Vec<OutDerivation>,
}

impl PendingOutputs {
    #[must_use]
    pub fn declared(base: ArgTree<ParsedPlacement>) -> Self {
        Self {
            base,
            derivations: Vec::new(),
        }
    }

    /// Resolves against the now-known output tree. `nz_out_masks` supplies
    /// one output-nonzero mask per stacked derivation, each over the output
    /// list as it stood when that derivation was applied.
    pub fn resolve(
        &self,
        out_tree: &TreeDef,
        nz_out_masks: &[Vec<bool>],
    ) -> Result<Vec<ParsedPlacement>, RewriteError> {
        if nz_out_masks.len() != self.derivations.len() {
            return Err(RewriteError::DerivationMaskCount {
                expected: self.derivations.len(),
                actual: nz_out_masks.len(),
            });
        }

        let mut resolved = flatten_against_prefix("out_placements", out_tree, &self.base)?;
        for (derivation, mask) in self.derivations.iter().zip(nz_out_masks.iter()) {
            match derivation {
                OutDerivation::AppendNonzeroTangents { .. } => {
                    if mask.len() != resolved.len() {
                        return Err(RewriteError::MaskLengthMismatch {
                            what: "nonzero-tangent output mask",
                            expected: resolved.len(),
                            actual: mask.len(),
                        });
                    }
                    let appended: Vec<ParsedPlacement> = resolved
                        .iter()
                        .zip(mask.iter())
                        .filter(|(_, nz)| **nz)
                        .map(|(placement, _)| placement.clone())
                        .collect();
                    resolved.extend(appended);
                }
            }
        }
        Ok(resolved)
    }

    #[must_use]
    pub fn canonical_string(&self) -> String {
        let mut out = String::from("pending:");
        write_spec_tree(&mut out, &self.base);
        for derivation in &self.derivations {
            match derivation {
                OutDerivation::AppendNonzeroTangents { nz_tangents } => {
                    out.push_str("+jvp[");
                    for nz in nz_tangents {
                        out.push(if *nz { 't' } else { 'f' });
                    }
                    out.push(']');
                }
            }
        }
        out
    }
}

fn write_spec_tree(out: &mut String, tree: &ArgTree<ParsedPlacement>) {
    match tree {
        ArgTree::Leaf(placement) => {
            let _ = write!(out, "{}~{};", placement.user_spec(), placement.canonical_string());
        }
        ArgTree::Tuple(items) => {
            out.push('(');
            for item in items {
                write_spec_tree(out, item);
            }
            out.push(')');
        }
    }
}

/// Output placements of one call: deferred until tracing fixes the output
/// tree, or a concrete per-output tuple afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OutPlacements {
    Pending(PendingOutputs),
    Resolved(Vec<ParsedPlacement>),
}

impl OutPlacements {
    #[must_use]
    pub fn canonical_string(&self) -> String {
        match self {
            Self::Pending(pending) => pending.canonical_string(),
            Self::Resolved(placements) => {
                let mut out = String::from("resolved:");
                for placement in placements {
                    let _ = write!(
                        out,
                        "{}~{};",
                        placement.user_spec(),
                        placement.canonical_string()
                    );
                }
                out
            }
        }
    }
}

// ── Call parameters ────────────────────────────────────────────────

/// Parameters of one partitioned call node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallParams {
    pub in_placements: Vec<ParsedPlacement>,
    pub out_placements: OutPlacements,
    pub donated: Vec<bool>,
    pub name: String,
}

impl CallParams {
    #[must_use]
    pub fn new(
        in_placements: Vec<ParsedPlacement>,
        out_placements: OutPlacements,
        donated: Vec<bool>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            in_placements,
            out_placements,
            donated,
            name: name.into(),
        }
    }

    /// Canonical text form of everything in the params that affects
    /// compilation identity.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        let _ = write!(&mut out, "name={}|in=", self.name);
        for placement in &self.in_placements {
            let _ = write!(
                &mut out,
                "{}~{};",
                placement.user_spec(),
                placement.canonical_string()
            );
        }
        let _ = write!(&mut out, "|out={}|donated=", self.out_placements.canonical_string());
        for donated in &self.donated {
            out.push(if *donated { 't' } else { 'f' });
        }
        out
    }
}

// ── Rewrite rules ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    MaskLengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    InvarCountTooSmall {
        new_invar_count: usize,
        unknown: usize,
    },
    LengthInvariantViolated {
        expected: usize,
        actual: usize,
    },
    DerivationMaskCount {
        expected: usize,
        actual: usize,
    },
    UnresolvedDerivations {
        pending: usize,
    },
    Tree(TreeError),
}

impl std::fmt::Display for RewriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaskLengthMismatch {
                what,
                expected,
                actual,
            } => {
                write!(f, "{what} has {actual} entries, call has {expected}")
            }
            Self::InvarCountTooSmall {
                new_invar_count,
                unknown,
            } => {
                write!(
                    f,
                    "rewritten call body has {new_invar_count} input(s), fewer than the \
                     {unknown} unknown original input(s)"
                )
            }
            Self::LengthInvariantViolated { expected, actual } => {
                write!(
                    f,
                    "rewritten placement list has {actual} entries, call body expects {expected}"
                )
            }
            Self::DerivationMaskCount { expected, actual } => {
                write!(
                    f,
                    "pending outputs carry {expected} derivation(s), got {actual} mask(s)"
                )
            }
            Self::UnresolvedDerivations { pending } => {
                write!(
                    f,
                    "output placements still carry {pending} unresolved derivation(s)"
                )
            }
            Self::Tree(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RewriteError {}

impl From<TreeError> for RewriteError {
    fn from(value: TreeError) -> Self {
        Self::Tree(value)
    }
}

/// The closed set of transformation-participation rules for the partitioned
/// call node: how its parameters are rewritten when partial evaluation or
/// forward-mode differentiation wraps the call, and how pending output
/// placements convert to resolved ones and back.
pub struct MeshCallRules;

impl MeshCallRules {
    /// Partial evaluation / staging rewrite.
    ///
    /// With no original input tracers (the call is replayed post hoc, all
    /// constants already folded in), every placement becomes replicated and
    /// nothing is donated. Otherwise the rewritten body keeps the unknown
    /// arguments and prepends `new_invar_count - unknown` hoisted
    /// constants, so the lists get a replicated/un-donated constant prefix
    /// followed by the entries at unknown positions. Output placements are
    /// recomputed fresh by the caller and installed as resolved.
    pub fn partial_eval_update(
        params: &CallParams,
        in_unknowns: &[bool],
        new_invar_count: usize,
        resolved_outs: Vec<ParsedPlacement>,
    ) -> Result<CallParams, RewriteError> {
        let (donated, in_placements) = if in_unknowns.is_empty() {
            (
                vec![false; new_invar_count],
                vec![ParsedPlacement::replicated(); new_invar_count],
            )
        } else {
            if in_unknowns.len() != params.in_placements.len() {
                return Err(RewriteError::MaskLengthMismatch {
                    what: "unknown-input mask",
                    expected: params.in_placements.len(),
                    actual: in_unknowns.len(),
                });
            }
            let unknown = in_unknowns.iter().filter(|unknown| **unknown).count();
            let num_consts = new_invar_count
                .checked_sub(unknown)
                .ok_or(RewriteError::InvarCountTooSmall {
                    new_invar_count,
                    unknown,
                })?;

            let mut donated = vec![false; num_consts];
            donated.extend(
                params
                    .donated
                    .iter()
                    .zip(in_unknowns.iter())
                    .filter(|(_, unknown)| **unknown)
                    .map(|(flag, _)| *flag),
            );

            let mut in_placements = vec![ParsedPlacement::replicated(); num_consts];
            in_placements.extend(
                params
                    .in_placements
                    .iter()
                    .zip(in_unknowns.iter())
                    .filter(|(_, unknown)| **unknown)
                    .map(|(placement, _)| placement.clone()),
            );

            (donated, in_placements)
        };

        if in_placements.len() != new_invar_count || donated.len() != new_invar_count {
            return Err(RewriteError::LengthInvariantViolated {
                expected: new_invar_count,
                actual: in_placements.len(),
            });
        }

        Ok(CallParams {
            in_placements,
            out_placements: OutPlacements::Resolved(resolved_outs),
            donated,
            name: params.name.clone(),
        })
    }

    /// Forward-mode differentiation rewrite: appends one entry per nonzero
    /// tangent input, mirroring that input's placement and donation flag,
    /// and stacks the matching output derivation onto the pending state.
    ///
    /// Pure in its inputs: rewriting the same params with the same mask
    /// twice yields structurally equal results, so the rewritten params
    /// stay cache-key stable.
    pub fn jvp_update(
        params: &CallParams,
        nz_tangents: &[bool],
    ) -> Result<CallParams, RewriteError> {
        if nz_tangents.len() != params.in_placements.len() {
            return Err(RewriteError::MaskLengthMismatch {
                what: "nonzero-tangent input mask",
                expected: params.in_placements.len(),
                actual: nz_tangents.len(),
            });
        }

        let mut donated = params.donated.clone();
        donated.extend(
            params
                .donated
                .iter()
                .zip(nz_tangents.iter())
                .filter(|(_, nz)| **nz)
                .map(|(flag, _)| *flag),
        );

        let mut in_placements = params.in_placements.clone();
        in_placements.extend(
            params
                .in_placements
                .iter()
                .zip(nz_tangents.iter())
                .filter(|(_, nz)| **nz)
                .map(|(placement, _)| placement.clone()),
        );

        let mut pending = match &params.out_placements {
            OutPlacements::Pending(pending) => pending.clone(),
            OutPlacements::Resolved(placements) => PendingOutputs::declared(ArgTree::Tuple(
                placements.iter().cloned().map(ArgTree::Leaf).collect(),
            )),
        };
        pending.derivations.push(OutDerivation::AppendNonzeroTangents {
            nz_tangents: nz_tangents.to_vec(),
        });

        Ok(CallParams {
            in_placements,
            out_placements: OutPlacements::Pending(pending),
            donated,
            name: params.name.clone(),
        })
    }

    /// Converts pending output placements into a concrete resolved tuple
    /// once tracing is complete and the output tree is final. Resolved
    /// params pass through unchanged.
    pub fn finalize(
        params: &CallParams,
        out_tree: &TreeDef,
        nz_out_masks: &[Vec<bool>],
    ) -> Result<CallParams, RewriteError> {
        let resolved = match &params.out_placements {
            OutPlacements::Resolved(placements) => placements.clone(),
            OutPlacements::Pending(pending) => pending.resolve(out_tree, nz_out_masks)?,
        };
        Ok(CallParams {
            in_placements: params.in_placements.clone(),
            out_placements: OutPlacements::Resolved(resolved),
            donated: params.donated.clone(),
            name: params.name.clone(),
        })
    }

    /// Re-defers resolved output placements for re-entry into a
    /// transformation that expects a pending state. The deferred base is a
    /// flat tuple, one leaf per output.
    #[must_use]
    pub fn defer(params: &CallParams) -> CallParams {
        let out_placements = match &params.out_placements {
            OutPlacements::Pending(pending) => OutPlacements::Pending(pending.clone()),
            OutPlacements::Resolved(placements) => {
                OutPlacements::Pending(PendingOutputs::declared(ArgTree::Tuple(
                    placements.iter().cloned().map(ArgTree::Leaf).collect(),
                )))
            }
        };
        CallParams {
            in_placements: params.in_placements.clone(),
            out_placements,
            donated: params.donated.clone(),
            name: params.name.clone(),
        }
    }
}

// ── Dispatch ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum DispatchError {
    ParamArity {
        detail: String,
    },
    Placement(PlacementError),
    Typing(TypingError),
    Rewrite(RewriteError),
    AbstractEval(InterpreterError),
    Lowering(LoweringError),
    Execution(ExecutionError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ParamArity { detail } => write!(f, "call parameter mismatch: {detail}"),
            Self::Placement(err) => write!(f, "placement error: {err}"),
            Self::Typing(err) => write!(f, "resource typing error: {err}"),
            Self::Rewrite(err) => write!(f, "call rewrite error: {err}"),
            Self::AbstractEval(err) => write!(f, "abstract evaluation error: {err}"),
            Self::Lowering(err) => write!(f, "lowering error: {err}"),
            Self::Execution(err) => write!(f, "execution error: {err}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<PlacementError> for DispatchError {
    fn from(value: PlacementError) -> Self {
        Self::Placement(value)
    }
}

impl From<TypingError> for DispatchError {
    fn from(value: TypingError) -> Self {
        Self::Typing(value)
    }
}

impl From<RewriteError> for DispatchError {
    fn from(value: RewriteError) -> Self {
        Self::Rewrite(value)
    }
}

impl From<LoweringError> for DispatchError {
    fn from(value: LoweringError) -> Self {
        Self::Lowering(value)
    }
}

impl From<ExecutionError> for DispatchError {
    fn from(value: ExecutionError) -> Self {
        Self::Execution(value)
    }
}

/// Compiles (or reuses) the partitioned executable for one call.
///
/// Input placements are assumed already validated against the argument
/// shapes by the caller; output placements are validated here once the
/// output descriptors are known, before lowering. Exactly one compilation
/// happens per distinct cache key, and a failed compilation leaves the key
/// absent.
#[allow(clippy::too_many_arguments)]
pub fn compile(
    graph: &Graph,
    consts: &[Value],
    params: &CallParams,
    out_tree: &TreeDef,
    env: &ResourceEnv,
    named_ctx: &NamedAxisContext,
    lowering: &dyn Lowering,
    artifacts: &ArtifactCache,
    in_avals: &[AbstractValue],
) -> Result<Arc<dyn PartitionedExecutable>, DispatchError> {
    if in_avals.len() != graph.invars.len() {
        return Err(DispatchError::ParamArity {
            detail: format!(
                "graph has {} input(s), got {} argument(s)",
                graph.invars.len(),
                in_avals.len()
            ),
        });
    }
    if params.in_placements.len() != in_avals.len() || params.donated.len() != in_avals.len() {
        return Err(DispatchError::ParamArity {
            detail: format!(
                "{} argument(s) paired with {} placement(s) and {} donation flag(s)",
                in_avals.len(),
                params.in_placements.len(),
                params.donated.len()
            ),
        });
    }

    let mut payload = String::new();
    let _ = write!(
        &mut payload,
        "graph={}|consts=",
        graph.canonical_fingerprint()
    );
    for constant in consts {
        payload.push_str(&constant.canonical_string());
        payload.push(';');
    }
    let _ = write!(
        &mut payload,
        "|env={}|params={}|avals=",
        env.fingerprint(),
        params.canonical_string()
    );
    for aval in in_avals {
        payload.push_str(&aval.canonical_string());
        payload.push(';');
    }
    let key = build_cache_key(&payload);

    artifacts.get_or_compile(&key, || -> Result<_, DispatchError> {
        log::debug!(
            "compiling partitioned call '{}' (mesh {}, {} arg(s))",
            params.name,
            env.fingerprint(),
            in_avals.len(),
        );

        let const_avals: Vec<AbstractValue> = consts.iter().map(Value::abstract_value).collect();
        let out_avals =
            abstract_eval(graph, &const_avals, in_avals).map_err(DispatchError::AbstractEval)?;

        // The deferred output placements become resolvable only now that
        // the output descriptors exist.
        let resolved_outs = match &params.out_placements {
            OutPlacements::Resolved(placements) => placements.clone(),
            OutPlacements::Pending(pending) => {
                if !pending.derivations.is_empty() {
                    return Err(RewriteError::UnresolvedDerivations {
                        pending: pending.derivations.len(),
                    }
                    .into());
                }
                pending.resolve(out_tree, &[])?
            }
        };

        check_avals_against_resources(
            "partitioned call outputs",
            env,
            &out_avals,
            &resolved_outs,
        )?;

        resource_typecheck_call(
            &params.name,
            graph,
            named_ctx,
            &params.in_placements,
            &resolved_outs,
        )?;

        let in_shardings = emit_boundary(
            "partitioned call inputs",
            in_avals,
            &params.in_placements,
            env,
        )?;
        let out_shardings =
            emit_boundary("partitioned call outputs", &out_avals, &resolved_outs, env)?;

        let request = LoweringRequest {
            graph,
            name: &params.name,
            mesh: env.mesh(),
            consts,
            in_avals,
            out_avals: &out_avals,
            in_shardings: &in_shardings,
            out_shardings: &out_shardings,
            donated: &params.donated,
        };
        lowering.lower_and_compile(&request).map_err(DispatchError::from)
    })
}

/// Compiles the call (reusing a cached artifact when one exists) and runs
/// it on the given flat arguments.
#[allow(clippy::too_many_arguments)]
pub fn compile_and_run(
    graph: &Graph,
    consts: &[Value],
    params: &CallParams,
    out_tree: &TreeDef,
    env: &ResourceEnv,
    named_ctx: &NamedAxisContext,
    lowering: &dyn Lowering,
    artifacts: &ArtifactCache,
    args: &[Value],
) -> Result<Vec<Value>, DispatchError> {
    let in_avals: Vec<AbstractValue> = args.iter().map(Value::abstract_value).collect();
    let executable = compile(
        graph, consts, params, out_tree, env, named_ctx, lowering, artifacts, &in_avals,
    )?;
    executable.execute(args).map_err(DispatchError::from)
}

fn emit_boundary(
    what: &str,
    avals: &[AbstractValue],
    placements: &[ParsedPlacement],
    env: &ResourceEnv,
) -> Result<Vec<ShardingMeta>, PlacementError> {
    avals
        .iter()
        .zip(placements.iter())
        .map(|(aval, placement)| {
            emit_sharding(
                what,
                &ValueDescriptor::Shaped(aval.clone()),
                placement,
                env.mesh(),
            )
        })
        .collect()
}
