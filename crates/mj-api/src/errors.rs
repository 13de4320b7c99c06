use mj_core::tree::TreeError;
use mj_dispatch::DispatchError;
use mj_placement::PlacementError;

#[derive(Debug)]
pub enum ApiError {
    /// A constant or donated argument index does not fit the call arity.
    ArgnumOutOfRange {
        kind: &'static str,
        index: usize,
        arity: usize,
    },
    /// The same argument position was marked both constant and donated.
    StaticDonateOverlap { index: usize },
    /// A compile-time-constant argument was a container, not a value.
    StaticArgMustBeLeaf { index: usize },
    /// The call received a different number of values than the wrapped
    /// program declares.
    ArgumentCount {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    /// The declared output tree does not cover the program's outputs.
    OutputTreeMismatch { outputs: usize, tree_leaves: usize },
    /// The sharding constraint operator was invoked on concrete values,
    /// outside any compiled, partitioned computation.
    ConstraintOutsideCompiledContext,
    Placement(PlacementError),
    Tree(TreeError),
    Dispatch(DispatchError),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArgnumOutOfRange { kind, index, arity } => {
                write!(
                    f,
                    "{kind} argument index {index} is out of range for a call with {arity} \
                     positional argument(s)"
                )
            }
            Self::StaticDonateOverlap { index } => {
                write!(
                    f,
                    "argument {index} is marked both compile-time-constant and donated"
                )
            }
            Self::StaticArgMustBeLeaf { index } => {
                write!(
                    f,
                    "compile-time-constant argument {index} must be a single value, not a \
                     container"
                )
            }
            Self::ArgumentCount {
                what,
                expected,
                actual,
            } => {
                write!(f, "{what}: expected {expected}, got {actual}")
            }
            Self::OutputTreeMismatch {
                outputs,
                tree_leaves,
            } => {
                write!(
                    f,
                    "program produces {outputs} output(s), declared output tree has \
                     {tree_leaves} leaf(s)"
                )
            }
            Self::ConstraintOutsideCompiledContext => {
                write!(
                    f,
                    "sharding_constraint must be used inside a compiled, partitioned \
                     computation"
                )
            }
            Self::Placement(err) => write!(f, "{err}"),
            Self::Tree(err) => write!(f, "{err}"),
            Self::Dispatch(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<PlacementError> for ApiError {
    fn from(value: PlacementError) -> Self {
        Self::Placement(value)
    }
}

impl From<TreeError> for ApiError {
    fn from(value: TreeError) -> Self {
        Self::Tree(value)
    }
}

impl From<DispatchError> for ApiError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}
