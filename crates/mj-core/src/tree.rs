//! Nested argument containers and their structure descriptors.
//!
//! Placement declarations and call arguments both arrive as trees. The core
//! engine works on flat leaf lists plus a [`TreeDef`] describing the nesting,
//! and broadcasts declaration *prefixes* over deeper argument trees: a leaf
//! standing in for a subtree applies to every leaf of that subtree, while an
//! explicit tuple must match the subtree's arity exactly.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgTree<T> {
    Leaf(T),
    Tuple(Vec<ArgTree<T>>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeDef {
    Leaf,
    Tuple(Vec<TreeDef>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    LeafCountMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },
    PrefixArityMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },
    PrefixDeeperThanTree {
        label: String,
    },
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LeafCountMismatch {
                label,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "{label}: leaf count mismatch: structure expects {expected}, got {actual}"
                )
            }
            Self::PrefixArityMismatch {
                label,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "{label}: tuple arity mismatch: tree has {expected} entries, \
                     declaration has {actual}"
                )
            }
            Self::PrefixDeeperThanTree { label } => {
                write!(f, "{label}: declaration is nested deeper than the tree it describes")
            }
        }
    }
}

impl std::error::Error for TreeError {}

impl<T> ArgTree<T> {
    #[must_use]
    pub fn leaf(value: T) -> Self {
        Self::Leaf(value)
    }

    #[must_use]
    pub fn tuple(items: Vec<ArgTree<T>>) -> Self {
        Self::Tuple(items)
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Tuple(items) => items.iter().map(ArgTree::leaf_count).sum(),
        }
    }

    /// Flattens into depth-first leaf order plus the structure descriptor.
    #[must_use]
    pub fn flatten(self) -> (Vec<T>, TreeDef) {
        let mut leaves = Vec::new();
        let def = flatten_into(self, &mut leaves);
        (leaves, def)
    }

    /// Borrowing variant of [`ArgTree::flatten`].
    #[must_use]
    pub fn flatten_ref(&self) -> (Vec<&T>, TreeDef) {
        let mut leaves = Vec::new();
        let def = flatten_ref_into(self, &mut leaves);
        (leaves, def)
    }

    #[must_use]
    pub fn structure(&self) -> TreeDef {
        match self {
            Self::Leaf(_) => TreeDef::Leaf,
            Self::Tuple(items) => TreeDef::Tuple(items.iter().map(ArgTree::structure).collect()),
        }
    }
}

fn flatten_into<T>(tree: ArgTree<T>, leaves: &mut Vec<T>) -> TreeDef {
    match tree {
        ArgTree::Leaf(value) => {
            leaves.push(value);
            TreeDef::Leaf
        }
        ArgTree::Tuple(items) => TreeDef::Tuple(
            items
                .into_iter()
                .map(|item| flatten_into(item, leaves))
                .collect(),
        ),
    }
}

fn flatten_ref_into<'a, T>(tree: &'a ArgTree<T>, leaves: &mut Vec<&'a T>) -> TreeDef {
    match tree {
        ArgTree::Leaf(value) => {
            leaves.push(value);
            TreeDef::Leaf
        }
        ArgTree::Tuple(items) => TreeDef::Tuple(
            items
                .iter()
                .map(|item| flatten_ref_into(item, leaves))
                .collect(),
        ),
    }
}

impl TreeDef {
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf => 1,
            Self::Tuple(items) => items.iter().map(TreeDef::leaf_count).sum(),
        }
    }

    /// Structure of a flat tuple holding `count` leaves.
    #[must_use]
    pub fn tuple_of_leaves(count: usize) -> Self {
        Self::Tuple(vec![Self::Leaf; count])
    }
}

/// Rebuilds a tree of the given structure from depth-first-ordered leaves.
pub fn unflatten<T>(label: &str, def: &TreeDef, leaves: Vec<T>) -> Result<ArgTree<T>, TreeError> {
    let expected = def.leaf_count();
    if leaves.len() != expected {
        return Err(TreeError::LeafCountMismatch {
            label: label.to_owned(),
            expected,
            actual: leaves.len(),
        });
    }
    let mut iter = leaves.into_iter();
    let tree = unflatten_next(def, &mut iter);
    Ok(tree)
}

fn unflatten_next<T>(def: &TreeDef, leaves: &mut impl Iterator<Item = T>) -> ArgTree<T> {
    match def {
        TreeDef::Leaf => {
            // Leaf count was checked up front, so the iterator cannot run dry.
            let value = leaves.next().expect("leaf count already validated");
            ArgTree::Leaf(value)
        }
        TreeDef::Tuple(items) => ArgTree::Tuple(
            items
                .iter()
                .map(|item| unflatten_next(item, leaves))
                .collect(),
        ),
    }
}

/// Broadcasts a declaration prefix over `full`, producing one entry per leaf
/// of `full` in depth-first order.
pub fn flatten_against_prefix<T: Clone>(
    label: &str,
    full: &TreeDef,
    prefix: &ArgTree<T>,
) -> Result<Vec<T>, TreeError> {
    let mut out = Vec::with_capacity(full.leaf_count());
    broadcast_prefix(label, full, prefix, &mut out)?;
    Ok(out)
}

fn broadcast_prefix<T: Clone>(
    label: &str,
    full: &TreeDef,
    prefix: &ArgTree<T>,
    out: &mut Vec<T>,
) -> Result<(), TreeError> {
    match (full, prefix) {
        (_, ArgTree::Leaf(value)) => {
            for _ in 0..full.leaf_count() {
                out.push(value.clone());
            }
            Ok(())
        }
        (TreeDef::Leaf, ArgTree::Tuple(_)) => Err(TreeError::PrefixDeeperThanTree {
            label: label.to_owned(),
        }),
        (TreeDef::Tuple(full_items), ArgTree::Tuple(prefix_items)) => {
            if full_items.len() != prefix_items.len() {
                return Err(TreeError::PrefixArityMismatch {
                    label: label.to_owned(),
                    expected: full_items.len(),
                    actual: prefix_items.len(),
                });
            }
            for (full_item, prefix_item) in full_items.iter().zip(prefix_items.iter()) {
                broadcast_prefix(label, full_item, prefix_item, out)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ArgTree, TreeDef, TreeError, flatten_against_prefix, unflatten};

    fn nested() -> ArgTree<i32> {
        // (1, (2, 3), 4)
        ArgTree::tuple(vec![
            ArgTree::leaf(1),
            ArgTree::tuple(vec![ArgTree::leaf(2), ArgTree::leaf(3)]),
            ArgTree::leaf(4),
        ])
    }

    #[test]
    fn flatten_unflatten_roundtrip() {
        let tree = nested();
        let (leaves, def) = tree.clone().flatten();
        assert_eq!(leaves, vec![1, 2, 3, 4]);
        let rebuilt = unflatten("args", &def, leaves).expect("unflatten should succeed");
        assert_eq!(rebuilt, tree);
    }

    #[test]
    fn unflatten_rejects_wrong_leaf_count() {
        let def = nested().structure();
        let err = unflatten("results", &def, vec![1, 2]).expect_err("count mismatch");
        assert_eq!(
            err,
            TreeError::LeafCountMismatch {
                label: "results".to_owned(),
                expected: 4,
                actual: 2,
            }
        );
    }

    #[test]
    fn leaf_prefix_broadcasts_over_whole_tree() {
        let def = nested().structure();
        let out = flatten_against_prefix("in_placements", &def, &ArgTree::leaf("r"))
            .expect("broadcast should succeed");
        assert_eq!(out, vec!["r"; 4]);
    }

    #[test]
    fn leaf_prefix_inside_tuple_broadcasts_over_subtree() {
        let def = nested().structure();
        // One entry per top-level argument; the middle one covers (2, 3).
        let prefix = ArgTree::tuple(vec![
            ArgTree::leaf("a"),
            ArgTree::leaf("b"),
            ArgTree::leaf("c"),
        ]);
        let out = flatten_against_prefix("in_placements", &def, &prefix)
            .expect("broadcast should succeed");
        assert_eq!(out, vec!["a", "b", "b", "c"]);
    }

    #[test]
    fn tuple_prefix_must_match_arity_exactly() {
        let def = nested().structure();
        let prefix = ArgTree::tuple(vec![ArgTree::leaf("a"), ArgTree::leaf("b")]);
        let err =
            flatten_against_prefix("in_placements", &def, &prefix).expect_err("arity mismatch");
        assert_eq!(
            err,
            TreeError::PrefixArityMismatch {
                label: "in_placements".to_owned(),
                expected: 3,
                actual: 2,
            }
        );
    }

    #[test]
    fn tuple_prefix_never_broadcasts_as_leaf() {
        // A tuple declaration facing a single leaf is an error, not a broadcast.
        let def = TreeDef::Leaf;
        let prefix = ArgTree::tuple(vec![ArgTree::leaf("a")]);
        let err = flatten_against_prefix("out_placements", &def, &prefix)
            .expect_err("tuple vs leaf should fail");
        assert_eq!(
            err,
            TreeError::PrefixDeeperThanTree {
                label: "out_placements".to_owned(),
            }
        );
    }

    #[test]
    fn exact_match_and_prefix_coincide_for_leaf_specs() {
        // A leaf spec over a leaf tree: broadcast and exact match agree.
        let out = flatten_against_prefix("in_placements", &TreeDef::Leaf, &ArgTree::leaf(7))
            .expect("should succeed");
        assert_eq!(out, vec![7]);
    }
}
