#![forbid(unsafe_code)]

//! Logical resource topology: named mesh axes and the resource environment
//! read by the partitioning engine at call time.
//!
//! A mesh organizes compute slots into a multi-dimensional grid where each
//! dimension has a human-readable name. Slots are addressed in row-major
//! order with respect to the axis list: for axes `("x"=4, "y"=2)`, the slot
//! at mesh coordinate `(i, j)` has linear index `i * 2 + j`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    EmptyAxisName,
    InvalidAxisSize { axis: String },
    DuplicateAxisName { axis: String },
    SlotCountOverflow,
}

impl std::fmt::Display for MeshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyAxisName => write!(f, "mesh axis names must be non-empty"),
            Self::InvalidAxisSize { axis } => {
                write!(f, "mesh axis '{axis}' must have size > 0")
            }
            Self::DuplicateAxisName { axis } => {
                write!(f, "mesh axis '{axis}' appears more than once")
            }
            Self::SlotCountOverflow => {
                write!(f, "mesh slot count overflowed while multiplying axis sizes")
            }
        }
    }
}

impl std::error::Error for MeshError {}

/// One named dimension of the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshAxis {
    name: String,
    size: u64,
}

impl MeshAxis {
    pub fn new(name: impl Into<String>, size: u64) -> Result<Self, MeshError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(MeshError::EmptyAxisName);
        }
        if size == 0 {
            return Err(MeshError::InvalidAxisSize { axis: name });
        }
        Ok(Self { name, size })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Ordered collection of named resource axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mesh {
    axes: Vec<MeshAxis>,
    #[serde(skip)]
    index_by_name: BTreeMap<String, usize>,
}

impl Mesh {
    pub fn new(axes: Vec<MeshAxis>) -> Result<Self, MeshError> {
        let mut index_by_name = BTreeMap::new();
        for (axis_index, axis) in axes.iter().enumerate() {
            if index_by_name
                .insert(axis.name.clone(), axis_index)
                .is_some()
            {
                return Err(MeshError::DuplicateAxisName {
                    axis: axis.name.clone(),
                });
            }
        }
        Ok(Self {
            axes,
            index_by_name,
        })
    }

    #[must_use]
    pub fn axes(&self) -> &[MeshAxis] {
        &self.axes
    }

    #[must_use]
    pub fn axis_index(&self, name: &str) -> Option<usize> {
        self.index_by_name.get(name).copied()
    }

    #[must_use]
    pub fn axis_size(&self, name: &str) -> Option<u64> {
        self.axis_index(name).map(|index| self.axes[index].size)
    }

    /// Total number of compute slots in the grid.
    pub fn slot_count(&self) -> Result<u64, MeshError> {
        self.axes
            .iter()
            .try_fold(1_u64, |count, axis| count.checked_mul(axis.size))
            .ok_or(MeshError::SlotCountOverflow)
    }
}

/// Ambient resource scope for one partitioned call.
///
/// Established by the caller and threaded explicitly into every call; the
/// engine reads it and never mutates it, so it is safe to share across
/// concurrent calls without synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceEnv {
    mesh: Mesh,
    local_shape: BTreeMap<String, u64>,
}

impl ResourceEnv {
    #[must_use]
    pub fn new(mesh: Mesh) -> Self {
        let local_shape = mesh
            .axes()
            .iter()
            .map(|axis| (axis.name().to_owned(), axis.size()))
            .collect();
        Self { mesh, local_shape }
    }

    #[must_use]
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Resource-axis name to size, for divisibility checks.
    #[must_use]
    pub fn local_shape(&self) -> &BTreeMap<String, u64> {
        &self.local_shape
    }

    #[must_use]
    pub fn axis_size(&self, name: &str) -> Option<u64> {
        self.local_shape.get(name).copied()
    }

    /// Stable identity of this environment for cache-key participation.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut out = String::from("mesh=");
        for axis in self.mesh.axes() {
            let _ = write!(&mut out, "{}:{};", axis.name(), axis.size());
        }
        out
    }
}

/// Convenience constructor for `(name, size)` pair lists.
pub fn mesh_from_pairs(pairs: &[(&str, u64)]) -> Result<Mesh, MeshError> {
    let axes = pairs
        .iter()
        .map(|(name, size)| MeshAxis::new(*name, *size))
        .collect::<Result<Vec<_>, _>>()?;
    Mesh::new(axes)
}
