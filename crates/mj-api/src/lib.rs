#![forbid(unsafe_code)]

pub mod constraint;
pub mod errors;
pub mod parallel;

pub use constraint::{sharding_constraint, with_sharding_constraint};
pub use errors::ApiError;
pub use parallel::{Engine, Parallelized, ParallelizeBuilder, parallelize};
