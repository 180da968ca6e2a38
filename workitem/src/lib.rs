//! Work-group flattening for the Veld OpenCL kernel compiler.
//!
//! A kernel function describes a single work-item. To execute a whole
//! work-group on one scalar CPU thread, every work-item must be interleaved
//! so that nobody advances past a barrier before the rest of the group
//! arrives. This crate implements the continuation-based synchronization
//! (CBS) formation: the kernel CFG is cut into barrier-bounded sub-CFGs,
//! each sub-CFG is wrapped in work-item loops over the local index space,
//! values that live across barriers are widened to per-work-item storage,
//! and a dispatcher loop re-enters the sub-CFG selected by the last barrier
//! that completed.
//!
//! # Module Organization
//!
//! - [`kernel_info`] - local sizes, dimensionality and handler choice from
//!   module metadata
//! - [`uniformity`] - variable uniformity analysis
//! - [`barrier`] - barrier-block predicates and the barrier id map
//! - [`arrayify`] - per-work-item widening of values and allocas
//! - [`wiloops`] - work-item loop scaffolding and the contiguous index
//! - [`subcfg`] - sub-CFG discovery, replication and SSA repair
//! - [`formation`] - the pass driver: dispatcher, alloca widening, and the
//!   barrier-free fallback
//!
//! Kernels reach this crate in canonical form: barrier calls sit alone in
//! their blocks, the entry block ends in an unconditional branch, and every
//! function exit is a barrier block. The barrier canonicalization pass
//! establishing that shape runs earlier in the pipeline.

pub mod arrayify;
pub mod barrier;
pub mod error;
pub mod formation;
pub mod kernel_info;
pub mod subcfg;
pub mod uniformity;
pub mod wiloops;

#[cfg(test)]
pub mod test;

pub use error::{Error, Result};
pub use formation::{run_on_function, run_on_function_with_uniformity};
pub use kernel_info::{KernelInfo, WorkItemHandler};
pub use uniformity::VariableUniformity;

/// Number of per-work-item slots in a widened alloca. Bounds the largest
/// supported work-group.
pub const NUM_ARRAY_ELEMENTS: u64 = 1024;

/// Alignment of widened allocas, in bytes.
pub const DEFAULT_ALIGNMENT: u64 = 64;

/// What the pass did to the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not a kernel to process, or the chosen handler is not CBS.
    Unchanged,
    /// No barriers: the whole body was wrapped in work-item loops.
    WrappedInLoops,
    /// Barrier-bounded sub-CFGs were formed and stitched with a dispatcher.
    SubCfgsFormed { sub_cfgs: usize },
}
