//! Kernel metadata: local sizes, dimensionality, handler choice.
//!
//! The host side records the work-group shape as module metadata
//! (`WGLocalSizeX/Y/Z`, `WGDynamicLocalSize`) and the per-dimension index
//! and size globals (`_local_id_*`, `_local_size_*`). This module gathers
//! all of it into one [`KernelInfo`] so the pass never touches raw
//! metadata keys.

use veld_ir::{Function, GlobalId, Module, Type};

pub const LOCAL_ID_GLOBAL_NAMES: [&str; 3] = ["_local_id_x", "_local_id_y", "_local_id_z"];
pub const LOCAL_SIZE_GLOBAL_NAMES: [&str; 3] = ["_local_size_x", "_local_size_y", "_local_size_z"];

/// Which work-item handler lowers this module's kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemHandler {
    /// Continuation-based synchronization; the handler this crate
    /// implements.
    Cbs,
    /// The legacy loop-based handler, implemented elsewhere.
    Loops,
}

/// Work-group shape and globals of one module, as the pass consumes them.
#[derive(Debug, Clone)]
pub struct KernelInfo {
    /// Compile-time local sizes per dimension; meaningful only when
    /// `dynamic_local_size` is false.
    pub local_sizes: [u64; 3],
    /// Local sizes are only known at enqueue time and must be loaded from
    /// the `_local_size_*` globals.
    pub dynamic_local_size: bool,
    /// Number of active dimensions, 1 to 3.
    pub dim: usize,
    pub handler: WorkItemHandler,
    pub local_id_globals: [GlobalId; 3],
    pub local_size_globals: [GlobalId; 3],
}

impl KernelInfo {
    /// Read the work-group shape from module metadata, creating the index
    /// and size globals if the host did not declare them yet.
    pub fn from_module(module: &mut Module) -> Self {
        let local_sizes = [
            module.int_metadata("WGLocalSizeX").unwrap_or(1),
            module.int_metadata("WGLocalSizeY").unwrap_or(1),
            module.int_metadata("WGLocalSizeZ").unwrap_or(1),
        ];
        let dynamic_local_size = module.bool_metadata("WGDynamicLocalSize").unwrap_or(false);

        // A trailing size of 1 drops the dimension, unless sizes are
        // dynamic and could grow at enqueue time.
        let dim = if local_sizes[2] == 1 && !dynamic_local_size {
            if local_sizes[1] == 1 { 1 } else { 2 }
        } else {
            3
        };

        let handler =
            if module.bool_metadata("WGCbsHandler").unwrap_or(true) { WorkItemHandler::Cbs } else { WorkItemHandler::Loops };

        let mut global = |names: [&str; 3]| {
            [
                module.ensure_global(names[0], Type::largest_int()),
                module.ensure_global(names[1], Type::largest_int()),
                module.ensure_global(names[2], Type::largest_int()),
            ]
        };
        let local_id_globals = global(LOCAL_ID_GLOBAL_NAMES);
        let local_size_globals = global(LOCAL_SIZE_GLOBAL_NAMES);

        Self { local_sizes, dynamic_local_size, dim, handler, local_id_globals, local_size_globals }
    }

    /// Total number of work-items in the group, when statically known.
    pub fn flat_size(&self) -> Option<u64> {
        (!self.dynamic_local_size).then(|| self.local_sizes.iter().product())
    }
}

/// Whether `func` is a kernel this pass still has to handle. Flattened
/// functions are not processed twice.
pub fn is_kernel_to_process(module: &Module, func: &Function) -> bool {
    module.is_kernel(&func.name) && !func.flattened
}
