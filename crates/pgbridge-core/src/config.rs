//! Configuration for the guest runtime.

use serde::{Deserialize, Serialize};

/// Runtime configuration for guest instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum host stack available to a guest call (bytes). The parser
    /// recurses on deeply nested expressions, so this is above wasmtime's
    /// default.
    pub max_wasm_stack: usize,
    /// Number of guest instances instantiated eagerly when the pool is
    /// created. Zero means instances are created on first checkout.
    pub prewarm: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_wasm_stack: 1024 * 1024, // 1 MiB
            prewarm: 0,
        }
    }
}
