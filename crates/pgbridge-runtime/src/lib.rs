//! Host side of the sandboxed SQL parser.
//!
//! The parser itself is an opaque WebAssembly guest; this crate is the
//! bridge that compiles and instantiates it, marshals memory across the
//! host/guest boundary, dispatches guest exports with a C-compatible
//! calling convention, decodes guest error records, and pools initialized
//! instances across calls.

pub mod instance;
pub mod memory;
pub mod ops;
pub mod pool;
pub mod wasix;

pub use instance::GuestInstance;
pub use memory::{GuestAddr, GuestString};
pub use ops::Bridge;
pub use pool::{Checkout, Pool};

use instance::GuestState;
use pgbridge_core::{Fault, Result, RuntimeConfig};
use wasmtime::{Config, Engine, Linker, Module};
use wasmtime_wasi::preview1;

/// The compiled guest module plus everything needed to stamp out fresh
/// instances of it.
///
/// Compilation happens exactly once, when the runtime is created; a
/// compilation failure is fatal and is surfaced as [`Fault::Compile`].
/// Instances produced by [`Runtime::instantiate`] never share linear
/// memory or export caches.
pub struct Runtime {
    engine: Engine,
    module: Module,
    linker: Linker<GuestState>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Compile `guest_wasm` and register the host import groups the guest
    /// links against: WASI preview1 (descriptors, clocks) and the
    /// `wasix_32v1` threading/stack-snapshot shim.
    pub fn new(guest_wasm: &[u8], config: RuntimeConfig) -> Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.wasm_threads(true);
        wasm_config.max_wasm_stack(config.max_wasm_stack);

        let engine = Engine::new(&wasm_config).map_err(Fault::Compile)?;
        let module = Module::new(&engine, guest_wasm).map_err(Fault::Compile)?;

        let mut linker = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut GuestState| &mut state.wasi)
            .map_err(Fault::Compile)?;
        wasix::add_to_linker(&mut linker).map_err(Fault::Compile)?;

        tracing::debug!("compiled guest module");

        Ok(Self {
            engine,
            module,
            linker,
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Create a fresh, fully-initialized guest instance.
    pub fn instantiate(&self) -> Result<GuestInstance> {
        GuestInstance::new(&self.engine, &self.module, &self.linker)
    }
}
