//! Guest instance management and the function dispatch table.

use std::collections::HashMap;

use pgbridge_core::{Fault, Result};
use wasmtime::{Engine, Func, Instance, Linker, Memory, Module, Store, Val, ValType};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::WasiCtxBuilder;

use crate::memory::GuestAddr;
use crate::wasix::{self, ShimState};

/// Per-store host state: the WASI context plus the snapshot shim's
/// checkpoint table.
pub struct GuestState {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) shim: ShimState,
}

/// One live, initialized guest module.
///
/// Owned exclusively by whichever caller currently holds it checked out of
/// the pool; never entered by two callers at once.
pub struct GuestInstance {
    pub(crate) store: Store<GuestState>,
    pub(crate) memory: Memory,
    instance: Instance,
    funcs: HashMap<&'static str, Func>,
}

impl GuestInstance {
    pub(crate) fn new(
        engine: &Engine,
        module: &Module,
        linker: &Linker<GuestState>,
    ) -> Result<Self> {
        let wasi = WasiCtxBuilder::new()
            .inherit_stdout()
            .inherit_stderr()
            .build_p1();
        let state = GuestState {
            wasi,
            shim: ShimState::default(),
        };
        let mut store = Store::new(engine, state);

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(Fault::Instantiate)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(Fault::MissingExport("memory"))?;

        let mut guest = Self {
            store,
            memory,
            instance,
            funcs: HashMap::new(),
        };

        // Reactor start function first, then the parser's one-time setup.
        if guest
            .instance
            .get_func(&mut guest.store, "_initialize")
            .is_some()
        {
            guest.call0("_initialize")?;
        }
        guest.call0("pg_query_init")?;

        tracing::debug!("instantiated guest");
        Ok(guest)
    }

    /// Start a new invocation context. The snapshot shim's checkpoint
    /// table is scoped to one guest invocation and must not leak across
    /// calls.
    pub fn begin_call(&mut self) {
        self.store.data_mut().shim.reset();
    }

    /// Resolve an export by name, caching the handle for the lifetime of
    /// this instance.
    fn func(&mut self, name: &'static str) -> Result<Func> {
        if let Some(func) = self.funcs.get(name) {
            return Ok(*func);
        }
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or(Fault::MissingExport(name))?;
        self.funcs.insert(name, func);
        Ok(func)
    }

    /// Invoke a guest export through the uniform 64-bit-word convention.
    ///
    /// Arguments are narrowed to the export's declared parameter types and
    /// the first result, if any, is widened back to a word. A trap is a
    /// contract violation terminating the operation, never a decodable
    /// parse error.
    pub fn call_raw(&mut self, name: &'static str, args: &[u64]) -> Result<u64> {
        let func = self.func(name)?;
        let ty = func.ty(&self.store);

        if ty.params().len() != args.len() {
            return Err(Fault::Arity {
                name,
                expects: ty.params().len(),
                got: args.len(),
            }
            .into());
        }

        let mut params = Vec::with_capacity(args.len());
        for (param_ty, &arg) in ty.params().zip(args.iter()) {
            params.push(match param_ty {
                ValType::I32 => Val::I32(arg as u32 as i32),
                ValType::I64 => Val::I64(arg as i64),
                other => {
                    return Err(Fault::Trap {
                        name,
                        source: anyhow::anyhow!("unsupported parameter type {other}"),
                    }
                    .into())
                }
            });
        }
        let mut results = vec![Val::I64(0); ty.results().len()];

        loop {
            match func.call(&mut self.store, &params, &mut results) {
                Ok(()) => break,
                Err(err) if wasix::is_restore_signal(&err) => {
                    // The re-entered pass replays deterministically up to
                    // the checkpoint site, where the armed restore value
                    // is delivered.
                    tracing::trace!(name, "re-entering after stack restore");
                }
                Err(err) => return Err(Fault::Trap { name, source: err }.into()),
            }
        }

        Ok(results.first().map(val_to_word).unwrap_or(0))
    }

    pub fn call0(&mut self, name: &'static str) -> Result<u64> {
        self.call_raw(name, &[])
    }

    pub fn call1(&mut self, name: &'static str, a1: u64) -> Result<u64> {
        self.call_raw(name, &[a1])
    }

    pub fn call2(&mut self, name: &'static str, a1: u64, a2: u64) -> Result<u64> {
        self.call_raw(name, &[a1, a2])
    }

    pub fn call3(&mut self, name: &'static str, a1: u64, a2: u64, a3: u64) -> Result<u64> {
        self.call_raw(name, &[a1, a2, a3])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn call8(
        &mut self,
        name: &'static str,
        a1: u64,
        a2: u64,
        a3: u64,
        a4: u64,
        a5: u64,
        a6: u64,
        a7: u64,
        a8: u64,
    ) -> Result<u64> {
        self.call_raw(name, &[a1, a2, a3, a4, a5, a6, a7, a8])
    }

    /// Allocate `size` bytes in guest linear memory through the guest's
    /// own allocator. The returned address is an offset into this
    /// instance's memory, meaningless anywhere else.
    pub fn malloc(&mut self, size: u32) -> Result<GuestAddr> {
        let addr = GuestAddr::new(self.call1("malloc", size as u64)? as u32);
        if addr.is_null() {
            return Err(Fault::Alloc(size).into());
        }
        Ok(addr)
    }

    /// Release guest memory previously obtained from [`Self::malloc`].
    pub fn free(&mut self, addr: GuestAddr) -> Result<()> {
        self.call1("free", addr.word()).map(|_| ())
    }
}

fn val_to_word(val: &Val) -> u64 {
    match val {
        Val::I32(v) => *v as u32 as u64,
        Val::I64(v) => *v as u64,
        _ => 0,
    }
}
