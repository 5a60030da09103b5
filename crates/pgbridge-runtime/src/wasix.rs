//! Host imports for the guest's `wasix_32v1` runtime layer.
//!
//! The guest binary links against a host environment that can in principle
//! run threads and snapshot call stacks. This host never executes the
//! guest concurrently with itself, so the threading entry points are
//! unreachable stubs that fail the call loudly if ever hit. The stack
//! snapshot pair is real: it bridges the guest's setjmp/longjmp-style
//! non-local control transfer, modeled as an explicit state machine with
//! an append-only checkpoint table scoped to one guest invocation.
//!
//! A restore arms a pending-restore state and unwinds to the dispatch
//! layer, which re-enters the export; the run back to the checkpoint site
//! replays deterministically, and the `stack_checkpoint` call there
//! observes the armed restore: it re-issues the saved checkpoint and
//! writes the restore value into the resume slot, so the guest sees
//! exactly what a longjmp back to the setjmp site would have shown it.

use anyhow::{anyhow, bail};
use wasmtime::{Caller, Extern, Global, Linker, Memory, Val};

use crate::instance::GuestState;

pub const MODULE_NAME: &str = "wasix_32v1";

/// A saved guest execution point: the raw call-stack bytes between the
/// guest's stack pointer and its heap base at checkpoint time.
///
/// Captured state is immutable once taken; a checkpoint may be restored
/// any number of times within its invocation.
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint {
    pub stack_pointer: u32,
    pub stack: Vec<u8>,
}

/// A restore that has fired but whose value has not yet been delivered to
/// the checkpoint site.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingRestore {
    pub idx: u64,
    pub value: u64,
}

/// Append-only checkpoint table plus the armed restore, scoped to a
/// single guest invocation.
#[derive(Debug, Default)]
pub(crate) struct ShimState {
    checkpoints: Vec<Checkpoint>,
    pending: Option<PendingRestore>,
}

impl ShimState {
    /// Record a checkpoint and return its index. Indexes increase
    /// monotonically and are never reused within one invocation.
    pub fn record(&mut self, checkpoint: Checkpoint) -> u64 {
        self.checkpoints.push(checkpoint);
        (self.checkpoints.len() - 1) as u64
    }

    pub fn get(&self, idx: u64) -> Option<&Checkpoint> {
        self.checkpoints.get(idx as usize)
    }

    /// Arm a restore. The next `stack_checkpoint` call delivers it
    /// instead of taking a new snapshot.
    pub fn arm_restore(&mut self, pending: PendingRestore) {
        self.pending = Some(pending);
    }

    pub fn take_pending(&mut self) -> Option<PendingRestore> {
        self.pending.take()
    }

    /// Discard all checkpoints and any armed restore when the invocation
    /// context ends.
    pub fn reset(&mut self) {
        self.checkpoints.clear();
        self.pending = None;
    }
}

/// Marker error raised by `stack_restore` once the restore is armed. The
/// dispatch layer catches it and re-enters the in-flight export, whose
/// checkpoint site then observes the armed restore.
#[derive(Debug)]
pub(crate) struct RestoreSignal;

impl std::fmt::Display for RestoreSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("guest stack restore")
    }
}

impl std::error::Error for RestoreSignal {}

pub(crate) fn is_restore_signal(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<RestoreSignal>().is_some())
}

/// Register every `wasix_32v1` import the guest requires at link time.
pub fn add_to_linker(linker: &mut Linker<GuestState>) -> anyhow::Result<()> {
    linker.func_wrap(MODULE_NAME, "proc_id", proc_id)?;
    linker.func_wrap(MODULE_NAME, "stack_checkpoint", stack_checkpoint)?;
    linker.func_wrap(MODULE_NAME, "stack_restore", stack_restore)?;

    // The guest is executed strictly single-threaded, so none of the
    // threading entry points can be reached; hitting one means a broken
    // assumption, not a recoverable condition.
    linker.func_wrap(
        MODULE_NAME,
        "callback_signal",
        |_: Caller<'_, GuestState>, _: i32, _: i32| -> anyhow::Result<()> {
            bail!("callback_signal invoked: this host never signals the guest")
        },
    )?;
    linker.func_wrap(
        MODULE_NAME,
        "futex_wait",
        |_: Caller<'_, GuestState>, _: i32, _: i32, _: i32, _: i32| -> anyhow::Result<i32> {
            bail!("futex_wait invoked: the guest is never executed concurrently")
        },
    )?;
    linker.func_wrap(
        MODULE_NAME,
        "futex_wake",
        |_: Caller<'_, GuestState>, _: i32, _: i32| -> anyhow::Result<i32> {
            bail!("futex_wake invoked: the guest is never executed concurrently")
        },
    )?;
    linker.func_wrap(
        MODULE_NAME,
        "futex_wake_all",
        |_: Caller<'_, GuestState>, _: i32, _: i32| -> anyhow::Result<i32> {
            bail!("futex_wake_all invoked: the guest is never executed concurrently")
        },
    )?;
    linker.func_wrap(
        MODULE_NAME,
        "thread_exit",
        |_: Caller<'_, GuestState>, _: i32| -> anyhow::Result<()> {
            bail!("thread_exit invoked: this host spawns no guest threads")
        },
    )?;
    linker.func_wrap(
        MODULE_NAME,
        "thread_signal",
        |_: Caller<'_, GuestState>, _: i32, _: i32| -> anyhow::Result<i32> {
            bail!("thread_signal invoked: this host spawns no guest threads")
        },
    )?;

    Ok(())
}

/// The guest only ever observes one logical process.
fn proc_id(mut caller: Caller<'_, GuestState>, res_ptr: i32) -> anyhow::Result<i32> {
    let memory = exported_memory(&mut caller)?;
    memory.write(&mut caller, res_ptr as usize, &1u32.to_le_bytes())?;
    Ok(0)
}

/// Capture the guest's current call-stack region and hand back a
/// checkpoint index, or deliver an armed restore.
///
/// On a first pass the index (not a real address) lands in the first 8
/// bytes of the guest's snapshot struct and a zero resume value is
/// written at `retval_ptr`. On the re-entered pass after a restore this
/// is the resume point: the saved checkpoint is re-issued with its stack
/// state re-applied, and the restore value is written at `retval_ptr`, so
/// the guest code reading the resume slot takes the restored path.
fn stack_checkpoint(
    mut caller: Caller<'_, GuestState>,
    snapshot_ptr: i32,
    retval_ptr: i32,
) -> anyhow::Result<i32> {
    let memory = exported_memory(&mut caller)?;

    if let Some(pending) = caller.data_mut().shim.take_pending() {
        let checkpoint = caller
            .data()
            .shim
            .get(pending.idx)
            .cloned()
            .ok_or_else(|| anyhow!("unknown stack checkpoint {}", pending.idx))?;

        let stack_pointer = exported_global(&mut caller, "__stack_pointer")?;
        stack_pointer.set(&mut caller, Val::I32(checkpoint.stack_pointer as i32))?;
        memory.write(
            &mut caller,
            checkpoint.stack_pointer as usize,
            &checkpoint.stack,
        )?;
        // The value write comes last: the snapshot struct and resume slot
        // may themselves live inside the restored stack region.
        memory.write(&mut caller, snapshot_ptr as usize, &pending.idx.to_le_bytes())?;
        memory.write(&mut caller, retval_ptr as usize, &pending.value.to_le_bytes())?;

        tracing::trace!(idx = pending.idx, value = pending.value, "restore delivered");
        return Ok(0);
    }

    let stack_pointer = global_u32(&mut caller, "__stack_pointer")?;
    let heap_base = global_u32(&mut caller, "__heap_base")?;

    let len = heap_base.checked_sub(stack_pointer).ok_or_else(|| {
        anyhow!("stack pointer {stack_pointer:#x} above heap base {heap_base:#x}")
    })?;
    let mut stack = vec![0u8; len as usize];
    memory.read(&caller, stack_pointer as usize, &mut stack)?;

    let idx = caller.data_mut().shim.record(Checkpoint {
        stack_pointer,
        stack,
    });

    memory.write(&mut caller, snapshot_ptr as usize, &idx.to_le_bytes())?;
    memory.write(&mut caller, retval_ptr as usize, &0u64.to_le_bytes())?;

    tracing::trace!(idx, "stack checkpoint");
    Ok(0)
}

/// Rewind the guest to a previously issued checkpoint.
///
/// Arms the pending restore and unwinds to the dispatch layer, which
/// re-enters the export; the checkpoint site then observes the armed
/// restore and takes the resumed path. This call never returns into the
/// guest code that made it.
fn stack_restore(
    mut caller: Caller<'_, GuestState>,
    snapshot_ptr: i32,
    value: i64,
) -> anyhow::Result<()> {
    let memory = exported_memory(&mut caller)?;

    let mut idx_buf = [0u8; 8];
    memory.read(&caller, snapshot_ptr as usize, &mut idx_buf)?;
    let idx = u64::from_le_bytes(idx_buf);

    if caller.data().shim.get(idx).is_none() {
        bail!("unknown stack checkpoint {idx}");
    }
    caller.data_mut().shim.arm_restore(PendingRestore {
        idx,
        value: value as u64,
    });

    tracing::trace!(idx, value, "stack restore");
    Err(anyhow::Error::new(RestoreSignal))
}

fn exported_memory(caller: &mut Caller<'_, GuestState>) -> anyhow::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow!("guest does not export `memory`"))
}

fn exported_global(caller: &mut Caller<'_, GuestState>, name: &str) -> anyhow::Result<Global> {
    caller
        .get_export(name)
        .and_then(Extern::into_global)
        .ok_or_else(|| anyhow!("guest does not export `{name}`"))
}

fn global_u32(caller: &mut Caller<'_, GuestState>, name: &str) -> anyhow::Result<u32> {
    let global = exported_global(caller, name)?;
    match global.get(&mut *caller) {
        Val::I32(v) => Ok(v as u32),
        other => bail!("guest global `{name}` is not i32: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_indexes_monotonic() {
        let mut shim = ShimState::default();
        let a = shim.record(Checkpoint {
            stack_pointer: 0x1000,
            stack: vec![1, 2, 3],
        });
        let b = shim.record(Checkpoint {
            stack_pointer: 0x0ff0,
            stack: vec![4, 5],
        });
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(shim.get(0).map(|c| c.stack.as_slice()), Some(&[1, 2, 3][..]));

        shim.reset();
        assert!(shim.get(0).is_none());
        // A fresh invocation starts numbering over.
        let c = shim.record(Checkpoint {
            stack_pointer: 0x1000,
            stack: vec![],
        });
        assert_eq!(c, 0);
    }

    #[test]
    fn test_armed_restore_delivered_once() {
        let mut shim = ShimState::default();
        shim.record(Checkpoint {
            stack_pointer: 0x1000,
            stack: vec![],
        });

        shim.arm_restore(PendingRestore { idx: 0, value: 7 });
        let pending = shim.take_pending();
        assert_eq!(pending.map(|p| (p.idx, p.value)), Some((0, 7)));
        // Delivered restores do not fire again.
        assert!(shim.take_pending().is_none());

        // A restore armed when the invocation ends is dropped with it.
        shim.arm_restore(PendingRestore { idx: 0, value: 9 });
        shim.reset();
        assert!(shim.take_pending().is_none());
    }

    #[test]
    fn test_restore_signal_detected_through_context() {
        let err = anyhow::Error::new(RestoreSignal).context("while executing guest");
        assert!(is_restore_signal(&err));

        let other = anyhow!("unrelated trap");
        assert!(!is_restore_signal(&other));
    }
}
