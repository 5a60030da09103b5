//! Guest instance pooling.
//!
//! Instantiation cost dominates, so idle instances are kept for the life
//! of the pool and the idle set never shrinks. The idle-set lock is the
//! only shared mutable state in the bridge and is never held while the
//! guest executes.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;
use pgbridge_core::Result;

use crate::instance::GuestInstance;
use crate::Runtime;

/// An unordered collection of idle guest instances, grown on demand.
pub struct Pool {
    runtime: Runtime,
    idle: Mutex<Vec<GuestInstance>>,
}

impl Pool {
    pub fn new(runtime: Runtime) -> Result<Self> {
        let pool = Self {
            runtime,
            idle: Mutex::new(Vec::new()),
        };
        for _ in 0..pool.runtime.config().prewarm {
            let guest = pool.runtime.instantiate()?;
            pool.idle.lock().push(guest);
        }
        Ok(pool)
    }

    /// Take an idle instance, instantiating a new one when none is
    /// available. The returned guard releases the instance back to the
    /// pool when dropped.
    pub fn checkout(&self) -> Result<Checkout<'_>> {
        let reused = self.idle.lock().pop();
        let guest = match reused {
            Some(guest) => {
                tracing::trace!("reusing pooled guest");
                guest
            }
            None => {
                tracing::debug!("pool empty, instantiating guest");
                self.runtime.instantiate()?
            }
        };
        Ok(Checkout {
            pool: self,
            guest: Some(guest),
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Number of idle instances currently held.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, guest: GuestInstance) {
        self.idle.lock().push(guest);
    }
}

/// Exclusive ownership of one pooled guest instance.
///
/// Releases the instance on drop, on every exit path. A caller that
/// observed an infrastructure fault must call [`Checkout::discard`]
/// instead: the instance's internal state is no longer trustworthy and it
/// must not be pooled again.
pub struct Checkout<'a> {
    pool: &'a Pool,
    guest: Option<GuestInstance>,
}

impl Checkout<'_> {
    /// Drop the instance without returning it to the pool.
    pub fn discard(mut self) {
        if self.guest.take().is_some() {
            tracing::warn!("discarding faulted guest instance");
        }
    }
}

impl Deref for Checkout<'_> {
    type Target = GuestInstance;

    fn deref(&self) -> &GuestInstance {
        self.guest.as_ref().expect("checkout already consumed")
    }
}

impl DerefMut for Checkout<'_> {
    fn deref_mut(&mut self) -> &mut GuestInstance {
        self.guest.as_mut().expect("checkout already consumed")
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if let Some(guest) = self.guest.take() {
            self.pool.release(guest);
        }
    }
}
