//! Kernel state locking mechanism
use core::ops;
use spin::{Mutex as SpinMutex, MutexGuard as SpinMutexGuard};

use crate::Port;

/// Cell type holding state that only the owner of the critical section may
/// touch (or the dispatcher, while interrupts are masked and no critical
/// section is active).
///
/// The critical-section flag already serializes every borrower, so the lock
/// is never contended. Contention means the flag discipline was broken, and
/// is treated as an internal invariant violation.
pub(crate) struct CriticalCell<T>(SpinMutex<T>);

impl<T> CriticalCell<T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(SpinMutex::new(x))
    }

    /// Borrow the contents. The caller must own the critical section.
    #[inline]
    pub(crate) fn borrow_mut(&self) -> CriticalRef<'_, T> {
        match self.0.try_lock() {
            Some(guard) => CriticalRef(guard),
            None => unreachable!("kernel state is already borrowed"),
        }
    }
}

/// The borrowed contents of a [`CriticalCell`].
pub(crate) struct CriticalRef<'a, T>(SpinMutexGuard<'a, T>);

impl<T> ops::Deref for CriticalRef<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> ops::DerefMut for CriticalRef<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// RAII guard for the port's interrupt mask. Nestable.
pub(crate) struct IrqGuard<'a, P: Port> {
    port: &'a P,
    key: usize,
}

impl<'a, P: Port> IrqGuard<'a, P> {
    #[inline]
    pub(crate) fn new(port: &'a P) -> Self {
        Self {
            key: port.irq_lock(),
            port,
        }
    }
}

impl<P: Port> Drop for IrqGuard<'_, P> {
    #[inline]
    fn drop(&mut self) {
        // Safety: `key` was returned by the matching `irq_lock`, and guards
        //         are dropped in the reverse order of creation
        unsafe { self.port.irq_unlock(self.key) };
    }
}
