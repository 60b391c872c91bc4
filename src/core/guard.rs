// Scoped exclusive access to state shared between tasks

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// A cloneable handle to state that more than one task touches.
///
/// The only ways in are [`AtomicGuard::acquire`], whose guard releases the
/// lock when it goes out of scope, and [`AtomicGuard::with`], which runs a
/// closure under the lock. Borrows taken through either cannot outlive the
/// scope that produced them.
pub struct AtomicGuard<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> AtomicGuard<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Lock for the rest of the enclosing scope.
    pub async fn acquire(&self) -> MutexGuard<'_, T> {
        self.inner.lock().await
    }

    /// Run `f` with exclusive access and release before returning.
    pub async fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock().await;
        f(&mut guard)
    }

    /// Non-blocking variant of [`AtomicGuard::with`]; `None` if the lock is held.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.inner.try_lock().ok()?;
        Some(f(&mut guard))
    }

    /// Whether two handles refer to the same guarded value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Clone for AtomicGuard<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default> Default for AtomicGuard<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
