//! Shared element storage for atomic host vectors.
//!
//! Host vectors are reference counted: cloning a [`SharedVector`] is O(1) and
//! both clones see the same buffer. This is what makes the `'r'` transfer
//! mode zero-copy, since a VM-side reference object simply holds another
//! clone of the same storage.

use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Reference-counted, lockable element buffer of a host vector.
pub struct SharedVector<T> {
    data: Arc<RwLock<Vec<T>>>,
}

impl<T> SharedVector<T> {
    /// Wrap `values` in fresh storage.
    pub fn new(values: Vec<T>) -> Self {
        Self {
            data: Arc::new(RwLock::new(values)),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the vector has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Borrow the elements for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.data.read()
    }

    /// Borrow the elements for writing. Every clone observes the change.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.data.write()
    }

    /// Check if two vectors share the same underlying buffer.
    pub fn same_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Address of the underlying buffer, stable for the buffer's lifetime.
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.data) as *const () as usize
    }
}

impl<T: Clone> SharedVector<T> {
    /// Get a copy of element `i`.
    pub fn get(&self, i: usize) -> Option<T> {
        self.data.read().get(i).cloned()
    }

    /// Copy the elements out.
    pub fn to_vec(&self) -> Vec<T> {
        self.data.read().clone()
    }

    /// Copy the elements into new, unshared storage.
    pub fn deep_copy(&self) -> Self {
        Self::new(self.to_vec())
    }
}

impl<T> Clone for SharedVector<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<T: PartialEq> PartialEq for SharedVector<T> {
    fn eq(&self, other: &Self) -> bool {
        if self.same_storage(other) {
            return true;
        }
        *self.data.read() == *other.data.read()
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedVector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.data.read().iter()).finish()
    }
}

impl<T> From<Vec<T>> for SharedVector<T> {
    fn from(values: Vec<T>) -> Self {
        Self::new(values)
    }
}
