//! Fixed-capacity object arena addressed by typed handles
use core::{fmt, marker::PhantomData, ops};
use slab::Slab;

/// A handle type usable as a [`Pool`] key.
pub trait PoolId: Copy + Eq + fmt::Debug {
    fn from_key(key: usize) -> Self;
    fn key(self) -> usize;
}

/// Define a `Copy` handle type wrapping a non-zero index.
macro_rules! define_id {
    (
        $( #[$meta:meta] )*
        $vis:vis struct $name:ident;
    ) => {
        $( #[$meta] )*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $vis struct $name(core::num::NonZeroUsize);

        impl $name {
            /// Get the raw (1-based) value of the handle.
            #[inline]
            pub const fn into_raw(self) -> usize {
                self.0.get()
            }

            /// Construct a handle from a raw value returned by
            /// [`Self::into_raw`]. Returns `None` for `0`.
            #[inline]
            pub const fn from_raw(raw: usize) -> Option<Self> {
                match core::num::NonZeroUsize::new(raw) {
                    Some(x) => Some(Self(x)),
                    None => None,
                }
            }
        }

        impl $crate::utils::pool::PoolId for $name {
            #[inline]
            fn from_key(key: usize) -> Self {
                Self(core::num::NonZeroUsize::MIN.saturating_add(key))
            }

            #[inline]
            fn key(self) -> usize {
                self.0.get() - 1
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.0.get()).finish()
            }
        }
    };
}

/// A slab that never grows past the capacity it was created with. Insertion
/// into a full pool fails instead of reallocating, so the pool can be
/// modified inside a critical section.
pub struct Pool<Id, T> {
    slab: Slab<T>,
    capacity: usize,
    _phantom: PhantomData<fn(Id) -> Id>,
}

impl<Id: PoolId, T> Pool<Id, T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            capacity,
            _phantom: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.slab.len() >= self.capacity
    }

    /// Get the number of vacant slots.
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.slab.len())
    }

    /// Insert `value`. Returns it back if the pool is full.
    pub fn insert(&mut self, value: T) -> Result<Id, T> {
        if self.is_full() {
            return Err(value);
        }
        Ok(Id::from_key(self.slab.insert(value)))
    }

    #[inline]
    pub fn contains(&self, id: Id) -> bool {
        self.slab.contains(id.key())
    }

    #[inline]
    pub fn get(&self, id: Id) -> Option<&T> {
        self.slab.get(id.key())
    }

    #[inline]
    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.slab.get_mut(id.key())
    }

    pub fn remove(&mut self, id: Id) -> Option<T> {
        if self.slab.contains(id.key()) {
            Some(self.slab.remove(id.key()))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> + '_ {
        self.slab.iter().map(|(key, value)| (Id::from_key(key), value))
    }
}

impl<Id: PoolId, T> ops::Index<Id> for Pool<Id, T> {
    type Output = T;

    #[inline]
    fn index(&self, id: Id) -> &T {
        &self.slab[id.key()]
    }
}

impl<Id: PoolId, T> ops::IndexMut<Id> for Pool<Id, T> {
    #[inline]
    fn index_mut(&mut self, id: Id) -> &mut T {
        &mut self.slab[id.key()]
    }
}

impl<Id: PoolId, T: fmt::Debug> fmt::Debug for Pool<Id, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
