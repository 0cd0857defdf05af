//! Slot declarations and typed slot keys.

use std::fmt;
use std::marker::PhantomData;

/// Declaration of one slot of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotDef {
    /// Name, unique among the operator's inputs (or outputs).
    pub name: &'static str,
    /// Nesting level; 0 for a plain slot, 1 for a list of slots.
    pub level: usize,
}

impl SlotDef {
    /// Declares a level-0 slot.
    pub const fn new(name: &'static str) -> Self {
        Self { name, level: 0 }
    }

    /// Declares a slot with the given nesting level.
    pub const fn multi(name: &'static str, level: usize) -> Self {
        Self { name, level }
    }
}

macro_rules! slot_key {
    ($(#[$doc:meta])* $key:ident) => {
        $(#[$doc])*
        ///
        /// The type parameter is the operator the key belongs to, so a key
        /// of one operator type cannot index the slots of another.
        pub struct $key<T> {
            index: usize,
            name: &'static str,
            _operator: PhantomData<fn() -> T>,
        }

        impl<T> $key<T> {
            /// Creates a key for the slot declared at `index`.
            pub const fn new(index: usize, name: &'static str) -> Self {
                Self {
                    index,
                    name,
                    _operator: PhantomData,
                }
            }

            /// Position of the slot in the operator's declaration.
            #[inline]
            pub const fn index(&self) -> usize {
                self.index
            }

            /// Declared slot name.
            #[inline]
            pub const fn name(&self) -> &'static str {
                self.name
            }
        }

        impl<T> Clone for $key<T> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T> Copy for $key<T> {}

        impl<T> fmt::Debug for $key<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($key))
                    .field("index", &self.index)
                    .field("name", &self.name)
                    .finish()
            }
        }
    };
}

slot_key!(
    /// Typed handle to an input slot of operator `T`.
    InputKey
);

slot_key!(
    /// Typed handle to an output slot of operator `T`.
    OutputKey
);
