//! Strongly-typed handles shared between the allocator and its callers.
//!
//! Downstream crates (views, stores) should *not* pass raw integers around for
//! pool offsets or owner tags.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! new_id {
    ($name:ident, $repr:ty) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name($repr);

        impl $name {
            pub const fn new(v: $repr) -> Self {
                Self(v)
            }
            pub const fn get(self) -> $repr {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

new_id!(Pointer, u32);
new_id!(OwnerId, u64);

impl Pointer {
    /// Offset 0 never addresses a payload: every payload sits behind a block header.
    pub const NULL: Pointer = Pointer(0);

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Byte offset into the host buffer.
    pub const fn offset(self) -> usize {
        self.0 as usize
    }
}

impl Default for Pointer {
    fn default() -> Self {
        Self::NULL
    }
}

impl OwnerId {
    /// Derive a stable owner id from a name (e.g. a view type name).
    pub fn from_name(name: &str) -> Self {
        Self(crate::hash::stable_u64(name.as_bytes()))
    }

    /// Owner id for a Rust type, keyed on its type name.
    pub fn of<T: ?Sized>() -> Self {
        Self::from_name(std::any::type_name::<T>())
    }
}
