//! Stable, `Copy` handles used throughout the crate instead of raw pointers.
//!
//! The teacher (`yara-x`) identifies rules and patterns with small `u32`
//! newtypes (`RuleId`, `PatternId`, `IdentId` in `crate::compiler`) rather
//! than pointers, and this crate follows the same convention everywhere,
//! including inside the [`crate::arena::Arena`] where the original engine
//! would have used a raw address.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(v: u32) -> Self {
                $name(v)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(v: usize) -> Self {
                $name(v as u32)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(RuleId);
id_type!(NamespaceId);
id_type!(StringId);
id_type!(PatternId);
id_type!(IdentId);
