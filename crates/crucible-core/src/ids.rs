//! Strongly-typed identifiers for domain entities.
//!
//! Builds and versioned resources are store-assigned rows; their ids wrap
//! the database integer because ordering by id is meaningful (an "earlier"
//! build is one with a smaller id).

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_row_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub fn new(raw: i64) -> Self {
                Self(raw)
            }

            pub fn raw(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

define_row_id!(BuildId);
define_row_id!(VersionedResourceId);

/// Monotonic pipeline config version used for optimistic CAS on save.
pub type ConfigVersion = i32;
