//! Bingo Types
//!
//! This crate defines the value types shared by the Bingo crates. `bingo-network` builds
//! its join indexes, range trees and fact handles on top of `FactValue` and `ValueType`.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(missing_docs)]

mod types;
mod value_type;

pub use types::{FactValue, canonical_float};
pub use value_type::ValueType;
