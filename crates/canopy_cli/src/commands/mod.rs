//! CLI command implementations.

pub mod inspect;
pub mod simulate;
pub mod vacuum;
