//! General helpers and assertion macros.

pub mod general;
pub mod macros;
