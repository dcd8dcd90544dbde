pub mod clean;
pub mod clone;
pub mod sync;
