pub mod geometry;
mod types;

pub use types::*;
