/// Neural network layer primitives shared by the built-in models
pub mod dense;

pub use dense::{Activation, Dense};
