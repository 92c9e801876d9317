//! Command-line configuration surface.

mod args;

pub use args::Args;
