// Shared concurrency primitives

pub mod guard;
pub mod task;

pub use guard::*;
pub use task::*;
