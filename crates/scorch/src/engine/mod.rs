//! Recursive stage/loop runner and its background bookkeeping.

mod background;
mod executor;

pub use background::{BackgroundHandle, BackgroundKey, BackgroundRegistry};
pub use executor::RunExecutor;
