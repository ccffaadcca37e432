mod components;
mod experiments;
mod health;
mod terminals;
mod ws;

pub use components::*;
pub use experiments::*;
pub use health::*;
pub use terminals::*;
pub use ws::*;
