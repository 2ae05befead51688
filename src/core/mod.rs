pub mod domain;
pub mod engine;
pub mod env;
pub mod gate;
pub mod limits;
pub mod output;
pub mod pipeline;
pub mod reaper;
pub mod registry;
pub mod traits;
