/// Persistence backends for the runtime catalog.
pub mod json;
