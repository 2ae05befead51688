pub mod builder;
pub mod sandbox;
pub mod store;
