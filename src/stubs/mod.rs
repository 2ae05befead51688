pub mod builder;
pub mod sandbox;
