/// Sandbox backed by the `isolate` tool: namespaces plus control groups,
/// one box per command.
pub mod boxes;
pub mod meta;
pub mod sandbox;
