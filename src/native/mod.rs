/// Native module contains implementations of core traits
/// without using any external sandboxing tool,
/// using syscalls and `/proc` directly instead.
pub mod cgroup;
pub mod nix;
pub mod procfs;
pub mod sandbox;
