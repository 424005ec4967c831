#![forbid(unsafe_code)]

//! SSH jump-forwarding support: ssh_config parsing, an async SSH
//! client with `ProxyJump` chaining, and a local-listener forwarder
//! built on top of it (spec §4.9, §6 "SSH configuration").

pub mod client;
pub mod config;
pub mod forward;

pub use client::{SshSession, SshTarget};
pub use config::{resolve_alias, resolve_alias_cached, resolve_jump_chain, BastionConfig};
pub use forward::{run, ConnectionState, ForwardSpec};
