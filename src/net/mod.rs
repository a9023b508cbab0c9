//! Concrete [`Transport`](crate::services::transport::Transport) and
//! [`Discovery`](crate::services::discovery::Discovery) implementations.

#[cfg(feature = "lan")]
pub mod lan;
pub mod memory;
