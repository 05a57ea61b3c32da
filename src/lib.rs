//! Boardlink - TCP communication core for robot-module middleware
//!
//! Modules exchange text commands and responses over TCP and share named
//! variables with write permissions and change subscriptions.

pub mod config;
pub mod network;
pub mod protocol;
pub mod service;
pub mod shared_var;
