//! Protocol implementations.
//!
//! Each protocol supplies `AcceptorHandler`/`ConnectionHandler`
//! implementations driven by the hive runtime.
//!
//! - `echo`: raw byte echo service

pub mod echo;
