//! A Redis-compatible key-value server with primary/replica replication.
//!
//! Connections decode RESP frames and push them onto a single command queue;
//! one executor task applies them to the store in arrival order and, on a
//! primary, forwards writes to every attached replica.

pub mod cli;
pub mod commands;
pub mod db;
pub mod handler;
pub mod propagator;
pub mod rdb;
pub mod replica;
pub mod resp;
pub mod server;
pub mod types;
