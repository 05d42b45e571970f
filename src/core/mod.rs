//! Core modules: the store handle and the plumbing every subsystem shares.
//!
//! Configuration, logging, errors and time helpers, the SQLite index pool and
//! schema, path-pattern rules, and the two-level archive locks.

pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod logging;
pub mod paths;
pub mod pool;
pub mod schemas;
pub mod store;
pub mod time;
