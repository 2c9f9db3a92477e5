//! Core plumbing shared by every catalog subsystem: storage, errors,
//! configuration, logging and time helpers.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod pool;
pub mod schemas;
pub mod store;
pub mod time;
