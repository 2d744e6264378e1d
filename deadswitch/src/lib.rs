//! deadswitch library
//!
//! A dead man's switch: sealed messages released to a recipient when their
//! owner stops checking in. The library exposes the services so the binary
//! and the integration tests drive the same code.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod notify;
pub mod services;
pub mod storage;
