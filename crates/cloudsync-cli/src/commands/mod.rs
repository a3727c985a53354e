//! Command handlers

pub mod account;
pub mod config;
pub mod init;
pub mod status;
pub mod store;
pub mod sync;
