pub mod account;
pub mod authority;
pub mod bootstrap;
pub mod certificate;
pub mod cli;
pub mod cmd_runner;
pub mod config;
pub mod crypto;
pub mod error;
pub mod lock;
pub mod service;
pub mod store;
pub mod time;

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
