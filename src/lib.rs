pub mod adapters;
pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod server;
pub mod settlement;
pub mod storage;
