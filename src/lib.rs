pub mod adapters;
pub mod config;
pub mod db;
pub mod error;
pub mod monitoring;
pub mod notify;
pub mod watch;
