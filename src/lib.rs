pub mod config;
pub mod clock;
pub mod error;
pub mod identity;
pub mod audit;
pub mod server;
