pub mod auth;
pub mod client;
pub mod config;
pub mod csv_io;
pub mod daemon;
pub mod db;
pub mod error;
pub mod ident;
pub mod output;
pub mod qr;
pub mod types;
