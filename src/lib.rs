#[macro_use]
pub mod logger;

pub mod arena;
pub mod autoindex;
pub mod config;
pub mod connection;
pub mod error;
pub mod header;
pub mod http;
pub mod mime;
pub mod program;
pub mod registry;
pub mod request;
pub mod transfer;
pub mod upload;
pub mod url;
