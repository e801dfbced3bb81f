// Library exports for the microblog
// This allows integration tests and the binary to share modules

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
