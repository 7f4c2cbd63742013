pub mod api;
pub mod config;
pub mod credentials;
pub mod deploy;
pub mod error;
pub mod protect;
pub mod rate_limit;
pub mod remove;
pub mod report;
pub mod session;
pub mod sources;
pub mod wiki;

#[cfg(test)]
mod testing;
