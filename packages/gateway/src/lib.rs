pub mod chunk;
pub mod cli;
pub mod config;
pub mod engine;
pub mod router;
pub mod sentence;
pub mod session;
pub mod translator;
pub mod ws;
