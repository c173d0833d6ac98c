pub mod app;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod log_parser;
pub mod notifier;
pub mod scanner;
pub mod session;
pub mod tailer;
pub mod util;
