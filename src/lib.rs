pub mod app;
pub mod artifacts;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod log;
pub mod output;
pub mod roster;
