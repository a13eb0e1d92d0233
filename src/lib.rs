pub mod backend;
pub mod cli;
pub mod cluster;
pub mod config;
