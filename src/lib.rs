pub mod cli;
pub mod client;
pub mod config;
pub mod cpu;
pub mod daemon;
pub mod install;
pub mod log;
pub mod manager;
pub mod monitor;
pub mod paths;
pub mod persist;
pub mod pid;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod sys;
