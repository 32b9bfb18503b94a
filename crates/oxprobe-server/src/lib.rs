pub mod config;
pub mod scheduler;
pub mod seed;
pub mod sink;
