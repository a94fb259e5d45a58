pub mod config;
pub mod context;
pub mod dag;
pub mod git_ops;
pub mod types;
pub mod usage;
