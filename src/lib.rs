#![forbid(unsafe_code)]

pub mod chain;
pub mod cli;
pub mod commands;
pub mod error;
pub mod fetch;
pub mod heuristics;
pub mod logging;
pub mod model;
pub mod openai;
pub mod pipeline;
pub mod runner;
pub mod schema;
pub mod store;
pub mod usage;
