//! pinroll: rolls a vendored upstream dependency pin forward to the newest
//! upstream commit that integrates cleanly, bisecting when it doesn't.

pub mod config;
pub mod integration;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod process;
pub mod steps;
