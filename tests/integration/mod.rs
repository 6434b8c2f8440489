//! Integration tests for pinroll
//!
//! Drive the update pipeline end to end against a scripted git and build.

mod support;
mod updater;
