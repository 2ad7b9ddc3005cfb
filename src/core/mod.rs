//! Core provisioning logic: types, parsing, naming, graph assembly, workflow.

pub mod error;
pub mod export;
pub mod graph;
pub mod hooks;
pub mod naming;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod roles;
pub mod state;
pub mod types;
pub mod workflow;
