//! Stratus: Rust-native serverless provisioning.
//!
//! Compiles a crate into a Lambda bootstrap, packages and uploads it,
//! assembles a CloudFormation resource graph and converges the stack.
//! Every side effect registers its compensating action; a failed run
//! rolls back what it already did.

pub mod build;
pub mod cli;
pub mod core;
pub mod provenance;
pub mod provider;
pub mod upload;
