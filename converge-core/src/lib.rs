//! Data model shared by the engine, the providers and the CLI.

pub mod plan;
pub mod resource;
pub mod snapshot;
pub mod step;
pub mod urn;
