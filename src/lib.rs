//! Localhost command/control bridge between callers and a content-editing
//! host application.

pub mod api;
pub mod audit;
pub mod client;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod history;
pub mod host;
pub mod jobs;
pub mod lifecycle;
pub mod locks;
pub mod orchestrator;
pub mod paths;
pub mod plan;
pub mod project;
pub mod registry;
pub mod settings;
pub mod state;

#[cfg(test)]
mod testing;
