pub mod common;
pub mod job;
pub mod plan;
pub mod project;
pub mod render;
pub mod scene;
pub mod system;
