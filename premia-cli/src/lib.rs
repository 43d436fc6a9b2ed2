pub mod alerts;
pub mod anchor;
pub mod app;
pub mod engine;
pub mod telemetry;

pub use app::run as run_app;
