pub mod checklist;
pub mod config;
pub mod gateways;
pub mod media;
pub mod models;
pub mod service;

pub use config::Config;
pub use service::{AppState, build_router, create_app};
