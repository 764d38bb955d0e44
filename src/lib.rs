pub mod app;
pub mod chatbase;
pub mod config;
pub mod error;
pub mod events;
pub mod pg;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod whatsapp;
