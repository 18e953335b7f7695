//! HTTP front

pub mod render;
pub mod server;

pub use server::{serve, AppState};
