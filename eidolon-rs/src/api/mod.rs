//! REST API for users and administrators

pub mod admin;
pub mod handlers;
pub mod server;

pub use handlers::{ApiError, ApiResponse, AppState};
pub use server::ApiServer;
