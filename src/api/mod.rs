pub mod auth;
pub mod clerk;
mod error;
pub mod models;
mod server;
pub mod services;
pub mod state;

pub use error::ApiError;
pub use server::{router, run};
