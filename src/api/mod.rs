pub mod handler;
pub mod models;
pub mod validation;

pub use handler::AppState;
