pub mod rest;
pub mod state;
pub mod ws;

pub use state::AppState;
