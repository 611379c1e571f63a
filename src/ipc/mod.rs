mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use error::bad_json;
pub use router::handle_request;
pub use types::{AppState, Request};

/// Opens the workspace named at startup, if any.
pub fn open_startup_workspace(state: &mut AppState, path: std::path::PathBuf) -> anyhow::Result<()> {
    handlers::core::open_workspace(state, path)
}
