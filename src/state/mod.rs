//! State module for the frontier and the manager lifecycle
//!
//! # Components
//!
//! - `UrlTask`: one URL in the frontier, with its docid and try state
//! - `ManagerState`: lifecycle of the site manager (uninitialized through stopped)

mod manager_state;
mod url_task;

// Re-export main types
pub use manager_state::ManagerState;
pub use url_task::UrlTask;
