//! Line-delimited JSON protocol: one request per stdin line, one response
//! per stdout line, dispatched by method name to the handler families.

mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use router::handle_request;
pub use types::{AppState, Request};
