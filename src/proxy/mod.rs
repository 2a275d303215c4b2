// Proxy module - the multi-tenant request path
//
// This module implements the transparent forwarding core: a request
// arrives with a withering token, gets authenticated and admitted,
// its Authorization header is swapped for the tenant's upstream key,
// and the upstream response is streamed back unchanged. On completion
// (or rejection, or fault) exactly one event describes what happened.

mod error;
mod forward;
mod handler;
mod server;
pub mod state;


pub(crate) use error::ProxyError;
pub use server::{build_router, start_proxy};
pub use state::ProxyState;
