//! Client-facing HTTP surface: `/proxy/{provider}/v1/...` routes, SSE
//! response plumbing, and the cached models listing.

mod models;
mod proxy;
mod render;

pub use models::ModelsCache;
pub use proxy::proxy_router;
