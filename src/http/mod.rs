//! HTTP surfaces: the rate limiting middleware and the admin API.

mod admin;
mod middleware;
mod server;

pub use admin::{admin_router, AdminState};
pub use middleware::{enforce, AuthenticatedSubject, ClientIpSource, Interceptor};
pub use server::AdminServer;
