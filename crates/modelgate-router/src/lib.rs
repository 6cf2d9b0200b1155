//! HTTP surface: client proxy routes and the management API.

pub mod management;
pub mod proxy;

pub use management::{ManagementState, management_router};
pub use proxy::{ProxyState, proxy_router};
