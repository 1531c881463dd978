//! Model provider implementations

mod disk;
mod http;

pub use disk::DiskModelProvider;
pub use http::HttpModelProvider;
