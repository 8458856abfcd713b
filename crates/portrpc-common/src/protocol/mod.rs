pub mod body;
pub mod error;
pub mod metadata;
pub mod requests;
pub mod responses;
pub mod version;

#[cfg(test)]
mod tests;

pub use body::Body;
pub use error::{Result, RpcError};
pub use metadata::Metadata;
pub use requests::{Request, ServiceMethod};
pub use responses::{Response, StatusCode};
pub use version::{Version, PROTOCOL_VERSION};
