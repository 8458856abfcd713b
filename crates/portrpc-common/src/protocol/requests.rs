use std::fmt;

use crate::protocol::body::Body;
use crate::protocol::metadata::Metadata;

/// Target of a call, written `"<Service>.<Method>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ServiceMethod(String);

impl ServiceMethod {
    pub fn new(value: impl Into<String>) -> Self {
        ServiceMethod(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits into `(service, method)`.
    ///
    /// Returns `None` unless the value holds exactly one `.` with a
    /// non-empty name on each side.
    ///
    /// # Example
    ///
    /// ```
    /// use portrpc_common::ServiceMethod;
    ///
    /// assert_eq!(ServiceMethod::new("Calc.Add").split(), Some(("Calc", "Add")));
    /// assert_eq!(ServiceMethod::new("Calc.Add.More").split(), None);
    /// assert_eq!(ServiceMethod::new(".Add").split(), None);
    /// ```
    pub fn split(&self) -> Option<(&str, &str)> {
        let (service, method) = self.0.split_once('.')?;
        if service.is_empty() || method.is_empty() || method.contains('.') {
            return None;
        }
        Some((service, method))
    }
}

impl fmt::Display for ServiceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceMethod {
    fn from(value: &str) -> Self {
        ServiceMethod(value.to_owned())
    }
}

impl From<String> for ServiceMethod {
    fn from(value: String) -> Self {
        ServiceMethod(value)
    }
}

/// An RPC call as seen by transports: routing target, metadata and a
/// payload stream in the agreed payload encoding.
#[derive(Debug, Default)]
pub struct Request {
    pub service_method: ServiceMethod,
    pub metadata: Metadata,
    pub body: Body,
}

impl Request {
    pub fn new(service_method: impl Into<ServiceMethod>, body: Body) -> Self {
        Request {
            service_method: service_method.into(),
            metadata: Metadata::new(),
            body,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}
