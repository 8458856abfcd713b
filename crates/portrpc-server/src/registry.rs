//! Service registry
//!
//! A registered implementation is turned into a name-indexed table of
//! type-erased methods once, at registration time. Each table entry knows
//! how to decode the body into its operation's request type and how to
//! invoke the operation, so dispatch needs no knowledge of concrete types.
//!
//! Which operations are exposed is declared by [`Service::methods`]. Only
//! operations shaped `(Arc<S>, CancellationToken, Req) -> Result<Resp, E>`
//! can be listed; helper methods of other shapes are simply not listed.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use portrpc_common::payload::{decode_body, encode_body, Codec, CodecError};
use portrpc_common::Body;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Decoded request value, erased to its registered type.
pub type AnyRequest = Box<dyn Any + Send>;

type DecodeFn = Box<dyn Fn(Body) -> BoxFuture<'static, Result<AnyRequest, CodecError>> + Send + Sync>;
type InvokeFn =
    Box<dyn Fn(CancellationToken, AnyRequest) -> BoxFuture<'static, Result<Body, InvokeError>> + Send + Sync>;

/// An implementation that can be registered on a
/// [`Server`](crate::Server).
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use portrpc_common::payload::Codec;
/// use portrpc_server::{MethodSet, Service};
/// use serde::{Deserialize, Serialize};
/// use tokio_util::sync::CancellationToken;
///
/// #[derive(Deserialize)]
/// struct AddReq { a: i64, b: i64 }
///
/// #[derive(Serialize)]
/// struct AddResp { result: i64 }
///
/// struct Calculator;
///
/// impl Calculator {
///     async fn add(self: Arc<Self>, _: CancellationToken, req: AddReq) -> Result<AddResp, String> {
///         Ok(AddResp { result: req.a + req.b })
///     }
/// }
///
/// impl Service for Calculator {
///     fn methods<C: Codec>(methods: &mut MethodSet<Self, C>) {
///         methods.method("Add", Self::add);
///     }
/// }
/// ```
pub trait Service: Send + Sync + Sized + 'static {
    /// Lists the operations exposed over RPC.
    fn methods<C: Codec>(methods: &mut MethodSet<Self, C>);
}

/// Collects the exposed operations of one service.
pub struct MethodSet<S, C> {
    service: Arc<S>,
    codec: C,
    methods: HashMap<String, Method>,
}

impl<S: Service, C: Codec> MethodSet<S, C> {
    pub(crate) fn new(service: Arc<S>, codec: C) -> Self {
        Self {
            service,
            codec,
            methods: HashMap::new(),
        }
    }

    /// Exposes `op` under `name`. A later entry with the same name replaces
    /// the earlier one.
    pub fn method<Req, Resp, E, F, Fut>(&mut self, name: &str, op: F) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(Arc<S>, CancellationToken, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let decode: DecodeFn = Box::new(move |body| {
            let codec = codec.clone();
            async move {
                let request: Req = decode_body(&codec, body).await?;
                Ok(Box::new(request) as AnyRequest)
            }
            .boxed()
        });

        let service = self.service.clone();
        let codec = self.codec.clone();
        let op = Arc::new(op);
        let invoke: InvokeFn = Box::new(move |cancel, request| {
            let service = service.clone();
            let codec = codec.clone();
            let op = op.clone();
            async move {
                let request = request
                    .downcast::<Req>()
                    .map_err(|_| InvokeError::Internal("decoded request has the wrong type".to_string()))?;
                match op(service, cancel, *request).await {
                    Ok(response) => Ok(encode_body(&codec, response)),
                    Err(err) => Err(InvokeError::Service(err.to_string())),
                }
            }
            .boxed()
        });

        self.methods.insert(
            name.to_string(),
            Method {
                request_type: std::any::type_name::<Req>(),
                decode,
                invoke,
            },
        );
        self
    }

    pub(crate) fn into_methods(self) -> HashMap<String, Method> {
        self.methods
    }
}

/// Failure of an invoked operation.
#[derive(Debug)]
pub(crate) enum InvokeError {
    /// The operation returned an error.
    Service(String),
    /// The runtime could not run the operation.
    Internal(String),
}

/// One exposed operation.
pub struct Method {
    request_type: &'static str,
    decode: DecodeFn,
    invoke: InvokeFn,
}

impl Method {
    /// Type name of the operation's request.
    pub fn request_type(&self) -> &'static str {
        self.request_type
    }

    /// Allocates a fresh request value and decodes `body` into it.
    pub(crate) fn decode(&self, body: Body) -> BoxFuture<'static, Result<AnyRequest, CodecError>> {
        (self.decode)(body)
    }

    pub(crate) fn invoke(
        &self,
        cancel: CancellationToken,
        request: AnyRequest,
    ) -> BoxFuture<'static, Result<Body, InvokeError>> {
        (self.invoke)(cancel, request)
    }
}

/// A registered implementation and its method table.
pub struct ServiceEntry {
    name: String,
    type_name: &'static str,
    methods: HashMap<String, Method>,
}

impl ServiceEntry {
    pub(crate) fn build<S: Service, C: Codec>(service: S, name: String, codec: C) -> Self {
        let mut set = MethodSet::new(Arc::new(service), codec);
        S::methods(&mut set);
        Self {
            name,
            type_name: std::any::type_name::<S>(),
            methods: set.into_methods(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// Names of the exposed operations, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Name-indexed services.
pub type Registry = HashMap<String, Arc<ServiceEntry>>;

/// Default registry name of `T`: its bare type name, looking through
/// references and smart pointers to the pointee.
///
/// ```
/// use std::sync::Arc;
/// use portrpc_server::registry::service_type_name;
///
/// struct Calculator;
/// assert_eq!(service_type_name::<Calculator>(), "Calculator");
/// assert_eq!(service_type_name::<Arc<Calculator>>(), "Calculator");
/// ```
pub fn service_type_name<T: ?Sized>() -> String {
    short_type_name(std::any::type_name::<T>())
}

fn short_type_name(full: &str) -> String {
    let mut name = full.trim();

    loop {
        let stripped = name
            .strip_prefix('&')
            .map(|rest| rest.trim_start_matches("mut ").trim_start())
            .or_else(|| name.strip_prefix("*const ").or_else(|| name.strip_prefix("*mut ")));
        if let Some(rest) = stripped {
            name = rest;
            continue;
        }

        match unwrap_pointer(name) {
            Some(inner) => name = inner,
            None => break,
        }
    }

    let base = name.split('<').next().unwrap_or(name);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Returns the type argument of a known pointer wrapper.
fn unwrap_pointer(name: &str) -> Option<&str> {
    const POINTERS: [&str; 4] = ["Arc", "Box", "Rc", "Pin"];

    let open = name.find('<')?;
    let head = name[..open].rsplit("::").next()?;
    if !POINTERS.contains(&head) || !name.ends_with('>') {
        return None;
    }
    Some(&name[open + 1..name.len() - 1])
}
