//! Method handlers and the per-channel dispatch table.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RpcError;

pub type HandlerFuture = BoxFuture<'static, Result<Value, RpcError>>;

/// Handles one method. The returned value becomes the response `result`,
/// an error becomes the response `error`. Notifications discard both.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, params: Option<Value>) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    fn call(&self, params: Option<Value>) -> HandlerFuture {
        Box::pin(self(params))
    }
}

struct Typed<F, P, R> {
    f: F,
    _marker: std::marker::PhantomData<fn(P) -> R>,
}

impl<F, Fut, P, R> Handler for Typed<F, P, R>
where
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    P: DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    fn call(&self, params: Option<Value>) -> HandlerFuture {
        let parsed = serde_json::from_value::<P>(params.unwrap_or(Value::Null));
        let future = parsed.map(&self.f);
        Box::pin(async move {
            let output = future.map_err(RpcError::invalid_params)?.await?;
            serde_json::to_value(output).map_err(|e| RpcError::internal(e.to_string()))
        })
    }
}

/// Wrap a handler taking typed params and returning a typed result.
/// Params that do not deserialize into `P` are answered with an
/// invalid-params error without calling `f`.
pub fn typed<F, Fut, P, R>(f: F) -> impl Handler
where
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    P: DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    Typed {
        f,
        _marker: std::marker::PhantomData,
    }
}

/// Method name to handler. The first registration for a name wins.
#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerTable {
    /// Returns `false` (and keeps the existing handler) if `method` is taken.
    pub fn register(&mut self, method: String, handler: Arc<dyn Handler>) -> bool {
        if self.handlers.contains_key(&method) {
            return false;
        }
        self.handlers.insert(method, handler);
        true
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(method).cloned()
    }
}
