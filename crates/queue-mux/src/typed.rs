//! JSON-typed view over a [`QueueHandler`].
//!
//! [`TypedQueue<T>`] decodes every received payload into `T` before calling
//! the user's handler and encodes `T` to JSON when publishing. The wrapped
//! handler is unchanged; raw handlers and typed handlers can share it.
//!
//! # Examples
//!
//! ```rust
//! use queue_mux::providers::{MemoryBackend, MemoryBroker};
//! use queue_mux::{QueueBackend, QueueUri, TypedQueue};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Order {
//!     id: u32,
//! }
//!
//! # async fn example() -> Result<(), queue_mux::QueueError> {
//! let backend = MemoryBackend::new(Arc::new(MemoryBroker::new()));
//! let handler = backend.queue(&QueueUri::parse("mem://orders")?).await?;
//!
//! let orders = TypedQueue::<Order>::new(handler);
//! orders.add_typed_handler(|_ctx, order| async move {
//!     println!("order {}", order.id);
//!     Ok(())
//! });
//! orders.handler().start()?;
//! orders.publish_typed(&Order { id: 1 }, &[]).await?;
//! # Ok(())
//! # }
//! ```

use crate::context::{MessageContext, PublishOptions};
use crate::error::{HandlerError, QueueError};
use crate::handler::QueueHandler;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use thiserror::Error;
use tracing::error;

#[cfg(test)]
#[path = "typed_tests.rs"]
mod tests;

/// Failure to decode a received payload.
#[derive(Debug, Error)]
pub enum TypedMessageError {
    #[error("parsing message json: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A queue handler whose payloads are JSON-encoded `T` values.
pub struct TypedQueue<T> {
    handler: QueueHandler,
    _payload: PhantomData<fn() -> T>,
}

impl<T> TypedQueue<T> {
    pub fn new(handler: QueueHandler) -> Self {
        Self {
            handler,
            _payload: PhantomData,
        }
    }

    /// The wrapped handler, for lifecycle calls such as `start` and `close`.
    pub fn handler(&self) -> &QueueHandler {
        &self.handler
    }

    pub fn into_inner(self) -> QueueHandler {
        self.handler
    }
}

impl<T> TypedQueue<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Append a handler receiving decoded values.
    ///
    /// A payload that is not valid JSON for `T` fails the message with a
    /// [`TypedMessageError`] and `handler` is not called.
    pub fn add_typed_handler<F, Fut>(&self, handler: F) -> &Self
    where
        F: Fn(MessageContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handler.add_handler(move |ctx, data| {
            let call = serde_json::from_slice::<T>(&data)
                .map(|value| handler(ctx, value))
                .map_err(TypedMessageError::Decode);
            async move {
                match call {
                    Ok(fut) => fut.await,
                    Err(err) => Err(err.into()),
                }
            }
        });
        self
    }
}

impl<T> TypedQueue<T>
where
    T: Serialize,
{
    /// Encode `value` as JSON and publish it.
    pub async fn publish_typed(
        &self,
        value: &T,
        options: &[PublishOptions],
    ) -> Result<(), QueueError> {
        let data = serde_json::to_vec(value).map_err(|err| {
            error!(uri = %self.handler.uri(), error = %err, "marshaling message into json");
            QueueError::Serialization(err)
        })?;
        self.handler.publish(data, options).await
    }
}

impl<T> Clone for TypedQueue<T> {
    fn clone(&self) -> Self {
        Self::new(self.handler.clone())
    }
}

impl<T> From<QueueHandler> for TypedQueue<T> {
    fn from(handler: QueueHandler) -> Self {
        Self::new(handler)
    }
}

impl<T> fmt::Debug for TypedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedQueue")
            .field("handler", &self.handler)
            .field("payload", &std::any::type_name::<T>())
            .finish()
    }
}
