//! RPC transport consumed by collections and sync drivers.
//!
//! The engine only needs two capabilities: a unary call and a server-streaming
//! subscription that stops when its cancellation token fires.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::schema::MethodDescriptor;
use crate::wire::Json;

pub mod memory;

pub use memory::MemoryTransport;

/// Stream of raw messages from a server-streaming RPC.
pub type MessageStream = BoxStream<'static, Result<Json, TransportError>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Single request/response call.
    async fn unary(&self, method: &MethodDescriptor, input: Json) -> Result<Json, TransportError>;

    /// Open a server-streaming call.
    ///
    /// Once `cancel` fires the stream yields a [`Canceled`] error or ends.
    ///
    /// [`Canceled`]: crate::error::TransportErrorKind::Canceled
    fn stream(&self, method: &MethodDescriptor, input: Json, cancel: CancellationToken) -> MessageStream;

    /// Transport backend name, for logging.
    fn name(&self) -> &'static str;
}
