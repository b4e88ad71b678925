//! In-process transport with a scriptable server side.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use super::{MessageStream, Transport};
use crate::error::TransportError;
use crate::schema::MethodDescriptor;
use crate::wire::Json;

type UnaryHandler = Arc<dyn Fn(&Json) -> Result<Json, TransportError> + Send + Sync>;
type Reply = Result<Json, TransportError>;

/// A unary call observed by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: MethodDescriptor,
    pub input: Json,
}

#[derive(Default)]
struct State {
    handlers: HashMap<MethodDescriptor, UnaryHandler>,
    gates: HashMap<MethodDescriptor, VecDeque<oneshot::Receiver<Reply>>>,
    streams: HashMap<MethodDescriptor, Vec<mpsc::UnboundedSender<Reply>>>,
    calls: Vec<RecordedCall>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    stream_opened: Notify,
}

/// In-memory transport.
///
/// Unary replies come from a pending gate (see [`gate`](Self::gate)) or a
/// registered handler; stream messages are pushed by the owner.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call to `method` with `handler`.
    pub fn on_unary<F>(&self, method: &MethodDescriptor, handler: F)
    where
        F: Fn(&Json) -> Result<Json, TransportError> + Send + Sync + 'static,
    {
        self.shared
            .state
            .lock()
            .handlers
            .insert(method.clone(), Arc::new(handler));
    }

    /// Answer every call to `method` with the same output.
    pub fn reply(&self, method: &MethodDescriptor, output: Json) {
        self.on_unary(method, move |_| Ok(output.clone()));
    }

    /// Hold the next call to `method` until the returned sender resolves it.
    ///
    /// Dropping the sender fails the call as unavailable.
    pub fn gate(&self, method: &MethodDescriptor) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .state
            .lock()
            .gates
            .entry(method.clone())
            .or_default()
            .push_back(rx);
        tx
    }

    /// Deliver a message to every open stream of `method`.
    ///
    /// Returns how many streams received it.
    pub fn push(&self, method: &MethodDescriptor, message: Json) -> usize {
        self.send(method, Ok(message))
    }

    /// Fail every open stream of `method` with `error`.
    pub fn fail_streams(&self, method: &MethodDescriptor, error: TransportError) -> usize {
        self.send(method, Err(error))
    }

    /// End every open stream of `method` without an error.
    pub fn close_streams(&self, method: &MethodDescriptor) {
        self.shared.state.lock().streams.remove(method);
    }

    fn send(&self, method: &MethodDescriptor, reply: Reply) -> usize {
        let mut state = self.shared.state.lock();
        let Some(senders) = state.streams.get_mut(method) else {
            return 0;
        };
        senders.retain(|tx| tx.send(reply.clone()).is_ok());
        senders.len()
    }

    /// Number of streams of `method` still open.
    pub fn open_streams(&self, method: &MethodDescriptor) -> usize {
        let mut state = self.shared.state.lock();
        match state.streams.get_mut(method) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    /// Wait until at least one stream of `method` is open.
    pub async fn wait_for_stream(&self, method: &MethodDescriptor) {
        loop {
            let opened = self.shared.stream_opened.notified();
            if self.open_streams(method) > 0 {
                return;
            }
            opened.await;
        }
    }

    /// Unary calls seen so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.shared.state.lock().calls.clone()
    }

    pub fn calls_to(&self, method: &MethodDescriptor) -> Vec<Json> {
        self.shared
            .state
            .lock()
            .calls
            .iter()
            .filter(|call| &call.method == method)
            .map(|call| call.input.clone())
            .collect()
    }
}

enum Route {
    Gate(oneshot::Receiver<Reply>),
    Handler(UnaryHandler),
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn unary(&self, method: &MethodDescriptor, input: Json) -> Result<Json, TransportError> {
        let route = {
            let mut state = self.shared.state.lock();
            state.calls.push(RecordedCall {
                method: method.clone(),
                input: input.clone(),
            });

            let gate = state.gates.get_mut(method).and_then(VecDeque::pop_front);
            match gate {
                Some(rx) => Route::Gate(rx),
                None => match state.handlers.get(method) {
                    Some(handler) => Route::Handler(handler.clone()),
                    None => {
                        return Err(TransportError::unimplemented(format!(
                            "no handler for {method}"
                        )))
                    }
                },
            }
        };

        match route {
            Route::Gate(rx) => rx
                .await
                .map_err(|_| TransportError::unavailable(format!("{method} was abandoned")))?,
            Route::Handler(handler) => handler(&input),
        }
    }

    fn stream(&self, method: &MethodDescriptor, _input: Json, cancel: CancellationToken) -> MessageStream {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.shared
            .state
            .lock()
            .streams
            .entry(method.clone())
            .or_default()
            .push(tx);
        self.shared.stream_opened.notify_waiters();

        let method = method.clone();
        Box::pin(async_stream::stream! {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    message = rx.recv() => Some(message),
                };
                match next {
                    None => {
                        yield Err(TransportError::canceled(format!("{method} cancelled")));
                        break;
                    }
                    Some(Some(message)) => yield message,
                    Some(None) => break,
                }
            }
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
