use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use lodtrack_common::LodChunk;
use tokio::sync::watch;

/// Payload delivered with a chunk once its request settles successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload<P> {
    /// Produced by a [`ChunkProducer`].
    Loaded(P),
    /// No producer accepted the request.
    Placeholder,
}

impl<P> ChunkPayload<P> {
    pub fn loaded(&self) -> Option<&P> {
        match self {
            ChunkPayload::Loaded(payload) => Some(payload),
            ChunkPayload::Placeholder => None,
        }
    }
}

/// Settled outcome of a [`DataRequest`]. `None` means failed or cancelled.
pub type RenderData<P> = Option<ChunkPayload<P>>;

/// Cooperative cancellation flag shared between a request and its producer.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender is owned by `self`, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
enum LoadState<P> {
    Pending,
    Settled(RenderData<P>),
}

struct Inner<P> {
    chunk: RefCell<LodChunk>,
    token: CancelToken,
    state: watch::Sender<LoadState<P>>,
}

/// Asynchronous acquisition handle for one chunk's payload.
///
/// Settles exactly once; the first outcome wins and later ones are dropped.
/// Clones share the same underlying request.
pub struct DataRequest<P> {
    inner: Rc<Inner<P>>,
}

impl<P> Clone for DataRequest<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<P: Clone + 'static> DataRequest<P> {
    /// A pending request that nothing will settle unless a caller binds it.
    pub fn new(chunk: LodChunk) -> Self {
        let (state, _) = watch::channel(LoadState::Pending);
        Self {
            inner: Rc::new(Inner {
                chunk: RefCell::new(chunk),
                token: CancelToken::new(),
                state,
            }),
        }
    }

    /// Create a request and offer it to `producer`.
    ///
    /// If the producer does not call [`RequestData::accept`] before returning,
    /// the request settles immediately with [`ChunkPayload::Placeholder`].
    pub fn create<R>(chunk: LodChunk, producer: &R) -> Self
    where
        R: ChunkProducer<Payload = P> + ?Sized,
    {
        let request = Self::new(chunk.clone());
        let mut event = RequestData {
            chunk: &chunk,
            request: &request,
            accepted: false,
        };
        producer.request_data(&mut event);

        if !event.is_accepted() {
            tracing::trace!(%chunk, "request not accepted, settling placeholder");
            request.settle(Some(ChunkPayload::Placeholder));
        }
        request
    }

    /// Bind the outcome to `op`: `Ok` becomes [`ChunkPayload::Loaded`],
    /// `Err` or cancellation becomes `None`.
    ///
    /// The operation runs as a local task, so this must be called from
    /// within a [`tokio::task::LocalSet`].
    pub fn wait_until<F, E>(&self, op: F)
    where
        F: Future<Output = Result<P, E>> + 'static,
        E: fmt::Display + 'static,
    {
        let request = self.clone();
        tokio::task::spawn_local(async move {
            let token = request.inner.token.clone();
            let outcome = tokio::select! {
                result = op => match result {
                    Ok(payload) => Some(ChunkPayload::Loaded(payload)),
                    Err(err) => {
                        tracing::debug!(chunk = %request.chunk(), error = %err, "chunk production failed");
                        None
                    }
                },
                () = token.cancelled() => None,
            };
            request.settle(outcome);
        });
    }

    /// Returns false if the request had already settled.
    pub(crate) fn settle(&self, outcome: RenderData<P>) -> bool {
        self.inner.state.send_if_modified(move |state| match state {
            LoadState::Pending => {
                *state = LoadState::Settled(outcome);
                true
            }
            LoadState::Settled(_) => false,
        })
    }

    /// Signal the token. An already-settled outcome is kept.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn token(&self) -> &CancelToken {
        &self.inner.token
    }

    /// Repoint at an equal-identity chunk. Never re-requests or resettles.
    pub fn replace_node(&self, chunk: LodChunk) {
        debug_assert!(self.inner.chunk.borrow().node_equals(&chunk));
        *self.inner.chunk.borrow_mut() = chunk;
    }

    pub fn chunk(&self) -> LodChunk {
        self.inner.chunk.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.inner.state.borrow(), LoadState::Settled(_))
    }

    /// The outcome, if settled.
    pub fn settled(&self) -> Option<RenderData<P>> {
        match &*self.inner.state.borrow() {
            LoadState::Pending => None,
            LoadState::Settled(data) => Some(data.clone()),
        }
    }

    /// Wait for the outcome. Any number of callers may wait.
    pub async fn wait_for_load(&self) -> RenderData<P> {
        let mut rx = self.inner.state.subscribe();
        match rx
            .wait_for(|state| matches!(state, LoadState::Settled(_)))
            .await
        {
            Ok(state) => match &*state {
                LoadState::Settled(data) => data.clone(),
                LoadState::Pending => None,
            },
            Err(_) => None,
        }
    }
}

impl<P> fmt::Debug for DataRequest<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataRequest")
            .field("chunk", &self.inner.chunk.borrow().key)
            .field(
                "settled",
                &matches!(*self.inner.state.borrow(), LoadState::Settled(_)),
            )
            .field("cancelled", &self.inner.token.is_cancelled())
            .finish()
    }
}

/// Request event handed to a [`ChunkProducer`].
pub struct RequestData<'a, P> {
    chunk: &'a LodChunk,
    request: &'a DataRequest<P>,
    accepted: bool,
}

impl<P: Clone + 'static> RequestData<'_, P> {
    pub fn chunk(&self) -> &LodChunk {
        self.chunk
    }

    /// Token the producer should watch to abandon work early.
    pub fn token(&self) -> &CancelToken {
        self.request.token()
    }

    /// Take ownership of the request; its outcome becomes `op`'s result.
    pub fn accept<F, E>(&mut self, op: F)
    where
        F: Future<Output = Result<P, E>> + 'static,
        E: fmt::Display + 'static,
    {
        self.accepted = true;
        self.request.wait_until(op);
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }
}

/// External collaborator that produces chunk payloads.
pub trait ChunkProducer {
    type Payload: Clone + 'static;

    /// Called synchronously once per new request. Call
    /// [`RequestData::accept`] to take it on; returning without accepting
    /// settles it with a placeholder.
    fn request_data(&self, request: &mut RequestData<'_, Self::Payload>);
}

/// Producer that never accepts: every chunk settles with a placeholder.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProducer;

impl ChunkProducer for NullProducer {
    type Payload = ();

    fn request_data(&self, _request: &mut RequestData<'_, ()>) {}
}
