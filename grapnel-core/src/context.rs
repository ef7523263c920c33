use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancellation::{CancelReason, CancellationToken};
use crate::deadline::Deadline;
use crate::metadata::Metadata;
use crate::method::MethodDescriptor;

type ValueMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

struct Inner {
    method: MethodDescriptor,
    peer: String,
    deadline: Option<Deadline>,
    request_metadata: Metadata,
    token: CancellationToken,
    /// Values installed by the executor before the handler runs.
    immutable: ValueMap,
    /// Values handlers and interceptors may install during the call.
    mutable: Mutex<ValueMap>,
}

/// The per-call bag handed to handlers and server interceptors: method
/// identity, deadline, peer, request metadata, cancellation, and a typed
/// value map keyed by type.
///
/// Clones share the same call; the context is only valid for the call it
/// was created for.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<Inner>,
}

impl ServerContext {
    pub(crate) fn new(
        method: MethodDescriptor,
        peer: String,
        deadline: Option<Deadline>,
        request_metadata: Metadata,
        token: CancellationToken,
        immutable: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        ServerContext {
            inner: Arc::new(Inner {
                method,
                peer,
                deadline,
                request_metadata,
                token,
                immutable,
                mutable: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.inner.method
    }

    /// Peer identity as reported by the transport.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// The effective deadline: the earlier of the transport-imposed and
    /// configured deadlines.
    pub fn deadline(&self) -> Option<Deadline> {
        self.inner.deadline
    }

    /// Time remaining until the deadline, if one is set.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.inner.deadline.map(|d| d.remaining())
    }

    /// The request's leading metadata, with protocol headers stripped.
    pub fn request_metadata(&self) -> &Metadata {
        &self.inner.request_metadata
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Suspend until the call is cancelled.
    pub async fn cancelled(&self) -> CancelReason {
        self.inner.token.await_cancelled().await
    }

    /// Install a value in the call's mutable map, replacing any previous
    /// value of the same type.
    pub fn insert<T: Any + Send + Sync>(&self, value: T) {
        self.inner
            .mutable
            .lock()
            .expect("context value lock poisoned")
            .insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Look up a value by type: executor-installed values first, then the
    /// mutable map.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        if let Some(value) = self.inner.immutable.get(&TypeId::of::<T>()) {
            return value.clone().downcast::<T>().ok();
        }
        self.inner
            .mutable
            .lock()
            .expect("context value lock poisoned")
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("method", &self.inner.method)
            .field("peer", &self.inner.peer)
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}
