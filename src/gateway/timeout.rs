//! Per-request remote timeout providers.

use std::{fmt, time::Duration};

use bytes::Bytes;
use dyn_clone::DynClone;

/// Computes how long to wait for the reply to a request once it has been sent.
///
/// Consulted once per request, before acquiring a connection. Implemented for [`Duration`]
/// (the same value for every request) and for [`FnRemoteTimeout`].
pub trait RemoteTimeout: DynClone + fmt::Debug + Send + Sync + 'static {
    /// Returns the remote timeout for `request`.
    fn remote_timeout(&self, request: &Bytes) -> Duration;
}

dyn_clone::clone_trait_object!(RemoteTimeout);

/// A boxed remote timeout provider.
pub type BoxRemoteTimeout = Box<dyn RemoteTimeout>;

impl RemoteTimeout for Duration {
    fn remote_timeout(&self, _request: &Bytes) -> Duration {
        *self
    }
}

/// A remote timeout computed from each request by a closure.
#[derive(Clone)]
pub struct FnRemoteTimeout<F>(
    /// Computes the timeout from the request.
    pub F,
);

impl<F> RemoteTimeout for FnRemoteTimeout<F>
where
    F: Fn(&Bytes) -> Duration + Clone + Send + Sync + 'static,
{
    fn remote_timeout(&self, request: &Bytes) -> Duration {
        (self.0)(request)
    }
}

impl<F> fmt::Debug for FnRemoteTimeout<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnRemoteTimeout").finish_non_exhaustive()
    }
}
