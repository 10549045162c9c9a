pub(crate) mod executor;
pub mod session;
#[cfg(test)]
mod test;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    error::{ErrorKind, Result},
    options::{ClientOptions, SessionOptions},
    sdam::{Topology, TransactionSupportStatus},
    ClientSession,
};

use session::{ServerSession, ServerSessionPool};

/// The client-side entry point to operation execution.
///
/// A `Client` decides, for every outbound command, which server to target, whether and how to
/// retry on failure, and how much time remains under a client-side deadline. Topology discovery
/// and connection management are consumed through the [`Topology`] trait; everything else the
/// driver layers above need goes through [`Client::execute_operation`] and the session returned
/// by [`Client::start_session`].
///
/// `Client` uses [`std::sync::Arc`] internally, so it can safely be shared across threads or
/// async tasks by cloning.
#[derive(Clone, Debug)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

#[derive(Debug)]
pub(crate) struct ClientInner {
    pub(crate) topology: Arc<dyn Topology>,
    pub(crate) options: ClientOptions,
    pub(crate) session_pool: ServerSessionPool,
    connected: AtomicBool,
    shutdown: AtomicBool,
}

impl Client {
    /// Creates a new `Client` executing operations against the given topology.
    pub fn new(topology: Arc<dyn Topology>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                topology,
                options,
                session_pool: ServerSessionPool::new(),
                connected: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// The options this client was created with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The topology this client executes operations against.
    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.inner.topology
    }

    /// Starts a new [`ClientSession`].
    pub async fn start_session(&self, options: Option<SessionOptions>) -> Result<ClientSession> {
        if let Some(ref options) = options {
            options.validate()?;
        }
        Ok(ClientSession::new(self.clone(), options, false).await)
    }

    /// Starts an implicit session, used by the executor when the caller did not provide one.
    pub(crate) async fn start_implicit_session(&self) -> ClientSession {
        ClientSession::new(self.clone(), None, true).await
    }

    /// Whether `session` was started by this client.
    pub(crate) fn is_session_owner(&self, session: &ClientSession) -> bool {
        Arc::ptr_eq(&self.inner, &session.client().inner)
    }

    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        let timeout = self.inner.topology.logical_session_timeout();
        self.inner.session_pool.check_in(session, timeout).await;
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.inner.topology.transaction_support_status()
    }

    /// Marks the client as connected, failing if it has been shut down. Executing any operation
    /// connects the client implicitly.
    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(ErrorKind::Shutdown.into());
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Shuts this client down, after which any attempt to execute an operation through it
    /// returns a shutdown error.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
