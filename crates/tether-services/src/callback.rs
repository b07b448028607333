//! Callback surface between endpoints and the owning application.
//!
//! Three pieces:
//!   1. [`SessionHandler`]: the operations every application must provide
//!   2. [`SessionHooks`]: optional hooks, each a no-op unless set
//!   3. [`ErrorNotify`]: connect/accept/send/receive failures,
//!      [`LoggingErrorNotify`] unless the application supplies its own
//!
//! Every call happens on the connection's own worker task, in stream
//! order. A slow callback stalls that connection's read loop.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tether_core::Kind;

use crate::error::SessionError;

/// Operations every endpoint owner must implement.
pub trait SessionHandler: Send + Sync {
    /// A Text envelope arrived (the `Bye` sentinel is not delivered here).
    fn on_text_received(&self, text: &str);

    /// The server is bound and about to accept. Fired once; never for clients.
    fn on_start_success(&self, msg: &str);
}

/// Receives every error an endpoint reports.
pub trait ErrorNotify: Send + Sync {
    fn on_error(&self, error: &SessionError, context: &str);
}

/// Default notifier: errors go to `tracing` and nowhere else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorNotify;

impl ErrorNotify for LoggingErrorNotify {
    fn on_error(&self, error: &SessionError, context: &str) {
        tracing::warn!(error = %error, context, "session error");
    }
}

impl<F> ErrorNotify for F
where
    F: Fn(&SessionError, &str) + Send + Sync,
{
    fn on_error(&self, error: &SessionError, context: &str) {
        self(error, context)
    }
}

type ProgressHook = Box<dyn Fn(u8) + Send + Sync>;
type LogHook = Box<dyn Fn(Kind, &str) + Send + Sync>;
type UnitHook = Box<dyn Fn() + Send + Sync>;
type FailureHook = Box<dyn Fn(&SessionError) + Send + Sync>;
type FileHook = Box<dyn Fn(&Path) + Send + Sync>;

/// Optional hooks. Unset hooks are no-ops.
///
/// ```
/// use tether_services::SessionHooks;
/// let hooks = SessionHooks::new()
///     .on_progress(|pct| println!("{pct}%"))
///     .on_disconnected(|| println!("peer left"));
/// ```
#[derive(Default)]
pub struct SessionHooks {
    progress: Option<ProgressHook>,
    log: Option<LogHook>,
    connect_success: Option<UnitHook>,
    connect_failure: Option<FailureHook>,
    file_received: Option<FileHook>,
    disconnected: Option<UnitHook>,
}

impl SessionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Percentage of the current file sent or received, after every chunk.
    pub fn on_progress(mut self, f: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Log and Command envelopes from the peer, plus local connection diagnostics.
    pub fn on_log(mut self, f: impl Fn(Kind, &str) + Send + Sync + 'static) -> Self {
        self.log = Some(Box::new(f));
        self
    }

    pub fn on_connect_success(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.connect_success = Some(Box::new(f));
        self
    }

    /// Single-address dial failed. Clients only.
    pub fn on_connect_failure(mut self, f: impl Fn(&SessionError) + Send + Sync + 'static) -> Self {
        self.connect_failure = Some(Box::new(f));
        self
    }

    /// A file is complete on disk, either just written or already present.
    pub fn on_file_received(mut self, f: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.file_received = Some(Box::new(f));
        self
    }

    /// The peer said `Bye` or closed the stream.
    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.disconnected = Some(Box::new(f));
        self
    }

    pub(crate) fn progress(&self, percent: u8) {
        if let Some(f) = &self.progress {
            f(percent)
        }
    }

    pub(crate) fn log(&self, kind: Kind, msg: &str) {
        if let Some(f) = &self.log {
            f(kind, msg)
        }
    }

    pub(crate) fn connect_success(&self) {
        if let Some(f) = &self.connect_success {
            f()
        }
    }

    pub(crate) fn connect_failure(&self, error: &SessionError) {
        if let Some(f) = &self.connect_failure {
            f(error)
        }
    }

    pub(crate) fn file_received(&self, path: &Path) {
        if let Some(f) = &self.file_received {
            f(path)
        }
    }

    pub(crate) fn disconnected(&self) {
        if let Some(f) = &self.disconnected {
            f()
        }
    }
}

impl fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHooks")
            .field("progress", &self.progress.is_some())
            .field("log", &self.log.is_some())
            .field("connect_success", &self.connect_success.is_some())
            .field("connect_failure", &self.connect_failure.is_some())
            .field("file_received", &self.file_received.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .finish()
    }
}

/// Everything an endpoint reports to, cheap to clone into worker tasks.
#[derive(Clone)]
pub struct Callbacks {
    pub(crate) handler: Arc<dyn SessionHandler>,
    pub(crate) hooks: Arc<SessionHooks>,
    errors: Arc<dyn ErrorNotify>,
}

impl Callbacks {
    pub fn new(handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            handler,
            hooks: Arc::new(SessionHooks::default()),
            errors: Arc::new(LoggingErrorNotify),
        }
    }

    pub fn with_hooks(mut self, hooks: SessionHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn with_error_notify(mut self, notify: Arc<dyn ErrorNotify>) -> Self {
        self.errors = notify;
        self
    }

    /// Hand an error to the notifier.
    pub(crate) fn error(&self, error: &SessionError, context: &str) {
        tracing::debug!(error = %error, context, "reporting error");
        self.errors.on_error(error, context);
    }
}
