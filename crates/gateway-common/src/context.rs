use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a request stopped before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The client went away (connection closed, handler dropped).
    ClientGone,
    /// The enclosing deadline passed.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::ClientGone => write!(f, "request canceled by client"),
            CancelReason::DeadlineExceeded => write!(f, "request deadline exceeded"),
        }
    }
}

/// Per-request context propagated to every backend call.
///
/// Cloning shares the cancellation token, so canceling any clone cancels them all.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` until it completes, the token is canceled, or the deadline passes.
    /// The losing future is dropped, which stops any in-flight backend I/O it owns.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, CancelReason>
    where
        F: Future,
    {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CancelReason::ClientGone),
            _ = deadline => Err(CancelReason::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }
}
