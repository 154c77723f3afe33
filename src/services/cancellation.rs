use tokio::sync::watch;

/// Why a job stopped dispatching work early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A caller asked for it.
    Cancelled,
    /// The provider looked unreachable; dispatch gave up on its own.
    Aborted(String),
}

/// Per-job stop flag. Workers look at it between attempts only, so an
/// in-flight provider call is always allowed to finish.
pub struct CancellationController {
    tx: watch::Sender<Option<StopReason>>,
}

/// Worker-side view of a [`CancellationController`].
#[derive(Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<Option<StopReason>>,
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Requests cancellation. Returns false if the job was already stopping.
    pub fn cancel(&self) -> bool {
        self.stop(StopReason::Cancelled)
    }

    /// Stops dispatch because of a job-level failure.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        self.stop(StopReason::Aborted(reason.into()))
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.tx.borrow().clone()
    }

    // First reason wins.
    fn stop(&self, reason: StopReason) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        })
    }
}

impl CancellationToken {
    pub fn is_stopped(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.rx.borrow().clone()
    }

    /// Resolves once the job is told to stop.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|state| state.is_some()).await;
    }
}
