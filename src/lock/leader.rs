use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Transition reported by a backend's contention loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaderEvent {
    Elected,
    Deposed,
}

type Callback = Box<dyn FnMut() + Send>;
type TenureTask = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// What to do when leadership of a group starts and ends.
///
/// ```rust,no_run
/// use property_runner::LeaderListener;
///
/// let listener = LeaderListener::task(|cancel| async move {
///     while !cancel.is_cancelled() {
///         // periodic cleanup, only on the leader
///         tokio::time::sleep(std::time::Duration::from_secs(60)).await;
///     }
/// });
/// ```
pub enum LeaderListener {
    /// Plain callbacks. `on_elected` runs once per tenure, `on_deposed` once when it ends.
    Callbacks {
        on_elected: Callback,
        on_deposed: Callback,
    },
    /// A long-running job bound to the tenure: spawned on election, its token is cancelled
    /// on deposal.
    Task(TenureTask),
}

impl LeaderListener {
    pub fn new<E, D>(on_elected: E, on_deposed: D) -> Self
    where
        E: FnMut() + Send + 'static,
        D: FnMut() + Send + 'static,
    {
        LeaderListener::Callbacks {
            on_elected: Box::new(on_elected),
            on_deposed: Box::new(on_deposed),
        }
    }

    pub fn task<F, Fut>(job: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        LeaderListener::Task(Box::new(move |token| Box::pin(job(token))))
    }
}

impl std::fmt::Debug for LeaderListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaderListener::Callbacks { .. } => write!(f, "LeaderListener::Callbacks(..)"),
            LeaderListener::Task(_) => write!(f, "LeaderListener::Task(..)"),
        }
    }
}

/// Invokes a listener on its own task so a slow callback never stalls lease renewal.
///
/// The dispatcher owns the leading flag: a second `Elected` without an intervening
/// `Deposed` (or the reverse) is dropped, so a tenure is reported exactly once.
pub(crate) fn spawn_dispatcher(
    group: String,
    mut listener: LeaderListener,
    leading: Arc<AtomicBool>,
    mut events: mpsc::UnboundedReceiver<LeaderEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tenure: Option<(CancellationToken, JoinHandle<()>)> = None;

        while let Some(event) = events.recv().await {
            match event {
                LeaderEvent::Elected => {
                    if leading.swap(true, Ordering::SeqCst) {
                        debug!(group = %group, "Duplicate election event ignored");
                        continue;
                    }
                    info!(group = %group, "Elected leader");
                    match &mut listener {
                        LeaderListener::Callbacks { on_elected, .. } => on_elected(),
                        LeaderListener::Task(job) => {
                            let token = CancellationToken::new();
                            let handle = tokio::spawn(job(token.clone()));
                            tenure = Some((token, handle));
                        }
                    }
                }
                LeaderEvent::Deposed => {
                    if !leading.swap(false, Ordering::SeqCst) {
                        continue;
                    }
                    info!(group = %group, "No longer leader");
                    match &mut listener {
                        LeaderListener::Callbacks { on_deposed, .. } => on_deposed(),
                        LeaderListener::Task(_) => {
                            if let Some((token, _handle)) = tenure.take() {
                                token.cancel();
                            }
                        }
                    }
                }
            }
        }

        // Sender gone: the contention loop has exited. Never leave a tenure dangling.
        if leading.swap(false, Ordering::SeqCst) {
            match &mut listener {
                LeaderListener::Callbacks { on_deposed, .. } => on_deposed(),
                LeaderListener::Task(_) => {
                    if let Some((token, _handle)) = tenure.take() {
                        token.cancel();
                    }
                }
            }
        }
        debug!(group = %group, "Leader listener dispatcher stopped");
    })
}

/// Handle to one contender in a leader election. Dropping it withdraws the contender.
pub struct LeaderElection {
    group: String,
    leading: Arc<AtomicBool>,
    cancel: CancellationToken,
    contender: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl LeaderElection {
    /// Wire a contention loop to a listener.
    ///
    /// `contend` receives the event sender and a cancellation token; it must send
    /// `Deposed` (or simply return) once the token fires.
    pub(crate) fn spawn<F, Fut>(group: &str, listener: LeaderListener, contend: F) -> Self
    where
        F: FnOnce(mpsc::UnboundedSender<LeaderEvent>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let leading = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = spawn_dispatcher(group.to_string(), listener, leading.clone(), rx);
        let contender = tokio::spawn(contend(tx, cancel.clone()));
        Self {
            group: group.to_string(),
            leading,
            cancel,
            contender: Some(contender),
            dispatcher: Some(dispatcher),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Whether the listener currently holds a tenure.
    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    /// Withdraw from the election and wait until the listener has been told.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(contender) = self.contender.take() {
            let _ = contender.await;
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
    }
}

impl Drop for LeaderElection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for LeaderElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElection")
            .field("group", &self.group)
            .field("leading", &self.is_leader())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dispatcher_suppresses_duplicate_events() {
        let elected = Arc::new(AtomicUsize::new(0));
        let deposed = Arc::new(AtomicUsize::new(0));
        let (e, d) = (elected.clone(), deposed.clone());
        let listener = LeaderListener::new(
            move || {
                e.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                d.fetch_add(1, Ordering::SeqCst);
            },
        );
        let leading = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_dispatcher("g".into(), listener, leading.clone(), rx);

        for event in [
            LeaderEvent::Deposed,
            LeaderEvent::Elected,
            LeaderEvent::Elected,
            LeaderEvent::Deposed,
            LeaderEvent::Deposed,
            LeaderEvent::Elected,
        ] {
            tx.send(event).unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(elected.load(Ordering::SeqCst), 2);
        // the final tenure is closed when the sender goes away
        assert_eq!(deposed.load(Ordering::SeqCst), 2);
        assert!(!leading.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_task_listener_is_cancelled_on_deposal() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let listener = LeaderListener::task(move |token| {
            let flag = flag.clone();
            async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            }
        });
        let leading = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_dispatcher("g".into(), listener, leading, rx);

        tx.send(LeaderEvent::Elected).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cancelled.load(Ordering::SeqCst));

        tx.send(LeaderEvent::Deposed).unwrap();
        drop(tx);
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
