//! Filesystem watching for the rsync daemon: a debounce timer that coalesces bursts of
//! change events into a single upload, and the recursive observer that feeds it.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::event::{EventKind, ModifyKind};
use notify::{RecursiveMode, Watcher};

use crate::rsync::RsyncClient;
use crate::Result;

/// A timer that debounces calls: scheduling cancels any pending execution and re-arms the
/// delay, so only the last call in a burst fires.
pub struct DebounceTimer {
    delay: Duration,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DebounceTimer {
    pub fn new(delay: Duration) -> Self {
        DebounceTimer {
            delay,
            timer: Mutex::new(None),
        }
    }

    /// Schedules `func` to run after the configured delay, cancelling any pending execution.
    pub fn debounce<F, Fut>(&self, func: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.cancel();
        let delay = self.delay;
        tracing::debug!(
            "Debouncing function call... will execute in {} seconds",
            delay.as_secs_f64()
        );
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            func().await;
        });
        *self.timer.lock().expect("timer lock poisoned") = Some(handle);
    }

    /// Cancels the pending execution, if any.
    pub fn cancel(&self) {
        if let Some(handle) = self.timer.lock().expect("timer lock poisoned").take() {
            if !handle.is_finished() {
                tracing::debug!("Cancelling existing debounce timer...");
                handle.abort();
            }
        }
    }
}

/// Create and modify events trigger uploads; deletes and renames are intentionally ignored
/// because `rsync -av` is append-oriented in this design.
fn is_eligible_event(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Name(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

/// Watches a source path recursively and debounces change events into `upload()` calls on a
/// subscribed rsync client.
pub struct WorkspaceObserver {
    // Dropping the watcher tears the observer thread down
    _watcher: notify::RecommendedWatcher,
    debounce_timer: Arc<DebounceTimer>,
    forwarder: tokio::task::JoinHandle<()>,
}

impl WorkspaceObserver {
    /// Starts watching `src`. Events are delivered from the observer thread into the async
    /// scheduler through a channel; the debounce timer runs on the scheduler side.
    pub fn start(src: &Path, rsync_client: RsyncClient, debounce_delay: Duration) -> Result<Self> {
        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    if is_eligible_event(&event.kind) {
                        let _ = event_tx.send(());
                    }
                }
            })?;
        watcher.watch(src, RecursiveMode::Recursive)?;

        let debounce_timer = Arc::new(DebounceTimer::new(debounce_delay));
        let forwarder = {
            let debounce_timer = debounce_timer.clone();
            let src = src.to_owned();
            tokio::spawn(async move {
                while event_rx.recv().await.is_some() {
                    tracing::info!(
                        "Path event handler ({}) detected changes...",
                        src.display()
                    );
                    let client = rsync_client.clone();
                    debounce_timer.debounce(move || async move {
                        if let Err(err) = client.upload().await {
                            tracing::error!(error = %err, "Error running debounced upload");
                        }
                    });
                }
            })
        };

        Ok(WorkspaceObserver {
            _watcher: watcher,
            debounce_timer,
            forwarder,
        })
    }

    /// Stops the observer and any pending debounced upload.
    pub fn stop(&self) {
        self.debounce_timer.cancel();
        self.forwarder.abort();
    }
}

impl Drop for WorkspaceObserver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_events_coalesces_into_one_call() {
        let timer = DebounceTimer::new(Duration::from_secs(30));
        let fired = Arc::new(AtomicU32::new(0));

        for _ in 0..10 {
            let fired = fired.clone();
            timer.debounce(move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_event_resets_the_timer() {
        let timer = DebounceTimer::new(Duration::from_secs(30));
        let fired = Arc::new(AtomicU32::new(0));

        {
            let fired = fired.clone();
            timer.debounce(move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Re-arming one second before the deadline pushes execution out another full delay
        {
            let fired = fired.clone();
            timer.debounce(move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_execution() {
        let timer = DebounceTimer::new(Duration::from_secs(5));
        let fired = Arc::new(AtomicU32::new(0));
        {
            let fired = fired.clone();
            timer.debounce(move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_eligible_events_exclude_removes_and_renames() {
        use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};
        assert!(is_eligible_event(&EventKind::Create(CreateKind::File)));
        assert!(is_eligible_event(&EventKind::Create(CreateKind::Folder)));
        assert!(is_eligible_event(&EventKind::Modify(ModifyKind::Data(
            DataChange::Content
        ))));
        assert!(!is_eligible_event(&EventKind::Modify(ModifyKind::Name(
            RenameMode::Both
        ))));
        assert!(!is_eligible_event(&EventKind::Remove(RemoveKind::File)));
        assert!(!is_eligible_event(&EventKind::Access(
            notify::event::AccessKind::Read
        )));
    }
}
