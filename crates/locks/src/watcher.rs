use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vipd_store::CoordinationStore;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Callback invoked after changes to a watched key. It should re-read
/// whatever state it cares about rather than rely on what changed.
pub type OnChange = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Watches a single key and calls back on every batch of changes to it,
/// across reconnects, until stopped or dropped.
#[derive(Debug)]
pub struct Watcher {
    key: String,
    shutdown_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Starts watching `key` in the background. Longer keys that merely
    /// start with `key` are ignored.
    pub fn start<S>(store: S, key: String, on_change: OnChange) -> Self
    where
        S: CoordinationStore,
    {
        let shutdown_token = CancellationToken::new();
        let task = tokio::spawn(run(
            store,
            key.clone(),
            on_change,
            shutdown_token.clone(),
        ));

        Self {
            key,
            shutdown_token,
            task: Mutex::new(Some(task)),
        }
    }

    /// The key being watched.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cancels the subscription and waits for the watch task to exit.
    /// Callbacks already spawned are not waited on.
    pub async fn stop(&self) {
        self.shutdown_token.cancel();

        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

fn notify(on_change: &OnChange) {
    tokio::spawn(on_change());
}

async fn run<S>(store: S, key: String, on_change: OnChange, shutdown_token: CancellationToken)
where
    S: CoordinationStore,
{
    let mut reconnecting = false;

    loop {
        let subscribed = tokio::select! {
            () = shutdown_token.cancelled() => return,
            subscribed = store.watch_prefix(&key) => subscribed,
        };

        match subscribed {
            Ok(mut stream) => {
                if reconnecting {
                    // Changes during the gap were missed.
                    debug!(%key, "watch re-established");
                    notify(&on_change);
                }

                loop {
                    let next = tokio::select! {
                        () = shutdown_token.cancelled() => return,
                        next = stream.next() => next,
                    };

                    match next {
                        Some(Ok(events)) => {
                            // The store watches by prefix.
                            if !events.iter().any(|event| event.key == key) {
                                continue;
                            }

                            debug!(%key, events = events.len(), "watched keys changed");
                            notify(&on_change);
                        }
                        Some(Err(e)) => {
                            warn!(%key, error = %e, "watch stream failed");
                            break;
                        }
                        None => {
                            warn!(%key, "watch stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(%key, error = %e, "failed to start watch"),
        }

        reconnecting = true;

        tokio::select! {
            () = shutdown_token.cancelled() => return,
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
