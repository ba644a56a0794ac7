//! The publish queue: a single-writer mailbox serialising every
//! mutation and every subscriber delivery.
//!
//! The worker task owns the tree context (root handle, tlog writer,
//! per-action batch). Callers from any task or thread submit actions;
//! the worker runs them one at a time and then commits: tlog records
//! are appended and flushed, events dispatch, and deferred completions
//! fire. An action that errors or panics is logged and never stops the
//! worker.

use crate::error::{Result, StoreError};
use crate::events::{self, Batch};
use crate::node::Node;
use crate::tlog::writer::TlogWriter;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

type ActionFn = Box<dyn FnOnce(&mut TreeCtx) + Send>;

enum Envelope {
    Action(ActionFn),
    Shutdown,
}

/// Worker-owned state threaded through every action.
pub(crate) struct TreeCtx {
    pub(crate) root: Node,
    pub(crate) tlog: TlogWriter,
    pub(crate) batch: Batch,
    deferred: Vec<Box<dyn FnOnce() + Send>>,
}

impl TreeCtx {
    fn new(root: Node, tlog: TlogWriter) -> Self {
        Self {
            root,
            tlog,
            batch: Batch::default(),
            deferred: Vec::new(),
        }
    }

    /// Run after this action's records are flushed and its events have
    /// dispatched. Used to resolve `submit_and_wait` callers.
    pub(crate) fn defer(&mut self, f: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(f));
    }

    fn commit(&mut self) {
        let batch = std::mem::take(&mut self.batch);
        if !batch.records.is_empty() {
            for record in &batch.records {
                if let Err(e) = self.tlog.append(record) {
                    tracing::error!(error = %e, "tlog append failed");
                }
            }
            if let Err(e) = self.tlog.sync_for_dispatch() {
                tracing::error!(error = %e, "tlog flush failed");
            }
            if self.tlog.should_truncate() {
                // Runs on the worker, so the snapshot sees a single
                // instant; failure keeps appending to the existing log.
                let root = self.root.clone();
                let _ = self.tlog.truncate(&root);
            }
        }
        events::dispatch(batch);
        for completion in self.deferred.drain(..) {
            completion();
        }
    }
}

impl std::fmt::Debug for TreeCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCtx").field("tlog", &self.tlog).finish()
    }
}

#[derive(Debug, Default)]
struct PendingCounter {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingCounter {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait for transitive quiescence: actions submitted by running
    /// actions raise the count before their parent finishes, so zero
    /// means truly empty. The waiter must be registered with the
    /// `Notify` before the count is read: `notify_waiters` stores no
    /// permit, so a `finish` landing between an unregistered check and
    /// the await would be lost and park this task forever.
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct PublishQueue {
    tx: mpsc::UnboundedSender<Envelope>,
    pending: Arc<PendingCounter>,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl PublishQueue {
    pub(crate) fn spawn(
        root: Node,
        tlog: TlogWriter,
        flush_interval: Option<Duration>,
        close_timeout: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingCounter::default());
        let worker_pending = Arc::clone(&pending);

        let worker = tokio::spawn(async move {
            let mut ctx = TreeCtx::new(root, tlog);
            let mut ticker = flush_interval.map(|period| {
                let mut t = tokio::time::interval(period);
                t.set_missed_tick_behavior(MissedTickBehavior::Delay);
                t
            });
            loop {
                let envelope = match ticker.as_mut() {
                    Some(ticker) => tokio::select! {
                        envelope = rx.recv() => envelope,
                        _ = ticker.tick() => {
                            if let Err(e) = ctx.tlog.flush() {
                                tracing::error!(error = %e, "periodic tlog flush failed");
                            }
                            continue;
                        }
                    },
                    None => rx.recv().await,
                };
                match envelope {
                    Some(Envelope::Action(action)) => {
                        let panicked =
                            catch_unwind(AssertUnwindSafe(|| action(&mut ctx))).is_err();
                        if panicked {
                            tracing::error!("configuration action panicked; worker continues");
                        }
                        ctx.commit();
                        worker_pending.finish();
                    }
                    Some(Envelope::Shutdown) | None => break,
                }
            }
            if let Err(e) = ctx.tlog.close() {
                tracing::error!(error = %e, "tlog close failed");
            }
        });

        Self {
            tx,
            pending,
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
            close_timeout,
        }
    }

    fn enqueue(&self, action: ActionFn) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::ShuttingDown);
        }
        self.pending.start();
        if self.tx.send(Envelope::Action(action)).is_err() {
            self.pending.finish();
            return Err(StoreError::ShuttingDown);
        }
        Ok(())
    }

    /// Non-blocking fire-and-forget submission. FIFO per submitter and
    /// totally ordered across all submissions as of acceptance.
    pub(crate) fn submit<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce(&mut TreeCtx) -> Result<()> + Send + 'static,
    {
        self.enqueue(Box::new(move |ctx| {
            if let Err(e) = action(ctx) {
                tracing::warn!(error = %e, "queued action failed");
            }
        }))
    }

    /// Submit, then wait until the action has been applied: tree
    /// mutated, tlog flushed, events dispatched.
    pub(crate) async fn submit_and_wait<T, F>(&self, action: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TreeCtx) -> Result<T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(Box::new(move |ctx| {
            let outcome = action(ctx);
            if let Err(e) = &outcome {
                tracing::warn!(error = %e, "queued action failed");
            }
            ctx.defer(move || {
                let _ = done_tx.send(outcome);
            });
        }))?;
        done_rx.await.map_err(|_| StoreError::ActionAborted)?
    }

    /// Block until the queue is empty, including actions submitted by
    /// actions.
    pub(crate) async fn drain(&self) {
        self.pending.wait_idle().await;
    }

    /// Reject further submissions, drain, and stop the worker within
    /// the close deadline. Past the deadline the worker is aborted.
    pub(crate) async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.wait_idle().await;
        let _ = self.tx.send(Envelope::Shutdown);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut handle) = handle else {
            return Ok(());
        };
        tokio::select! {
            joined = &mut handle => {
                if joined.is_err() {
                    tracing::error!("publish queue worker ended abnormally");
                }
                Ok(())
            }
            () = tokio::time::sleep(self.close_timeout) => {
                handle.abort();
                tracing::error!("publish queue worker missed the close deadline; aborted");
                Err(StoreError::ShuttingDown)
            }
        }
    }
}

impl std::fmt::Debug for PublishQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishQueue")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("pending", &self.pending.count.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlushMode;
    use crate::value::ConfigValue;
    use tempfile::TempDir;

    fn queue_in(dir: &TempDir) -> Arc<PublishQueue> {
        let tlog = TlogWriter::open(
            &dir.path().join("config.tlog"),
            FlushMode::Immediate,
            None,
            None,
        )
        .unwrap();
        Arc::new(PublishQueue::spawn(
            Node::new_root(),
            tlog,
            None,
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn actions_run_in_submission_order() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = Arc::clone(&log);
            queue
                .submit(move |_ctx| {
                    log.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        queue.drain().await;
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn submit_and_wait_returns_the_action_result() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        let value = queue
            .submit_and_wait(|ctx| {
                let leaf = ctx.root.lookup(&["k"], &mut ctx.batch)?;
                leaf.write_leaf(1, ConfigValue::Int(7), false, &mut ctx.batch)?;
                Ok(leaf.value().unwrap().as_int())
            })
            .await
            .unwrap();
        assert_eq!(value, Some(7));

        let err = queue
            .submit_and_wait::<(), _>(|_ctx| {
                Err(StoreError::ShuttingDown)
            })
            .await;
        assert!(matches!(err, Err(StoreError::ShuttingDown)));
    }

    #[tokio::test]
    async fn drain_covers_actions_submitted_by_actions() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        let hits = Arc::new(AtomicUsize::new(0));

        let inner_queue = Arc::clone(&queue);
        let inner_hits = Arc::clone(&hits);
        queue
            .submit(move |_ctx| {
                let deep_hits = Arc::clone(&inner_hits);
                inner_queue
                    .submit(move |_ctx| {
                        deep_hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
                inner_hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        queue.drain().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_panicking_action_does_not_stop_the_worker() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        queue
            .submit(|_ctx| {
                panic!("misbehaving collaborator");
            })
            .unwrap();
        let alive = queue.submit_and_wait(|_ctx| Ok(42)).await.unwrap();
        assert_eq!(alive, 42);
    }

    #[tokio::test]
    async fn close_rejects_later_submissions() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        queue.close().await.unwrap();
        let err = queue.submit(|_ctx| Ok(()));
        assert!(matches!(err, Err(StoreError::ShuttingDown)));
    }
}
