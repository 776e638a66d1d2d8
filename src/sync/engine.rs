//! Process assembly: the engine owns the shared resources (pool, delta
//! observers, interrupt, body-fetch queue) and the three long-lived
//! tasks: the listener, the background worker, and the foreground worker.
//!
//! The foreground worker is started by the background worker after its
//! first complete pass, so the folder list and per-folder cursors exist
//! before anything tries to IDLE.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::channel::{self, OrphanWatch, Packet};
use crate::config;
use crate::error::SyncError;
use crate::imap::ImapBackend;
use crate::models::{Account, Task};
use crate::store::{self, DbPool, Observers, Store};
use crate::sync::idle::Interrupt;
use crate::sync::worker::SyncWorker;
use crate::tasks::TaskProcessor;

/// Sleep between background cycles once a pass reports no more work. Long
/// on purpose: the foreground worker is idling on the inbox meanwhile.
const BACKGROUND_SLEEP: Duration = Duration::from_secs(120);
/// Back-off before retrying a worker that hit a transient failure.
const RETRY_SLEEP: Duration = Duration::from_secs(15);

pub struct Engine {
    account: Arc<Account>,
    pool: DbPool,
    observers: Observers,
    interrupt: Arc<Interrupt>,
    body_tx: flume::Sender<String>,
    body_rx: flume::Receiver<String>,
    files_root: PathBuf,
    orphan: bool,
}

impl Engine {
    pub fn new(account: Arc<Account>, orphan: bool) -> Result<Engine, SyncError> {
        let db_path = config::database_path(&account.id);
        let pool = store::open_pool(&db_path)?;
        let observers = Observers::new();
        let (body_tx, body_rx) = flume::unbounded();

        // Keep the Account row current; the worker is pinned to it anyway,
        // but migrations and debugging read it from the database.
        let bootstrap = Store::new(pool.clone(), observers.clone());
        let mut fresh = (*account).clone();
        fresh.version = bootstrap
            .find_by_id::<Account>(&account.id)?
            .map(|existing| existing.version)
            .unwrap_or(0);
        bootstrap.save(&mut fresh, false)?;

        Ok(Engine {
            account,
            pool,
            observers,
            interrupt: Arc::new(Interrupt::new()),
            body_tx,
            body_rx,
            files_root: config::files_root(),
            orphan,
        })
    }

    /// Explicit wakeup of the foreground worker, e.g. after a task's local
    /// phase. Flag first, then the idle primitive.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    fn store(&self) -> Store {
        Store::new(self.pool.clone(), self.observers.clone())
    }

    fn worker(&self, body_rx: flume::Receiver<String>) -> SyncWorker<ImapBackend> {
        SyncWorker::new(
            ImapBackend::new(self.account.clone()),
            self.store(),
            self.account.clone(),
            self.files_root.clone(),
            self.interrupt.clone(),
            body_rx,
        )
    }

    /// Run `--mode sync`: spawn the writer and the background worker, then
    /// serve the UI channel on this task until orphaned.
    pub async fn run(self) -> Result<(), SyncError> {
        let (delta_tx, delta_rx) = flume::unbounded();
        self.observers.add_observer(delta_tx);
        let (reply_tx, reply_rx) = flume::unbounded();
        tokio::spawn(channel::run_writer(delta_rx, reply_rx));

        let background = self.worker(flume::unbounded().1);
        let foreground = self.worker(self.body_rx.clone());
        tokio::spawn(run_background(background, foreground));

        self.run_listener(reply_tx).await
    }

    /// The main listener: blocks on the UI channel, runs the local phase of
    /// inbound tasks, and wakes the foreground worker.
    async fn run_listener(
        &self,
        reply_tx: flume::Sender<serde_json::Value>,
    ) -> Result<(), SyncError> {
        let store = self.store();
        let tasks = TaskProcessor::new(self.account.clone(), self.files_root.clone());
        let mut watch = OrphanWatch::new(!self.orphan);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            match tokio::time::timeout(Duration::from_secs(1), lines.next_line()).await {
                // Quiet channel; only a closed one counts against liveness.
                Err(_elapsed) => {}
                Ok(Ok(Some(line))) => {
                    watch.alive();
                    self.handle_line(&store, &tasks, &reply_tx, line.trim());
                }
                Ok(Ok(None)) | Ok(Err(_)) => {
                    if watch.broken(Instant::now()) {
                        info!("UI channel closed for 30s; worker is orphaned, exiting");
                        std::process::exit(0);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn handle_line(
        &self,
        store: &Store,
        tasks: &TaskProcessor,
        reply_tx: &flume::Sender<serde_json::Value>,
        line: &str,
    ) {
        if line.is_empty() {
            return;
        }
        match channel::parse_packet(line) {
            Ok(Packet::TaskQueued(raw)) => {
                let mut task = match Task::from_wire(raw) {
                    Ok(task) => task,
                    Err(e) => {
                        warn!("dropping malformed task: {}", e);
                        let _ = reply_tx
                            .send(serde_json::json!({ "error": format!("bad task: {}", e) }));
                        return;
                    }
                };
                if let Err(e) = tasks.perform_local(store, &mut task) {
                    error!(task = %task.id, "local phase failed: {}", e);
                }
                self.interrupt();
            }
            Ok(Packet::NeedBodies(ids)) => {
                for id in ids {
                    let _ = self.body_tx.send(id);
                }
                self.interrupt();
            }
            Err(e) => {
                // Drop the offending packet, answer with the error, carry on.
                warn!("dropping packet: {}", e);
                let _ = reply_tx.send(serde_json::json!({ "error": e.to_string() }));
            }
        }
    }
}

/// The background worker loop: full-mailbox cycles in a hard loop while
/// there is more to sync, then a long sleep. Transient failures restart
/// the cycle after a back-off; anything else takes the process down.
async fn run_background(
    mut worker: SyncWorker<ImapBackend>,
    foreground: SyncWorker<ImapBackend>,
) {
    let mut foreground = Some(foreground);
    loop {
        let mut more_to_sync = true;
        while more_to_sync {
            match worker.sync_now().await {
                Ok(more) => {
                    more_to_sync = more;
                    // First complete pass: folder list and cursors exist,
                    // the idle worker can start.
                    if let Some(fg) = foreground.take() {
                        tokio::spawn(run_foreground(fg));
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!("background cycle failed, will retry: {}", e);
                    tokio::time::sleep(RETRY_SLEEP).await;
                }
                Err(e) => {
                    error!("background sync failed fatally: {}", e);
                    std::process::exit(1);
                }
            }
        }
        tokio::time::sleep(BACKGROUND_SLEEP).await;
    }
}

async fn run_foreground(mut worker: SyncWorker<ImapBackend>) {
    loop {
        match worker.idle_cycle().await {
            Ok(()) => unreachable!("idle_cycle only returns on error"),
            Err(e) if e.is_retryable() => {
                warn!("idle cycle failed, will retry: {}", e);
                tokio::time::sleep(RETRY_SLEEP).await;
            }
            Err(e) => {
                error!("foreground worker failed fatally: {}", e);
                std::process::exit(1);
            }
        }
    }
}
