//! The storage engine.
//!
//! Owns the memtable pair, the two level handlers, and the manifest, and
//! runs four cooperating background tasks:
//!
//! 1. **accept-write** serializes all mutation: it drains the bounded
//!    write queue one request at a time, rotating the active memtable
//!    into the immutable slot when it fills.
//! 2. **flush** turns each immutable memtable into a level 0 table and
//!    registers it with the manifest and the level 0 handler.
//! 3. **compaction** drains level 0 into level 1 once enough level 0
//!    tables accumulate, driven by fingerprint-range overlap.
//! 4. **load-balance** splits any level 1 table that outgrows its size
//!    bound at the median fingerprint.
//!
//! Reads run inline on the caller: active memtable, immutable memtable,
//! level 0, level 1, first hit wins — recency order, so a read issued
//! after an acknowledged write observes it.

mod balance;
mod compaction;
mod write;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot, Notify};

use crate::closer::Closer;
use crate::config::Options;
use crate::errinput;
use crate::error::{Error, Result};
use crate::level::LevelHandler;
use crate::manifest::Manifest;
use crate::memtable::Memtable;
use crate::table::Table;
use write::WriteRequest;

/// Logs an integrity-critical failure and aborts the process. The manifest
/// and the filesystem could diverge if the failed operation were retried
/// or ignored, so these errors are not surfaced to callers.
pub(crate) fn fatal(task: &str, err: &Error) -> ! {
    tracing::error!(task, error = %err, "unrecoverable storage failure");
    std::process::exit(1);
}

/// The (active, immutable) memtable pair, guarded by the engine lock.
/// Rotation takes the write lock; readers take the read lock only long
/// enough to clone the two handles.
pub(crate) struct MemtablePair {
    pub(crate) active: Arc<Memtable>,
    pub(crate) immutable: Option<Arc<Memtable>>,
}

/// State shared by the public handle and the background tasks.
pub(crate) struct StoreState {
    pub(crate) opts: Options,
    pub(crate) dir: PathBuf,
    pub(crate) memtables: RwLock<MemtablePair>,
    pub(crate) l0: LevelHandler,
    pub(crate) l1: LevelHandler,
    pub(crate) manifest: Manifest,
    /// Signalled by the flush task whenever the immutable slot empties.
    pub(crate) flush_done: Notify,
    /// Serializes compaction and load-balance passes: both reshape level 1,
    /// and an interleaving could delete the same table twice.
    pub(crate) maintenance_running: AtomicBool,
}

/// Point-in-time observables, mainly for tests and monitoring.
#[derive(Debug, Clone)]
pub struct StoreMetrics {
    pub active_memtable_size: usize,
    pub immutable_pending: bool,
    pub l0_tables: usize,
    pub l1_tables: usize,
    pub next_file_id: u32,
}

/// An embedded, persistent key-value store.
pub struct Store {
    state: Arc<StoreState>,
    write_tx: mpsc::Sender<WriteRequest>,
    flush_tx: mpsc::Sender<Arc<Memtable>>,
    write_closer: Closer,
    flush_closer: Closer,
    compaction_closer: Closer,
    balance_closer: Closer,
}

impl Store {
    /// Opens the store under `opts.dir`, recovering the tables recorded in
    /// the manifest and starting the background tasks.
    pub async fn open(opts: Options) -> Result<Self> {
        opts.validate()?;
        fs::create_dir_all(&opts.dir)?;
        let dir = opts.dir.canonicalize()?;

        let manifest = Manifest::load_or_create(&dir)?;
        cleanup_stray_files(&dir, &manifest)?;

        let l0 = LevelHandler::new();
        for meta in manifest.copy_l0() {
            l0.add_table(Arc::new(Table::open(&dir, meta.id)?), meta.id);
        }
        let l1 = LevelHandler::new();
        for meta in manifest.copy_l1() {
            l1.add_table(Arc::new(Table::open(&dir, meta.id)?), meta.id);
        }

        let state = Arc::new(StoreState {
            memtables: RwLock::new(MemtablePair {
                active: Arc::new(Memtable::new(opts.memtable_size)),
                immutable: None,
            }),
            dir,
            l0,
            l1,
            manifest,
            flush_done: Notify::new(),
            maintenance_running: AtomicBool::new(false),
            opts,
        });

        let (write_tx, write_rx) = mpsc::channel(state.opts.write_queue_depth);
        let (flush_tx, flush_rx) = mpsc::channel(1);

        let (tx, signal) = Closer::signal();
        let write_closer = Closer::new(
            tx,
            tokio::spawn(write::accept_write(
                state.clone(),
                write_rx,
                flush_tx.clone(),
                signal,
            )),
        );
        let (tx, signal) = Closer::signal();
        let flush_closer = Closer::new(
            tx,
            tokio::spawn(write::flush_loop(state.clone(), flush_rx, signal)),
        );
        let (tx, signal) = Closer::signal();
        let compaction_closer = Closer::new(
            tx,
            tokio::spawn(compaction::compaction_loop(state.clone(), signal)),
        );
        let (tx, signal) = Closer::signal();
        let balance_closer = Closer::new(
            tx,
            tokio::spawn(balance::balance_loop(state.clone(), signal)),
        );

        Ok(Self {
            state,
            write_tx,
            flush_tx,
            write_closer,
            flush_closer,
            compaction_closer,
            balance_closer,
        })
    }

    /// Durably queues a write and waits until it is applied. Returns once
    /// the entry is visible to readers; persistence to disk follows
    /// asynchronously through the flush pipeline.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > u32::MAX as usize {
            return errinput!("key length {} exceeds the 32-bit bound", key.len());
        }
        if value.len() > u32::MAX as usize {
            return errinput!("value length {} exceeds the 32-bit bound", value.len());
        }

        let (done, done_rx) = oneshot::channel();
        let request = WriteRequest::Set {
            key: key.to_vec(),
            value: value.to_vec(),
            done,
        };
        self.write_tx
            .send(request)
            .await
            .map_err(|_| Error::Closed)?;
        done_rx.await.map_err(|_| Error::Closed)
    }

    /// Returns the stored value for `key`. Probes the active memtable, the
    /// immutable memtable, level 0, and level 1 in that order; the first
    /// hit wins.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (active, immutable) = {
            let pair = self.state.memtables.read().unwrap();
            (pair.active.clone(), pair.immutable.clone())
        };

        if let Some(value) = active.get(key) {
            return Ok(Some(value));
        }
        if let Some(immutable) = immutable {
            if let Some(value) = immutable.get(key) {
                return Ok(Some(value));
            }
        }
        if let Some(value) = self.state.l0.get(key)? {
            return Ok(Some(value));
        }
        self.state.l1.get(key)
    }

    /// Rotates a non-empty active memtable into the flush pipeline and
    /// waits until it reaches level 0.
    pub async fn flush(&self) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest::Rotate { done })
            .await
            .map_err(|_| Error::Closed)?;
        done_rx.await.map_err(|_| Error::Closed)?;

        // The rotated memtable is flushed once the immutable slot clears.
        loop {
            let notified = self.state.flush_done.notified();
            if self.state.memtables.read().unwrap().immutable.is_none() {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Runs one compaction pass inline. Returns whether any level 0 table
    /// was promoted or merged. A pass already running in the background
    /// makes this a no-op.
    pub fn compact(&self) -> Result<bool> {
        compaction::run_once(&self.state)
    }

    /// Runs one load-balance pass inline. Returns whether any level 1
    /// table was split.
    pub fn rebalance(&self) -> Result<bool> {
        balance::run_once(&self.state)
    }

    pub fn metrics(&self) -> StoreMetrics {
        let (active_memtable_size, immutable_pending) = {
            let pair = self.state.memtables.read().unwrap();
            (pair.active.occupied_space(), pair.immutable.is_some())
        };
        StoreMetrics {
            active_memtable_size,
            immutable_pending,
            l0_tables: self.state.manifest.l0_len(),
            l1_tables: self.state.manifest.l1_len(),
            next_file_id: self.state.manifest.peek_next_file_id(),
        }
    }

    /// Stops the background tasks in dependency order, flushes any
    /// residual memtable, and persists the manifest.
    pub async fn close(self) -> Result<()> {
        self.balance_closer.signal_and_wait().await?;
        self.compaction_closer.signal_and_wait().await?;

        // Stop accepting writes; the task drains whatever is queued.
        drop(self.write_tx);
        self.write_closer.signal_and_wait().await?;

        let active = {
            let pair = self.state.memtables.read().unwrap();
            pair.active.clone()
        };
        if !active.is_empty() {
            let _ = self.flush_tx.send(active).await;
        }
        drop(self.flush_tx);
        self.flush_closer.signal_and_wait().await?;

        if let Err(e) = self.state.manifest.save() {
            fatal("close", &e);
        }
        Ok(())
    }
}

/// Removes leftovers a crash can strand in the data directory: temporary
/// files from interrupted table writes, and finished tables the persisted
/// manifest never came to reference.
fn cleanup_stray_files(dir: &Path, manifest: &Manifest) -> Result<()> {
    let referenced = manifest.referenced_ids();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".tmp") {
            tracing::warn!(file = name, "removing leftover temporary file");
            fs::remove_file(&path)?;
        } else if let Some(stem) = name.strip_suffix(".table") {
            let Ok(id) = stem.parse::<u32>() else {
                continue;
            };
            if !referenced.contains(&id) {
                tracing::warn!(table_id = id, "removing unreferenced table file");
                fs::remove_file(&path)?;
            }
        }
    }
    Ok(())
}
