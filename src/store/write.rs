//! The accept-write and flush tasks.
//!
//! All mutation funnels through the accept-write task, so the memtable
//! itself never needs a write lock; the engine lock is taken only to swap
//! the (active, immutable) pair. The flush task owns the disk side of a
//! rotation: it serializes the immutable memtable, registers the new
//! level 0 table, and only then clears the immutable slot, so an entry
//! being flushed stays readable throughout.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::closer::StopSignal;
use crate::manifest::TableMeta;
use crate::memtable::Memtable;
use crate::table::Table;

use super::{fatal, StoreState};

pub(crate) enum WriteRequest {
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
        done: oneshot::Sender<()>,
    },
    /// Manual rotation of the active memtable into the flush pipeline.
    Rotate { done: oneshot::Sender<()> },
}

pub(crate) async fn accept_write(
    state: Arc<StoreState>,
    mut rx: mpsc::Receiver<WriteRequest>,
    flush_tx: mpsc::Sender<Arc<Memtable>>,
    mut stop: StopSignal,
) {
    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(request) => handle(&state, &flush_tx, request).await,
                None => break,
            },
            _ = stop.stopped() => break,
        }
    }

    // Drain requests queued before the stop signal.
    rx.close();
    while let Some(request) = rx.recv().await {
        handle(&state, &flush_tx, request).await;
    }
}

async fn handle(
    state: &StoreState,
    flush_tx: &mpsc::Sender<Arc<Memtable>>,
    request: WriteRequest,
) {
    match request {
        WriteRequest::Set { key, value, done } => {
            let need = key.len() + value.len();
            let active = {
                let pair = state.memtables.read().unwrap();
                pair.active.clone()
            };
            let active = if !active.is_enough_space(need) && !active.is_empty() {
                rotate(state, flush_tx).await
            } else {
                active
            };
            active.set(key, value);
            let _ = done.send(());
        }
        WriteRequest::Rotate { done } => {
            let non_empty = {
                let pair = state.memtables.read().unwrap();
                !pair.active.is_empty()
            };
            if non_empty {
                rotate(state, flush_tx).await;
            }
            let _ = done.send(());
        }
    }
}

/// Swaps the active memtable into the immutable slot and hands it to the
/// flush task, returning the fresh active memtable. Stalls until the
/// previous flush has cleared the slot, which is the write path's
/// back-pressure: a writer outpacing the disk waits here.
async fn rotate(state: &StoreState, flush_tx: &mpsc::Sender<Arc<Memtable>>) -> Arc<Memtable> {
    loop {
        let notified = state.flush_done.notified();
        if state.memtables.read().unwrap().immutable.is_none() {
            break;
        }
        notified.await;
    }

    let (immutable, active) = {
        let mut pair = state.memtables.write().unwrap();
        let immutable = pair.active.clone();
        pair.immutable = Some(immutable.clone());
        pair.active = Arc::new(Memtable::new(state.opts.memtable_size));
        (immutable, pair.active.clone())
    };

    if flush_tx.send(immutable).await.is_err() {
        // Only reachable while shutting down after the flush task died.
        tracing::error!("flush channel closed during rotation");
    }
    active
}

pub(crate) async fn flush_loop(
    state: Arc<StoreState>,
    mut rx: mpsc::Receiver<Arc<Memtable>>,
    mut stop: StopSignal,
) {
    loop {
        tokio::select! {
            memtable = rx.recv() => match memtable {
                Some(memtable) => flush_memtable(&state, memtable),
                None => break,
            },
            _ = stop.stopped() => break,
        }
    }

    // Drain memtables handed over before the stop signal.
    rx.close();
    while let Some(memtable) = rx.recv().await {
        flush_memtable(&state, memtable);
    }
}

/// Serializes one memtable as a level 0 table: allocate a file id, write
/// the table, record it in the manifest, open a read handle, and clear
/// the immutable slot. Registration precedes the clear so the entries
/// never go dark for readers.
fn flush_memtable(state: &StoreState, memtable: Arc<Memtable>) {
    if !memtable.is_empty() {
        let id = state.manifest.next_file_id();
        let (_, size) = match memtable.to_disk(&state.dir, id) {
            Ok(written) => written,
            Err(e) => fatal("flush", &e),
        };
        state.manifest.add_l0_file(TableMeta {
            id,
            entries: memtable.len() as u32,
            min_fp: memtable.min_range(),
            max_fp: memtable.max_range(),
            size: size as u32,
        });
        if let Err(e) = state.manifest.save() {
            fatal("flush", &e);
        }
        let table = match Table::open(&state.dir, id) {
            Ok(table) => Arc::new(table),
            Err(e) => fatal("flush", &e),
        };
        state.l0.add_table(table, id);
        tracing::info!(
            table_id = id,
            entries = memtable.len(),
            size,
            "flushed memtable to level 0 table"
        );
    }

    {
        let mut pair = state.memtables.write().unwrap();
        if pair
            .immutable
            .as_ref()
            .is_some_and(|imm| Arc::ptr_eq(imm, &memtable))
        {
            pair.immutable = None;
        }
    }
    state.flush_done.notify_waiters();
}
