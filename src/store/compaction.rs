//! Level 0 to level 1 compaction.
//!
//! The loop wakes on its interval and acts once the level 0 population
//! reaches the configured limit. With an empty level 1 it cold-starts by
//! merging the two densest level 0 tables; after that each level 0 table
//! is classified against the level 1 fingerprint ranges and either
//! promoted unchanged or merged with the one level 1 table it lands on.
//!
//! Merges splice payload bytes and fold indexes; the older source is
//! appended first so that on a duplicate fingerprint the newer entry
//! survives. Between two level 0 tables the lower file id is the older;
//! against a level 1 table the level 1 side is always the older. Every
//! action allocates a fresh file id and persists the manifest before the
//! input files are deleted, so a crash leaves either the inputs or the
//! output referenced, never both.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::closer::StopSignal;
use crate::errdata;
use crate::error::Result;
use crate::manifest::{Placement, TableMeta};
use crate::table::builder::MergeBuilder;
use crate::table::{self, Table};

use super::{fatal, StoreState};

pub(crate) async fn compaction_loop(state: Arc<StoreState>, mut stop: StopSignal) {
    let mut ticker = tokio::time::interval(state.opts.compaction_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_once(&state) {
                    fatal("compaction", &e);
                }
            }
            _ = stop.stopped() => break,
        }
    }
}

/// Runs one compaction pass unless a maintenance pass is already running.
pub(crate) fn run_once(state: &StoreState) -> Result<bool> {
    if state.maintenance_running.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }
    let result = compact(state);
    state.maintenance_running.store(false, Ordering::SeqCst);
    result
}

fn compact(state: &StoreState) -> Result<bool> {
    if state.manifest.l0_len() < state.opts.level0_file_limit {
        return Ok(false);
    }

    let mut did_work = false;
    if state.manifest.l1_len() == 0 {
        did_work |= cold_start(state)?;
    }

    // Snapshot after the cold start so its inputs are not revisited.
    // Every action below allocates a new file id, so no action can be
    // performed twice on the same bytes. Ascending id order keeps the
    // invariant that level 1 content always predates the level 0 table
    // currently being placed.
    let mut snapshot = state.manifest.copy_l0();
    snapshot.sort_by_key(|m| m.id);
    for l0_meta in snapshot {
        match state.manifest.find_l1_policy(&l0_meta) {
            Placement::Disjoint => promote(state, &l0_meta)?,
            Placement::Contained(target) | Placement::Overlapping(target) => {
                merge_into_l1(state, &l0_meta, target)?
            }
        }
        did_work = true;
    }
    Ok(did_work)
}

/// With no level 1 tables yet, merge the two densest level 0 tables into
/// the first level 1 table.
fn cold_start(state: &StoreState) -> Result<bool> {
    if state.manifest.l0_len() < 2 {
        return Ok(false);
    }

    state.manifest.sort_l0();
    let snapshot = state.manifest.copy_l0();
    let (a, b) = (snapshot[0], snapshot[1]);
    let (older, newer) = if a.id < b.id { (a, b) } else { (b, a) };

    let older_table = l0_handle(state, older.id)?;
    let newer_table = l0_handle(state, newer.id)?;
    let new_id = merge_tables(state, &older_table, &newer_table)?;

    state.l0.delete_table(older.id);
    state.l0.delete_table(newer.id);
    state.manifest.delete_l0_table(older.id);
    state.manifest.delete_l0_table(newer.id);
    state.manifest.save()?;
    table::remove_table(&state.dir, older.id)?;
    table::remove_table(&state.dir, newer.id)?;

    tracing::info!(
        first = older.id,
        second = newer.id,
        merged = new_id,
        "cold-start compaction seeded level 1"
    );
    Ok(true)
}

/// Relabels a level 0 table whose range no level 1 table intersects: the
/// manifest entry and the open handle move to level 1, the file stays.
fn promote(state: &StoreState, meta: &TableMeta) -> Result<()> {
    let table = l0_handle(state, meta.id)?;
    state.l1.add_table(table, meta.id);
    state.l0.delete_table(meta.id);
    state.manifest.promote_l0_table(meta.id);
    state.manifest.save()?;
    tracing::info!(table_id = meta.id, "level 0 table promoted to level 1");
    Ok(())
}

/// Merges a level 0 table with the level 1 table its range landed on and
/// replaces both with the merged output.
fn merge_into_l1(state: &StoreState, l0_meta: &TableMeta, target: u32) -> Result<()> {
    let l0_table = l0_handle(state, l0_meta.id)?;
    let Some(l1_table) = state.l1.get_table(target) else {
        return errdata!("level 1 table {target} is in the manifest but has no open handle");
    };

    // The level 1 side is always the older source: its content was
    // flushed before this level 0 table, even when a mid-pass merge gave
    // the file itself a higher id. The level 0 entries must override.
    let new_id = merge_tables(state, &l1_table, &l0_table)?;

    state.l0.delete_table(l0_meta.id);
    state.l1.delete_table(target);
    state.manifest.delete_l0_table(l0_meta.id);
    state.manifest.delete_l1_table(target);
    state.manifest.save()?;
    table::remove_table(&state.dir, l0_meta.id)?;
    table::remove_table(&state.dir, target)?;

    tracing::info!(
        l0_table = l0_meta.id,
        l1_table = target,
        merged = new_id,
        "merged level 0 table into level 1"
    );
    Ok(())
}

/// Splices two tables into a new level 1 table, older source first so
/// the newer source wins duplicate fingerprints, and registers it.
fn merge_tables(state: &StoreState, older: &Arc<Table>, newer: &Arc<Table>) -> Result<u32> {
    let mut builder = MergeBuilder::new((older.size() + newer.size()) as usize);
    builder.append_payload(older)?;
    builder.merge_index(older.index(), 0);
    let base = builder.payload_len();
    builder.append_payload(newer)?;
    builder.merge_index(newer.index(), base);
    save_l1_table(state, builder.finish())
}

/// Writes a finished table image as a new level 1 table and registers it
/// with the level handler and the manifest (not yet persisted).
pub(super) fn save_l1_table(state: &StoreState, image: Vec<u8>) -> Result<u32> {
    let id = state.manifest.next_file_id();
    table::write_table_file(&state.dir, id, &image)?;
    let table = Arc::new(Table::open(&state.dir, id)?);
    let footer = *table.footer();
    state.l1.add_table(table, id);
    state.manifest.add_l1_file(TableMeta {
        id,
        entries: footer.entries,
        min_fp: footer.min_fp,
        max_fp: footer.max_fp,
        size: footer.size,
    });
    Ok(id)
}

fn l0_handle(state: &StoreState, id: u32) -> Result<Arc<Table>> {
    match state.l0.get_table(id) {
        Some(table) => Ok(table),
        None => errdata!("level 0 table {id} is in the manifest but has no open handle"),
    }
}
