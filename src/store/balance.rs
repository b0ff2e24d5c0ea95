//! Level 1 load balancing.
//!
//! Keeps individual level 1 tables within the configured size bound
//! without introducing a third level: any table above the bound is split
//! at the median fingerprint into two tables with disjoint fingerprint
//! ranges, so point reads still reach the right table by range lookup.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::closer::StopSignal;
use crate::errdata;
use crate::error::Result;
use crate::manifest::TableMeta;
use crate::table::builder::MergeBuilder;
use crate::table;

use super::{fatal, StoreState};

pub(crate) async fn balance_loop(state: Arc<StoreState>, mut stop: StopSignal) {
    let mut ticker = tokio::time::interval(state.opts.balance_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_once(&state) {
                    fatal("load-balance", &e);
                }
            }
            _ = stop.stopped() => break,
        }
    }
}

/// Runs one load-balance pass unless a maintenance pass is already running.
pub(crate) fn run_once(state: &StoreState) -> Result<bool> {
    if state.maintenance_running.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }
    let result = rebalance(state);
    state.maintenance_running.store(false, Ordering::SeqCst);
    result
}

fn rebalance(state: &StoreState) -> Result<bool> {
    let mut did_work = false;
    for meta in state.manifest.copy_l1() {
        if meta.size <= state.opts.max_level1_size {
            continue;
        }
        did_work |= split_table(state, &meta)?;
    }
    Ok(did_work)
}

/// Splits one oversized level 1 table at its median fingerprint:
/// fingerprints below the median go to the first output, the median and
/// above to the second. The median is the middle of the sorted distinct
/// fingerprints, so both halves are non-empty whenever there are at
/// least two.
fn split_table(state: &StoreState, meta: &TableMeta) -> Result<bool> {
    let Some(table) = state.l1.get_table(meta.id) else {
        return errdata!(
            "level 1 table {} is in the manifest but has no open handle",
            meta.id
        );
    };

    let mut fingerprints = table.entries();
    if fingerprints.len() < 2 {
        tracing::warn!(
            table_id = meta.id,
            size = meta.size,
            "oversized level 1 table holds a single fingerprint, cannot split"
        );
        return Ok(false);
    }
    fingerprints.sort_unstable();
    let median = fingerprints[fingerprints.len() / 2];

    // Partition bucket by bucket through the index rather than the raw
    // payload: records a merge left behind are not indexed and must not
    // be resurrected into the halves.
    let hint = meta.size as usize / 2;
    let mut low = MergeBuilder::new(hint);
    let mut high = MergeBuilder::new(hint);
    for &fp in &fingerprints {
        let builder = if fp < median { &mut low } else { &mut high };
        for (key, value) in table.bucket(fp)? {
            builder.add(&key, &value, fp);
        }
    }

    let low_id = super::compaction::save_l1_table(state, low.finish())?;
    let high_id = super::compaction::save_l1_table(state, high.finish())?;

    state.l1.delete_table(meta.id);
    state.manifest.delete_l1_table(meta.id);
    state.manifest.save()?;
    table::remove_table(&state.dir, meta.id)?;

    tracing::info!(
        table_id = meta.id,
        low_table = low_id,
        high_table = high_id,
        median,
        "split oversized level 1 table"
    );
    Ok(true)
}
