//! Merge execution and output splitting for leveled compaction.

use crate::compaction::{
    CompactionError, CompactionResult, MergeIterator, dedup_records, full_range_scan_iters,
};
use crate::engine::utils::{PointEntry, RangeTombstone};
use crate::engine::{EngineConfig, SSTABLE_DIR};
use crate::manifest::{Manifest, ManifestSstEntry};
use crate::sstable::{self, SSTable};
use tracing::{debug, info, warn};

/// Merges `victims`, splitting the output across as many SSTables as
/// needed to respect `config.leveled_max_sstable_size`, and atomically
/// swaps them into the manifest in place of the victims.
pub fn run(
    victims: &[&SSTable],
    manifest: &mut Manifest,
    data_dir: &str,
    config: &EngineConfig,
) -> Result<CompactionResult, CompactionError> {
    let removed_ids: Vec<u64> = victims.iter().map(|s| s.id()).collect();

    let iters = full_range_scan_iters(victims)?;
    let merge_iter = MergeIterator::new(iters);
    let (point_entries, range_tombstones) = dedup_records(merge_iter);

    if point_entries.is_empty() && range_tombstones.is_empty() {
        info!(
            removed_count = removed_ids.len(),
            "leveled: merge produced no surviving entries"
        );
        manifest.apply_compaction(Vec::new(), removed_ids.clone())?;
        manifest.checkpoint()?;
        remove_old_files(data_dir, &removed_ids);
        return Ok(CompactionResult {
            removed_ids,
            new_sst_path: None,
            new_sst_id: None,
            extra_ssts: Vec::new(),
        });
    }

    let chunks = split_by_size(point_entries, range_tombstones, config.leveled_max_sstable_size);

    debug!(chunk_count = chunks.len(), "leveled: writing output chunks");

    let mut new_entries = Vec::new();
    let mut outputs: Vec<(u64, String)> = Vec::new();

    for (points, ranges) in chunks {
        let id = manifest.allocate_sst_id()?;
        let path = format!("{}/{}/{:06}.sst", data_dir, SSTABLE_DIR, id);
        let point_count = points.len();
        let range_count = ranges.len();

        sstable::SstWriter::new(&path).build(
            points.into_iter(),
            point_count,
            ranges.into_iter(),
            range_count,
        )?;

        new_entries.push(ManifestSstEntry {
            id,
            path: path.clone().into(),
        });
        outputs.push((id, path));
    }

    manifest.apply_compaction(new_entries, removed_ids.clone())?;
    manifest.checkpoint()?;
    remove_old_files(data_dir, &removed_ids);

    let mut outputs = outputs.into_iter();
    let (new_sst_id, new_sst_path) = outputs
        .next()
        .expect("chunks produced at least one output when entries were non-empty");
    let extra_ssts = outputs.collect();

    Ok(CompactionResult {
        removed_ids,
        new_sst_path: Some(new_sst_path),
        new_sst_id: Some(new_sst_id),
        extra_ssts,
    })
}

fn remove_old_files(data_dir: &str, removed_ids: &[u64]) {
    for id in removed_ids {
        let path = format!("{}/{}/{:06}.sst", data_dir, SSTABLE_DIR, id);
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(id, %e, "failed to remove old SSTable file during leveled compaction");
        }
    }
}

/// Splits a merged, key-sorted entry stream into chunks whose estimated
/// byte size stays under `budget`. Range tombstones are duplicated into
/// every chunk whose key span they overlap — harmless, since applying
/// the same tombstone twice at read time has no additional effect.
fn split_by_size(
    point_entries: Vec<PointEntry>,
    range_tombstones: Vec<RangeTombstone>,
    budget: usize,
) -> Vec<(Vec<PointEntry>, Vec<RangeTombstone>)> {
    if point_entries.is_empty() {
        // Nothing to split by key; the tombstones stand alone.
        return vec![(Vec::new(), range_tombstones)];
    }

    let budget = budget.max(1) as u64;
    let mut chunks: Vec<Vec<PointEntry>> = Vec::new();
    let mut current: Vec<PointEntry> = Vec::new();
    let mut current_size: u64 = 0;

    for entry in point_entries {
        let entry_size = entry.key.len() as u64
            + entry.value.as_ref().map_or(0, |v| v.len() as u64)
            + 16;

        if !current.is_empty() && current_size + entry_size > budget {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }

        current_size += entry_size;
        current.push(entry);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    // Assign each range tombstone to every chunk it overlaps.
    let mut out: Vec<(Vec<PointEntry>, Vec<RangeTombstone>)> = chunks
        .into_iter()
        .map(|points| (points, Vec::new()))
        .collect();

    for rt in range_tombstones {
        let mut placed = false;
        for (points, ranges) in out.iter_mut() {
            let chunk_min = &points.first().expect("non-empty chunk").key;
            let chunk_max = &points.last().expect("non-empty chunk").key;
            if super::overlaps(chunk_min, chunk_max, &rt.start, &rt.end) {
                ranges.push(rt.clone());
                placed = true;
            }
        }
        if !placed {
            // Doesn't overlap any chunk's live data but must not be
            // dropped silently — keep it with the first chunk.
            out[0].1.push(rt);
        }
    }

    out
}
