//! # Leveled Compaction Strategy (LCS)
//!
//! Unlike size-tiered compaction, leveled compaction organizes SSTables
//! into numbered levels with a strict invariant: **level 0** holds the
//! raw, possibly-overlapping output of recent flushes; **levels ≥ 1**
//! are kept disjoint — no two SSTables at the same level share any key
//! range.
//!
//! ## Level assignment
//!
//! Levels are never persisted. An SSTable's level is a pure function of
//! its on-disk size relative to `config.leveled_max_sstable_size`:
//! anything below that budget is level 0; beyond it, each level's size
//! class grows geometrically (×10) from the previous one. A freshly
//! flushed memtable produces a small level-0 file; as compaction merges
//! level-0 tables together the output crosses the size threshold and
//! lands one level deeper, exactly mirroring how repeated merges would
//! grow a file in a real leveled store.
//!
//! ## Picking a job
//!
//! [`pick_compaction`] scans levels shallowest-first and returns the
//! first one whose SSTable count exceeds its
//! `config.leveled_level_bounds` entry. For level 0 the whole
//! (overlapping) level is merged down into level 1. For level ≥ 1 the
//! oldest surplus SSTables are merged together with every level `L+1`
//! table whose key range overlaps them, preserving the disjointness
//! invariant at the output level.
//!
//! ## Output splitting
//!
//! A merge can produce more data than a single SSTable should hold.
//! [`execute::run`] splits the merged stream into multiple output files
//! once the accumulated size crosses `leveled_max_sstable_size`,
//! guaranteeing disjoint, size-bounded outputs by construction rather
//! than by a post-hoc check.

mod execute;

use crate::compaction::{CompactionError, CompactionResult, CompactionStrategy};
use crate::engine::EngineConfig;
use crate::manifest::Manifest;
use crate::sstable::SSTable;
use tracing::{debug, info};

/// Leveled compaction — merges an overloaded level into the next.
pub struct LeveledCompaction;

impl CompactionStrategy for LeveledCompaction {
    fn compact(
        &self,
        sstables: &[SSTable],
        manifest: &mut Manifest,
        data_dir: &str,
        config: &EngineConfig,
    ) -> Result<Option<CompactionResult>, CompactionError> {
        let Some(job) = pick_compaction(sstables, config) else {
            debug!(sstable_count = sstables.len(), "leveled: nothing overloaded");
            return Ok(None);
        };

        info!(
            source_level = job.source_level,
            output_level = job.output_level,
            victims = job.victim_indices.len(),
            "leveled: compacting"
        );

        let victims: Vec<&SSTable> = job.victim_indices.iter().map(|&i| &sstables[i]).collect();
        let result = execute::run(&victims, manifest, data_dir, config)?;
        Ok(Some(result))
    }
}

/// A chosen compaction job: merge `victim_indices` (indices into the
/// engine's SSTable slice) and place the output at `output_level`.
pub struct CompactionJob {
    pub source_level: usize,
    pub output_level: usize,
    pub victim_indices: Vec<usize>,
}

/// Assigns a level to an SSTable purely from its on-disk size.
///
/// Level 0 covers anything under `leveled_max_sstable_size`. Each
/// subsequent level's size class is ten times the previous one's, up to
/// the deepest index in `leveled_level_bounds`; anything larger still
/// clamps to that deepest level.
pub fn level_of(sstable: &SSTable, config: &EngineConfig) -> usize {
    let base = config.leveled_max_sstable_size.max(1) as u64;
    let size = sstable.file_size();
    let max_level = config.leveled_level_bounds.len() - 1;

    if size < base {
        return 0;
    }

    let mut level = 1;
    let mut threshold = base * 10;
    while size >= threshold && level < max_level {
        level += 1;
        threshold = threshold.saturating_mul(10);
    }
    level
}

/// Groups SSTable indices by level, level 0 first.
pub fn classify(sstables: &[SSTable], config: &EngineConfig) -> Vec<Vec<usize>> {
    let num_levels = config.leveled_level_bounds.len();
    let mut levels: Vec<Vec<usize>> = vec![Vec::new(); num_levels];

    for (i, sst) in sstables.iter().enumerate() {
        let level = level_of(sst, config);
        levels[level].push(i);
    }

    levels
}

/// Picks the shallowest overloaded level and the SSTables it should
/// merge into the next level down.
///
/// Returns `None` if every level is within its configured bound.
pub fn pick_compaction(sstables: &[SSTable], config: &EngineConfig) -> Option<CompactionJob> {
    let levels = classify(sstables, config);

    for (level, members) in levels.iter().enumerate() {
        if level + 1 >= levels.len() {
            // Deepest configured level has nowhere further to go.
            continue;
        }
        let bound = config.leveled_level_bounds[level];
        if members.len() <= bound {
            continue;
        }

        let victim_indices = if level == 0 {
            // Level 0 overlaps by construction — merge the whole level.
            members.clone()
        } else {
            // Merge the oldest surplus tables plus every overlapping
            // table one level down, to keep the output level disjoint.
            let surplus = members.len() - bound;
            let mut picked: Vec<usize> = members.iter().take(surplus).copied().collect();

            let (min_key, max_key) = key_bounds(&picked, sstables);
            for &idx in &levels[level + 1] {
                let sst = &sstables[idx];
                if overlaps(&sst.properties.min_key, &sst.properties.max_key, &min_key, &max_key) {
                    picked.push(idx);
                }
            }
            picked
        };

        return Some(CompactionJob {
            source_level: level,
            output_level: level + 1,
            victim_indices,
        });
    }

    None
}

fn key_bounds(indices: &[usize], sstables: &[SSTable]) -> (Vec<u8>, Vec<u8>) {
    let mut min_key = sstables[indices[0]].properties.min_key.clone();
    let mut max_key = sstables[indices[0]].properties.max_key.clone();
    for &i in &indices[1..] {
        if sstables[i].properties.min_key < min_key {
            min_key = sstables[i].properties.min_key.clone();
        }
        if sstables[i].properties.max_key > max_key {
            max_key = sstables[i].properties.max_key.clone();
        }
    }
    (min_key, max_key)
}

pub(super) fn overlaps(a_min: &[u8], a_max: &[u8], b_min: &[u8], b_max: &[u8]) -> bool {
    a_min <= b_max && b_min <= a_max
}
