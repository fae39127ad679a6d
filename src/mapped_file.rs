//! # Mapped-File Registry
//!
//! Opens, memory-maps, flushes, and unmaps files by path. Keyed by path,
//! at most one mapping per path — re-mapping an already-registered path
//! hands back a fresh [`Arc`] clone of the existing mapping rather than
//! reopening the file.
//!
//! Read-only mappings back [`sstable::SSTable`](crate::sstable::SSTable)
//! files; writable mappings exist for callers that need to build a file
//! in place rather than write-then-rename. The two share almost nothing
//! at the `memmap2` level (`Mmap` vs. `MmapMut`, with different flush
//! semantics), so a [`Mapping`] enum distinguishes them rather than
//! forcing one representation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::sync::{Arc, Mutex};

use memmap2::{Mmap, MmapMut};

/// Errors raised by [`MappedFileRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum MappedFileError {
    /// Underlying filesystem or mmap I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `sync` was requested on a read-only mapping.
    #[error("cannot sync a read-only mapping")]
    ReadOnly,
}

/// A registered memory mapping — either read-only or writable.
pub enum Mapping {
    /// A read-only view, shareable across callers.
    ReadOnly(Arc<Mmap>),
    /// A writable view. Not `Clone`-shared as freely as `ReadOnly` since
    /// concurrent mutation through two handles would race; callers that
    /// need shared write access should serialize through their own lock.
    Writable(Arc<Mutex<MmapMut>>),
}

impl Mapping {
    /// Returns a snapshot of the mapped bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            Mapping::ReadOnly(m) => m.to_vec(),
            Mapping::Writable(m) => m.lock().expect("mapping mutex poisoned").to_vec(),
        }
    }

    /// Returns the mapped length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Mapping::ReadOnly(m) => m.len(),
            Mapping::Writable(m) => m.lock().expect("mapping mutex poisoned").len(),
        }
    }

    /// Returns `true` if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for Mapping {
    fn clone(&self) -> Self {
        match self {
            Mapping::ReadOnly(m) => Mapping::ReadOnly(Arc::clone(m)),
            Mapping::Writable(m) => Mapping::Writable(Arc::clone(m)),
        }
    }
}

struct Registration {
    mapping: Mapping,
    read_only: bool,
}

/// Path-keyed registry of open memory mappings.
///
/// Mirrors the reference `MMapManager`: one mapping per path, advisory
/// sequential-access hints for scan-heavy workloads, and a `close_all`
/// that drains every registered mapping.
#[derive(Default)]
pub struct MappedFileRegistry {
    mappings: Mutex<HashMap<String, Registration>>,
}

impl MappedFileRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or creates and extends) `path` and maps its entirety into
    /// memory, returning a shareable [`Mapping`].
    ///
    /// If `path` is already registered, returns a fresh handle onto the
    /// existing mapping instead of reopening the file.
    ///
    /// When `create_if_missing` is set and `read_only` is false, the
    /// file is truncated/extended to `size` bytes before mapping.
    pub fn map(
        &self,
        path: &str,
        size: u64,
        read_only: bool,
        create_if_missing: bool,
    ) -> Result<Mapping, MappedFileError> {
        let mut mappings = self.mappings.lock().expect("registry mutex poisoned");
        if let Some(existing) = mappings.get(path) {
            return Ok(existing.mapping.clone());
        }

        let mapping = if read_only {
            let file = File::open(path)?;
            let mmap = unsafe { Mmap::map(&file)? };
            let _ = mmap.advise(memmap2::Advice::Sequential);
            Mapping::ReadOnly(Arc::new(mmap))
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create_if_missing)
                .open(path)?;
            if create_if_missing {
                file.set_len(size)?;
            }
            let mmap = unsafe { MmapMut::map_mut(&file)? };
            Mapping::Writable(Arc::new(Mutex::new(mmap)))
        };

        mappings.insert(
            path.to_string(),
            Registration {
                mapping: mapping.clone(),
                read_only,
            },
        );
        Ok(mapping)
    }

    /// Returns the currently registered mapping for `path`, if any,
    /// without opening or creating a file.
    pub fn get_mapping(&self, path: &str) -> Option<Mapping> {
        let mappings = self.mappings.lock().expect("registry mutex poisoned");
        mappings.get(path).map(|r| r.mapping.clone())
    }

    /// Flushes dirty pages to durable storage. Only meaningful (and only
    /// possible) for writable mappings; read-only mappings and
    /// unregistered paths both return `false`.
    pub fn sync(&self, path: &str) -> Result<bool, MappedFileError> {
        let mappings = self.mappings.lock().expect("registry mutex poisoned");
        let Some(reg) = mappings.get(path) else {
            return Ok(false);
        };
        if reg.read_only {
            return Ok(false);
        }
        match &reg.mapping {
            Mapping::Writable(m) => {
                m.lock().expect("mapping mutex poisoned").flush()?;
                Ok(true)
            }
            Mapping::ReadOnly(_) => Ok(false),
        }
    }

    /// Unmaps and deregisters `path`. Flushes first if writable.
    ///
    /// Returns `false` (a no-op) if `path` was not registered.
    pub fn unmap(&self, path: &str) -> bool {
        let mut mappings = self.mappings.lock().expect("registry mutex poisoned");
        match mappings.remove(path) {
            Some(reg) => {
                if let Mapping::Writable(m) = &reg.mapping {
                    let _ = m.lock().expect("mapping mutex poisoned").flush();
                }
                true
            }
            None => false,
        }
    }

    /// Unmaps every registered file.
    pub fn close_all(&self) {
        let paths: Vec<String> = {
            let mappings = self.mappings.lock().expect("registry mutex poisoned");
            mappings.keys().cloned().collect()
        };
        for path in paths {
            self.unmap(&path);
        }
    }

    /// Number of currently registered mappings.
    pub fn len(&self) -> usize {
        self.mappings.lock().expect("registry mutex poisoned").len()
    }

    /// Returns `true` if no files are currently mapped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
