//! Per-device search acceleration structures.
//!
//! A [`DeviceIndex`] owns the record table and string pool produced by a
//! scan, plus everything derived from them: the flat trigram postings list
//! and four precomputed sort permutations with their rank inverses.
//! Records are immutable once installed; a re-scan replaces the whole
//! index under a new generation.

use crate::payload::ScanPayload;
use crate::record::{FileRecord, ROOT_PARENT};
use crate::types::FsType;
use rayon::slice::ParallelSliceMut;
use std::collections::HashMap;

/// Sorting below this many elements is cheaper single-threaded.
pub const PARALLEL_SORT_THRESHOLD: usize = 200_000;

/// Maximum parent hops when materializing a directory path. Bounds the
/// walk on corrupt record tables containing parent cycles.
pub const MAX_PATH_HOPS: usize = 4096;

/// ASCII-only case folding; bytes above `Z` pass through untouched.
#[inline]
pub fn fold_byte(b: u8) -> u8 {
    b.to_ascii_lowercase()
}

/// Packs three case-folded bytes as `b0<<16 | b1<<8 | b2`.
#[inline]
pub fn pack_trigram(b0: u8, b1: u8, b2: u8) -> u32 {
    (u32::from(fold_byte(b0)) << 16) | (u32::from(fold_byte(b1)) << 8) | u32::from(fold_byte(b2))
}

/// Case-insensitive byte compare (ASCII folding), shorter string first on
/// a common prefix.
pub fn ci_compare(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    let n = a.len().min(b.len());
    for i in 0..n {
        let (ac, bc) = (fold_byte(a[i]), fold_byte(b[i]));
        if ac != bc {
            return ac.cmp(&bc);
        }
    }
    a.len().cmp(&b.len())
}

/// Case-insensitive substring test (ASCII folding). Empty needles match.
pub fn ci_contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    let first = fold_byte(needle[0]);
    for start in 0..=(haystack.len() - needle.len()) {
        if fold_byte(haystack[start]) != first {
            continue;
        }
        if haystack[start..start + needle.len()]
            .iter()
            .zip(needle)
            .all(|(&h, &n)| fold_byte(h) == fold_byte(n))
        {
            return true;
        }
    }
    false
}

/// One `(trigram, recordIdx)` posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrigramEntry {
    pub trigram: u32,
    pub record_idx: u32,
}

/// Which precomputed order a query sorts by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Name,
    /// Cheap path proxy: parent record index, then name. A true path sort
    /// would require materializing full paths per record.
    Path,
    Size,
    Mtime,
}

impl SortKey {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "path" => Self::Path,
            "size" => Self::Size,
            "mtime" => Self::Mtime,
            _ => Self::Name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("desc") {
            Self::Desc
        } else {
            Self::Asc
        }
    }
}

/// The fully built, immutable search index for one device.
#[derive(Debug, Default, Clone)]
pub struct DeviceIndex {
    pub fs_type: FsType,
    /// Bumped by the store on every successful install; invalidates any
    /// record indices cached by clients from prior generations.
    pub generation: u64,
    /// Unix seconds of the last successful scan; 0 = unknown (e.g. loaded
    /// from an older snapshot).
    pub last_indexed_time: i64,
    /// Last-known display metadata; may be stale when the device is absent.
    pub label_last_known: String,
    pub uuid_last_known: String,

    pub records: Vec<FileRecord>,
    pub string_pool: Vec<u8>,

    /// Sorted by `(trigram, recordIdx)`, no duplicate pairs.
    pub flat_index: Vec<TrigramEntry>,

    order_by_name: Vec<u32>,
    order_by_path: Vec<u32>,
    order_by_size: Vec<u32>,
    order_by_mtime: Vec<u32>,

    rank_by_name: Vec<u32>,
    rank_by_path: Vec<u32>,
    rank_by_size: Vec<u32>,
    rank_by_mtime: Vec<u32>,

    dir_path_cache: HashMap<u32, String>,
}

impl DeviceIndex {
    /// Builds the acceleration structures for a freshly parsed scan.
    pub fn build(fs_type: FsType, payload: ScanPayload) -> Self {
        let mut idx = Self {
            fs_type,
            records: payload.records,
            string_pool: payload.string_pool,
            ..Self::default()
        };
        idx.build_trigram_index();
        idx.build_sort_orders();
        tracing::debug!(
            records = idx.records.len(),
            postings = idx.flat_index.len(),
            "device index built"
        );
        idx
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn name_of(&self, record_idx: u32) -> &[u8] {
        self.records[record_idx as usize].name(&self.string_pool)
    }

    pub fn order_for(&self, key: SortKey) -> &[u32] {
        match key {
            SortKey::Name => &self.order_by_name,
            SortKey::Path => &self.order_by_path,
            SortKey::Size => &self.order_by_size,
            SortKey::Mtime => &self.order_by_mtime,
        }
    }

    pub fn rank_for(&self, key: SortKey) -> &[u32] {
        match key {
            SortKey::Name => &self.rank_by_name,
            SortKey::Path => &self.rank_by_path,
            SortKey::Size => &self.rank_by_size,
            SortKey::Mtime => &self.rank_by_mtime,
        }
    }

    /// The contiguous postings run for one trigram (may be empty).
    pub fn trigram_postings(&self, trigram: u32) -> &[TrigramEntry] {
        let lo = self.flat_index.partition_point(|e| e.trigram < trigram);
        let hi = self.flat_index.partition_point(|e| e.trigram <= trigram);
        &self.flat_index[lo..hi]
    }

    fn build_trigram_index(&mut self) {
        self.flat_index.clear();
        self.flat_index.reserve(self.records.len() * 4);

        let mut tris: Vec<u32> = Vec::with_capacity(64);

        for record_idx in 0..self.records.len() as u32 {
            let name = self.records[record_idx as usize].name(&self.string_pool);
            if name.len() < 3 {
                continue;
            }

            tris.clear();
            for w in name.windows(3) {
                tris.push(pack_trigram(w[0], w[1], w[2]));
            }
            // The same trigram can repeat within one name; keep one posting.
            tris.sort_unstable();
            tris.dedup();

            for &tri in &tris {
                self.flat_index.push(TrigramEntry {
                    trigram: tri,
                    record_idx,
                });
            }
        }

        if self.flat_index.len() >= PARALLEL_SORT_THRESHOLD {
            self.flat_index.par_sort_unstable();
        } else {
            self.flat_index.sort_unstable();
        }
    }

    fn build_sort_orders(&mut self) {
        let n = self.records.len() as u32;
        let init = || (0..n).collect::<Vec<u32>>();

        let records = &self.records;
        let pool = &self.string_pool;
        let name = |i: u32| records[i as usize].name(pool);

        fn sort_maybe_par<F>(v: &mut Vec<u32>, cmp: F)
        where
            F: Fn(&u32, &u32) -> std::cmp::Ordering + Sync,
        {
            if v.len() >= PARALLEL_SORT_THRESHOLD {
                v.par_sort_unstable_by(&cmp);
            } else {
                v.sort_unstable_by(&cmp);
            }
        }

        let mut by_name = init();
        sort_maybe_par(&mut by_name, |&a, &b| {
            ci_compare(name(a), name(b)).then(a.cmp(&b))
        });

        let mut by_size = init();
        sort_maybe_par(&mut by_size, |&a, &b| {
            records[a as usize]
                .size
                .cmp(&records[b as usize].size)
                .then_with(|| ci_compare(name(a), name(b)))
                .then(a.cmp(&b))
        });

        let mut by_mtime = init();
        sort_maybe_par(&mut by_mtime, |&a, &b| {
            records[a as usize]
                .modification_time
                .cmp(&records[b as usize].modification_time)
                .then_with(|| ci_compare(name(a), name(b)))
                .then(a.cmp(&b))
        });

        let mut by_path = init();
        sort_maybe_par(&mut by_path, |&a, &b| {
            records[a as usize]
                .parent_record_idx
                .cmp(&records[b as usize].parent_record_idx)
                .then_with(|| ci_compare(name(a), name(b)))
                .then(a.cmp(&b))
        });

        fn build_rank(order: &[u32]) -> Vec<u32> {
            let mut rank = vec![0u32; order.len()];
            for (pos, &rec) in order.iter().enumerate() {
                rank[rec as usize] = pos as u32;
            }
            rank
        }

        self.rank_by_name = build_rank(&by_name);
        self.rank_by_path = build_rank(&by_path);
        self.rank_by_size = build_rank(&by_size);
        self.rank_by_mtime = build_rank(&by_mtime);

        self.order_by_name = by_name;
        self.order_by_path = by_path;
        self.order_by_size = by_size;
        self.order_by_mtime = by_mtime;
    }

    /// Resolves a directory record to its absolute path within the device.
    ///
    /// Walks parent pointers toward the root, skipping `.`/`..`/empty
    /// names, stopping on self-loops and after [`MAX_PATH_HOPS`] hops.
    /// Results are memoized until the index is replaced.
    pub fn dir_path(&mut self, dir_id: u32) -> String {
        if dir_id == ROOT_PARENT {
            return "/".to_string();
        }
        if let Some(cached) = self.dir_path_cache.get(&dir_id) {
            return cached.clone();
        }
        if dir_id as usize >= self.records.len() {
            return "\u{2026}".to_string();
        }

        let mut parts: Vec<&[u8]> = Vec::new();
        let mut cur = dir_id;
        let mut hops = 0;

        while cur != ROOT_PARENT && (cur as usize) < self.records.len() && hops < MAX_PATH_HOPS {
            hops += 1;
            let r = &self.records[cur as usize];
            let name = r.name(&self.string_pool);

            if !(name.is_empty() || name == b"." || name == b"..") {
                parts.push(name);
            }

            let next = r.parent_record_idx;
            if next == cur {
                break;
            }
            cur = next;
        }

        let mut path = String::from("/");
        for (i, name) in parts.iter().rev().enumerate() {
            if i > 0 {
                path.push('/');
            }
            path.push_str(&String::from_utf8_lossy(name));
        }

        self.dir_path_cache.insert(dir_id, path.clone());
        path
    }
}
