//! Query execution: tokenize, trigram-filter, refine, merge, page.
//!
//! A query runs against the set of device indexes visible to one owner.
//! Per device, trigram postings narrow the candidate set before the
//! (parallel) substring refinement; surviving hits are ordered by the
//! precomputed rank for the requested sort key and merged across devices
//! with a deterministic `(rank, deviceId, recordIdx)` tie-break chain, so
//! identical generations page identically.

use crate::index::{ci_contains, pack_trigram, DeviceIndex, SortDir, SortKey};
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::BTreeMap;

/// One page row of the service surface (§ wire order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRow {
    pub entry_id: u64,
    pub device_id: String,
    pub name: String,
    pub dir_id: u32,
    pub size: u64,
    pub mtime: i64,
    pub flags: u32,
}

#[derive(Debug, Default, Clone)]
pub struct SearchResult {
    pub total_hits: u64,
    pub rows: Vec<SearchRow>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub sort_key: SortKey,
    pub sort_dir: SortDir,
    pub offset: u32,
    pub limit: u32,
}

/// Splits a query on whitespace runs, dropping empties.
pub fn tokenize(query: &str) -> Vec<&str> {
    query.split_whitespace().collect()
}

/// 32-bit FNV-1a over the UTF-8 bytes of a device id.
pub fn device_hash32(device_id: &str) -> u32 {
    let mut h: u32 = 2_166_136_261;
    for &b in device_id.as_bytes() {
        h ^= u32::from(b);
        h = h.wrapping_mul(16_777_619);
    }
    h
}

/// Stable row handle: `fnv1a_32(deviceId) << 32 | recordIdx`. Only valid
/// for the generation current at dispatch time.
pub fn make_entry_id(device_id: &str, record_idx: u32) -> u64 {
    (u64::from(device_hash32(device_id)) << 32) | u64::from(record_idx)
}

/// Splits an entry id back into `(deviceHash32, recordIdx)`.
pub fn split_entry_id(entry_id: u64) -> (u32, u32) {
    ((entry_id >> 32) as u32, entry_id as u32)
}

/// Trigram candidate filtering for one device.
///
/// Tokens shorter than 3 bytes cannot consult the postings; if no token is
/// long enough every record is a candidate. Otherwise each trigram of each
/// long-enough token is intersected with a sorted-merge walk; an absent
/// trigram short-circuits to "no hits on this device" without touching the
/// refinement stage.
pub fn candidates_for_query(idx: &DeviceIndex, tokens: &[&str]) -> Vec<u32> {
    let mut used_index = false;
    let mut candidates: Vec<u32> = Vec::new();

    for token in tokens {
        let bytes = token.as_bytes();
        if bytes.len() < 3 {
            continue;
        }
        used_index = true;

        for w in bytes.windows(3) {
            let postings = idx.trigram_postings(pack_trigram(w[0], w[1], w[2]));
            if postings.is_empty() {
                return Vec::new();
            }

            if candidates.is_empty() {
                candidates.reserve(postings.len());
                candidates.extend(postings.iter().map(|e| e.record_idx));
            } else {
                let mut next = Vec::with_capacity(candidates.len().min(postings.len()));
                let (mut a, mut b) = (0usize, 0usize);
                while a < candidates.len() && b < postings.len() {
                    match candidates[a].cmp(&postings[b].record_idx) {
                        std::cmp::Ordering::Less => a += 1,
                        std::cmp::Ordering::Greater => b += 1,
                        std::cmp::Ordering::Equal => {
                            next.push(candidates[a]);
                            a += 1;
                            b += 1;
                        }
                    }
                }
                candidates = next;
                if candidates.is_empty() {
                    return Vec::new();
                }
            }
        }
    }

    if !used_index {
        candidates = (0..idx.len() as u32).collect();
    }
    candidates
}

/// Keeps the candidates whose name contains every token case-insensitively.
pub fn refine(idx: &DeviceIndex, candidates: &[u32], tokens: &[&str]) -> Vec<u32> {
    candidates
        .par_iter()
        .copied()
        .filter(|&rec| {
            let name = idx.name_of(rec);
            tokens.iter().all(|t| ci_contains(name, t.as_bytes()))
        })
        .collect()
}

fn device_selected(device_ids: &[String], device_id: &str) -> bool {
    device_ids.is_empty() || device_ids.iter().any(|d| d == device_id)
}

fn build_row(device_id: &str, idx: &DeviceIndex, record_idx: u32) -> SearchRow {
    let r = &idx.records[record_idx as usize];
    SearchRow {
        entry_id: make_entry_id(device_id, record_idx),
        device_id: device_id.to_string(),
        name: String::from_utf8_lossy(idx.name_of(record_idx)).into_owned(),
        dir_id: r.parent_record_idx,
        size: r.size,
        mtime: r.modification_time as i64,
        flags: r.flags_word(),
    }
}

/// Rank adjusted so the merge heap always pops ascending.
#[inline]
fn adjust_rank(rank: u32, dir: SortDir) -> u32 {
    match dir {
        SortDir::Asc => rank,
        SortDir::Desc => u32::MAX - rank,
    }
}

/// Runs a search over the given per-device indexes (already filtered to
/// one owner). `devices` iterates in ascending device-id order, which the
/// merge relies on for its tie-break chain.
pub fn search(
    devices: &BTreeMap<String, DeviceIndex>,
    query: &str,
    device_ids: &[String],
    page: Page,
) -> SearchResult {
    let tokens = tokenize(query);

    if tokens.is_empty() {
        return search_all(devices, device_ids, page)
    }

    struct DeviceHits<'a> {
        device_id: &'a str,
        idx: &'a DeviceIndex,
        /// Record indices in emission order (rank ascending for asc,
        /// descending for desc).
        hits: Vec<u32>,
    }

    let mut per_dev: Vec<DeviceHits<'_>> = Vec::new();
    let mut total_hits: u64 = 0;

    for (device_id, idx) in devices {
        if !device_selected(device_ids, device_id) || idx.is_empty() {
            continue;
        }

        let candidates = candidates_for_query(idx, &tokens);
        if candidates.is_empty() {
            continue;
        }

        let mut hits = refine(idx, &candidates, &tokens);
        if hits.is_empty() {
            continue;
        }
        total_hits += hits.len() as u64;

        let rank = idx.rank_for(page.sort_key);
        let by_rank = |&a: &u32, &b: &u32| {
            rank[a as usize]
                .cmp(&rank[b as usize])
                .then(a.cmp(&b))
        };
        if hits.len() >= crate::index::PARALLEL_SORT_THRESHOLD {
            hits.par_sort_unstable_by(by_rank);
        } else {
            hits.sort_unstable_by(by_rank);
        }
        if page.sort_dir == SortDir::Desc {
            hits.reverse();
        }

        per_dev.push(DeviceHits {
            device_id,
            idx,
            hits,
        });
    }

    let mut out = SearchResult {
        total_hits,
        rows: Vec::new(),
    };
    if page.limit == 0 || total_hits == 0 {
        return out;
    }

    // K-way merge: heap keyed by (adjustedRank, deviceSlot, recordIdx).
    // Device slots follow ascending device-id order.
    let mut heap: BinaryHeap<Reverse<(u32, usize, u32, usize)>> = BinaryHeap::new();
    for (slot, dh) in per_dev.iter().enumerate() {
        let rec = dh.hits[0];
        let key = adjust_rank(dh.idx.rank_for(page.sort_key)[rec as usize], page.sort_dir);
        heap.push(Reverse((key, slot, rec, 0)));
    }

    let end = u64::from(page.offset) + u64::from(page.limit);
    let mut global_pos: u64 = 0;

    while let Some(Reverse((_, slot, rec, pos))) = heap.pop() {
        if global_pos >= end {
            break;
        }
        let dh = &per_dev[slot];

        if global_pos >= u64::from(page.offset) {
            out.rows.push(build_row(dh.device_id, dh.idx, rec));
        }
        global_pos += 1;

        let next_pos = pos + 1;
        if next_pos < dh.hits.len() {
            let next_rec = dh.hits[next_pos];
            let key = adjust_rank(
                dh.idx.rank_for(page.sort_key)[next_rec as usize],
                page.sort_dir,
            );
            heap.push(Reverse((key, slot, next_rec, next_pos)));
        }
    }

    out
}

/// Empty-query fast path: walk each device's precomputed order directly
/// (backwards for descending) and merge on the direction-adjusted rank.
fn search_all(
    devices: &BTreeMap<String, DeviceIndex>,
    device_ids: &[String],
    page: Page,
) -> SearchResult {
    struct Cursor<'a> {
        device_id: &'a str,
        idx: &'a DeviceIndex,
        order: &'a [u32],
    }

    let mut cursors: Vec<Cursor<'_>> = Vec::new();
    let mut total_hits: u64 = 0;

    for (device_id, idx) in devices {
        if !device_selected(device_ids, device_id) {
            continue;
        }
        total_hits += idx.len() as u64;
        if idx.is_empty() {
            continue;
        }
        cursors.push(Cursor {
            device_id,
            idx,
            order: idx.order_for(page.sort_key),
        });
    }

    let mut out = SearchResult {
        total_hits,
        rows: Vec::new(),
    };
    if page.limit == 0 || total_hits == 0 {
        return out;
    }

    let rec_at = |c: &Cursor<'_>, pos: usize| -> u32 {
        match page.sort_dir {
            SortDir::Asc => c.order[pos],
            SortDir::Desc => c.order[c.order.len() - 1 - pos],
        }
    };
    // Same heap key as the non-empty path: the record's rank for the sort
    // key, direction-adjusted. Raw traversal position would not compare
    // correctly across devices of different sizes when descending.
    let key_of = |c: &Cursor<'_>, rec: u32| -> u32 {
        adjust_rank(c.idx.rank_for(page.sort_key)[rec as usize], page.sort_dir)
    };

    let mut heap: BinaryHeap<Reverse<(u32, usize, u32, usize)>> = BinaryHeap::new();
    for (slot, c) in cursors.iter().enumerate() {
        let rec = rec_at(c, 0);
        heap.push(Reverse((key_of(c, rec), slot, rec, 0)));
    }

    let end = u64::from(page.offset) + u64::from(page.limit);
    let mut global_pos: u64 = 0;

    while let Some(Reverse((_, slot, rec, pos))) = heap.pop() {
        if global_pos >= end {
            break;
        }
        let c = &cursors[slot];

        if global_pos >= u64::from(page.offset) {
            out.rows.push(build_row(c.device_id, c.idx, rec));
        }
        global_pos += 1;

        let next_pos = pos + 1;
        if next_pos < c.order.len() {
            let next_rec = rec_at(c, next_pos);
            heap.push(Reverse((key_of(c, next_rec), slot, next_rec, next_pos)));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::ScanPayload;
    use crate::record::{FileRecord, ROOT_PARENT};
    use crate::types::FsType;

    fn index_from_names(names: &[&str]) -> DeviceIndex {
        let mut payload = ScanPayload::default();
        for name in names {
            let mut rec = FileRecord::new(ROOT_PARENT, 0, 0);
            rec.name_offset = payload.string_pool.len() as u32;
            rec.name_len = name.len() as u16;
            payload.string_pool.extend_from_slice(name.as_bytes());
            payload.records.push(rec);
        }
        DeviceIndex::build(FsType::Ext4, payload)
    }

    fn one_device(names: &[&str]) -> BTreeMap<String, DeviceIndex> {
        let mut m = BTreeMap::new();
        m.insert("partuuid:dev-a".to_string(), index_from_names(names));
        m
    }

    fn page(sort_dir: SortDir, offset: u32, limit: u32) -> Page {
        Page {
            sort_key: SortKey::Name,
            sort_dir,
            offset,
            limit,
        }
    }

    #[test]
    fn tokenize_splits_on_whitespace_runs() {
        assert_eq!(tokenize("  foo   bar\tbaz "), vec!["foo", "bar", "baz"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn entry_id_round_trips_record_idx() {
        let id = make_entry_id("partuuid:dev-a", 0xDEAD);
        let (hash, rec) = split_entry_id(id);
        assert_eq!(hash, device_hash32("partuuid:dev-a"));
        assert_eq!(rec, 0xDEAD);
    }

    #[test]
    fn absent_trigram_short_circuits() {
        // A token whose trigram is missing from the postings yields zero
        // candidates, so refinement never runs.
        let idx = index_from_names(&["alpha", "beta"]);
        let cands = candidates_for_query(&idx, &["alpha", "gamma"]);
        assert!(cands.is_empty());

        let result = search(
            &one_device(&["alpha", "beta"]),
            "alpha gamma",
            &[],
            page(SortDir::Asc, 0, 10),
        );
        assert_eq!(result.total_hits, 0);
        assert!(result.rows.is_empty());
    }

    #[test]
    fn short_tokens_match_like_a_linear_scan() {
        // With every token under 3 bytes the trigram index is unusable;
        // refinement over all records must match a plain linear scan.
        let names = ["ab.txt", "ba.log", "AB.md", "zz"];
        let idx = index_from_names(&names);
        let tokens = vec!["ab"];

        let cands = candidates_for_query(&idx, &tokens);
        assert_eq!(cands.len(), names.len());

        let refined = refine(&idx, &cands, &tokens);
        let expected: Vec<u32> = (0..names.len() as u32)
            .filter(|&i| ci_contains(names[i as usize].as_bytes(), b"ab"))
            .collect();
        let mut sorted = refined.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn multi_token_requires_all_substrings() {
        let devices = one_device(&["report-2024.pdf", "report-draft.txt", "summary.pdf"]);
        let result = search(&devices, "report pdf", &[], page(SortDir::Asc, 0, 10));
        assert_eq!(result.total_hits, 1);
        assert_eq!(result.rows[0].name, "report-2024.pdf");
    }

    #[test]
    fn case_insensitive_match() {
        let devices = one_device(&["Readme.txt"]);
        let result = search(&devices, "README", &[], page(SortDir::Asc, 0, 10));
        assert_eq!(result.total_hits, 1);
    }

    #[test]
    fn empty_query_counts_all_records() {
        let devices = one_device(&["a", "b", "c"]);
        let result = search(&devices, "", &[], page(SortDir::Asc, 0, 2));
        assert_eq!(result.total_hits, 3);
        assert_eq!(result.rows.len(), 2);
    }

    #[test]
    fn empty_query_desc_reverses_order_without_revisits() {
        // Descending traversal is the exact reverse of orderByName and
        // reaches every record exactly once.
        let names = ["delta", "alpha", "charlie", "bravo", "echo"];
        let devices = one_device(&names);
        let idx = &devices["partuuid:dev-a"];

        let asc: Vec<String> = search(&devices, "", &[], page(SortDir::Asc, 0, 10))
            .rows
            .into_iter()
            .map(|r| r.name)
            .collect();
        let desc: Vec<String> = search(&devices, "", &[], page(SortDir::Desc, 0, 10))
            .rows
            .into_iter()
            .map(|r| r.name)
            .collect();

        let mut reversed = asc.clone();
        reversed.reverse();
        assert_eq!(desc, reversed);
        assert_eq!(asc.len(), idx.len());

        // Paged desc traversal visits each record once across pages.
        let mut seen = Vec::new();
        for off in (0..names.len() as u32).step_by(2) {
            for row in search(&devices, "", &[], page(SortDir::Desc, off, 2)).rows {
                seen.push(row.entry_id);
            }
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), names.len());
    }

    #[test]
    fn empty_query_desc_merges_by_rank_across_device_sizes() {
        // With devices of different sizes, a record's heap key must be its
        // direction-adjusted rank, not its traversal position: "d" is the
        // last name of the larger device and must lead the descending
        // merge even though its traversal position ties with "z".
        let mut devices = one_device(&["m", "z"]);
        devices.insert(
            "partuuid:dev-b".to_string(),
            index_from_names(&["a", "b", "c", "d"]),
        );

        let asc: Vec<String> = search(&devices, "", &[], page(SortDir::Asc, 0, 10))
            .rows
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(asc, vec!["m", "a", "z", "b", "c", "d"]);

        let desc: Vec<String> = search(&devices, "", &[], page(SortDir::Desc, 0, 10))
            .rows
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(desc, vec!["d", "c", "z", "b", "m", "a"]);

        // paging over the merged stream stays consistent with the full run
        let mut paged = Vec::new();
        for off in (0..6).step_by(2) {
            for row in search(&devices, "", &[], page(SortDir::Desc, off, 2)).rows {
                paged.push(row.name);
            }
        }
        assert_eq!(paged, desc);
    }

    #[test]
    fn paging_is_deterministic_and_disjoint() {
        // Consecutive pages partition a prefix of the name order.
        let names: Vec<String> = (0..500).map(|i| format!("file{i:04}.dat")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let devices = one_device(&refs);

        let p1 = search(&devices, "file", &[], page(SortDir::Asc, 0, 100));
        let p2 = search(&devices, "file", &[], page(SortDir::Asc, 100, 100));
        assert_eq!(p1.total_hits, 500);
        assert_eq!(p1.rows.len(), 100);
        assert_eq!(p2.rows.len(), 100);

        let ids1: Vec<u64> = p1.rows.iter().map(|r| r.entry_id).collect();
        let ids2: Vec<u64> = p2.rows.iter().map(|r| r.entry_id).collect();
        assert!(ids1.iter().all(|id| !ids2.contains(id)));

        // Union equals the first 200 entries of orderByName.
        let idx = &devices["partuuid:dev-a"];
        let expected: Vec<u64> = idx.order_for(SortKey::Name)[..200]
            .iter()
            .map(|&rec| make_entry_id("partuuid:dev-a", rec))
            .collect();
        let got: Vec<u64> = ids1.into_iter().chain(ids2).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn device_filter_restricts_scope() {
        let mut devices = one_device(&["alpha"]);
        devices.insert(
            "partuuid:dev-b".to_string(),
            index_from_names(&["alphabet"]),
        );

        let all = search(&devices, "alpha", &[], page(SortDir::Asc, 0, 10));
        assert_eq!(all.total_hits, 2);

        let only_b = search(
            &devices,
            "alpha",
            &["partuuid:dev-b".to_string()],
            page(SortDir::Asc, 0, 10),
        );
        assert_eq!(only_b.total_hits, 1);
        assert_eq!(only_b.rows[0].device_id, "partuuid:dev-b");
    }

    #[test]
    fn merge_ties_break_by_device_id_then_record() {
        // Same names on two devices: same ranks, so the device slot
        // (ascending device id) decides.
        let mut devices = one_device(&["same.txt"]);
        devices.insert("partuuid:dev-b".to_string(), index_from_names(&["same.txt"]));

        let result = search(&devices, "same", &[], page(SortDir::Asc, 0, 10));
        assert_eq!(result.total_hits, 2);
        assert_eq!(result.rows[0].device_id, "partuuid:dev-a");
        assert_eq!(result.rows[1].device_id, "partuuid:dev-b");
    }

    #[test]
    fn zero_limit_returns_counts_only() {
        let devices = one_device(&["alpha", "beta"]);
        let result = search(&devices, "", &[], page(SortDir::Asc, 0, 0));
        assert_eq!(result.total_hits, 2);
        assert!(result.rows.is_empty());
    }
}
