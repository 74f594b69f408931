//! Set-theoretic queries across property trees: duplicates, intersection,
//! difference.
//!
//! Everything here works on sizes first — for a content hasher, files of
//! different sizes cannot share a fingerprint, so size is a free pre-filter
//! and fingerprints are only computed inside size buckets with potential.
//! Callers using a hasher whose value does not determine size pass
//! `size = None` to sweep whole trees instead.
//!
//! The `hard_links` flag decides whether several links to one file count as
//! one occurrence (true) or as many (false). Files whose fingerprint cannot
//! be computed are logged and skipped, never fatal.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::fileid::FileId;
use crate::hasher::Fingerprint;
use crate::proptree::PropertyTree;

/// Files matching a query, per tree: (index into the tree slice, file ids).
pub type LocatedFiles = Vec<(usize, Vec<FileId>)>;

fn fingerprint_or_skip(tree: &mut PropertyTree, id: FileId) -> Option<Fingerprint> {
    match tree.get_fingerprint(id) {
        Ok(fp) => Some(fp),
        Err(e) => {
            tracing::error!(path = %tree.path_digest(id), "ignoring file: {e}");
            None
        }
    }
}

/// Every size with at least two occurrences across all trees. With
/// `hard_links` false a single file carrying two links already counts.
pub fn sizes_with_duplicates(trees: &mut [PropertyTree], hard_links: bool) -> Result<Vec<u64>> {
    let mut seen_once: HashSet<u64> = HashSet::new();
    let mut seen_twice: HashSet<u64> = HashSet::new();
    let mut out = Vec::new();
    for tree in trees.iter_mut() {
        let mut sizes = tree.all_sizes()?;
        sizes.sort_unstable();
        for size in sizes {
            if seen_twice.contains(&size) {
                continue;
            }
            if seen_once.remove(&size) {
                seen_twice.insert(size);
                out.push(size);
                continue;
            }
            let files = tree.size_to_files(size)?;
            let multi_link = !hard_links
                && tree
                    .tree()
                    .file(files[0])
                    .is_some_and(|f| f.paths.len() > 1);
            if files.len() > 1 || multi_link {
                seen_twice.insert(size);
                out.push(size);
            } else {
                seen_once.insert(size);
            }
        }
    }
    Ok(out)
}

/// Fingerprints with two or more member occurrences across all trees, with
/// their files. `size` None sweeps all files.
pub fn groups_of_duplicates_at_size(
    trees: &mut [PropertyTree],
    size: Option<u64>,
    hard_links: bool,
) -> Result<Vec<(Fingerprint, LocatedFiles)>> {
    // fingerprint -> tree index -> files, split by seen-once/seen-more.
    let mut once: HashMap<Fingerprint, HashMap<usize, Vec<FileId>>> = HashMap::new();
    let mut more: HashMap<Fingerprint, HashMap<usize, Vec<FileId>>> = HashMap::new();
    for index in 0..trees.len() {
        for id in trees[index].files_of_size(size)? {
            let Some(fp) = fingerprint_or_skip(&mut trees[index], id) else {
                continue;
            };
            if let Some(located) = more.get_mut(&fp) {
                located.entry(index).or_default().push(id);
            } else if let Some(mut located) = once.remove(&fp) {
                located.entry(index).or_default().push(id);
                more.insert(fp, located);
            } else {
                let multi_link = !hard_links
                    && trees[index]
                        .tree()
                        .file(id)
                        .is_some_and(|f| f.paths.len() > 1);
                let dest = if multi_link { &mut more } else { &mut once };
                dest.entry(fp).or_default().entry(index).or_default().push(id);
            }
        }
    }
    Ok(sorted_groups(more))
}

/// Sizes present in every tree. Trees are visited smallest first so the
/// candidate set shrinks as early as possible.
pub fn sizes_on_all(trees: &mut [PropertyTree]) -> Result<Vec<u64>> {
    if trees.is_empty() {
        return Ok(Vec::new());
    }
    let order = by_ascending_file_count(trees)?;
    let first = order[0];
    let mut candidates = trees[first].all_sizes()?;
    candidates.sort_unstable();
    let mut out = Vec::new();
    'sizes: for size in candidates {
        for &index in &order[1..] {
            if trees[index].size_to_files(size)?.is_empty() {
                continue 'sizes;
            }
        }
        out.push(size);
    }
    Ok(out)
}

/// Fingerprints present in every tree at this size, with their files.
pub fn groups_on_all_at_size(
    trees: &mut [PropertyTree],
    size: Option<u64>,
) -> Result<Vec<(Fingerprint, LocatedFiles)>> {
    if trees.is_empty() {
        return Ok(Vec::new());
    }
    let mut good: HashSet<Fingerprint> = tree_fingerprints(&mut trees[0], size)?;
    for index in 1..trees.len() {
        if good.is_empty() {
            break;
        }
        let here = tree_fingerprints(&mut trees[index], size)?;
        good.retain(|fp| here.contains(fp));
    }
    locate_by_fingerprints(trees, 0..trees.len(), &good, size)
}

/// Fingerprints in the first tree at this size and in no other tree.
pub fn groups_on_first_only_at_size(
    trees: &mut [PropertyTree],
    size: Option<u64>,
) -> Result<Vec<(Option<Fingerprint>, LocatedFiles)>> {
    if trees.is_empty() {
        return Ok(Vec::new());
    }
    // A size held by a single file in the first tree and absent elsewhere
    // needs no fingerprint at all.
    if let Some(sz) = size {
        let first_files = trees[0].size_to_files(sz)?;
        if first_files.len() == 1 {
            let mut unique = true;
            for tree in &mut trees[1..] {
                if !tree.size_to_files(sz)?.is_empty() {
                    unique = false;
                    break;
                }
            }
            if unique {
                return Ok(vec![(None, vec![(0, first_files)])]);
            }
        }
    }
    let mut good: HashSet<Fingerprint> = tree_fingerprints(&mut trees[0], size)?;
    for index in 1..trees.len() {
        if good.is_empty() {
            break;
        }
        for id in trees[index].files_of_size(size)? {
            if let Some(fp) = fingerprint_or_skip(&mut trees[index], id) {
                good.remove(&fp);
            }
        }
    }
    let groups = locate_by_fingerprints(trees, 0..1, &good, size)?;
    Ok(groups.into_iter().map(|(fp, loc)| (Some(fp), loc)).collect())
}

/// Fingerprints in the first tree at this size that also appear in at
/// least one other tree.
pub fn groups_on_first_not_only_at_size(
    trees: &mut [PropertyTree],
    size: Option<u64>,
) -> Result<Vec<(Fingerprint, LocatedFiles)>> {
    if trees.len() < 2 {
        return Ok(Vec::new());
    }
    let mut candidates: HashSet<Fingerprint> = tree_fingerprints(&mut trees[0], size)?;
    let mut good: HashSet<Fingerprint> = HashSet::new();
    for index in 1..trees.len() {
        if candidates.is_empty() {
            break;
        }
        for id in trees[index].files_of_size(size)? {
            if let Some(fp) = fingerprint_or_skip(&mut trees[index], id) {
                if candidates.remove(&fp) {
                    good.insert(fp);
                }
            }
        }
    }
    locate_by_fingerprints(trees, 0..trees.len(), &good, size)
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn by_ascending_file_count(trees: &mut [PropertyTree]) -> Result<Vec<usize>> {
    let mut counts: Vec<(usize, usize)> = Vec::new();
    for (index, tree) in trees.iter_mut().enumerate() {
        counts.push((index, tree.file_count()?));
    }
    counts.sort_by_key(|&(_, count)| count);
    Ok(counts.into_iter().map(|(index, _)| index).collect())
}

fn tree_fingerprints(tree: &mut PropertyTree, size: Option<u64>) -> Result<HashSet<Fingerprint>> {
    let mut out = HashSet::new();
    for id in tree.files_of_size(size)? {
        if let Some(fp) = fingerprint_or_skip(tree, id) {
            out.insert(fp);
        }
    }
    Ok(out)
}

/// Files matching each given fingerprint, over a range of trees.
fn locate_by_fingerprints(
    trees: &mut [PropertyTree],
    range: std::ops::Range<usize>,
    fingerprints: &HashSet<Fingerprint>,
    size: Option<u64>,
) -> Result<Vec<(Fingerprint, LocatedFiles)>> {
    let mut located: HashMap<Fingerprint, HashMap<usize, Vec<FileId>>> = HashMap::new();
    for index in range {
        for id in trees[index].files_of_size(size)? {
            let Some(fp) = fingerprint_or_skip(&mut trees[index], id) else {
                continue;
            };
            if fingerprints.contains(&fp) {
                located.entry(fp).or_default().entry(index).or_default().push(id);
            }
        }
    }
    Ok(sorted_groups(located))
}

fn sorted_groups(
    map: HashMap<Fingerprint, HashMap<usize, Vec<FileId>>>,
) -> Vec<(Fingerprint, LocatedFiles)> {
    let mut out: Vec<(Fingerprint, LocatedFiles)> = map
        .into_iter()
        .map(|(fp, by_tree)| {
            let mut located: LocatedFiles = by_tree.into_iter().collect();
            located.sort_by_key(|&(index, _)| index);
            (fp, located)
        })
        .collect();
    out.sort_by_key(|&(fp, _)| fp);
    out
}
