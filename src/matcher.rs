//! Match source and target file trees and plan rename-based sync.
//!
//! Files are partitioned by signature — the (size, fingerprint) pair — and
//! only signatures present in both trees are considered: content one side
//! lacks is outside this planner's reach, since it never copies data. Within
//! a signature, each target file is matched to a source file and its path
//! set is rewritten into the source's path set using only `mv`, `ln`, and
//! `rm`.
//!
//! All planned renames form a 1-graph (arrow: target path -> wanted source
//! path). On a single filesystem a rename cycle cannot be executed without
//! an intermediate free name, so plans whose move graph has a cycle are
//! rejected, and the backtracking search exists to find a pairing whose
//! combined graph stays acyclic. Commands come out in execution order:
//! links first, then each rename chain from its free end, then removals.
//! Every removal carries a witness path (another surviving link to the same
//! file) so the command sequence is reversible; removing a file's last path
//! is never planned.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;

use crate::backtracker::{do_search, SearchState};
use crate::error::{PlanImpossible, TreeError};
use crate::fileid::FileId;
use crate::hasher::Fingerprint;
use crate::onegraph::OneGraph;
use crate::proptree::PropertyTree;

pub type SizeHash = (u64, Fingerprint);

/// One planner command over tree-relative paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncCmd {
    Mv {
        from: Utf8PathBuf,
        to: Utf8PathBuf,
    },
    Ln {
        existing: Utf8PathBuf,
        new: Utf8PathBuf,
    },
    /// `witness` is another path to the same file that survives the unlink,
    /// recorded so the command can be undone.
    Rm {
        path: Utf8PathBuf,
        witness: Utf8PathBuf,
    },
}

impl std::fmt::Display for SyncCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCmd::Mv { from, to } => write!(f, "mv \"{from}\" \"{to}\""),
            SyncCmd::Ln { existing, new } => write!(f, "ln \"{existing}\" \"{new}\""),
            SyncCmd::Rm { path, witness: _ } => write!(f, "rm \"{path}\""),
        }
    }
}

// ----------------------------------------------------------------------
// PathOp: a combined mv/ln/rm operation set
// ----------------------------------------------------------------------

/// The combined path operations accumulated for (part of) a plan:
/// a move 1-graph, a map from an existing target path to the new links to
/// cut from it, and the set of paths to unlink.
#[derive(Clone, Debug, Default)]
struct PathOp {
    mv_graph: OneGraph<Utf8PathBuf>,
    ln_map: IndexMap<Utf8PathBuf, Vec<Utf8PathBuf>>,
    unln_set: IndexSet<Utf8PathBuf>,
}

impl PathOp {
    fn trivial() -> Self {
        PathOp::default()
    }

    /// mv: rename the target path into the source path (arrow tgt -> src).
    fn make_mv(src_path: &Utf8Path, tgt_path: &Utf8Path) -> Self {
        let mut op = PathOp::trivial();
        if src_path != tgt_path {
            op.mv_graph.add_arrow(tgt_path.to_owned(), src_path.to_owned());
        }
        op
    }

    fn make_unln(paths: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        let mut op = PathOp::trivial();
        op.unln_set.extend(paths);
        op
    }

    fn make_ln(existing: Utf8PathBuf, new_paths: Vec<Utf8PathBuf>) -> Self {
        let mut op = PathOp::trivial();
        if !new_paths.is_empty() {
            op.ln_map.insert(existing, new_paths);
        }
        op
    }

    fn add(&mut self, other: &PathOp) {
        self.mv_graph.add_graph(&other.mv_graph);
        for (existing, new_paths) in &other.ln_map {
            debug_assert!(!self.ln_map.contains_key(existing), "ln source added twice");
            self.ln_map.insert(existing.clone(), new_paths.clone());
        }
        for path in &other.unln_set {
            debug_assert!(!self.unln_set.contains(path), "unlink path added twice");
            self.unln_set.insert(path.clone());
        }
    }

    fn remove(&mut self, other: &PathOp) {
        self.mv_graph.remove_graph(&other.mv_graph);
        for existing in other.ln_map.keys() {
            self.ln_map.shift_remove(existing);
        }
        for path in &other.unln_set {
            self.unln_set.shift_remove(path);
        }
    }

    fn is_valid(&self) -> bool {
        !self.mv_graph.has_cycle()
    }

    fn is_empty(&self) -> bool {
        self.mv_graph.is_empty() && self.ln_map.is_empty() && self.unln_set.is_empty()
    }
}

// ----------------------------------------------------------------------
// Search state
// ----------------------------------------------------------------------

enum MatchDelta {
    /// Pop the next (size, fingerprint) group off the stack.
    NextGroup(SizeHash),
    /// Commit one (source id, target id) match with one candidate rewrite.
    Pair {
        src: FileId,
        tgt: FileId,
        op: PathOp,
    },
    /// Leftover unmatched ids on one side: leave those files alone.
    SkipIds {
        src: Vec<FileId>,
        tgt: Vec<FileId>,
    },
    /// Stack is empty; validate the complete move graph.
    FinalCheck,
}

struct MatchState {
    group_stack: Vec<SizeHash>,
    groups: HashMap<SizeHash, (Vec<FileId>, Vec<FileId>)>,
    src_paths: HashMap<FileId, Vec<Utf8PathBuf>>,
    tgt_paths: HashMap<FileId, Vec<Utf8PathBuf>>,
    cur_src: Vec<FileId>,
    cur_tgt: Vec<FileId>,
    total: PathOp,
    valid: bool,
    doing_final_check: bool,
}

impl SearchState for MatchState {
    type Delta = MatchDelta;

    fn delta_iter(&self) -> Option<Box<dyn Iterator<Item = MatchDelta>>> {
        if !self.cur_src.is_empty() && !self.cur_tgt.is_empty() {
            Some(self.pair_deltas())
        } else if !self.cur_src.is_empty() || !self.cur_tgt.is_empty() {
            Some(Box::new(std::iter::once(MatchDelta::SkipIds {
                src: self.cur_src.clone(),
                tgt: self.cur_tgt.clone(),
            })))
        } else if let Some(&next) = self.group_stack.last() {
            tracing::debug!(groups_left = self.group_stack.len(), "matching next group");
            Some(Box::new(std::iter::once(MatchDelta::NextGroup(next))))
        } else if !self.doing_final_check {
            Some(Box::new(std::iter::once(MatchDelta::FinalCheck)))
        } else {
            None
        }
    }

    fn down_delta(&mut self, delta: &MatchDelta) {
        match delta {
            MatchDelta::NextGroup(szhash) => {
                let popped = self.group_stack.pop();
                debug_assert_eq!(popped, Some(*szhash));
                let (src, tgt) = self.groups[szhash].clone();
                self.cur_src = src;
                self.cur_tgt = tgt;
            }
            MatchDelta::Pair { src, tgt, op } => {
                remove_first(&mut self.cur_src, *src);
                remove_first(&mut self.cur_tgt, *tgt);
                self.total.add(op);
                self.valid = self.total.is_valid();
            }
            MatchDelta::SkipIds { src, tgt } => {
                tracing::trace!(?src, ?tgt, "ignoring leftover ids");
                for id in src {
                    remove_first(&mut self.cur_src, *id);
                }
                for id in tgt {
                    remove_first(&mut self.cur_tgt, *id);
                }
            }
            MatchDelta::FinalCheck => {
                self.doing_final_check = true;
                self.valid = self.total.is_valid();
            }
        }
    }

    fn up_delta(&mut self, delta: &MatchDelta) {
        match delta {
            MatchDelta::NextGroup(szhash) => {
                self.group_stack.push(*szhash);
                self.cur_src.clear();
                self.cur_tgt.clear();
            }
            MatchDelta::Pair { src, tgt, op } => {
                self.cur_src.push(*src);
                self.cur_tgt.push(*tgt);
                self.total.remove(op);
            }
            MatchDelta::SkipIds { src, tgt } => {
                self.cur_src.extend_from_slice(src);
                self.cur_tgt.extend_from_slice(tgt);
            }
            MatchDelta::FinalCheck => {
                self.doing_final_check = false;
            }
        }
        self.valid = true;
    }

    fn is_valid(&self) -> bool {
        self.valid
    }
}

fn remove_first(ids: &mut Vec<FileId>, id: FileId) {
    if let Some(pos) = ids.iter().position(|&x| x == id) {
        ids.remove(pos);
    }
}

impl MatchState {
    /// Deltas matching one target id of the current group against candidate
    /// source ids. Best-guess ordering: a target sharing a full path with
    /// some source is resolved first, and sources sharing a path with it
    /// come before the rest. On real trees the shared-path pairing almost
    /// always wins without backtracking.
    fn pair_deltas(&self) -> Box<dyn Iterator<Item = MatchDelta>> {
        let shares_path = |src: FileId, tgt: FileId| {
            let (Some(sp), Some(tp)) = (self.src_paths.get(&src), self.tgt_paths.get(&tgt)) else {
                return false;
            };
            sp.iter().any(|p| tp.contains(p))
        };

        let tgt = self
            .cur_tgt
            .iter()
            .copied()
            .find(|&t| self.cur_src.iter().any(|&s| shares_path(s, t)))
            .unwrap_or(self.cur_tgt[0]);

        let (shared, rest): (Vec<FileId>, Vec<FileId>) = self
            .cur_src
            .iter()
            .copied()
            .partition(|&s| shares_path(s, tgt));

        let tgt_paths = self.tgt_paths[&tgt].clone();
        let src_path_map: HashMap<FileId, Vec<Utf8PathBuf>> = shared
            .iter()
            .chain(rest.iter())
            .map(|&s| (s, self.src_paths[&s].clone()))
            .collect();

        Box::new(
            shared
                .into_iter()
                .chain(rest)
                .flat_map(move |src| {
                    let src_paths = src_path_map[&src].clone();
                    gen_pathops(src_paths, tgt_paths.clone())
                        .map(move |op| MatchDelta::Pair { src, tgt, op })
                }),
        )
    }
}

/// Candidate rewrites turning the target id's path set into the source
/// id's. Let Common be the shared paths, Sonly and Tonly the rest:
/// no Sonly means unlink the extras, no Tonly means link the missing ones,
/// otherwise pair min(|Sonly|, |Tonly|) paths as renames — every pairing is
/// a candidate, since a particular choice may cycle with other files' moves
/// — with leftovers unlinked or linked.
fn gen_pathops(
    src_paths: Vec<Utf8PathBuf>,
    tgt_paths: Vec<Utf8PathBuf>,
) -> Box<dyn Iterator<Item = PathOp>> {
    let some_tgt_path = tgt_paths[0].clone();
    let s_only: Vec<Utf8PathBuf> = src_paths
        .iter()
        .filter(|p| !tgt_paths.contains(p))
        .cloned()
        .collect();
    let t_only: Vec<Utf8PathBuf> = tgt_paths
        .iter()
        .filter(|p| !src_paths.contains(p))
        .cloned()
        .collect();

    if s_only.is_empty() {
        return Box::new(std::iter::once(PathOp::make_unln(t_only)));
    }
    if t_only.is_empty() {
        return Box::new(std::iter::once(PathOp::make_ln(some_tgt_path, s_only)));
    }

    if s_only.len() == t_only.len() {
        let k = t_only.len();
        Box::new(t_only.into_iter().permutations(k).map(move |perm| {
            let mut op = PathOp::trivial();
            for (s, t) in s_only.iter().zip(perm.iter()) {
                op.add(&PathOp::make_mv(s, t));
            }
            op
        }))
    } else if t_only.len() > s_only.len() {
        // More target paths than wanted: some renames plus unlinks.
        let k = s_only.len();
        let t_all = t_only.clone();
        Box::new(t_only.into_iter().permutations(k).map(move |perm| {
            let mut op = PathOp::trivial();
            for (s, t) in s_only.iter().zip(perm.iter()) {
                op.add(&PathOp::make_mv(s, t));
            }
            let leftover = t_all.iter().filter(|t| !perm.contains(t)).cloned();
            op.add(&PathOp::make_unln(leftover));
            op
        }))
    } else {
        // Fewer target paths than wanted: all renamed plus new links.
        let k = t_only.len();
        let s_all = s_only.clone();
        Box::new(s_only.into_iter().permutations(k).map(move |perm| {
            let mut op = PathOp::trivial();
            for (s, t) in perm.iter().zip(t_only.iter()) {
                op.add(&PathOp::make_mv(s, t));
            }
            let leftover: Vec<Utf8PathBuf> =
                s_all.iter().filter(|s| !perm.contains(s)).cloned().collect();
            op.add(&PathOp::make_ln(some_tgt_path.clone(), leftover));
            op
        }))
    }
}

// ----------------------------------------------------------------------
// TreePairMatcher
// ----------------------------------------------------------------------

/// Match two property trees and generate target sync commands.
///
/// The target tree must be online. When the source is also online, neither
/// root may contain the other.
pub struct TreePairMatcher {
    state: MatchState,
    matched: bool,
}

impl TreePairMatcher {
    pub fn new(src: &mut PropertyTree, tgt: &mut PropertyTree) -> Result<TreePairMatcher> {
        if !tgt.is_online() {
            return Err(TreeError::new("sync target must be an online tree").into());
        }
        if let (Some(src_root), Some(tgt_root)) = (src.root_path(), tgt.root_path()) {
            if src_root.starts_with(tgt_root) || tgt_root.starts_with(src_root) {
                return Err(TreeError::new(
                    "source and target trees must not contain one another",
                )
                .into());
            }
        }

        let mut state = MatchState {
            group_stack: Vec::new(),
            groups: HashMap::new(),
            src_paths: HashMap::new(),
            tgt_paths: HashMap::new(),
            cur_src: Vec::new(),
            cur_tgt: Vec::new(),
            total: PathOp::trivial(),
            valid: true,
            doing_final_check: false,
        };
        Self::init_groups(&mut state, src, tgt)?;
        state.valid = state.total.is_valid();
        Ok(TreePairMatcher {
            state,
            matched: false,
        })
    }

    /// Run the matching search. False means no acyclic plan exists.
    pub fn do_match(&mut self) -> bool {
        tracing::debug!(groups = self.state.group_stack.len(), "starting match-up");
        self.matched = do_search(&mut self.state);
        tracing::debug!(matched = self.matched, "finished match-up");
        self.matched
    }

    /// Convenience: match and either produce commands or `PlanImpossible`.
    pub fn plan(&mut self, tgt: &PropertyTree) -> Result<Vec<SyncCmd>> {
        if !self.do_match() {
            return Err(PlanImpossible.into());
        }
        self.sync_cmds(tgt)
    }

    fn init_groups(
        state: &mut MatchState,
        src: &mut PropertyTree,
        tgt: &mut PropertyTree,
    ) -> Result<()> {
        let tgt_sizes: HashSet<u64> = tgt.all_sizes()?.into_iter().collect();
        let mut common_sizes: Vec<u64> = src
            .all_sizes()?
            .into_iter()
            .filter(|s| tgt_sizes.contains(s))
            .collect();
        common_sizes.sort_unstable();

        for size in common_sizes {
            let src_by_hash = hash_to_ids(src, size)?;
            let tgt_by_hash = hash_to_ids(tgt, size)?;
            let mut common_hashes: Vec<Fingerprint> = src_by_hash
                .keys()
                .filter(|h| tgt_by_hash.contains_key(h))
                .copied()
                .collect();
            common_hashes.sort_unstable();
            for hash in common_hashes {
                let src_ids = &src_by_hash[&hash];
                let tgt_ids = &tgt_by_hash[&hash];
                tracing::trace!(size, hash, "group init");
                let src_paths: Vec<Vec<Utf8PathBuf>> = src_ids
                    .iter()
                    .map(|&id| src.tree().file(id).expect("indexed").paths.clone())
                    .collect();
                let tgt_paths: Vec<Vec<Utf8PathBuf>> = tgt_ids
                    .iter()
                    .map(|&id| tgt.tree().file(id).expect("indexed").paths.clone())
                    .collect();

                if Self::eliminate_now(state, &src_paths, &tgt_paths) {
                    continue;
                }

                let szhash = (size, hash);
                state.group_stack.push(szhash);
                state.groups.insert(szhash, (src_ids.clone(), tgt_ids.clone()));
                for (id, paths) in src_ids.iter().zip(src_paths) {
                    state.src_paths.insert(*id, paths);
                }
                for (id, paths) in tgt_ids.iter().zip(tgt_paths) {
                    state.tgt_paths.insert(*id, paths);
                }
            }
        }
        Ok(())
    }

    /// Handle the overwhelmingly common trivial groups without touching the
    /// search stack. Returns true if the group is fully dealt with.
    fn eliminate_now(
        state: &mut MatchState,
        src_paths: &[Vec<Utf8PathBuf>],
        tgt_paths: &[Vec<Utf8PathBuf>],
    ) -> bool {
        // One id per side.
        if src_paths.len() == 1 && tgt_paths.len() == 1 {
            if src_paths[0].len() == 1 && tgt_paths[0].len() == 1 {
                let op = PathOp::make_mv(&src_paths[0][0], &tgt_paths[0][0]);
                state.total.add(&op);
                return true;
            }
            let sset: HashSet<&Utf8PathBuf> = src_paths[0].iter().collect();
            let tset: HashSet<&Utf8PathBuf> = tgt_paths[0].iter().collect();
            if sset == tset {
                return true;
            }
        }
        // Equal id counts, one path each, path sets already equal.
        else if src_paths.len() == tgt_paths.len()
            && src_paths.iter().all(|p| p.len() == 1)
            && tgt_paths.iter().all(|p| p.len() == 1)
        {
            let sset: HashSet<&Utf8PathBuf> = src_paths.iter().map(|p| &p[0]).collect();
            let tset: HashSet<&Utf8PathBuf> = tgt_paths.iter().map(|p| &p[0]).collect();
            if sset == tset {
                return true;
            }
        }
        false
    }

    /// Commands of the found plan, in execution order: ln, then mv chains,
    /// then rm. A destination occupied by a path that is itself scheduled
    /// for unlinking gets its rm emitted in advance.
    pub fn sync_cmds(&self, tgt: &PropertyTree) -> Result<Vec<SyncCmd>> {
        assert!(self.matched, "sync_cmds: not matched yet");
        let total = &self.state.total;
        let mut rm_in_advance: HashSet<Utf8PathBuf> = HashSet::new();
        let mut cmds: Vec<SyncCmd> = Vec::new();

        // Hard links first: their sources may be unlinked or moved later.
        for (existing, new_paths) in &total.ln_map {
            for new_path in new_paths {
                if tgt.tree().resolve(new_path).is_some() {
                    if total.unln_set.contains(new_path) {
                        rm_in_advance.insert(new_path.clone());
                        cmds.push(mk_rm(tgt, new_path)?);
                    } else {
                        tracing::warn!(path = %new_path, "cannot create hardlink at occupied path");
                        continue;
                    }
                }
                cmds.push(SyncCmd::Ln {
                    existing: existing.clone(),
                    new: new_path.clone(),
                });
            }
        }

        // Each rename chain a1 -> a2 -> ... -> an runs from its far end
        // backwards, so every destination is free when its mv executes.
        let mut roots = total.mv_graph.roots();
        roots.sort_unstable();
        for root in roots {
            let mut chain: Vec<(Utf8PathBuf, Utf8PathBuf)> = Vec::new();
            let mut cur = root;
            while let Some(next) = total.mv_graph.follow_arrow(&cur) {
                chain.push((cur.clone(), next.clone()));
                cur = next.clone();
            }
            let (_, final_dest) = chain.last().expect("root has an arrow");
            if tgt.tree().resolve(final_dest).is_some() {
                if total.unln_set.contains(final_dest) {
                    rm_in_advance.insert(final_dest.clone());
                    cmds.push(mk_rm(tgt, final_dest)?);
                } else {
                    tracing::warn!(path = %final_dest, "cannot mv to occupied path");
                    continue;
                }
            }
            for (from, to) in chain.into_iter().rev() {
                cmds.push(SyncCmd::Mv { from, to });
            }
        }

        for path in &total.unln_set {
            if !rm_in_advance.contains(path) {
                cmds.push(mk_rm(tgt, path)?);
            }
        }
        Ok(cmds)
    }

    /// True when the plan contains no operations at all.
    pub fn is_noop(&self) -> bool {
        self.state.total.is_empty()
    }
}

fn hash_to_ids(tree: &mut PropertyTree, size: u64) -> Result<HashMap<Fingerprint, Vec<FileId>>> {
    let mut by_hash: HashMap<Fingerprint, Vec<FileId>> = HashMap::new();
    for id in tree.size_to_files(size)? {
        match tree.get_fingerprint(id) {
            Ok(hash) => by_hash.entry(hash).or_default().push(id),
            Err(e) => {
                tracing::error!(path = %tree.path_digest(id), "skipping unhashable file: {e}");
            }
        }
    }
    Ok(by_hash)
}

/// An rm command with a distinct surviving witness path to the same file.
fn mk_rm(tgt: &PropertyTree, path: &Utf8Path) -> Result<SyncCmd> {
    let file = tgt
        .tree()
        .file_at(path)
        .ok_or_else(|| TreeError::new(format!("rm target is not a file: {path}")))?;
    let witness = file
        .paths
        .iter()
        .find(|p| p.as_path() != path)
        .ok_or_else(|| TreeError::new(format!("no witness path for rm of {path}")))?
        .clone();
    Ok(SyncCmd::Rm {
        path: path.to_owned(),
        witness,
    })
}
