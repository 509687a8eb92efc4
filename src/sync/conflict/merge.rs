//! Three-way merge for text items and shallow merge for JSON objects

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Above this many base x side line pairs, skip the LCS table and treat the
/// whole file as one edit
const MAX_DIFF_CELLS: usize = 4_000_000;

/// Result of a three-way merge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    /// The merged content (with conflict markers if any)
    pub content: String,
    /// Whether the merge was clean
    pub success: bool,
    pub has_conflict_markers: bool,
    /// Output line index of each conflict block
    pub conflict_lines: Vec<usize>,
    pub stats: MergeStats,
}

/// Statistics about a merge operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeStats {
    pub base_kept: usize,
    pub local_added: usize,
    pub remote_added: usize,
    pub local_deleted: usize,
    pub remote_deleted: usize,
    pub conflicts: usize,
}

/// Replace `base[start..end]` with `lines`
#[derive(Debug, Clone, PartialEq)]
struct Hunk {
    start: usize,
    end: usize,
    lines: Vec<String>,
}

fn overlaps(a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> bool {
    a_start == b_start || (a_start < b_end && b_start < a_end)
}

/// Edits turning `base` into `other`, in base order
fn diff_hunks(base: &[&str], other: &[&str]) -> Vec<Hunk> {
    let (n, m) = (base.len(), other.len());
    if n.saturating_mul(m) > MAX_DIFF_CELLS {
        if base == other {
            return Vec::new();
        }
        return vec![Hunk {
            start: 0,
            end: n,
            lines: other.iter().map(|l| l.to_string()).collect(),
        }];
    }

    // lcs[i][j] = LCS length of base[i..] and other[j..]
    let width = m + 1;
    let mut lcs = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * width + j] = if base[i] == other[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let mut hunks = Vec::new();
    let mut current: Option<Hunk> = None;
    let (mut i, mut j) = (0, 0);
    while i < n || j < m {
        if i < n && j < m && base[i] == other[j] {
            if let Some(h) = current.take() {
                hunks.push(h);
            }
            i += 1;
            j += 1;
        } else if j < m && (i == n || lcs[i * width + j + 1] >= lcs[(i + 1) * width + j]) {
            current
                .get_or_insert_with(|| Hunk {
                    start: i,
                    end: i,
                    lines: Vec::new(),
                })
                .lines
                .push(other[j].to_string());
            j += 1;
        } else {
            let hunk = current.get_or_insert_with(|| Hunk {
                start: i,
                end: i,
                lines: Vec::new(),
            });
            i += 1;
            hunk.end = i;
        }
    }
    if let Some(h) = current.take() {
        hunks.push(h);
    }
    hunks
}

/// Base region `[start, end)` with one side's hunks applied
fn render(base: &[&str], start: usize, end: usize, hunks: &[&Hunk]) -> Vec<String> {
    let mut out = Vec::new();
    let mut pos = start;
    for hunk in hunks {
        out.extend(base[pos..hunk.start].iter().map(|l| l.to_string()));
        out.extend(hunk.lines.iter().cloned());
        pos = hunk.end;
    }
    out.extend(base[pos..end].iter().map(|l| l.to_string()));
    out
}

/// Three-way merge implementation
pub struct ThreeWayMerge {
    local_marker: String,
    remote_marker: String,
    separator: String,
}

impl Default for ThreeWayMerge {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreeWayMerge {
    pub fn new() -> Self {
        Self {
            local_marker: "<<<<<<< LOCAL".to_string(),
            remote_marker: ">>>>>>> REMOTE".to_string(),
            separator: "=======".to_string(),
        }
    }

    /// Set custom conflict markers
    pub fn with_markers(
        mut self,
        local: impl Into<String>,
        separator: impl Into<String>,
        remote: impl Into<String>,
    ) -> Self {
        self.local_marker = local.into();
        self.separator = separator.into();
        self.remote_marker = remote.into();
        self
    }

    /// Merge `local` and `remote` edits of `base`. Edits to disjoint line
    /// ranges combine; edits to the same range must be identical or the
    /// block is emitted between conflict markers.
    pub fn merge(&self, base: &str, local: &str, remote: &str) -> MergeResult {
        let base_lines: Vec<&str> = base.lines().collect();
        let local_lines: Vec<&str> = local.lines().collect();
        let remote_lines: Vec<&str> = remote.lines().collect();

        let local_hunks = diff_hunks(&base_lines, &local_lines);
        let remote_hunks = diff_hunks(&base_lines, &remote_lines);

        let mut out: Vec<String> = Vec::new();
        let mut stats = MergeStats::default();
        let mut conflict_lines = Vec::new();
        let mut pos = 0;
        let (mut li, mut ri) = (0, 0);

        let copy_base = |out: &mut Vec<String>, stats: &mut MergeStats, from: usize, to: usize| {
            out.extend(base_lines[from..to].iter().map(|l| l.to_string()));
            stats.base_kept += to - from;
        };

        while li < local_hunks.len() || ri < remote_hunks.len() {
            let l = local_hunks.get(li);
            let r = remote_hunks.get(ri);

            match (l, r) {
                (Some(lh), Some(rh)) if overlaps(lh.start, lh.end, rh.start, rh.end) => {
                    // Grow the block until no further hunk on either side touches it
                    let mut start = lh.start.min(rh.start);
                    let mut end = lh.end.max(rh.end);
                    let (mut lj, mut rj) = (li + 1, ri + 1);
                    loop {
                        if let Some(h) = local_hunks
                            .get(lj)
                            .filter(|h| overlaps(h.start, h.end, start, end))
                        {
                            start = start.min(h.start);
                            end = end.max(h.end);
                            lj += 1;
                        } else if let Some(h) = remote_hunks
                            .get(rj)
                            .filter(|h| overlaps(h.start, h.end, start, end))
                        {
                            start = start.min(h.start);
                            end = end.max(h.end);
                            rj += 1;
                        } else {
                            break;
                        }
                    }

                    let local_block: Vec<&Hunk> = local_hunks[li..lj].iter().collect();
                    let remote_block: Vec<&Hunk> = remote_hunks[ri..rj].iter().collect();
                    let local_text = render(&base_lines, start, end, &local_block);
                    let remote_text = render(&base_lines, start, end, &remote_block);

                    copy_base(&mut out, &mut stats, pos, start);
                    if local_text == remote_text {
                        stats.local_added += local_text.len();
                        out.extend(local_text);
                    } else {
                        stats.conflicts += 1;
                        conflict_lines.push(out.len());
                        out.push(self.local_marker.clone());
                        out.extend(local_text);
                        out.push(self.separator.clone());
                        out.extend(remote_text);
                        out.push(self.remote_marker.clone());
                    }
                    pos = end;
                    li = lj;
                    ri = rj;
                }
                (Some(lh), rh) if rh.map_or(true, |rh| lh.start < rh.start) => {
                    copy_base(&mut out, &mut stats, pos, lh.start);
                    stats.local_added += lh.lines.len();
                    stats.local_deleted += lh.end - lh.start;
                    out.extend(lh.lines.iter().cloned());
                    pos = lh.end;
                    li += 1;
                }
                (_, Some(rh)) => {
                    copy_base(&mut out, &mut stats, pos, rh.start);
                    stats.remote_added += rh.lines.len();
                    stats.remote_deleted += rh.end - rh.start;
                    out.extend(rh.lines.iter().cloned());
                    pos = rh.end;
                    ri += 1;
                }
                _ => break,
            }
        }
        copy_base(&mut out, &mut stats, pos, base_lines.len());

        let mut content = out.join("\n");
        if trailing_newline(base, local, remote) && !content.is_empty() {
            content.push('\n');
        }

        let has_conflicts = stats.conflicts > 0;
        MergeResult {
            content,
            success: !has_conflicts,
            has_conflict_markers: has_conflicts,
            conflict_lines,
            stats,
        }
    }

    /// Whether `local` and `remote` edits of `base` combine without conflict
    pub fn merges_cleanly(&self, base: &str, local: &str, remote: &str) -> bool {
        self.merge(base, local, remote).success
    }

    /// Shallow merge of two JSON objects. Keys present on one side are kept;
    /// keys whose values differ take the newer side's value.
    pub fn merge_objects(
        &self,
        local: &serde_json::Map<String, serde_json::Value>,
        remote: &serde_json::Map<String, serde_json::Value>,
        local_is_newer: bool,
    ) -> serde_json::Map<String, serde_json::Value> {
        let (newer, older) = if local_is_newer {
            (local, remote)
        } else {
            (remote, local)
        };
        let mut result = older.clone();
        for (k, v) in newer {
            result.insert(k.clone(), v.clone());
        }
        result
    }

    /// Merge item metadata, local values winning on conflicting keys
    pub fn merge_metadata_map(
        &self,
        base: Option<&BTreeMap<String, serde_json::Value>>,
        local: &BTreeMap<String, serde_json::Value>,
        remote: &BTreeMap<String, serde_json::Value>,
    ) -> BTreeMap<String, serde_json::Value> {
        if local == remote {
            return local.clone();
        }
        let mut result = base.cloned().unwrap_or_default();

        for (k, v) in local {
            if base.and_then(|b| b.get(k)) != Some(v) {
                result.insert(k.clone(), v.clone());
            }
        }
        // Remote edits apply only where local left the base value alone
        for (k, v) in remote {
            let base_value = base.and_then(|b| b.get(k));
            if base_value != Some(v) && local.get(k) == base_value {
                result.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in local.iter().chain(remote.iter()) {
            result.entry(k.clone()).or_insert_with(|| v.clone());
        }
        result
    }
}

fn trailing_newline(base: &str, local: &str, remote: &str) -> bool {
    let (b, l, r) = (base.ends_with('\n'), local.ends_with('\n'), remote.ends_with('\n'));
    if l == r {
        l
    } else if l != b {
        l
    } else {
        r
    }
}
