use itertools::Itertools;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Parse failure for a host-range expression, pointing at the
/// offending character of the source text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid hosts list at character {pos}: {msg}")]
pub struct HostsError {
    pub pos: usize,
    pub src: String,
    pub msg: &'static str,
}

impl HostsError {
    fn new(pos: usize, src: &str, msg: &'static str) -> Self {
        Self {
            pos,
            src: src.to_owned(),
            msg,
        }
    }

    /// Render the source expression with a caret under the offending
    /// character, for terminal diagnostics.
    pub fn pretty(&self) -> String {
        format!("{}\n  {}\n  {}^", self, self.src, " ".repeat(self.pos))
    }
}

/// Expands a host-range expression like `n1,gpu[1-4,a,06-8]` into the
/// full list of host names.
///
/// The scan is a single left-to-right pass: `[` opens a group that
/// reuses the preceding literal as prefix, `-` starts a numeric range,
/// `,` and `]` flush the pending literal or range. Ranges keep the
/// zero-padding of their start token, so `06-8` yields `06,07,08`.
/// Duplicate names collapse, first occurrence wins.
pub fn parse_hosts(src: &str) -> Result<Vec<String>, HostsError> {
    if src.is_empty() {
        return Err(HostsError::new(0, src, "empty hosts list"));
    }

    let mut hosts: Vec<String> = Vec::new();
    let mut curr = String::new();
    let mut prefix = String::new();
    let mut in_group = false;
    let mut after_group = false;
    let mut group_items = 0usize;
    // pending range start together with the position of its first character
    let mut range: Option<(String, usize)> = None;
    let mut token_start = 0usize;

    for (pos, c) in src.char_indices() {
        match c {
            '[' => {
                if in_group {
                    return Err(HostsError::new(pos, src, "nested group"));
                }
                in_group = true;
                group_items = 0;
                prefix = std::mem::take(&mut curr);
            }
            '-' => {
                if curr.is_empty() {
                    return Err(HostsError::new(pos, src, "range start cannot be empty"));
                }
                range = Some((std::mem::take(&mut curr), token_start));
            }
            ',' | ']' => {
                if c == ']' && !in_group {
                    return Err(HostsError::new(pos, src, "unexpected group end"));
                }
                if let Some((start, start_pos)) = range.take() {
                    if curr.is_empty() {
                        return Err(HostsError::new(pos, src, "range end cannot be empty"));
                    }
                    expand_range(&mut hosts, &prefix, &start, start_pos, &curr, token_start, src)?;
                    curr.clear();
                    group_items += 1;
                } else if !curr.is_empty() {
                    hosts.push(format!("{prefix}{curr}"));
                    curr.clear();
                    group_items += 1;
                } else if c == ']' && group_items == 0 {
                    return Err(HostsError::new(pos, src, "empty group"));
                } else if c == ',' && !after_group {
                    return Err(HostsError::new(pos, src, "empty host name"));
                }
                if c == ']' {
                    in_group = false;
                    prefix.clear();
                }
                after_group = c == ']';
            }
            _ => {
                if curr.is_empty() {
                    token_start = pos;
                }
                curr.push(c);
                after_group = false;
            }
        }
    }

    if in_group {
        return Err(HostsError::new(src.len(), src, "unclosed group"));
    }
    if let Some((start, start_pos)) = range.take() {
        if curr.is_empty() {
            return Err(HostsError::new(src.len(), src, "range end cannot be empty"));
        }
        expand_range(&mut hosts, &prefix, &start, start_pos, &curr, token_start, src)?;
    } else if !curr.is_empty() {
        hosts.push(format!("{prefix}{curr}"));
    }

    Ok(hosts.into_iter().unique().collect())
}

fn expand_range(
    hosts: &mut Vec<String>,
    prefix: &str,
    start: &str,
    start_pos: usize,
    end: &str,
    end_pos: usize,
    src: &str,
) -> Result<(), HostsError> {
    let first: u64 = start
        .parse()
        .map_err(|_| HostsError::new(start_pos, src, "range start is not a number"))?;
    let last: u64 = end
        .parse()
        .map_err(|_| HostsError::new(end_pos, src, "range end is not a number"))?;

    // the start token dictates the zero-padding of the whole range
    let width = if start.starts_with('0') { start.len() } else { 0 };
    for n in first..=last {
        hosts.push(format!("{prefix}{n:0width$}"));
    }
    Ok(())
}

/// A set of nodes picked from the pool, in sorted name order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeList(pub Vec<String>);

impl fmt::Display for NodeList {
    /// Host-selection fragment for an mpirun command line. An empty
    /// list renders as nothing so the command falls back to the
    /// scheduler's own placement.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, "-hosts {}", self.0.iter().join(","))
    }
}

/// Tracks which cluster nodes are free and which are busy running a
/// member. Shared between all members of a forecast run.
#[derive(Debug, Default)]
pub struct NodePool {
    // node name -> busy flag
    nodes: Mutex<BTreeMap<String, bool>>,
}

impl NodePool {
    pub fn new<I>(hosts: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            nodes: Mutex::new(hosts.into_iter().map(|name| (name, false)).collect()),
        }
    }

    /// Builds a pool from a host-range expression, usually the content
    /// of `SLURM_NODELIST`.
    pub fn parse(src: &str) -> Result<Self, HostsError> {
        Ok(Self::new(parse_hosts(src)?))
    }

    /// Picks `count` free nodes and marks them busy, all or nothing.
    /// Returns `None` without touching the pool when not enough nodes
    /// are free. Nodes are scanned in name order, so the allocation is
    /// deterministic for a given pool state.
    pub fn find_free(&self, count: usize) -> Option<NodeList> {
        let mut nodes = self.nodes.lock();
        let picked: Vec<String> = nodes
            .iter()
            .filter(|(_, busy)| !**busy)
            .map(|(name, _)| name.clone())
            .take(count)
            .collect();
        if picked.len() < count {
            return None;
        }
        for name in &picked {
            if let Some(busy) = nodes.get_mut(name) {
                *busy = true;
            }
        }
        debug!("Allocated nodes: {}", picked.iter().join(","));
        Some(NodeList(picked))
    }

    /// Returns nodes to the pool. Releasing an already free or unknown
    /// node is a no-op, so disposing twice is harmless.
    pub fn dispose(&self, list: &NodeList) {
        let mut nodes = self.nodes.lock();
        for name in &list.0 {
            if let Some(busy) = nodes.get_mut(name) {
                *busy = false;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.nodes.lock().values().filter(|busy| !**busy).count()
    }
}
