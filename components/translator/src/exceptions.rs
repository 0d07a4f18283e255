//! Exception regions as linearized, disjoint PC intervals.
//!
//! The method's exception table rows are arbitrary overlapping ranges;
//! translation wants, for any program counter, the ordered list of
//! handlers active there. Cutting the code at every range boundary
//! yields disjoint intervals (nodes) whose active-handler list is
//! constant, so each node can carry one lazily-built landing pad.

use crate::graph::BlockId;
use type_system::Type;

/// One exception-table row with its catch type resolved.
#[derive(Debug, Clone)]
pub(crate) struct RegionEntry {
    pub start: usize,
    pub end: usize,
    pub handler_pc: usize,
    /// `None` is the catch-all of `finally` blocks.
    pub catch: Option<Type>,
}

/// One disjoint interval and its active handlers, in priority order.
#[derive(Debug)]
pub(crate) struct RegionNode {
    pub start: usize,
    pub end: usize,
    pub entries: Vec<RegionEntry>,
    pub pad: Option<BlockId>,
}

/// The linearized interval sequence covering `[0, code_len)`.
#[derive(Debug)]
pub(crate) struct Regions {
    nodes: Vec<RegionNode>,
}

impl Regions {
    pub fn build(entries: &[RegionEntry], code_len: usize) -> Regions {
        let mut boundaries = vec![0, code_len];
        for e in entries {
            boundaries.push(e.start);
            boundaries.push(e.end);
        }
        boundaries.sort_unstable();
        boundaries.dedup();

        let nodes = boundaries
            .windows(2)
            .map(|pair| {
                let (start, end) = (pair[0], pair[1]);
                let active = entries
                    .iter()
                    .filter(|e| e.start <= start && end <= e.end)
                    .cloned()
                    .collect();
                RegionNode {
                    start,
                    end,
                    entries: active,
                    pad: None,
                }
            })
            .collect();
        Regions { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: usize) -> &RegionNode {
        &self.nodes[index]
    }

    pub fn set_pad(&mut self, index: usize, pad: BlockId) {
        self.nodes[index].pad = Some(pad);
    }

    /// The interval containing `pc`.
    pub fn node_for(&self, pc: usize) -> usize {
        self.nodes
            .iter()
            .position(|n| n.start <= pc && pc < n.end)
            .unwrap_or(0)
    }

    /// The landing pad active at interval `index`, if any.
    pub fn pad_for(&self, index: usize) -> Option<BlockId> {
        self.nodes.get(index).and_then(|n| n.pad)
    }
}
