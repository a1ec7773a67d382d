use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::ndarray::NdArray;
use crate::variable::{VarId, Variable};

// Backward engine — generation-ordered reverse traversal
//
// The engine walks the recorded graph from a target Variable back to the
// leaves with an explicit worklist (a max-heap), never language-stack
// recursion, so arbitrarily deep graphs cannot overflow the stack and the
// traversal order is auditable.
//
// The heap is keyed by (generation, insertion order): nodes pop in strictly
// decreasing generation, ties in insertion order. Because a node's
// generation is strictly greater than every ancestor's, all consumers of a
// node have been processed — and have contributed their gradient share —
// before the node itself pops. That is the property that makes diamond
// graphs correct: a Variable feeding two downstream operations propagates
// the SUM of both contributions, never just the last one.

struct Entry {
    generation: u32,
    seq: u64,
    var: Variable,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest generation first; equal generations pop in
        // insertion order (lowest seq first).
        self.generation
            .cmp(&other.generation)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Run reverse-mode differentiation from `target`.
///
/// Seeds the target's accumulator (adding to any existing gradient, so
/// repeated calls accumulate), then propagates gradients to every tracked
/// ancestor. When `retain_grad` is false, non-leaf gradients are dropped as
/// soon as they have been propagated.
pub(crate) fn run_backward(
    target: &Variable,
    seed: Option<&NdArray>,
    retain_grad: bool,
) -> Result<()> {
    if !target.requires_grad() {
        return Err(Error::BackwardOnUntracked);
    }

    let seed = match seed {
        Some(s) => {
            if s.shape() != target.shape() {
                return Err(Error::SeedShapeMismatch {
                    expected: target.shape().clone(),
                    got: s.shape().clone(),
                });
            }
            s.clone()
        }
        None => {
            if target.elem_count() != 1 {
                return Err(Error::NonScalarBackward {
                    shape: target.shape().clone(),
                });
            }
            NdArray::ones(target.shape().clone())
        }
    };
    target.accumulate_grad(seed)?;

    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    let mut seen: HashSet<VarId> = HashSet::new();
    let mut seq = 0u64;

    if target.creator().is_some() {
        seen.insert(target.id());
        heap.push(Entry {
            generation: target.generation(),
            seq,
            var: target.clone(),
        });
        seq += 1;
    }

    let mut processed = 0usize;
    while let Some(entry) = heap.pop() {
        let var = entry.var;
        // Only nodes with a creator are queued.
        let creator = match var.creator() {
            Some(c) => c,
            None => continue,
        };

        let gout = match var.grad() {
            Some(g) => g,
            None => continue,
        };

        trace!(
            "backward: {} (gen {}) through {}",
            processed,
            var.generation(),
            creator.op.name()
        );

        let gxs = creator.op.backward(&gout)?;
        if gxs.len() != creator.inputs.len() {
            return Err(Error::GradientArityMismatch {
                expected: creator.inputs.len(),
                got: gxs.len(),
            });
        }

        for (parent, gx) in creator.inputs.iter().zip(gxs) {
            if !parent.requires_grad() {
                continue;
            }
            parent.accumulate_grad(gx)?;
            if parent.creator().is_some() && seen.insert(parent.id()) {
                heap.push(Entry {
                    generation: parent.generation(),
                    seq,
                    var: parent.clone(),
                });
                seq += 1;
            }
        }

        // Intermediate gradients are only kept on request; leaves (never
        // queued) always keep theirs.
        if !retain_grad {
            var.drop_grad();
        }
        processed += 1;
    }

    debug!("backward complete: {} nodes propagated", processed);
    Ok(())
}
