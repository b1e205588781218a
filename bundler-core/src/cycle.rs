//! Circular-dependency detection: a DFS paint over the module graph,
//! diagnostic-only (a cycle never aborts the bundle), gated by
//! `check_circular_dependency`.

use crate::module::{BundlerModule, CheckState};

/// One detected cycle, reported as the chain of module indices that close
/// the loop, starting and ending at the same index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    pub path: Vec<u32>,
}

/// Walks the graph from every entry module, painting `None -> Entered ->
/// Checked`. A node revisited while still `Entered` closes a cycle.
/// Modules already `Checked` are not re-walked, so the whole traversal is
/// linear in the number of edges regardless of how many entries share
/// subgraphs.
pub fn detect_cycles(nodes: &[BundlerModule], entry_indices: &[u32]) -> Vec<Cycle> {
    let mut cycles = Vec::new();
    let mut stack = Vec::new();

    for &entry in entry_indices {
        if nodes[entry as usize].check_state.get() == CheckState::None {
            walk(nodes, entry, &mut stack, &mut cycles);
        }
    }

    cycles
}

fn walk(nodes: &[BundlerModule], index: u32, stack: &mut Vec<u32>, cycles: &mut Vec<Cycle>) {
    let node = &nodes[index as usize];
    node.check_state.set(CheckState::Entered);
    stack.push(index);

    for &child in &node.children {
        match nodes[child as usize].check_state.get() {
            CheckState::None => walk(nodes, child, stack, cycles),
            CheckState::Entered => {
                let start = stack.iter().position(|&i| i == child).unwrap_or(0);
                let mut path: Vec<u32> = stack[start..].to_vec();
                path.push(child);
                cycles.push(Cycle { path });
            }
            CheckState::Checked => {}
        }
    }

    stack.pop();
    node.check_state.set(CheckState::Checked);
}
