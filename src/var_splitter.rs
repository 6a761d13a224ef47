//! Local variable splitting.
//!
//! Obfuscated code reuses one local slot for unrelated variables, which makes a
//! decompiler merge them. Every load is paired with the stores that can reach
//! it, loads and stores that share a value are grouped, and each group gets a
//! slot of its own. Loads reached by a parameter's incoming value keep their
//! slot, together with the rest of their group.

use std::collections::{HashMap, HashSet};

use log::trace;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::Direction;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::insn::{Insn, InsnId, InstructionList};
use crate::opcodes;
use crate::pipeline::{StageContext, Transform};
use crate::program::{Code, MethodUnit, Program};

/// Outcome of splitting one method.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    /// Groups that received a fresh slot
    pub groups: usize,
    /// Instructions whose slot changed
    pub renumbered: usize,
    pub max_locals: u16,
    pub changed: bool,
}

/// Instruction-level flow graph. Node weights are the instructions, `None`
/// is the synthetic start node standing for the parameters' incoming values.
struct FlowGraph {
    graph: Graph<Option<InsnId>, ()>,
    start: NodeIndex,
    nodes: Vec<Option<NodeIndex>>,
}

impl FlowGraph {
    fn build(code: &Code) -> FlowGraph {
        let list = &code.instructions;
        let mut graph = Graph::new();
        let start = graph.add_node(None);
        let mut nodes = vec![None; list.capacity()];
        for id in list.iter() {
            nodes[id.index()] = Some(graph.add_node(Some(id)));
        }
        let node = |id: InsnId| nodes[id.index()];

        if let Some(first) = list.first().and_then(node) {
            graph.add_edge(start, first, ());
        }

        for id in list.iter() {
            let insn = list.get(id);
            let from = match node(id) {
                Some(from) => from,
                None => continue,
            };
            if !insn.is_terminal() {
                if let Some(next) = list.next(id).and_then(node) {
                    graph.add_edge(from, next, ());
                }
            }
            for target in insn.jump_targets() {
                if let Some(to) = node(target.id()) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        for range in &code.exception_ranges {
            let handler = match node(range.handler.id()) {
                Some(handler) => handler,
                None => continue,
            };
            let mut current = Some(range.start.id()).filter(|id| list.contains(*id));
            while let Some(id) = current {
                if id == range.end.id() {
                    break;
                }
                if let Some(from) = node(id) {
                    graph.add_edge(from, handler, ());
                }
                current = list.next(id);
            }
        }

        FlowGraph {
            graph,
            start,
            nodes,
        }
    }

    fn node(&self, id: InsnId) -> Option<NodeIndex> {
        self.nodes.get(id.index()).copied().flatten()
    }

    /// Stores to `var` that reach `load` without another store to `var` in
    /// between. `None` stands for the incoming parameter value.
    fn last_stores(&self, list: &InstructionList, load: NodeIndex, var: u16, first_local: u16) -> Vec<Option<InsnId>> {
        let mut stores = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![load];
        visited.insert(load);

        while let Some(node) = stack.pop() {
            for prev in self.graph.neighbors_directed(node, Direction::Incoming) {
                let stored = self.graph[prev].and_then(|id| list.get(id).stored_var());
                if stored == Some(var) {
                    stores.push(self.graph[prev]);
                } else if prev == self.start && var < first_local {
                    stores.push(None);
                } else if visited.insert(prev) {
                    stack.push(prev);
                }
            }
        }
        stores
    }
}

fn slot(insn: &Insn) -> Option<u16> {
    match insn {
        Insn::Var { var, .. } | Insn::Iinc { var, .. } => Some(*var),
        _ => None,
    }
}

fn set_slot(insn: &mut Insn, slot: u16) {
    match insn {
        Insn::Var { var, .. } | Insn::Iinc { var, .. } => *var = slot,
        _ => {}
    }
}

/// Gives every independent use of a local slot its own slot and updates `max_locals`.
pub fn split_variables(method: &MethodUnit, code: &mut Code) -> Result<Split> {
    let first_local = method.first_local_index();
    let flow = FlowGraph::build(code);
    let list = &code.instructions;

    let var_insns: Vec<InsnId> = list
        .iter()
        .filter(|id| {
            let insn = list.get(*id);
            insn.loaded_var().is_some() || insn.stored_var().is_some()
        })
        .collect();
    let dense: HashMap<InsnId, usize> = var_insns
        .iter()
        .enumerate()
        .map(|(index, id)| (*id, index))
        .collect();

    let mut groups = UnionFind::new(var_insns.len());
    let mut parameter_loads = vec![false; var_insns.len()];
    for (index, id) in var_insns.iter().enumerate() {
        let var = match list.get(*id).loaded_var() {
            Some(var) => var,
            None => continue,
        };
        let load = match flow.node(*id) {
            Some(load) => load,
            None => continue,
        };
        for store in flow.last_stores(list, load, var, first_local) {
            match store {
                None => parameter_loads[index] = true,
                Some(store) => {
                    groups.union(index, dense[&store]);
                }
            }
        }
    }

    // groups in order of their first instruction
    let mut order = Vec::new();
    let mut members: HashMap<usize, Vec<usize>> = HashMap::new();
    for index in 0..var_insns.len() {
        let root = groups.find_mut(index);
        members
            .entry(root)
            .or_insert_with(|| {
                order.push(root);
                Vec::new()
            })
            .push(index);
    }

    let mut next_slot = first_local;
    let mut renames = Vec::new();
    let mut split = Split::default();
    for root in order {
        let group = &members[&root];
        let mut original: Option<u16> = None;
        let mut parameter = false;
        let mut wide = false;
        for member in group {
            let insn = list.get(var_insns[*member]);
            parameter |= parameter_loads[*member];
            wide |= insn.opcode().map_or(false, opcodes::is_wide_var);
            if let Some(var) = slot(insn) {
                match original {
                    Some(first) if first != var => {
                        return Err(Error::MergedSlots {
                            method: method.to_string(),
                            first,
                            second: var,
                        })
                    }
                    _ => original = Some(var),
                }
            }
        }
        if parameter {
            continue;
        }

        for member in group {
            renames.push((var_insns[*member], next_slot));
        }
        split.groups += 1;
        next_slot = next_slot
            .checked_add(if wide { 2 } else { 1 })
            .ok_or_else(|| Error::Invariant(format!("{} needs more than 65535 local slots", method)))?;
    }

    for (id, new_slot) in renames {
        let insn = code.instructions.get_mut(id);
        if slot(insn) != Some(new_slot) {
            set_slot(insn, new_slot);
            split.renumbered += 1;
        }
    }

    split.changed = split.renumbered > 0 || code.max_locals != next_slot;
    code.max_locals = next_slot;
    split.max_locals = next_slot;
    if split.changed {
        trace!("{}: {} variable groups, max_locals={}", method, split.groups, next_slot);
    }
    Ok(split)
}

fn split_method(method: &mut MethodUnit) -> Result<Split> {
    match method.code.take() {
        Some(mut code) => {
            let result = split_variables(method, &mut code);
            method.code = Some(code);
            result
        }
        None => Ok(Split::default()),
    }
}

/// Splits every method in parallel. Each method is analysed on its own.
fn split_all(program: &mut Program, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    let mut methods: Vec<&mut MethodUnit> = program
        .methods_mut()
        .filter(|method| method.code.is_some())
        .collect();
    let results: Vec<Result<Split>> = methods.par_iter_mut().map(|method| split_method(method)).collect();

    let mut changed = false;
    for result in results {
        let split = result?;
        if split.changed {
            changed = true;
            ctx.stats.incr("changed_methods");
            ctx.stats.add("renumbered_insns", split.renumbered);
        }
    }
    Ok(changed)
}

pub static VARIABLE_SPLITTER: Transform = Transform {
    pass: Some(split_all),
    ..Transform::new("variable-splitter")
};
