//! Basic block graphs and the control-flow normalizer built on them.
//!
//! Normalizing a method removes unreachable instructions, lays the blocks out
//! in reverse post-order (jump targets explored before the fall-through path),
//! and then deletes `GOTO`s to the next instruction and unreferenced labels.
//! Methods with exception ranges only get the last two steps.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};
use crate::insn::{Insn, InsnId, InstructionList, Label};
use crate::opcodes::GOTO;
use crate::pipeline::{StageContext, Transform};
use crate::program::{Code, MethodUnit};

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum EdgeWeight {
    /// Branch to a jump target. The ordinal is the target's position among all
    /// targets of the block, so sorting edges gives jump-table order.
    Jump(usize),
    NonJump,
}

impl fmt::Display for EdgeWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Represents a single block of code up until its next label
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// Label the block starts with. Only the entry block has none.
    pub label: Option<Label>,
    /// Instructions contained within this BB, including its label
    pub instrs: Vec<InsnId>,
}

impl BasicBlock {
    fn last_real<'l>(&self, list: &'l InstructionList) -> Option<&'l Insn> {
        self.instrs
            .iter()
            .rev()
            .map(|id| list.get(*id))
            .find(|insn| insn.is_real())
    }

    /// Whether control never falls out of the bottom of this block.
    pub fn is_terminal(&self, list: &InstructionList) -> bool {
        self.last_real(list).map_or(false, Insn::is_terminal)
    }

    fn render(&self, list: &InstructionList) -> String {
        let mut text = String::new();
        for id in &self.instrs {
            text.push_str(&list.get(*id).to_string());
            text.push('\n');
        }
        text
    }
}

/// Block graph of one instruction list.
pub struct CodeGraph {
    pub root: NodeIndex,
    pub graph: Graph<BasicBlock, EdgeWeight>,
}

impl CodeGraph {
    /// Splits the list at every label. A block is linked to the block after it
    /// unless its last real instruction is terminal, and to every block one of
    /// its instructions jumps to.
    pub fn from_list(list: &InstructionList) -> CodeGraph {
        let mut graph = Graph::new();
        let root = graph.add_node(BasicBlock::default());
        let mut label_blocks: HashMap<Label, NodeIndex> = HashMap::new();
        let mut current = root;

        let mut block_for = |graph: &mut Graph<BasicBlock, EdgeWeight>, label: Label| {
            *label_blocks.entry(label).or_insert_with(|| {
                graph.add_node(BasicBlock {
                    label: Some(label),
                    instrs: Vec::new(),
                })
            })
        };

        for id in list.iter() {
            let insn = list.get(id);
            if insn.is_label() {
                let next = block_for(&mut graph, Label(id));
                if !graph[current].is_terminal(list) {
                    graph.add_edge(current, next, EdgeWeight::NonJump);
                }
                current = next;
            }

            graph[current].instrs.push(id);

            for target in insn.jump_targets() {
                let ordinal = graph
                    .edges(current)
                    .filter(|edge| matches!(edge.weight(), EdgeWeight::Jump(_)))
                    .count();
                let target = block_for(&mut graph, target);
                graph.add_edge(current, target, EdgeWeight::Jump(ordinal));
            }
        }

        CodeGraph { root, graph }
    }

    /// Successors with jump targets in table order and the fall-through block last.
    fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut targets: Vec<(EdgeWeight, NodeIndex)> = self
            .graph
            .edges(node)
            .map(|edge| (*edge.weight(), edge.target()))
            .collect();

        // Sort the targets so that the non-branch path is last
        targets.sort_by(|(aweight, _a), (bweight, _b)| aweight.cmp(bweight));
        targets.into_iter().map(|(_weight, target)| target).collect()
    }

    pub fn fallthrough(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .edges(node)
            .find(|edge| *edge.weight() == EdgeWeight::NonJump)
            .map(|edge| edge.target())
    }

    /// Depth-first post-order from the root, reversed. Blocks the root cannot
    /// reach are left out.
    pub fn ordered_blocks(&self) -> Vec<NodeIndex> {
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(self.graph.node_count());
        let mut stack = vec![(self.root, self.successors(self.root), 0usize)];
        visited.insert(self.root);

        loop {
            let (node, child) = match stack.last_mut() {
                None => break,
                Some((node, children, next)) => {
                    let child = children.get(*next).copied();
                    *next += 1;
                    (*node, child)
                }
            };
            match child {
                Some(child) => {
                    if visited.insert(child) {
                        stack.push((child, self.successors(child), 0));
                    }
                }
                None => {
                    order.push(node);
                    stack.pop();
                }
            }
        }

        order.reverse();
        order
    }

    /// Renders the graph in dot format.
    pub fn to_dot(&self, list: &InstructionList) -> String {
        use petgraph::dot::{Config, Dot};

        let rendered = self.graph.map(|_, block| block.render(list), |_, weight| *weight);
        format!("{}", Dot::with_config(&rendered, &[Config::EdgeNoLabel]))
    }

    pub fn write_dot(&self, list: &InstructionList, path: &Path) -> Result<()> {
        let mut file = File::create(path).map_err(|err| Error::io(path, err))?;
        file.write_all(self.to_dot(list).as_bytes())
            .map_err(|err| Error::io(path, err))
    }
}

fn exception_labels(code: &Code) -> HashSet<InsnId> {
    code.exception_ranges
        .iter()
        .flat_map(|range| range.labels())
        .map(Label::id)
        .collect()
}

/// Deletes every instruction that cannot be reached from the method entry or an
/// exception handler. Labels bounding exception ranges stay. Returns the number
/// of removed instructions.
pub fn remove_unreachable(code: &mut Code) -> usize {
    let protected = exception_labels(code);
    let list = &mut code.instructions;
    let first = match list.first() {
        Some(first) => first,
        None => return 0,
    };

    let mut visited = vec![false; list.capacity()];
    let mut queue = VecDeque::new();
    queue.push_back(first);
    queue.extend(code.exception_ranges.iter().map(|range| range.handler.id()));

    while let Some(id) = queue.pop_front() {
        if visited[id.index()] {
            continue;
        }
        visited[id.index()] = true;

        let insn = list.get(id);
        if !insn.is_terminal() {
            if let Some(next) = list.next(id) {
                queue.push_back(next);
            }
        }
        queue.extend(insn.jump_targets().into_iter().map(Label::id));
    }

    list.remove_if(|id, _| !visited[id.index()] && !protected.contains(&id))
}

/// Reorders the blocks of a list without exception ranges. A block whose
/// fall-through block is no longer placed right after it gets a `GOTO` there,
/// and the target block gets a head label if it lacks one.
pub fn sort_blocks(list: &mut InstructionList) -> CodeGraph {
    let graph = CodeGraph::from_list(list);
    let order: Vec<NodeIndex> = graph
        .ordered_blocks()
        .into_iter()
        .filter(|node| !graph.graph[*node].instrs.is_empty())
        .collect();

    let mut detached = HashMap::new();
    for (position, node) in order.iter().enumerate() {
        if graph.graph[*node].is_terminal(list) {
            continue;
        }
        if let Some(next) = graph.fallthrough(*node) {
            if order.get(position + 1) != Some(&next) {
                detached.insert(*node, next);
            }
        }
    }

    let mut heads = HashMap::with_capacity(detached.len());
    for next in detached.values() {
        let label = match graph.graph[*next].label {
            Some(label) => label,
            None => list.create_label(),
        };
        heads.insert(*next, label);
    }

    let mut sequence = Vec::with_capacity(list.len() + detached.len() * 2);
    for node in &order {
        let block = &graph.graph[*node];
        if block.label.is_none() {
            if let Some(label) = heads.get(node) {
                sequence.push(label.id());
            }
        }
        sequence.extend(block.instrs.iter().copied());

        if let Some(next) = detached.get(node) {
            let jump = list.create(Insn::Jump {
                opcode: GOTO,
                target: heads[next],
            });
            sequence.push(jump);
        }
    }

    list.relink(&sequence);
    graph
}

/// Removes every `GOTO` whose target is the next real instruction.
pub fn remove_redundant_gotos(list: &mut InstructionList) -> usize {
    let mut removed = 0;
    let mut current = list.first();
    while let Some(id) = current {
        current = list.next(id);
        if let Insn::Jump {
            opcode: GOTO,
            target,
        } = list.get(id)
        {
            let following = list.next(id).and_then(|next| list.next_real(next));
            if following.is_some() && following == list.next_real(target.id()) {
                list.remove(id);
                removed += 1;
            }
        }
    }
    removed
}

/// Removes labels referenced neither by an instruction nor by an exception range.
pub fn remove_unused_labels(code: &mut Code) -> usize {
    let mut used = exception_labels(code);
    let list = &mut code.instructions;
    for id in list.iter() {
        used.extend(list.get(id).jump_targets().into_iter().map(Label::id));
    }
    list.remove_if(|id, insn| insn.is_label() && !used.contains(&id))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Normalized {
    pub unreachable: usize,
    pub gotos: usize,
    pub labels: usize,
    pub sorted: bool,
}

/// Runs the whole normalizer over one method body.
pub fn normalize(code: &mut Code) -> Normalized {
    let mut result = Normalized::default();
    if code.exception_ranges.is_empty() {
        result.unreachable = remove_unreachable(code);
        sort_blocks(&mut code.instructions);
        result.sorted = true;
    }
    result.gotos = remove_redundant_gotos(&mut code.instructions);
    result.labels = remove_unused_labels(code);
    result
}

fn graph_path(dir: &Path, method: &MethodUnit) -> PathBuf {
    let name: String = format!("{}.{}{}", method.owner, method.name, method.descriptor)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect();
    dir.join(format!("{}.dot", name))
}

fn unreachable_code(method: &MethodUnit, code: &mut Code, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    let removed = remove_unreachable(code);
    if removed > 0 {
        trace!("{}: removed {} unreachable instructions", method, removed);
        ctx.stats.add("removed_insns", removed);
    }
    Ok(removed > 0)
}

fn redundant_goto(method: &MethodUnit, code: &mut Code, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    if let Some(dir) = ctx.settings.graphs_dir.as_ref().filter(|_| !ctx.settings.dry) {
        CodeGraph::from_list(&code.instructions).write_dot(&code.instructions, &graph_path(dir, method))?;
    }

    let before = code.instructions.shape();
    let result = normalize(code);
    let changed = code.instructions.shape() != before;

    ctx.stats.add("removed_insns", result.unreachable);
    ctx.stats.add("removed_gotos", result.gotos);
    ctx.stats.add("removed_labels", result.labels);
    if changed {
        debug!("{}: normalized {:?}", method, result);
        ctx.stats.incr("changed_methods");
    }
    Ok(changed)
}

pub static UNREACHABLE_CODE: Transform = Transform {
    code: Some(unreachable_code),
    ..Transform::new("unreachable-code")
};

pub static REDUNDANT_GOTO: Transform = Transform {
    code: Some(redundant_goto),
    ..Transform::new("redundant-goto")
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::tests::mnemonics;
    use crate::opcodes::*;
    use crate::program::ExceptionRange;

    fn jump(opcode: u8, target: Label) -> Insn {
        Insn::Jump { opcode, target }
    }

    fn code(list: InstructionList) -> Code {
        Code {
            instructions: list,
            ..Code::default()
        }
    }

    #[test]
    fn subroutine_returns_end_reachability() {
        let mut list = InstructionList::new();
        let sub = list.create_label();
        list.push(jump(JSR, sub));
        list.push(Insn::Simple(RETURN));
        list.append(sub.id());
        list.push(Insn::Var { opcode: ASTORE, var: 1 });
        list.push(Insn::Var { opcode: RET, var: 1 });
        list.push(Insn::Simple(NOP));

        let mut code = code(list);
        assert_eq!(remove_unreachable(&mut code), 1);
        assert_eq!(
            mnemonics(&code.instructions),
            vec!["JSR", "RETURN", "LABEL", "ASTORE", "RET"]
        );
    }

    #[test]
    fn blocks_follow_labels_and_jumps() {
        let mut list = InstructionList::new();
        let else_label = list.create_label();
        let end = list.create_label();
        list.push(Insn::Var { opcode: ILOAD, var: 0 });
        list.push(jump(IFEQ, else_label));
        list.push(Insn::Simple(ICONST_1));
        list.push(jump(GOTO, end));
        list.append(else_label.id());
        list.push(Insn::Simple(ICONST_2));
        list.append(end.id());
        list.push(Insn::Simple(IRETURN));

        let graph = CodeGraph::from_list(&list);
        assert_eq!(graph.graph.node_count(), 3);
        assert_eq!(graph.successors(graph.root).len(), 2);
        assert_eq!(graph.fallthrough(graph.root), None);
        let order = graph.ordered_blocks();
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], graph.root);
        assert_eq!(graph.graph[order[1]].label, Some(else_label));
        assert_eq!(graph.fallthrough(order[1]), Some(order[2]));
        assert!(graph.to_dot(&list).contains("digraph"));
    }

    #[test]
    fn scrambled_blocks_are_put_back_in_order() {
        let mut list = InstructionList::new();
        let exit = list.create_label();
        let body = list.create_label();
        list.push(jump(GOTO, body));
        list.append(exit.id());
        list.push(Insn::Simple(ICONST_2));
        list.push(Insn::Simple(IRETURN));
        list.append(body.id());
        list.push(Insn::Var { opcode: ILOAD, var: 0 });
        list.push(jump(IFEQ, exit));
        list.push(Insn::Simple(ICONST_1));
        list.push(Insn::Simple(IRETURN));

        let mut code = code(list);
        let result = normalize(&mut code);
        assert_eq!(result.gotos, 1);
        assert_eq!(
            mnemonics(&code.instructions),
            vec!["ILOAD", "IFEQ", "ICONST_1", "IRETURN", "LABEL", "ICONST_2", "IRETURN"]
        );
    }

    #[test]
    fn normalizing_twice_changes_nothing() {
        let mut list = InstructionList::new();
        let exit = list.create_label();
        let body = list.create_label();
        let tail = list.create_label();
        list.push(jump(GOTO, body));
        list.append(tail.id());
        list.push(Insn::Simple(ICONST_0));
        list.push(Insn::Simple(IRETURN));
        list.append(exit.id());
        list.push(Insn::Simple(ICONST_2));
        list.push(jump(GOTO, tail));
        list.append(body.id());
        list.push(Insn::Var { opcode: ILOAD, var: 0 });
        list.push(Insn::TableSwitch {
            low: 0,
            high: 1,
            default: tail,
            targets: vec![exit, tail],
        });

        let mut code = code(list);
        normalize(&mut code);
        let once = code.instructions.shape();
        let second = normalize(&mut code);
        assert_eq!(code.instructions.shape(), once);
        assert_eq!(second.unreachable + second.gotos + second.labels, 0);
    }

    #[test]
    fn blocks_behind_dead_jumps_are_removed() {
        let mut list = InstructionList::new();
        let dead = list.create_label();
        let dead_target = list.create_label();
        let live = list.create_label();
        list.push(jump(GOTO, live));
        list.append(dead.id());
        list.push(Insn::Simple(ICONST_5));
        list.push(jump(GOTO, dead_target));
        list.append(dead_target.id());
        list.push(Insn::Simple(ICONST_4));
        list.push(Insn::Simple(IRETURN));
        list.append(live.id());
        list.push(Insn::Simple(ICONST_1));
        list.push(Insn::Simple(IRETURN));

        let mut code = code(list);
        assert_eq!(remove_unreachable(&mut code), 6);
        for id in code.instructions.iter() {
            for target in code.instructions.get(id).jump_targets() {
                assert!(code.instructions.contains(target.id()));
            }
        }
        normalize(&mut code);
        assert_eq!(mnemonics(&code.instructions), vec!["ICONST_1", "IRETURN"]);
    }

    #[test]
    fn exception_labels_survive_cleanup() {
        let mut list = InstructionList::new();
        let start = list.push_label();
        list.push(Insn::Simple(NOP));
        let next = list.create_label();
        list.push(jump(GOTO, next));
        list.append(next.id());
        let end = list.push_label();
        list.push_label();
        list.push(Insn::Simple(RETURN));
        let handler = list.push_label();
        list.push(Insn::Simple(ATHROW));

        let mut code = code(list);
        code.exception_ranges.push(ExceptionRange {
            start,
            end,
            handler,
            catch_type: None,
        });
        let result = normalize(&mut code);
        assert!(!result.sorted);
        assert_eq!(result.gotos, 1);
        assert_eq!(result.labels, 2);
        assert_eq!(
            mnemonics(&code.instructions),
            vec!["LABEL", "NOP", "LABEL", "RETURN", "LABEL", "ATHROW"]
        );
        for label in &[start, end, handler] {
            assert!(code.instructions.contains(label.id()));
        }
    }

    #[test]
    fn exception_ranges_keep_block_order() {
        let mut list = InstructionList::new();
        let start = list.push_label();
        let body = list.create_label();
        let exit = list.create_label();
        list.push(jump(GOTO, body));
        list.append(exit.id());
        list.push(Insn::Simple(RETURN));
        list.append(body.id());
        list.push(Insn::Simple(NOP));
        list.push(jump(GOTO, exit));
        let end = list.push_label();
        let handler = end;
        list.push(Insn::Simple(ATHROW));

        let mut code = code(list);
        code.exception_ranges.push(ExceptionRange {
            start,
            end,
            handler,
            catch_type: Some("java/lang/RuntimeException".to_string()),
        });
        let before = mnemonics(&code.instructions);
        normalize(&mut code);
        assert_eq!(mnemonics(&code.instructions), before);
    }

    #[test]
    fn goto_next_is_dropped() {
        let mut list = InstructionList::new();
        let next = list.create_label();
        list.push(jump(GOTO, next));
        list.push(Insn::Line(3));
        list.append(next.id());
        list.push(Insn::Simple(RETURN));
        assert_eq!(remove_redundant_gotos(&mut list), 1);
        assert_eq!(mnemonics(&list), vec!["LINE 3", "LABEL", "RETURN"]);
    }
}
