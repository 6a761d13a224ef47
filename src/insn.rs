//! Mutable instruction lists.
//!
//! A method body is an arena of instruction nodes doubly linked through stable
//! [`InsnId`] handles. Nodes are never moved or reused once allocated, so a handle
//! stays valid (and keeps pointing at the same instruction) across insertions,
//! removals and reorderings. Labels are ordinary zero-width nodes; a [`Label`] is
//! the handle of such a node, which lets jumps, switch tables and exception ranges
//! refer to a position by identity.

use std::fmt;

use crate::opcodes;
use crate::program::{Constant, MemberRef};

/// Stable handle of a node in an [`InstructionList`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InsnId(pub(crate) u32);

impl InsnId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle of a label node. Jump operands, switch tables and exception ranges hold these.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(pub(crate) InsnId);

impl Label {
    pub fn id(self) -> InsnId {
        self.0
    }
}

/// Bootstrap information carried by an `INVOKEDYNAMIC` instruction. The bootstrap
/// method table is kept verbatim on the class, so only the index is needed here.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicCall {
    pub bootstrap: u16,
    pub name: String,
    pub descriptor: String,
}

/// A single instruction. Real instructions carry an opcode in canonical form
/// (no `ILOAD_0`, `LDC_W` or `GOTO_W` variants); `Label` and `Line` are pseudo
/// instructions with no opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    Label,
    Line(u16),
    Simple(u8),
    /// `BIPUSH`, `SIPUSH` and `NEWARRAY`
    Int { opcode: u8, operand: i32 },
    Var { opcode: u8, var: u16 },
    Iinc { var: u16, incr: i16 },
    Jump { opcode: u8, target: Label },
    Ldc(Constant),
    /// `NEW`, `ANEWARRAY`, `CHECKCAST` and `INSTANCEOF`
    Type { opcode: u8, class: String },
    Field { opcode: u8, member: MemberRef },
    Method {
        opcode: u8,
        member: MemberRef,
        interface: bool,
    },
    InvokeDynamic(DynamicCall),
    TableSwitch {
        low: i32,
        high: i32,
        default: Label,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
    MultiANewArray { class: String, dims: u8 },
}

impl Insn {
    /// Opcode of a real instruction, `None` for pseudo instructions.
    pub fn opcode(&self) -> Option<u8> {
        let opcode = match self {
            Insn::Label | Insn::Line(_) => return None,
            Insn::Simple(opcode)
            | Insn::Int { opcode, .. }
            | Insn::Var { opcode, .. }
            | Insn::Jump { opcode, .. }
            | Insn::Type { opcode, .. }
            | Insn::Field { opcode, .. }
            | Insn::Method { opcode, .. } => *opcode,
            Insn::Iinc { .. } => opcodes::IINC,
            Insn::Ldc(_) => opcodes::LDC,
            Insn::InvokeDynamic(_) => opcodes::INVOKEDYNAMIC,
            Insn::TableSwitch { .. } => opcodes::TABLESWITCH,
            Insn::LookupSwitch { .. } => opcodes::LOOKUPSWITCH,
            Insn::MultiANewArray { .. } => opcodes::MULTIANEWARRAY,
        };
        Some(opcode)
    }

    pub fn is_real(&self) -> bool {
        self.opcode().is_some()
    }

    pub fn is_label(&self) -> bool {
        matches!(self, Insn::Label)
    }

    /// Whether execution never falls through past this instruction.
    pub fn is_terminal(&self) -> bool {
        self.opcode().map_or(false, opcodes::is_terminal)
    }

    /// Every label this instruction may transfer control to, in operand order
    /// (switch cases first, default last).
    pub fn jump_targets(&self) -> Vec<Label> {
        match self {
            Insn::Jump { target, .. } => vec![*target],
            Insn::TableSwitch {
                default, targets, ..
            } => {
                let mut result = targets.clone();
                result.push(*default);
                result
            }
            Insn::LookupSwitch { default, pairs } => {
                let mut result: Vec<Label> = pairs.iter().map(|(_, label)| *label).collect();
                result.push(*default);
                result
            }
            _ => Vec::new(),
        }
    }

    /// Rewrites every label operand through `f`.
    pub fn map_labels(&mut self, mut f: impl FnMut(Label) -> Label) {
        match self {
            Insn::Jump { target, .. } => *target = f(*target),
            Insn::TableSwitch {
                default, targets, ..
            } => {
                *default = f(*default);
                for target in targets {
                    *target = f(*target);
                }
            }
            Insn::LookupSwitch { default, pairs } => {
                *default = f(*default);
                for (_, target) in pairs {
                    *target = f(*target);
                }
            }
            _ => {}
        }
    }

    /// Local slot read by this instruction (`IINC` both reads and writes, `RET`
    /// reads its return address).
    pub fn loaded_var(&self) -> Option<u16> {
        match self {
            Insn::Var { opcode, var } if opcodes::is_load(*opcode) || *opcode == opcodes::RET => Some(*var),
            Insn::Iinc { var, .. } => Some(*var),
            _ => None,
        }
    }

    /// Local slot written by this instruction.
    pub fn stored_var(&self) -> Option<u16> {
        match self {
            Insn::Var { opcode, var } if opcodes::is_store(*opcode) => Some(*var),
            Insn::Iinc { var, .. } => Some(*var),
            _ => None,
        }
    }

    /// Shortest instruction pushing `value`.
    pub fn push_int(value: i32) -> Insn {
        match value {
            -1..=5 => Insn::Simple((opcodes::ICONST_0 as i32 + value) as u8),
            -128..=127 => Insn::Int {
                opcode: opcodes::BIPUSH,
                operand: value,
            },
            -32768..=32767 => Insn::Int {
                opcode: opcodes::SIPUSH,
                operand: value,
            },
            _ => Insn::Ldc(Constant::Int(value)),
        }
    }

    /// Pushed integer value for `ICONST_*`, `BIPUSH`, `SIPUSH` and integer `LDC`.
    pub fn int_constant(&self) -> Option<i32> {
        match self {
            Insn::Simple(opcode) if (opcodes::ICONST_M1..=opcodes::ICONST_5).contains(opcode) => {
                Some(*opcode as i32 - opcodes::ICONST_0 as i32)
            }
            Insn::Int { opcode, operand }
                if *opcode == opcodes::BIPUSH || *opcode == opcodes::SIPUSH =>
            {
                Some(*operand)
            }
            Insn::Ldc(Constant::Int(value)) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Label => write!(f, "LABEL"),
            Insn::Line(line) => write!(f, "LINE {}", line),
            Insn::Simple(opcode) => write!(f, "{}", opcodes::mnemonic(*opcode)),
            Insn::Int { opcode, operand } => write!(f, "{} {}", opcodes::mnemonic(*opcode), operand),
            Insn::Var { opcode, var } => write!(f, "{} {}", opcodes::mnemonic(*opcode), var),
            Insn::Iinc { var, incr } => write!(f, "IINC {} {}", var, incr),
            Insn::Jump { opcode, target } => {
                write!(f, "{} L{}", opcodes::mnemonic(*opcode), target.0 .0)
            }
            Insn::Ldc(constant) => write!(f, "LDC {:?}", constant),
            Insn::Type { opcode, class } => write!(f, "{} {}", opcodes::mnemonic(*opcode), class),
            Insn::Field { opcode, member } | Insn::Method { opcode, member, .. } => {
                write!(f, "{} {}", opcodes::mnemonic(*opcode), member)
            }
            Insn::InvokeDynamic(call) => {
                write!(f, "INVOKEDYNAMIC {}{} #{}", call.name, call.descriptor, call.bootstrap)
            }
            Insn::TableSwitch { low, high, .. } => write!(f, "TABLESWITCH {}..={}", low, high),
            Insn::LookupSwitch { pairs, .. } => write!(f, "LOOKUPSWITCH ({} cases)", pairs.len()),
            Insn::MultiANewArray { class, dims } => write!(f, "MULTIANEWARRAY {} {}", class, dims),
        }
    }
}

/// Raw encoding an instruction was decoded from. The encoder reuses it when it
/// still agrees with the instruction so untouched code re-encodes unchanged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RawForm {
    pub opcode: u8,
    pub wide: bool,
    pub pool_index: Option<u16>,
}

#[derive(Debug, Clone)]
struct Node {
    insn: Insn,
    prev: Option<InsnId>,
    next: Option<InsnId>,
    linked: bool,
    raw: Option<RawForm>,
}

/// Doubly linked instruction sequence over an arena of nodes.
#[derive(Debug, Clone, Default)]
pub struct InstructionList {
    nodes: Vec<Node>,
    first: Option<InsnId>,
    last: Option<InsnId>,
    len: usize,
}

impl InstructionList {
    pub fn new() -> InstructionList {
        InstructionList::default()
    }

    /// Allocates a detached node. It joins the sequence once inserted.
    pub fn create(&mut self, insn: Insn) -> InsnId {
        let id = InsnId(self.nodes.len() as u32);
        self.nodes.push(Node {
            insn,
            prev: None,
            next: None,
            linked: false,
            raw: None,
        });
        id
    }

    /// Allocates a detached label.
    pub fn create_label(&mut self) -> Label {
        Label(self.create(Insn::Label))
    }

    /// Appends a new instruction and returns its handle.
    pub fn push(&mut self, insn: Insn) -> InsnId {
        let id = self.create(insn);
        self.append(id);
        id
    }

    /// Appends a new label.
    pub fn push_label(&mut self) -> Label {
        Label(self.push(Insn::Label))
    }

    pub fn append(&mut self, id: InsnId) {
        debug_assert!(!self.nodes[id.index()].linked);
        let node = &mut self.nodes[id.index()];
        node.prev = self.last;
        node.next = None;
        node.linked = true;
        match self.last {
            Some(last) => self.nodes[last.index()].next = Some(id),
            None => self.first = Some(id),
        }
        self.last = Some(id);
        self.len += 1;
    }

    pub fn insert_before(&mut self, at: InsnId, id: InsnId) {
        debug_assert!(self.nodes[at.index()].linked && !self.nodes[id.index()].linked);
        let prev = self.nodes[at.index()].prev;
        {
            let node = &mut self.nodes[id.index()];
            node.prev = prev;
            node.next = Some(at);
            node.linked = true;
        }
        self.nodes[at.index()].prev = Some(id);
        match prev {
            Some(prev) => self.nodes[prev.index()].next = Some(id),
            None => self.first = Some(id),
        }
        self.len += 1;
    }

    pub fn insert_after(&mut self, at: InsnId, id: InsnId) {
        debug_assert!(self.nodes[at.index()].linked && !self.nodes[id.index()].linked);
        let next = self.nodes[at.index()].next;
        {
            let node = &mut self.nodes[id.index()];
            node.prev = Some(at);
            node.next = next;
            node.linked = true;
        }
        self.nodes[at.index()].next = Some(id);
        match next {
            Some(next) => self.nodes[next.index()].prev = Some(id),
            None => self.last = Some(id),
        }
        self.len += 1;
    }

    /// Unlinks an instruction. Its handle stays valid but no longer belongs to the sequence.
    pub fn remove(&mut self, id: InsnId) {
        let node = &self.nodes[id.index()];
        if !node.linked {
            return;
        }
        let (prev, next) = (node.prev, node.next);
        match prev {
            Some(prev) => self.nodes[prev.index()].next = next,
            None => self.first = next,
        }
        match next {
            Some(next) => self.nodes[next.index()].prev = prev,
            None => self.last = prev,
        }
        let node = &mut self.nodes[id.index()];
        node.prev = None;
        node.next = None;
        node.linked = false;
        self.len -= 1;
    }

    /// Replaces the instruction behind a handle, keeping its position.
    pub fn replace(&mut self, id: InsnId, insn: Insn) {
        let node = &mut self.nodes[id.index()];
        node.insn = insn;
        node.raw = None;
    }

    /// Relinks the sequence to exactly `order`. Nodes not listed are unlinked.
    pub fn relink(&mut self, order: &[InsnId]) {
        for node in &mut self.nodes {
            node.prev = None;
            node.next = None;
            node.linked = false;
        }
        self.first = None;
        self.last = None;
        self.len = 0;
        for id in order {
            self.append(*id);
        }
    }

    pub fn get(&self, id: InsnId) -> &Insn {
        &self.nodes[id.index()].insn
    }

    pub fn get_mut(&mut self, id: InsnId) -> &mut Insn {
        &mut self.nodes[id.index()].insn
    }

    pub fn contains(&self, id: InsnId) -> bool {
        self.nodes.get(id.index()).map_or(false, |node| node.linked)
    }

    pub fn first(&self) -> Option<InsnId> {
        self.first
    }

    pub fn last(&self) -> Option<InsnId> {
        self.last
    }

    pub fn next(&self, id: InsnId) -> Option<InsnId> {
        self.nodes[id.index()].next
    }

    pub fn prev(&self, id: InsnId) -> Option<InsnId> {
        self.nodes[id.index()].prev
    }

    /// Number of linked instructions, pseudo instructions included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handles of the linked instructions in sequence order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            current: self.first,
        }
    }

    pub fn ids(&self) -> Vec<InsnId> {
        self.iter().collect()
    }

    /// First real instruction at or after `id`.
    pub fn next_real(&self, id: InsnId) -> Option<InsnId> {
        let mut current = Some(id);
        while let Some(candidate) = current {
            if self.get(candidate).is_real() {
                return Some(candidate);
            }
            current = self.next(candidate);
        }
        None
    }

    /// Last real instruction strictly before `id`.
    pub fn prev_real(&self, id: InsnId) -> Option<InsnId> {
        let mut current = self.prev(id);
        while let Some(candidate) = current {
            if self.get(candidate).is_real() {
                return Some(candidate);
            }
            current = self.prev(candidate);
        }
        None
    }

    /// Removes every linked instruction matching `predicate`, returning how many went.
    pub fn remove_if(&mut self, mut predicate: impl FnMut(InsnId, &Insn) -> bool) -> usize {
        let mut removed = 0;
        let mut current = self.first;
        while let Some(id) = current {
            current = self.next(id);
            if predicate(id, self.get(id)) {
                self.remove(id);
                removed += 1;
            }
        }
        removed
    }

    /// Position of every linked instruction, indexed by handle.
    pub fn positions(&self) -> Vec<Option<usize>> {
        let mut positions = vec![None; self.nodes.len()];
        for (position, id) in self.iter().enumerate() {
            positions[id.index()] = Some(position);
        }
        positions
    }

    /// Position-independent rendering of the sequence, with labels named by their
    /// order of appearance. Two lists with equal shapes encode to the same code.
    pub fn shape(&self) -> Vec<String> {
        let positions = self.positions();
        let name = |label: Label| match positions[label.id().index()] {
            Some(position) => format!("@{}", position),
            None => "@?".to_string(),
        };
        self.iter()
            .map(|id| {
                let insn = self.get(id);
                let targets = insn.jump_targets();
                if targets.is_empty() {
                    insn.to_string()
                } else {
                    let targets: Vec<String> = targets.into_iter().map(name).collect();
                    format!("{} -> {}", opcodes::mnemonic(insn.opcode().unwrap_or(0)), targets.join(","))
                }
            })
            .collect()
    }

    /// Number of node slots ever allocated, which bounds every handle's index.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn raw_form(&self, id: InsnId) -> Option<RawForm> {
        self.nodes[id.index()].raw
    }

    pub(crate) fn set_raw_form(&mut self, id: InsnId, raw: RawForm) {
        self.nodes[id.index()].raw = Some(raw);
    }
}

pub struct Iter<'a> {
    list: &'a InstructionList,
    current: Option<InsnId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = InsnId;

    fn next(&mut self) -> Option<InsnId> {
        let id = self.current?;
        self.current = self.list.next(id);
        Some(id)
    }
}
