//! Symbol remapping.
//!
//! Obfuscated classes, fields and methods get stable generated names
//! (`classN`, `fieldN`, `methodN`). Members that override or inherit each other
//! are linked through the class hierarchy and always receive the same name. The
//! name table seeds and records every assignment, so a later run on the same
//! input reproduces it exactly. Table entries may also move a static member to
//! another class.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use log::{debug, info, warn};
use petgraph::unionfind::UnionFind;

use crate::error::{Error, Result};
use crate::insn::Insn;
use crate::name_table::{Mapping, NameTable};
use crate::pipeline::{Settings, StageContext, Transform};
use crate::program::{descriptor, AccessFlags, Annotation, Code, Constant, ElementValue, MemberRef, Program};

/// Annotation recording the name a member had in the obfuscated build.
pub const OBFUSCATED_NAME: &str = "LObfuscatedName;";

const LEGITIMATE_SHORT_NAMES: &[&str] = &["run", "add", "put", "get", "set", "uid", "dns"];

/// One to three ASCII letters, minus a few real method names.
pub fn short_meaningless(name: &str) -> bool {
    (1..=3).contains(&name.len())
        && name.bytes().all(|b| b.is_ascii_alphabetic())
        && !LEGITIMATE_SHORT_NAMES.contains(&name)
}

/// [`short_meaningless`], or an eight letter all-uppercase name.
pub fn obfuscated_class(name: &str) -> bool {
    let shouted = name.len() == 8 && name.bytes().all(|b| b.is_ascii_uppercase());
    shouted || short_meaningless(name)
}

/// Decides which names look obfuscated. Class predicates receive the simple
/// name, without the package.
#[derive(Clone, Copy)]
pub struct NamePolicy {
    pub class: fn(&str) -> bool,
    pub field: fn(&str) -> bool,
    pub method: fn(&str) -> bool,
}

impl Default for NamePolicy {
    fn default() -> Self {
        NamePolicy {
            class: obfuscated_class,
            field: short_meaningless,
            method: short_meaningless,
        }
    }
}

impl fmt::Debug for NamePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamePolicy").finish_non_exhaustive()
    }
}

fn simple_name(class: &str) -> &str {
    &class[class.rfind('/').map_or(0, |pos| pos + 1)..]
}

/// Whether `name` is one the remapper generates, such as `method12` for the
/// `method` prefix.
pub fn generated_name(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .map_or(false, |counter| !counter.is_empty() && counter.bytes().all(|b| b.is_ascii_digit()))
}

/// Simple name an `InnerClasses` entry records for `class`.
pub fn inner_simple_name(class: &str) -> &str {
    let simple = simple_name(class);
    &simple[simple.rfind('$').map_or(0, |pos| pos + 1)..]
}

/// Source file name a compiler would record for `class`: the outermost class
/// of a nest names the file.
pub fn source_file_name(class: &str) -> String {
    let simple = simple_name(class);
    let outer = simple.split('$').next().unwrap_or(simple);
    format!("{}.java", outer)
}

/// Name recorded by an `ObfuscatedName` annotation, if any.
pub fn original_name(annotations: &[Annotation]) -> Option<&str> {
    annotations
        .iter()
        .find(|annotation| annotation.descriptor == OBFUSCATED_NAME)
        .and_then(|annotation| annotation.string_value("value"))
}

/// Every class of the program with the program classes it inherits from,
/// itself included, in breadth-first order.
pub fn inheritance(program: &Program) -> HashMap<&str, Vec<&str>> {
    let known: HashMap<&str, usize> = program
        .classes
        .iter()
        .enumerate()
        .map(|(index, class)| (class.name.as_str(), index))
        .collect();

    let mut closure = HashMap::with_capacity(program.classes.len());
    for class in &program.classes {
        let mut seen = HashSet::new();
        let mut ancestors = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(class.name.as_str());
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name) {
                continue;
            }
            if let Some(index) = known.get(name) {
                ancestors.push(name);
                queue.extend(program.classes[*index].supertypes());
            }
        }
        closure.insert(class.name.as_str(), ancestors);
    }
    closure
}

/// Members linked through inheritance. A member inherited by a class is also
/// reachable under that class's name (`Sub.field` for a field declared in
/// `Super`), so both references share one group.
#[derive(Debug)]
pub struct MemberGroups {
    index: HashMap<MemberRef, usize>,
    group_of: Vec<usize>,
    members: HashMap<usize, Vec<MemberRef>>,
}

impl MemberGroups {
    pub fn compute(program: &Program) -> MemberGroups {
        let closure = inheritance(program);
        let mut index: HashMap<MemberRef, usize> = HashMap::new();
        let mut intern = |member: MemberRef| {
            let next = index.len();
            *index.entry(member).or_insert(next)
        };

        let mut links = Vec::new();
        for class in &program.classes {
            for field in &class.fields {
                intern(field.key());
            }
            for method in &class.methods {
                intern(method.key());
            }
        }
        for class in &program.classes {
            for ancestor in &closure[class.name.as_str()] {
                let ancestor = match program.class(ancestor) {
                    Some(ancestor) if ancestor.name != class.name => ancestor,
                    _ => continue,
                };
                let fields = ancestor
                    .fields
                    .iter()
                    .filter(|field| !field.access.contains(AccessFlags::PRIVATE))
                    .map(|field| field.key());
                let methods = ancestor
                    .methods
                    .iter()
                    .filter(|method| !method.access.contains(AccessFlags::PRIVATE) && !method.is_constructor())
                    .map(|method| method.key());
                for inherited in fields.chain(methods) {
                    let through = inherited.with_owner(&class.name);
                    links.push((intern(inherited), intern(through)));
                }
            }
        }

        let mut sets = UnionFind::new(index.len());
        for (a, b) in links {
            sets.union(a, b);
        }
        let group_of = sets.into_labeling();
        let mut members: HashMap<usize, Vec<MemberRef>> = HashMap::new();
        for (member, index) in &index {
            members.entry(group_of[*index]).or_default().push(member.clone());
        }
        for group in members.values_mut() {
            group.sort();
        }
        MemberGroups {
            index,
            group_of,
            members,
        }
    }

    /// Group of `member`, if the program declares or inherits it.
    pub fn group(&self, member: &MemberRef) -> Option<usize> {
        self.index.get(member).map(|index| self.group_of[*index])
    }

    /// Every reference in the group of `member`, `member` itself included.
    pub fn linked<'a>(&'a self, member: &'a MemberRef) -> Vec<&'a MemberRef> {
        match self.group(member).and_then(|group| self.members.get(&group)) {
            Some(group) => group.iter().collect(),
            None => vec![member],
        }
    }
}

/// A rename of classes and members, applied to the whole program at once.
#[derive(Debug, Default, Clone)]
pub struct Remapping {
    classes: HashMap<String, String>,
    members: HashMap<MemberRef, MemberRef>,
}

impl Remapping {
    pub fn rename_class(&mut self, old: &str, new: &str) {
        if old != new {
            self.classes.insert(old.to_string(), new.to_string());
        }
    }

    /// Maps a member reference. `new` is the complete target reference, with
    /// its owner and descriptor already remapped.
    pub fn map_member(&mut self, old: MemberRef, new: MemberRef) {
        self.members.insert(old, new);
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.members.is_empty()
    }

    pub fn class<'a>(&'a self, name: &'a str) -> &'a str {
        self.classes.get(name).map_or(name, String::as_str)
    }

    pub fn descriptor(&self, desc: &str) -> String {
        descriptor::map_classes(desc, |class| self.classes.get(class).cloned())
    }

    fn class_operand(&self, class: &str) -> String {
        descriptor::map_class_operand(class, |class| self.classes.get(class).cloned())
    }

    pub fn member(&self, member: &MemberRef) -> MemberRef {
        match self.members.get(member) {
            Some(mapped) => mapped.clone(),
            None => MemberRef::new(
                self.class(&member.owner),
                member.name.as_str(),
                self.descriptor(&member.descriptor),
            ),
        }
    }

    /// Rewrites every declaration and every reference in one pass.
    pub fn apply(&self, program: &mut Program) {
        for class in &mut program.classes {
            class.name = self.class(&class.name).to_string();
            if let Some(super_name) = &mut class.super_name {
                *super_name = self.class(super_name).to_string();
            }
            for interface in &mut class.interfaces {
                *interface = self.class(interface).to_string();
            }
            for inner in &mut class.inner_classes {
                if let Some(renamed) = self.classes.get(&inner.inner) {
                    if inner.name.is_some() {
                        inner.name = Some(inner_simple_name(renamed).to_string());
                    }
                    inner.inner = renamed.clone();
                }
                if let Some(outer) = &mut inner.outer {
                    *outer = self.class(outer).to_string();
                }
            }
            self.annotations(&mut class.annotations);

            for field in &mut class.fields {
                let mapped = self.member(&field.key());
                field.name = mapped.name;
                field.descriptor = mapped.descriptor;
                field.owner = class.name.clone();
                self.annotations(&mut field.annotations);
            }
            for method in &mut class.methods {
                let mapped = self.member(&method.key());
                method.name = mapped.name;
                method.descriptor = mapped.descriptor;
                method.owner = class.name.clone();
                for exception in &mut method.exceptions {
                    *exception = self.class(exception).to_string();
                }
                self.annotations(&mut method.annotations);
                if let Some(code) = &mut method.code {
                    self.code(code);
                }
            }
        }
    }

    fn code(&self, code: &mut Code) {
        for id in code.instructions.ids() {
            match code.instructions.get_mut(id) {
                Insn::Type { class, .. } | Insn::MultiANewArray { class, .. } => {
                    *class = self.class_operand(class);
                }
                Insn::Field { member, .. } | Insn::Method { member, .. } => {
                    *member = self.member(member);
                }
                Insn::Ldc(constant) => self.constant(constant),
                Insn::InvokeDynamic(call) => call.descriptor = self.descriptor(&call.descriptor),
                _ => {}
            }
        }
        for range in &mut code.exception_ranges {
            if let Some(catch_type) = &mut range.catch_type {
                *catch_type = self.class(catch_type).to_string();
            }
        }
    }

    fn constant(&self, constant: &mut Constant) {
        match constant {
            Constant::Class(class) => *class = self.class_operand(class),
            Constant::MethodType(desc) | Constant::Dynamic { descriptor: desc, .. } => {
                *desc = self.descriptor(desc);
            }
            Constant::MethodHandle { member, .. } => *member = self.member(member),
            _ => {}
        }
    }

    fn annotations(&self, annotations: &mut [Annotation]) {
        for annotation in annotations {
            self.annotation(annotation);
        }
    }

    fn annotation(&self, annotation: &mut Annotation) {
        annotation.descriptor = self.descriptor(&annotation.descriptor);
        for (_, value) in &mut annotation.values {
            self.element(value);
        }
    }

    fn element(&self, value: &mut ElementValue) {
        match value {
            ElementValue::Enum { type_name, .. } => *type_name = self.descriptor(type_name),
            ElementValue::Class(desc) => *desc = self.descriptor(desc),
            ElementValue::Annotation(annotation) => self.annotation(annotation),
            ElementValue::Array(values) => {
                for value in values {
                    self.element(value);
                }
            }
            ElementValue::Const { .. } => {}
        }
    }
}

/// Moves member declarations into other classes (`target` is the class name
/// before any rename). Only static members move; a non-static member aborts
/// the whole relocation before anything is touched. Moves into classes the
/// program does not contain are reported and skipped.
pub fn relocate(program: &mut Program, moves: &[(MemberRef, String)]) -> Result<usize> {
    let mut valid = Vec::with_capacity(moves.len());
    for (member, target) in moves {
        if program.class(target).is_none() {
            warn!("Relocation target {} of {} does not exist, skipping", target, member);
            continue;
        }
        let owner = match program.class(&member.owner) {
            Some(owner) => owner,
            None => continue,
        };
        let is_static = if member.descriptor.starts_with('(') {
            owner.method(&member.name, &member.descriptor).map(|method| method.is_static())
        } else {
            owner.field(&member.name, &member.descriptor).map(|field| field.is_static())
        };
        match is_static {
            Some(true) => valid.push((member, target)),
            Some(false) => {
                return Err(Error::NonStaticRelocation {
                    member: member.to_string(),
                })
            }
            None => debug!("{} is not declared in the program, nothing to move", member),
        }
    }

    let mut moved = 0;
    for (member, target) in valid {
        if member.owner == *target {
            continue;
        }
        let owner = match program.class_mut(&member.owner) {
            Some(owner) => owner,
            None => continue,
        };
        if member.descriptor.starts_with('(') {
            let position = owner
                .methods
                .iter()
                .position(|method| method.name == member.name && method.descriptor == member.descriptor);
            if let Some(position) = position {
                let method = owner.methods.remove(position);
                if let Some(target) = program.class_mut(target) {
                    target.methods.push(method);
                    moved += 1;
                }
            }
        } else {
            let position = owner
                .fields
                .iter()
                .position(|field| field.name == member.name && field.descriptor == member.descriptor);
            if let Some(position) = position {
                let field = owner.fields.remove(position);
                if let Some(target) = program.class_mut(target) {
                    target.fields.push(field);
                    moved += 1;
                }
            }
        }
    }
    Ok(moved)
}

/// What a remap changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemapSummary {
    pub classes: usize,
    pub fields: usize,
    pub methods: usize,
    pub relocated: usize,
    pub new_entries: usize,
}

impl RemapSummary {
    pub fn changed(&self) -> bool {
        self.classes + self.fields + self.methods + self.relocated > 0
    }
}

struct Counters {
    class: usize,
    field: usize,
    method: usize,
}

/// Renames the program through `table`, adding entries for every obfuscated
/// name the table does not know yet.
pub fn remap(program: &mut Program, table: &mut NameTable, settings: &Settings) -> Result<RemapSummary> {
    let policy = settings.name_policy;
    let before = table.len();
    let mut counters = Counters {
        class: table.highest_counter("class"),
        field: table.highest_counter("field"),
        method: table.highest_counter("method"),
    };
    let mut summary = RemapSummary::default();
    let mut remapping = Remapping::default();

    // table keys use the names of the obfuscated build
    let mut class_keys = HashMap::new();
    for class in &program.classes {
        let key = original_name(&class.annotations).unwrap_or(&class.name).to_string();
        let new_name = match table.get(&key) {
            Some(mapping) => mapping.name().to_string(),
            None if (policy.class)(simple_name(&key)) => {
                counters.class += 1;
                let package = &class.name[..class.name.rfind('/').map_or(0, |pos| pos + 1)];
                let fresh = format!("{}class{}", package, counters.class);
                table.insert(key.clone(), Mapping::Rename(fresh.clone()));
                fresh
            }
            None => class.name.clone(),
        };
        let new_name = if new_name.contains('/') {
            new_name
        } else {
            format!("{}/{}", settings.default_package, new_name)
        };
        if new_name != class.name {
            summary.classes += 1;
            remapping.rename_class(&class.name, &new_name);
        }
        class_keys.insert(class.name.clone(), key);
    }

    let by_new_name: HashMap<String, String> = program
        .classes
        .iter()
        .map(|class| (remapping.class(&class.name).to_string(), class.name.clone()))
        .collect();

    let groups = MemberGroups::compute(program);
    let mut decided: HashMap<usize, Option<Mapping>> = HashMap::new();
    let mut moves = Vec::new();
    for class in &program.classes {
        let owner_key = &class_keys[&class.name];
        let fields = class.fields.iter().map(|field| {
            let name = original_name(&field.annotations).unwrap_or(&field.name);
            let key = format!("{}.{}:{}", owner_key, name, field.descriptor);
            (field.key(), name, key, policy.field)
        });
        let methods = class
            .methods
            .iter()
            .filter(|method| !method.is_constructor() && !method.is_initializer())
            .map(|method| {
                let name = original_name(&method.annotations).unwrap_or(&method.name);
                let key = format!("{}.{}{}", owner_key, name, method.descriptor);
                (method.key(), name, key, policy.method)
            });

        for (member, name, key, obfuscated) in fields.chain(methods) {
            let group = match groups.group(&member) {
                Some(group) => group,
                None => continue,
            };
            if decided.contains_key(&group) {
                continue;
            }
            let is_method = member.descriptor.starts_with('(');
            let mapping = match table.get(&key) {
                Some(mapping) => Some(mapping.clone()),
                None if obfuscated(name) => {
                    let fresh = if is_method {
                        counters.method += 1;
                        format!("method{}", counters.method)
                    } else {
                        counters.field += 1;
                        format!("field{}", counters.field)
                    };
                    table.insert(key, Mapping::Rename(fresh.clone()));
                    Some(Mapping::Rename(fresh))
                }
                None => None,
            };

            if let Some(mapping) = &mapping {
                let target = match mapping.owner() {
                    Some(owner) => match by_new_name.get(owner) {
                        Some(old_owner) => {
                            moves.push((member.clone(), old_owner.clone()));
                            Some(owner)
                        }
                        None => {
                            warn!("Cannot move {} into unknown class {}", member, owner);
                            None
                        }
                    },
                    None => None,
                };
                if mapping.name() != member.name || target.is_some() {
                    if is_method {
                        summary.methods += 1;
                    } else {
                        summary.fields += 1;
                    }
                }
                for linked in groups.linked(&member) {
                    let owner = target.unwrap_or_else(|| remapping.class(&linked.owner)).to_string();
                    let mapped = MemberRef::new(owner, mapping.name(), remapping.descriptor(&linked.descriptor));
                    remapping.map_member(linked.clone(), mapped);
                }
            }
            decided.insert(group, mapping);
        }
    }

    let renamed: HashSet<String> = program
        .classes
        .iter()
        .filter(|class| remapping.class(&class.name) != class.name)
        .map(|class| remapping.class(&class.name).to_string())
        .collect();
    summary.relocated = relocate(program, &moves)?;
    remapping.apply(program);
    for class in program.classes.iter_mut().filter(|class| renamed.contains(&class.name)) {
        class.source_file = Some(source_file_name(&class.name));
    }
    summary.new_entries = table.len() - before;
    debug!(
        "Remapped {} classes, {} fields, {} methods; {} new name table entries",
        summary.classes, summary.fields, summary.methods, summary.new_entries
    );
    Ok(summary)
}

/// Per-run state of the remap stage.
#[derive(Debug, Default)]
pub struct RemapState {
    table: NameTable,
    done: bool,
}

fn load_table(program: &mut Program, ctx: &mut StageContext<'_, RemapState>) -> Result<bool> {
    if let Some(table) = program.name_table.take() {
        ctx.state.table = table;
    } else if let Some(path) = &ctx.settings.name_table {
        ctx.state.table = NameTable::read(path)?;
        info!("Loaded {} name table entries", ctx.state.table.len());
    }
    Ok(false)
}

fn remap_once(program: &mut Program, ctx: &mut StageContext<'_, RemapState>) -> Result<bool> {
    if ctx.state.done {
        return Ok(false);
    }
    ctx.state.done = true;
    let summary = remap(program, &mut ctx.state.table, ctx.settings)?;
    ctx.stats.add("renamed_classes", summary.classes);
    ctx.stats.add("renamed_fields", summary.fields);
    ctx.stats.add("renamed_methods", summary.methods);
    ctx.stats.add("relocated_members", summary.relocated);
    ctx.stats.add("new_table_entries", summary.new_entries);
    Ok(summary.changed())
}

/// Hands the updated table back to the program. The driver saves it after the
/// output jar, so a failed run leaves the file untouched.
fn keep_table(program: &mut Program, ctx: &mut StageContext<'_, RemapState>) -> Result<bool> {
    if ctx.settings.name_table.is_some() {
        program.name_table = Some(std::mem::take(&mut ctx.state.table));
    }
    Ok(false)
}

pub static REMAP: Transform<RemapState> = Transform {
    before_all: Some(load_table),
    pass: Some(remap_once),
    after_all: Some(keep_table),
    ..Transform::new("remap")
};
