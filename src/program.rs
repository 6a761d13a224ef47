//! In-memory program model: classes own their fields and methods, methods own
//! their instruction lists and exception ranges.

use std::fmt;

use bitflags::bitflags;

use crate::classfile::ConstantPool;
use crate::insn::{InstructionList, Label};
use crate::name_table::NameTable;

bitflags! {
    #[derive(Default)]
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        /// `ACC_SUPER` on classes, `ACC_SYNCHRONIZED` on methods
        const SUPER = 0x0020;
        /// `ACC_VOLATILE` on fields, `ACC_BRIDGE` on methods
        const VOLATILE = 0x0040;
        /// `ACC_TRANSIENT` on fields, `ACC_VARARGS` on methods
        const TRANSIENT = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;

        const VISIBILITY = Self::PUBLIC.bits | Self::PRIVATE.bits | Self::PROTECTED.bits;
    }
}

impl AccessFlags {
    /// Package-private: none of the visibility bits set.
    pub fn is_package(self) -> bool {
        !self.intersects(AccessFlags::VISIBILITY)
    }
}

/// Reference to a field or method, also used as the key of a member declaration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, descriptor: impl Into<String>) -> MemberRef {
        MemberRef {
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }

    /// Same member declared elsewhere.
    pub fn with_owner(&self, owner: &str) -> MemberRef {
        MemberRef {
            owner: owner.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} {}", self.owner, self.name, self.descriptor)
    }
}

/// Loadable constant, as pushed by `LDC` or stored in a `ConstantValue` attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Class(String),
    MethodType(String),
    MethodHandle {
        kind: u8,
        member: MemberRef,
        interface: bool,
    },
    Dynamic {
        bootstrap: u16,
        name: String,
        descriptor: String,
    },
}

impl Constant {
    /// Long and double constants occupy two stack and pool slots.
    pub fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

/// Annotation element value.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
    /// Primitive or string constant, with its tag character (`I`, `Z`, `s`, ...)
    Const { tag: u8, value: Constant },
    Enum { type_name: String, const_name: String },
    Class(String),
    Annotation(Annotation),
    Array(Vec<ElementValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub descriptor: String,
    pub visible: bool,
    pub values: Vec<(String, ElementValue)>,
}

impl Annotation {
    pub fn value(&self, name: &str) -> Option<&ElementValue> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// String value of the element `name`, if it is a string constant.
    pub fn string_value(&self, name: &str) -> Option<&str> {
        match self.value(name)? {
            ElementValue::Const {
                value: Constant::String(value),
                ..
            } => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InnerClass {
    pub inner: String,
    pub outer: Option<String>,
    pub name: Option<String>,
    pub access: AccessFlags,
}

/// Attribute kept as opaque bytes. Pool indices inside it stay valid because the
/// original constant pool is only ever appended to.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub data: Vec<u8>,
}

/// Half-open protected range `[start, end)` with its handler entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionRange {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// `None` catches everything
    pub catch_type: Option<String>,
}

impl ExceptionRange {
    pub fn labels(&self) -> [Label; 3] {
        [self.start, self.end, self.handler]
    }
}

/// Body of a non-abstract, non-native method.
#[derive(Debug, Clone, Default)]
pub struct Code {
    pub instructions: InstructionList,
    pub exception_ranges: Vec<ExceptionRange>,
    pub max_stack: u16,
    pub max_locals: u16,
    /// Code attributes other than the ones decoded into instructions
    pub attributes: Vec<Attribute>,
}

impl Code {
    /// Whether `label` is a boundary or handler of some exception range.
    pub fn is_exception_label(&self, label: Label) -> bool {
        self.exception_ranges
            .iter()
            .any(|range| range.labels().contains(&label))
    }
}

#[derive(Debug, Clone)]
pub struct FieldUnit {
    pub name: String,
    pub descriptor: String,
    pub access: AccessFlags,
    /// Name of the declaring class
    pub owner: String,
    pub constant_value: Option<Constant>,
    pub annotations: Vec<Annotation>,
    pub attributes: Vec<Attribute>,
}

impl FieldUnit {
    pub fn new(owner: &str, name: &str, descriptor: &str, access: AccessFlags) -> FieldUnit {
        FieldUnit {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access,
            owner: owner.to_string(),
            constant_value: None,
            annotations: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn key(&self) -> MemberRef {
        MemberRef::new(self.owner.as_str(), self.name.as_str(), self.descriptor.as_str())
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }
}

#[derive(Debug, Clone)]
pub struct MethodUnit {
    pub name: String,
    pub descriptor: String,
    pub access: AccessFlags,
    /// Name of the declaring class
    pub owner: String,
    pub code: Option<Code>,
    /// Declared thrown exception classes
    pub exceptions: Vec<String>,
    pub annotations: Vec<Annotation>,
    pub attributes: Vec<Attribute>,
}

impl MethodUnit {
    pub fn new(owner: &str, name: &str, descriptor: &str, access: AccessFlags) -> MethodUnit {
        MethodUnit {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access,
            owner: owner.to_string(),
            code: None,
            exceptions: Vec::new(),
            annotations: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn key(&self) -> MemberRef {
        MemberRef::new(self.owner.as_str(), self.name.as_str(), self.descriptor.as_str())
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub fn is_initializer(&self) -> bool {
        self.name == "<clinit>"
    }

    /// First slot not taken by `this` and the parameters.
    pub fn first_local_index(&self) -> u16 {
        let this = if self.is_static() { 0 } else { 1 };
        this + descriptor::argument_slots(&self.descriptor)
    }
}

impl fmt::Display for MethodUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}

#[derive(Debug, Clone)]
pub struct ClassUnit {
    /// Slash separated internal name
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub access: AccessFlags,
    pub fields: Vec<FieldUnit>,
    pub methods: Vec<MethodUnit>,
    pub annotations: Vec<Annotation>,
    pub inner_classes: Vec<InnerClass>,
    pub source_file: Option<String>,
    pub attributes: Vec<Attribute>,
    pub minor_version: u16,
    pub major_version: u16,
    /// Constant pool the class was decoded from. The encoder appends to it.
    pub(crate) pool: Option<ConstantPool>,
}

impl ClassUnit {
    pub fn new(name: &str, super_name: Option<&str>, access: AccessFlags) -> ClassUnit {
        ClassUnit {
            name: name.to_string(),
            super_name: super_name.map(str::to_string),
            interfaces: Vec::new(),
            access,
            fields: Vec::new(),
            methods: Vec::new(),
            annotations: Vec::new(),
            inner_classes: Vec::new(),
            source_file: None,
            attributes: Vec::new(),
            minor_version: 0,
            major_version: 52,
            pool: None,
        }
    }

    /// Package part of the name, empty for the default package.
    pub fn package(&self) -> &str {
        match self.name.rfind('/') {
            Some(pos) => &self.name[..pos],
            None => "",
        }
    }

    pub fn is_interface(&self) -> bool {
        self.access.contains(AccessFlags::INTERFACE)
    }

    pub fn field(&self, name: &str, descriptor: &str) -> Option<&FieldUnit> {
        self.fields
            .iter()
            .find(|field| field.name == name && field.descriptor == descriptor)
    }

    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodUnit> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }

    pub fn method_mut(&mut self, name: &str, descriptor: &str) -> Option<&mut MethodUnit> {
        self.methods
            .iter_mut()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }

    /// Direct supertypes: the superclass followed by the interfaces.
    pub fn supertypes(&self) -> impl Iterator<Item = &str> {
        self.super_name
            .iter()
            .map(String::as_str)
            .chain(self.interfaces.iter().map(String::as_str))
    }
}

/// Ordered collection of classes, mutated in place by transforms.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub classes: Vec<ClassUnit>,
    /// Name table left by the remapper, saved once the output jar is written
    pub name_table: Option<NameTable>,
}

impl Program {
    pub fn new(classes: Vec<ClassUnit>) -> Program {
        Program {
            classes,
            name_table: None,
        }
    }

    pub fn class(&self, name: &str) -> Option<&ClassUnit> {
        self.classes.iter().find(|class| class.name == name)
    }

    pub fn class_mut(&mut self, name: &str) -> Option<&mut ClassUnit> {
        self.classes.iter_mut().find(|class| class.name == name)
    }

    pub fn class_index(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|class| class.name == name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodUnit> {
        self.classes.iter().flat_map(|class| class.methods.iter())
    }

    pub fn methods_mut(&mut self) -> impl Iterator<Item = &mut MethodUnit> {
        self.classes.iter_mut().flat_map(|class| class.methods.iter_mut())
    }

    /// Every method body in the program.
    pub fn code(&self) -> impl Iterator<Item = (&MethodUnit, &Code)> {
        self.methods()
            .filter_map(|method| method.code.as_ref().map(|code| (method, code)))
    }
}

/// Helpers over type and method descriptors.
pub mod descriptor {
    /// Splits a method descriptor into its argument type descriptors.
    pub fn arguments(descriptor: &str) -> Vec<&str> {
        let mut result = Vec::new();
        let bytes = descriptor.as_bytes();
        let mut pos = match descriptor.find('(') {
            Some(pos) => pos + 1,
            None => return result,
        };
        while pos < bytes.len() && bytes[pos] != b')' {
            let start = pos;
            while pos < bytes.len() && bytes[pos] == b'[' {
                pos += 1;
            }
            if pos >= bytes.len() {
                break;
            }
            if bytes[pos] == b'L' {
                match descriptor[pos..].find(';') {
                    Some(end) => pos += end,
                    None => return result,
                }
            }
            pos += 1;
            result.push(&descriptor[start..pos]);
        }
        result
    }

    /// Return type descriptor of a method descriptor.
    pub fn return_type(descriptor: &str) -> &str {
        match descriptor.rfind(')') {
            Some(pos) => &descriptor[pos + 1..],
            None => descriptor,
        }
    }

    /// Whether a value of this type takes two local slots.
    pub fn is_wide(field_type: &str) -> bool {
        field_type == "J" || field_type == "D"
    }

    /// Number of local slots taken by the arguments of a method descriptor.
    pub fn argument_slots(descriptor: &str) -> u16 {
        arguments(descriptor)
            .into_iter()
            .map(|arg| if is_wide(arg) { 2 } else { 1 })
            .sum()
    }

    /// Rewrites every class name mentioned in a descriptor (or signature-free type) through `f`.
    pub fn map_classes(descriptor: &str, mut f: impl FnMut(&str) -> Option<String>) -> String {
        let mut result = String::with_capacity(descriptor.len());
        let mut rest = descriptor;
        while let Some(start) = rest.find('L') {
            let end = match rest[start..].find(';') {
                Some(end) => start + end,
                None => break,
            };
            result.push_str(&rest[..=start]);
            let class = &rest[start + 1..end];
            match f(class) {
                Some(mapped) => result.push_str(&mapped),
                None => result.push_str(class),
            }
            result.push(';');
            rest = &rest[end + 1..];
        }
        result.push_str(rest);
        result
    }

    /// Rewrites a class operand of a type instruction, which is either an internal
    /// name or an array descriptor.
    pub fn map_class_operand(class: &str, mut f: impl FnMut(&str) -> Option<String>) -> String {
        if class.starts_with('[') {
            map_classes(class, f)
        } else {
            f(class).unwrap_or_else(|| class.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_arguments() {
        assert_eq!(
            descriptor::arguments("(IJ[Ljava/lang/String;[[D)V"),
            vec!["I", "J", "[Ljava/lang/String;", "[[D"]
        );
        assert_eq!(descriptor::argument_slots("(IJD)V"), 5);
        assert_eq!(descriptor::return_type("(I)Ljava/lang/Object;"), "Ljava/lang/Object;");
    }

    #[test]
    fn first_local_index_counts_receiver() {
        let instance = MethodUnit::new("a", "b", "(JI)V", AccessFlags::PUBLIC);
        assert_eq!(instance.first_local_index(), 4);
        let statik = MethodUnit::new("a", "b", "(JI)V", AccessFlags::STATIC);
        assert_eq!(statik.first_local_index(), 3);
    }

    #[test]
    fn map_classes_rewrites_only_class_names() {
        let mapped = descriptor::map_classes("(La;[Lb;I)La;", |name| {
            if name == "a" {
                Some("deob/class1".to_string())
            } else {
                None
            }
        });
        assert_eq!(mapped, "(Ldeob/class1;[Lb;I)Ldeob/class1;");
        assert_eq!(
            descriptor::map_class_operand("a", |_| Some("x".to_string())),
            "x"
        );
    }

    #[test]
    fn package_visibility() {
        assert!(AccessFlags::STATIC.is_package());
        assert!(!(AccessFlags::PUBLIC | AccessFlags::STATIC).is_package());
        let class = ClassUnit::new("net/foo/Bar", Some("java/lang/Object"), AccessFlags::PUBLIC);
        assert_eq!(class.package(), "net/foo");
    }
}
