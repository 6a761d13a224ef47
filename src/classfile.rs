//! Class file decoding and encoding.
//!
//! Decoding keeps the class's constant pool around and encoding appends to it,
//! so attributes carried as opaque bytes keep pointing at valid entries. Each
//! decoded instruction remembers the opcode byte and pool index it came from;
//! the encoder reuses them whenever they still describe the instruction, which
//! makes decode followed by encode reproduce untouched method bodies exactly.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::insn::{DynamicCall, Insn, InsnId, InstructionList, Label, RawForm};
use crate::opcodes::*;
use crate::program::{
    descriptor, AccessFlags, Annotation, Attribute, ClassUnit, Code, Constant, ElementValue,
    ExceptionRange, FieldUnit, InnerClass, MemberRef, MethodUnit,
};

const MAGIC: u32 = 0xCAFE_BABE;

/// Code attributes describing offsets or types of the original bytecode. They go
/// stale as soon as instructions move and are not carried over.
const DROPPED_CODE_ATTRIBUTES: &[&str] = &[
    "StackMapTable",
    "LocalVariableTable",
    "LocalVariableTypeTable",
];

fn malformed(reason: impl Into<String>) -> Error {
    Error::class_format("?", reason)
}

/// Attaches the class name to a format error raised below the class level.
fn in_class(err: Error, class: &str) -> Error {
    match err {
        Error::ClassFormat { reason, .. } => Error::class_format(class, reason),
        other => other,
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemberKind {
    Field,
    Method,
    InterfaceMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolEntry {
    /// Slot 0 and the second slot of long and double entries
    Unusable,
    Utf8(String),
    Int(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(u16),
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module(u16),
    Package(u16),
}

impl PoolEntry {
    fn is_wide(&self) -> bool {
        matches!(self, PoolEntry::Long(_) | PoolEntry::Double(_))
    }
}

/// Constant pool that can be appended to. Entries are interned, so adding an
/// entry that already exists returns the existing index.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<PoolEntry>,
    lookup: HashMap<PoolEntry, u16>,
    /// Original bytes of UTF-8 entries that do not re-encode to the same bytes
    verbatim: HashMap<u16, Vec<u8>>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        ConstantPool::new()
    }
}

impl ConstantPool {
    pub fn new() -> ConstantPool {
        ConstantPool {
            entries: vec![PoolEntry::Unusable],
            lookup: HashMap::new(),
            verbatim: HashMap::new(),
        }
    }

    /// Number of slots, including slot 0.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    fn intern(&mut self, entry: PoolEntry) -> Result<u16> {
        if let Some(index) = self.lookup.get(&entry) {
            return Ok(*index);
        }
        let index = self.entries.len();
        let slots = if entry.is_wide() { 2 } else { 1 };
        if index + slots > u16::MAX as usize {
            return Err(malformed("constant pool exceeds 65535 entries"));
        }
        let wide = entry.is_wide();
        self.lookup.insert(entry.clone(), index as u16);
        self.entries.push(entry);
        if wide {
            self.entries.push(PoolEntry::Unusable);
        }
        Ok(index as u16)
    }

    pub fn utf8(&mut self, text: &str) -> Result<u16> {
        if mutf8::encode(text).len() > u16::MAX as usize {
            return Err(malformed("string constant exceeds 65535 bytes"));
        }
        self.intern(PoolEntry::Utf8(text.to_string()))
    }

    pub fn class(&mut self, name: &str) -> Result<u16> {
        let name = self.utf8(name)?;
        self.intern(PoolEntry::Class(name))
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name = self.utf8(name)?;
        let descriptor = self.utf8(descriptor)?;
        self.intern(PoolEntry::NameAndType { name, descriptor })
    }

    pub fn member(&mut self, member: &MemberRef, kind: MemberKind) -> Result<u16> {
        let class = self.class(&member.owner)?;
        let name_and_type = self.name_and_type(&member.name, &member.descriptor)?;
        self.intern(match kind {
            MemberKind::Field => PoolEntry::FieldRef {
                class,
                name_and_type,
            },
            MemberKind::Method => PoolEntry::MethodRef {
                class,
                name_and_type,
            },
            MemberKind::InterfaceMethod => PoolEntry::InterfaceMethodRef {
                class,
                name_and_type,
            },
        })
    }

    pub fn invoke_dynamic(&mut self, call: &DynamicCall) -> Result<u16> {
        let name_and_type = self.name_and_type(&call.name, &call.descriptor)?;
        self.intern(PoolEntry::InvokeDynamic {
            bootstrap: call.bootstrap,
            name_and_type,
        })
    }

    pub fn constant(&mut self, constant: &Constant) -> Result<u16> {
        let entry = match constant {
            Constant::Int(value) => PoolEntry::Int(*value),
            Constant::Float(value) => PoolEntry::Float(value.to_bits()),
            Constant::Long(value) => PoolEntry::Long(*value),
            Constant::Double(value) => PoolEntry::Double(value.to_bits()),
            Constant::String(value) => PoolEntry::String(self.utf8(value)?),
            Constant::Class(name) => return self.class(name),
            Constant::MethodType(descriptor) => PoolEntry::MethodType(self.utf8(descriptor)?),
            Constant::MethodHandle {
                kind,
                member,
                interface,
            } => {
                let member_kind = match kind {
                    1..=4 => MemberKind::Field,
                    _ if *interface => MemberKind::InterfaceMethod,
                    _ => MemberKind::Method,
                };
                PoolEntry::MethodHandle {
                    kind: *kind,
                    reference: self.member(member, member_kind)?,
                }
            }
            Constant::Dynamic {
                bootstrap,
                name,
                descriptor,
            } => PoolEntry::Dynamic {
                bootstrap: *bootstrap,
                name_and_type: self.name_and_type(name, descriptor)?,
            },
        };
        self.intern(entry)
    }

    fn entry(&self, index: u16) -> Result<&PoolEntry> {
        match self.entries.get(index as usize) {
            Some(PoolEntry::Unusable) | None => {
                Err(malformed(format!("bad constant pool index {}", index)))
            }
            Some(entry) => Ok(entry),
        }
    }

    pub fn utf8_at(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            PoolEntry::Utf8(text) => Ok(text),
            other => Err(malformed(format!("entry {} is {:?}, expected UTF-8", index, other))),
        }
    }

    pub fn class_at(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            PoolEntry::Class(name) => self.utf8_at(*name),
            other => Err(malformed(format!("entry {} is {:?}, expected a class", index, other))),
        }
    }

    fn name_and_type_at(&self, index: u16) -> Result<(&str, &str)> {
        match self.entry(index)? {
            PoolEntry::NameAndType { name, descriptor } => {
                Ok((self.utf8_at(*name)?, self.utf8_at(*descriptor)?))
            }
            other => Err(malformed(format!(
                "entry {} is {:?}, expected a name and type",
                index, other
            ))),
        }
    }

    pub fn member_at(&self, index: u16) -> Result<(MemberRef, MemberKind)> {
        let (class, name_and_type, kind) = match self.entry(index)? {
            PoolEntry::FieldRef {
                class,
                name_and_type,
            } => (*class, *name_and_type, MemberKind::Field),
            PoolEntry::MethodRef {
                class,
                name_and_type,
            } => (*class, *name_and_type, MemberKind::Method),
            PoolEntry::InterfaceMethodRef {
                class,
                name_and_type,
            } => (*class, *name_and_type, MemberKind::InterfaceMethod),
            other => {
                return Err(malformed(format!(
                    "entry {} is {:?}, expected a member reference",
                    index, other
                )))
            }
        };
        let (name, descriptor) = self.name_and_type_at(name_and_type)?;
        Ok((MemberRef::new(self.class_at(class)?, name, descriptor), kind))
    }

    fn dynamic_at(&self, index: u16) -> Result<DynamicCall> {
        match self.entry(index)? {
            PoolEntry::InvokeDynamic {
                bootstrap,
                name_and_type,
            } => {
                let (name, descriptor) = self.name_and_type_at(*name_and_type)?;
                Ok(DynamicCall {
                    bootstrap: *bootstrap,
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                })
            }
            other => Err(malformed(format!(
                "entry {} is {:?}, expected an invokedynamic call site",
                index, other
            ))),
        }
    }

    pub fn constant_at(&self, index: u16) -> Result<Constant> {
        let constant = match self.entry(index)? {
            PoolEntry::Int(value) => Constant::Int(*value),
            PoolEntry::Float(bits) => Constant::Float(f32::from_bits(*bits)),
            PoolEntry::Long(value) => Constant::Long(*value),
            PoolEntry::Double(bits) => Constant::Double(f64::from_bits(*bits)),
            PoolEntry::String(text) => Constant::String(self.utf8_at(*text)?.to_string()),
            PoolEntry::Class(name) => Constant::Class(self.utf8_at(*name)?.to_string()),
            PoolEntry::MethodType(descriptor) => {
                Constant::MethodType(self.utf8_at(*descriptor)?.to_string())
            }
            PoolEntry::MethodHandle { kind, reference } => {
                let (member, member_kind) = self.member_at(*reference)?;
                Constant::MethodHandle {
                    kind: *kind,
                    member,
                    interface: member_kind == MemberKind::InterfaceMethod,
                }
            }
            PoolEntry::Dynamic {
                bootstrap,
                name_and_type,
            } => {
                let (name, descriptor) = self.name_and_type_at(*name_and_type)?;
                Constant::Dynamic {
                    bootstrap: *bootstrap,
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                }
            }
            other => {
                return Err(malformed(format!(
                    "entry {} is {:?}, expected a loadable constant",
                    index, other
                )))
            }
        };
        Ok(constant)
    }

    fn read(reader: &mut Reader<'_>) -> Result<ConstantPool> {
        let count = reader.u16()?;
        let mut pool = ConstantPool::new();
        let mut index = 1u16;
        while index < count {
            let tag = reader.u8()?;
            let entry = match tag {
                1 => {
                    let len = reader.u16()? as usize;
                    let bytes = reader.bytes(len)?;
                    let text = mutf8::decode(bytes);
                    if mutf8::encode(&text) != bytes {
                        pool.verbatim.insert(index, bytes.to_vec());
                    }
                    PoolEntry::Utf8(text)
                }
                3 => PoolEntry::Int(reader.i32()?),
                4 => PoolEntry::Float(reader.u32()?),
                5 => PoolEntry::Long(reader.i64()?),
                6 => PoolEntry::Double(reader.u64()?),
                7 => PoolEntry::Class(reader.u16()?),
                8 => PoolEntry::String(reader.u16()?),
                9 | 10 | 11 => {
                    let class = reader.u16()?;
                    let name_and_type = reader.u16()?;
                    match tag {
                        9 => PoolEntry::FieldRef {
                            class,
                            name_and_type,
                        },
                        10 => PoolEntry::MethodRef {
                            class,
                            name_and_type,
                        },
                        _ => PoolEntry::InterfaceMethodRef {
                            class,
                            name_and_type,
                        },
                    }
                }
                12 => PoolEntry::NameAndType {
                    name: reader.u16()?,
                    descriptor: reader.u16()?,
                },
                15 => PoolEntry::MethodHandle {
                    kind: reader.u8()?,
                    reference: reader.u16()?,
                },
                16 => PoolEntry::MethodType(reader.u16()?),
                17 | 18 => {
                    let bootstrap = reader.u16()?;
                    let name_and_type = reader.u16()?;
                    if tag == 17 {
                        PoolEntry::Dynamic {
                            bootstrap,
                            name_and_type,
                        }
                    } else {
                        PoolEntry::InvokeDynamic {
                            bootstrap,
                            name_and_type,
                        }
                    }
                }
                19 => PoolEntry::Module(reader.u16()?),
                20 => PoolEntry::Package(reader.u16()?),
                _ => {
                    return Err(malformed(format!(
                        "bad constant tag {} at index {}",
                        tag, index
                    )))
                }
            };
            let wide = entry.is_wide();
            pool.lookup.entry(entry.clone()).or_insert(index);
            pool.entries.push(entry);
            index += 1;
            if wide {
                pool.entries.push(PoolEntry::Unusable);
                index += 1;
            }
        }
        Ok(pool)
    }

    fn write(&self, out: &mut Output) {
        out.u16(self.entries.len() as u16);
        for (index, entry) in self.entries.iter().enumerate() {
            match entry {
                PoolEntry::Unusable => {}
                PoolEntry::Utf8(text) => {
                    out.u8(1);
                    let bytes = match self.verbatim.get(&(index as u16)) {
                        Some(bytes) => bytes.clone(),
                        None => mutf8::encode(text),
                    };
                    out.u16(bytes.len() as u16);
                    out.bytes(&bytes);
                }
                PoolEntry::Int(value) => {
                    out.u8(3);
                    out.i32(*value);
                }
                PoolEntry::Float(bits) => {
                    out.u8(4);
                    out.u32(*bits);
                }
                PoolEntry::Long(value) => {
                    out.u8(5);
                    out.i64(*value);
                }
                PoolEntry::Double(bits) => {
                    out.u8(6);
                    out.u64(*bits);
                }
                PoolEntry::Class(name) => {
                    out.u8(7);
                    out.u16(*name);
                }
                PoolEntry::String(text) => {
                    out.u8(8);
                    out.u16(*text);
                }
                PoolEntry::FieldRef {
                    class,
                    name_and_type,
                } => {
                    out.u8(9);
                    out.u16(*class);
                    out.u16(*name_and_type);
                }
                PoolEntry::MethodRef {
                    class,
                    name_and_type,
                } => {
                    out.u8(10);
                    out.u16(*class);
                    out.u16(*name_and_type);
                }
                PoolEntry::InterfaceMethodRef {
                    class,
                    name_and_type,
                } => {
                    out.u8(11);
                    out.u16(*class);
                    out.u16(*name_and_type);
                }
                PoolEntry::NameAndType { name, descriptor } => {
                    out.u8(12);
                    out.u16(*name);
                    out.u16(*descriptor);
                }
                PoolEntry::MethodHandle { kind, reference } => {
                    out.u8(15);
                    out.u8(*kind);
                    out.u16(*reference);
                }
                PoolEntry::MethodType(descriptor) => {
                    out.u8(16);
                    out.u16(*descriptor);
                }
                PoolEntry::Dynamic {
                    bootstrap,
                    name_and_type,
                } => {
                    out.u8(17);
                    out.u16(*bootstrap);
                    out.u16(*name_and_type);
                }
                PoolEntry::InvokeDynamic {
                    bootstrap,
                    name_and_type,
                } => {
                    out.u8(18);
                    out.u16(*bootstrap);
                    out.u16(*name_and_type);
                }
                PoolEntry::Module(name) => {
                    out.u8(19);
                    out.u16(*name);
                }
                PoolEntry::Package(name) => {
                    out.u8(20);
                    out.u16(*name);
                }
            }
        }
    }
}

/// The class file flavour of UTF-8: NUL takes two bytes and supplementary
/// characters are written as surrogate pairs.
mod mutf8 {
    pub fn decode(bytes: &[u8]) -> String {
        let mut units = Vec::with_capacity(bytes.len());
        let mut pos = 0;
        while pos < bytes.len() {
            let byte = bytes[pos] as u16;
            if byte & 0x80 == 0 {
                units.push(byte);
                pos += 1;
            } else if byte & 0xE0 == 0xC0 && pos + 1 < bytes.len() {
                units.push(((byte & 0x1F) << 6) | (bytes[pos + 1] as u16 & 0x3F));
                pos += 2;
            } else if byte & 0xF0 == 0xE0 && pos + 2 < bytes.len() {
                units.push(
                    ((byte & 0x0F) << 12)
                        | ((bytes[pos + 1] as u16 & 0x3F) << 6)
                        | (bytes[pos + 2] as u16 & 0x3F),
                );
                pos += 3;
            } else {
                units.push(0xFFFD);
                pos += 1;
            }
        }
        String::from_utf16_lossy(&units)
    }

    pub fn encode(text: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(text.len());
        for unit in text.encode_utf16() {
            match unit {
                0x0001..=0x007F => bytes.push(unit as u8),
                0x0000 | 0x0080..=0x07FF => {
                    bytes.push(0xC0 | (unit >> 6) as u8);
                    bytes.push(0x80 | (unit & 0x3F) as u8);
                }
                _ => {
                    bytes.push(0xE0 | (unit >> 12) as u8);
                    bytes.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                    bytes.push(0x80 | (unit & 0x3F) as u8);
                }
            }
        }
        bytes
    }
}

struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

fn truncated(_: std::io::Error) -> Error {
    malformed("truncated input")
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader {
            cursor: Cursor::new(data),
        }
    }

    fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }

    fn u8(&mut self) -> Result<u8> {
        self.cursor.read_u8().map_err(truncated)
    }

    fn i8(&mut self) -> Result<i8> {
        self.cursor.read_i8().map_err(truncated)
    }

    fn u16(&mut self) -> Result<u16> {
        self.cursor.read_u16::<BigEndian>().map_err(truncated)
    }

    fn i16(&mut self) -> Result<i16> {
        self.cursor.read_i16::<BigEndian>().map_err(truncated)
    }

    fn u32(&mut self) -> Result<u32> {
        self.cursor.read_u32::<BigEndian>().map_err(truncated)
    }

    fn i32(&mut self) -> Result<i32> {
        self.cursor.read_i32::<BigEndian>().map_err(truncated)
    }

    fn u64(&mut self) -> Result<u64> {
        self.cursor.read_u64::<BigEndian>().map_err(truncated)
    }

    fn i64(&mut self) -> Result<i64> {
        self.cursor.read_i64::<BigEndian>().map_err(truncated)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let data: &'a [u8] = *self.cursor.get_ref();
        let start = self.position();
        let end = start
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| malformed("truncated input"))?;
        self.cursor.set_position(end as u64);
        Ok(&data[start..end])
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }

    /// Reads an attribute table as (name, contents) pairs.
    fn attributes(&mut self, pool: &ConstantPool) -> Result<Vec<(String, &'a [u8])>> {
        let count = self.u16()?;
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = pool.utf8_at(self.u16()?)?.to_string();
            let len = self.u32()? as usize;
            attributes.push((name, self.bytes(len)?));
        }
        Ok(attributes)
    }
}

/// Big-endian output buffer.
#[derive(Default)]
struct Output(Vec<u8>);

impl Output {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn u8(&mut self, value: u8) {
        self.0.push(value);
    }

    fn u16(&mut self, value: u16) {
        let mut buf = [0; 2];
        BigEndian::write_u16(&mut buf, value);
        self.0.extend_from_slice(&buf);
    }

    fn i16(&mut self, value: i16) {
        self.u16(value as u16);
    }

    fn u32(&mut self, value: u32) {
        let mut buf = [0; 4];
        BigEndian::write_u32(&mut buf, value);
        self.0.extend_from_slice(&buf);
    }

    fn i32(&mut self, value: i32) {
        self.u32(value as u32);
    }

    fn u64(&mut self, value: u64) {
        let mut buf = [0; 8];
        BigEndian::write_u64(&mut buf, value);
        self.0.extend_from_slice(&buf);
    }

    fn i64(&mut self, value: i64) {
        self.u64(value as u64);
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    fn attributes(&mut self, attributes: &[(u16, Vec<u8>)]) {
        self.u16(attributes.len() as u16);
        for (name, data) in attributes {
            self.u16(*name);
            self.u32(data.len() as u32);
            self.bytes(data);
        }
    }
}

/// Decodes one class file.
pub fn decode(bytes: &[u8]) -> Result<ClassUnit> {
    let mut name = String::from("?");
    decode_class(bytes, &mut name).map_err(|err| in_class(err, &name))
}

fn decode_class(bytes: &[u8], name: &mut String) -> Result<ClassUnit> {
    let mut reader = Reader::new(bytes);
    if reader.u32()? != MAGIC {
        return Err(malformed("bad magic"));
    }
    let minor_version = reader.u16()?;
    let major_version = reader.u16()?;
    let pool = ConstantPool::read(&mut reader)?;
    let access = AccessFlags::from_bits_truncate(reader.u16()?);
    *name = pool.class_at(reader.u16()?)?.to_string();
    let super_name = match reader.u16()? {
        0 => None,
        index => Some(pool.class_at(index)?.to_string()),
    };
    let mut class = ClassUnit::new(name, super_name.as_deref(), access);
    class.minor_version = minor_version;
    class.major_version = major_version;

    for _ in 0..reader.u16()? {
        class.interfaces.push(pool.class_at(reader.u16()?)?.to_string());
    }

    for _ in 0..reader.u16()? {
        let access = AccessFlags::from_bits_truncate(reader.u16()?);
        let field_name = pool.utf8_at(reader.u16()?)?;
        let field_descriptor = pool.utf8_at(reader.u16()?)?;
        let mut field = FieldUnit::new(name, field_name, field_descriptor, access);
        for (attribute, data) in reader.attributes(&pool)? {
            match attribute.as_str() {
                "ConstantValue" => {
                    let index = Reader::new(data).u16()?;
                    field.constant_value = Some(pool.constant_at(index)?);
                }
                "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => field
                    .annotations
                    .extend(read_annotations(data, &pool, attribute == "RuntimeVisibleAnnotations")?),
                _ => field.attributes.push(Attribute {
                    name: attribute,
                    data: data.to_vec(),
                }),
            }
        }
        class.fields.push(field);
    }

    for _ in 0..reader.u16()? {
        let access = AccessFlags::from_bits_truncate(reader.u16()?);
        let method_name = pool.utf8_at(reader.u16()?)?;
        let method_descriptor = pool.utf8_at(reader.u16()?)?;
        let mut method = MethodUnit::new(name, method_name, method_descriptor, access);
        for (attribute, data) in reader.attributes(&pool)? {
            match attribute.as_str() {
                "Code" => method.code = Some(decode_code(data, &pool)?),
                "Exceptions" => {
                    let mut exceptions = Reader::new(data);
                    for _ in 0..exceptions.u16()? {
                        method
                            .exceptions
                            .push(pool.class_at(exceptions.u16()?)?.to_string());
                    }
                }
                "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => method
                    .annotations
                    .extend(read_annotations(data, &pool, attribute == "RuntimeVisibleAnnotations")?),
                _ => method.attributes.push(Attribute {
                    name: attribute,
                    data: data.to_vec(),
                }),
            }
        }
        class.methods.push(method);
    }

    for (attribute, data) in reader.attributes(&pool)? {
        match attribute.as_str() {
            "SourceFile" => {
                class.source_file = Some(pool.utf8_at(Reader::new(data).u16()?)?.to_string())
            }
            "InnerClasses" => {
                let mut inner = Reader::new(data);
                for _ in 0..inner.u16()? {
                    let inner_class = pool.class_at(inner.u16()?)?.to_string();
                    let outer = match inner.u16()? {
                        0 => None,
                        index => Some(pool.class_at(index)?.to_string()),
                    };
                    let simple_name = match inner.u16()? {
                        0 => None,
                        index => Some(pool.utf8_at(index)?.to_string()),
                    };
                    class.inner_classes.push(InnerClass {
                        inner: inner_class,
                        outer,
                        name: simple_name,
                        access: AccessFlags::from_bits_truncate(inner.u16()?),
                    });
                }
            }
            "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => class
                .annotations
                .extend(read_annotations(data, &pool, attribute == "RuntimeVisibleAnnotations")?),
            _ => class.attributes.push(Attribute {
                name: attribute,
                data: data.to_vec(),
            }),
        }
    }

    if reader.remaining() != 0 {
        debug!("{} trailing bytes after class {}", reader.remaining(), name);
    }
    class.pool = Some(pool);
    Ok(class)
}

fn read_annotations(data: &[u8], pool: &ConstantPool, visible: bool) -> Result<Vec<Annotation>> {
    let mut reader = Reader::new(data);
    let count = reader.u16()?;
    let mut annotations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        annotations.push(read_annotation(&mut reader, pool, visible)?);
    }
    Ok(annotations)
}

fn read_annotation(reader: &mut Reader<'_>, pool: &ConstantPool, visible: bool) -> Result<Annotation> {
    let descriptor = pool.utf8_at(reader.u16()?)?.to_string();
    let count = reader.u16()?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = pool.utf8_at(reader.u16()?)?.to_string();
        values.push((name, read_element_value(reader, pool, visible)?));
    }
    Ok(Annotation {
        descriptor,
        visible,
        values,
    })
}

fn read_element_value(reader: &mut Reader<'_>, pool: &ConstantPool, visible: bool) -> Result<ElementValue> {
    let tag = reader.u8()?;
    let value = match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => ElementValue::Const {
            tag,
            value: pool.constant_at(reader.u16()?)?,
        },
        b's' => ElementValue::Const {
            tag,
            value: Constant::String(pool.utf8_at(reader.u16()?)?.to_string()),
        },
        b'e' => ElementValue::Enum {
            type_name: pool.utf8_at(reader.u16()?)?.to_string(),
            const_name: pool.utf8_at(reader.u16()?)?.to_string(),
        },
        b'c' => ElementValue::Class(pool.utf8_at(reader.u16()?)?.to_string()),
        b'@' => ElementValue::Annotation(read_annotation(reader, pool, visible)?),
        b'[' => {
            let count = reader.u16()?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                values.push(read_element_value(reader, pool, visible)?);
            }
            ElementValue::Array(values)
        }
        _ => return Err(malformed(format!("bad element value tag {:?}", tag as char))),
    };
    Ok(value)
}

/// Labels materialized while decoding, keyed by bytecode offset.
struct LabelMap {
    code_length: usize,
    labels: BTreeMap<usize, Label>,
}

impl LabelMap {
    fn at(&mut self, list: &mut InstructionList, offset: i64) -> Result<Label> {
        if offset < 0 || offset as usize > self.code_length {
            return Err(malformed(format!("branch target {} outside of code", offset)));
        }
        Ok(*self
            .labels
            .entry(offset as usize)
            .or_insert_with(|| list.create_label()))
    }
}

fn decode_code(data: &[u8], pool: &ConstantPool) -> Result<Code> {
    let mut reader = Reader::new(data);
    let max_stack = reader.u16()?;
    let max_locals = reader.u16()?;
    let code_length = reader.u32()? as usize;
    let bytecode = reader.bytes(code_length)?;

    let mut list = InstructionList::new();
    let mut labels = LabelMap {
        code_length,
        labels: BTreeMap::new(),
    };

    let mut handlers = Vec::new();
    for _ in 0..reader.u16()? {
        let start = reader.u16()? as i64;
        let end = reader.u16()? as i64;
        let handler = reader.u16()? as i64;
        let catch_type = match reader.u16()? {
            0 => None,
            index => Some(pool.class_at(index)?.to_string()),
        };
        handlers.push(ExceptionRange {
            start: labels.at(&mut list, start)?,
            end: labels.at(&mut list, end)?,
            handler: labels.at(&mut list, handler)?,
            catch_type,
        });
    }

    let mut lines: BTreeMap<usize, Vec<u16>> = BTreeMap::new();
    let mut attributes = Vec::new();
    for (attribute, contents) in reader.attributes(pool)? {
        match attribute.as_str() {
            "LineNumberTable" => {
                let mut table = Reader::new(contents);
                for _ in 0..table.u16()? {
                    let pc = table.u16()? as usize;
                    let line = table.u16()?;
                    lines.entry(pc).or_default().push(line);
                }
            }
            name if DROPPED_CODE_ATTRIBUTES.contains(&name) => {
                trace!("dropping {} attribute", name);
            }
            _ => attributes.push(Attribute {
                name: attribute,
                data: contents.to_vec(),
            }),
        }
    }

    let mut decoded = Vec::new();
    let mut code = Reader::new(bytecode);
    while code.remaining() > 0 {
        let pc = code.position();
        let (insn, raw) = decode_insn(&mut code, pc, pool, &mut list, &mut labels)?;
        let id = list.create(insn);
        list.set_raw_form(id, raw);
        decoded.push((pc, id));
    }

    // labels first, then line markers, then the instruction at each offset
    let place_markers = |list: &mut InstructionList, pc: usize| {
        if let Some(label) = labels.labels.get(&pc) {
            list.append(label.id());
        }
        for line in lines.get(&pc).into_iter().flatten() {
            list.push(Insn::Line(*line));
        }
    };
    for (pc, id) in decoded.iter().copied() {
        place_markers(&mut list, pc);
        list.append(id);
    }
    place_markers(&mut list, code_length);

    for label in labels.labels.values() {
        if !list.contains(label.id()) {
            return Err(malformed("branch target inside an instruction"));
        }
    }

    Ok(Code {
        instructions: list,
        exception_ranges: handlers,
        max_stack,
        max_locals,
        attributes,
    })
}

fn raw(opcode: u8) -> RawForm {
    RawForm {
        opcode,
        wide: false,
        pool_index: None,
    }
}

fn decode_insn(
    code: &mut Reader<'_>,
    pc: usize,
    pool: &ConstantPool,
    list: &mut InstructionList,
    labels: &mut LabelMap,
) -> Result<(Insn, RawForm)> {
    let opcode = code.u8()?;
    let insn = match opcode {
        NOP..=DCONST_1
        | IALOAD..=SALOAD
        | IASTORE..=LXOR
        | I2L..=DCMPG
        | IRETURN..=RETURN
        | ARRAYLENGTH
        | ATHROW
        | MONITORENTER
        | MONITOREXIT => Insn::Simple(opcode),
        BIPUSH => Insn::Int {
            opcode,
            operand: code.i8()? as i32,
        },
        SIPUSH => Insn::Int {
            opcode,
            operand: code.i16()? as i32,
        },
        NEWARRAY => Insn::Int {
            opcode,
            operand: code.u8()? as i32,
        },
        LDC | LDC_W | LDC2_W => {
            let index = if opcode == LDC {
                code.u8()? as u16
            } else {
                code.u16()?
            };
            let constant = pool.constant_at(index)?;
            return Ok((
                Insn::Ldc(constant),
                RawForm {
                    opcode,
                    wide: false,
                    pool_index: Some(index),
                },
            ));
        }
        ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Insn::Var {
            opcode,
            var: code.u8()? as u16,
        },
        ILOAD_0..=ALOAD_3 => Insn::Var {
            opcode: ILOAD + (opcode - ILOAD_0) / 4,
            var: ((opcode - ILOAD_0) % 4) as u16,
        },
        ISTORE_0..=ASTORE_3 => Insn::Var {
            opcode: ISTORE + (opcode - ISTORE_0) / 4,
            var: ((opcode - ISTORE_0) % 4) as u16,
        },
        IINC => Insn::Iinc {
            var: code.u8()? as u16,
            incr: code.i8()? as i16,
        },
        WIDE => {
            let opcode = code.u8()?;
            let insn = match opcode {
                IINC => Insn::Iinc {
                    var: code.u16()?,
                    incr: code.i16()?,
                },
                ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Insn::Var {
                    opcode,
                    var: code.u16()?,
                },
                _ => return Err(malformed(format!("bad wide opcode {} at {}", opcode, pc))),
            };
            return Ok((
                insn,
                RawForm {
                    opcode,
                    wide: true,
                    pool_index: None,
                },
            ));
        }
        IFEQ..=JSR | IFNULL | IFNONNULL => {
            let offset = code.i16()? as i64;
            Insn::Jump {
                opcode,
                target: labels.at(list, pc as i64 + offset)?,
            }
        }
        GOTO_W | JSR_W => {
            let offset = code.i32()? as i64;
            Insn::Jump {
                opcode: if opcode == GOTO_W { GOTO } else { JSR },
                target: labels.at(list, pc as i64 + offset)?,
            }
        }
        TABLESWITCH | LOOKUPSWITCH => {
            code.skip(switch_padding(pc))?;
            let default = labels.at(list, pc as i64 + code.i32()? as i64)?;
            if opcode == TABLESWITCH {
                let low = code.i32()?;
                let high = code.i32()?;
                if high < low {
                    return Err(malformed(format!("bad tableswitch bounds at {}", pc)));
                }
                let mut targets = Vec::with_capacity((high as i64 - low as i64 + 1) as usize);
                for _ in low..=high {
                    targets.push(labels.at(list, pc as i64 + code.i32()? as i64)?);
                }
                Insn::TableSwitch {
                    low,
                    high,
                    default,
                    targets,
                }
            } else {
                let count = code.i32()?;
                if count < 0 {
                    return Err(malformed(format!("bad lookupswitch size at {}", pc)));
                }
                let mut pairs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = code.i32()?;
                    pairs.push((key, labels.at(list, pc as i64 + code.i32()? as i64)?));
                }
                Insn::LookupSwitch { default, pairs }
            }
        }
        GETSTATIC..=PUTFIELD | INVOKEVIRTUAL..=INVOKEINTERFACE => {
            let index = code.u16()?;
            if opcode == INVOKEINTERFACE {
                code.skip(2)?;
            }
            let (member, kind) = pool.member_at(index)?;
            let insn = if opcode <= PUTFIELD {
                Insn::Field { opcode, member }
            } else {
                Insn::Method {
                    opcode,
                    member,
                    interface: kind == MemberKind::InterfaceMethod,
                }
            };
            return Ok((
                insn,
                RawForm {
                    opcode,
                    wide: false,
                    pool_index: Some(index),
                },
            ));
        }
        INVOKEDYNAMIC => {
            let index = code.u16()?;
            code.skip(2)?;
            return Ok((
                Insn::InvokeDynamic(pool.dynamic_at(index)?),
                RawForm {
                    opcode,
                    wide: false,
                    pool_index: Some(index),
                },
            ));
        }
        NEW | ANEWARRAY | CHECKCAST | INSTANCEOF | MULTIANEWARRAY => {
            let index = code.u16()?;
            let class = pool.class_at(index)?.to_string();
            let insn = if opcode == MULTIANEWARRAY {
                Insn::MultiANewArray {
                    class,
                    dims: code.u8()?,
                }
            } else {
                Insn::Type { opcode, class }
            };
            return Ok((
                insn,
                RawForm {
                    opcode,
                    wide: false,
                    pool_index: Some(index),
                },
            ));
        }
        _ => return Err(malformed(format!("unknown opcode {} at {}", opcode, pc))),
    };
    Ok((insn, raw(opcode)))
}

fn switch_padding(pc: usize) -> usize {
    (4 - (pc + 1) % 4) % 4
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum VarForm {
    Compact,
    Normal,
    Wide,
}

/// Encoding chosen for one instruction.
#[derive(Debug, Clone)]
enum Form {
    Pseudo,
    Plain(u8),
    Byte(u8, u8),
    Short(u8, u16),
    Var { opcode: u8, var: u16, form: VarForm },
    Iinc { var: u16, incr: i16, wide: bool },
    Jump { opcode: u8, target: Label, wide: bool },
    Ldc { opcode: u8, index: u16 },
    Interface { index: u16, count: u8 },
    Dynamic(u16),
    Multi { index: u16, dims: u8 },
    Table { low: i32, high: i32, default: Label, targets: Vec<Label> },
    Lookup { default: Label, pairs: Vec<(i32, Label)> },
}

impl Form {
    fn size(&self, pc: usize) -> usize {
        match self {
            Form::Pseudo => 0,
            Form::Plain(_) => 1,
            Form::Byte(..) => 2,
            Form::Short(..) => 3,
            Form::Var { form, .. } => match form {
                VarForm::Compact => 1,
                VarForm::Normal => 2,
                VarForm::Wide => 4,
            },
            Form::Iinc { wide, .. } => {
                if *wide {
                    6
                } else {
                    3
                }
            }
            Form::Jump { wide, .. } => {
                if *wide {
                    5
                } else {
                    3
                }
            }
            Form::Ldc { opcode, .. } => {
                if *opcode == LDC {
                    2
                } else {
                    3
                }
            }
            Form::Interface { .. } | Form::Dynamic(_) => 5,
            Form::Multi { .. } => 4,
            Form::Table { targets, .. } => 1 + switch_padding(pc) + 12 + 4 * targets.len(),
            Form::Lookup { pairs, .. } => 1 + switch_padding(pc) + 8 + 8 * pairs.len(),
        }
    }
}

fn var_form(opcode: u8, var: u16, raw: Option<RawForm>) -> VarForm {
    let compact_allowed = opcode != RET && var <= 3;
    if let Some(raw) = raw {
        if raw.wide && raw.opcode == opcode {
            return VarForm::Wide;
        }
        if raw.opcode == opcode && var <= 0xFF {
            return VarForm::Normal;
        }
        if raw.opcode == compact_opcode(opcode, var) && compact_allowed {
            return VarForm::Compact;
        }
    }
    if compact_allowed {
        VarForm::Compact
    } else if var <= 0xFF {
        VarForm::Normal
    } else {
        VarForm::Wide
    }
}

fn compact_opcode(opcode: u8, var: u16) -> u8 {
    let var = var.min(3) as u8;
    if is_load(opcode) {
        ILOAD_0 + (opcode - ILOAD) * 4 + var
    } else if is_store(opcode) {
        ISTORE_0 + (opcode - ISTORE) * 4 + var
    } else {
        opcode
    }
}

/// Pool index recorded at decode time, if the entry still holds what `matches` expects.
fn hinted(raw: Option<RawForm>, matches: impl FnOnce(u16) -> bool) -> Option<u16> {
    raw.and_then(|raw| raw.pool_index).filter(|index| matches(*index))
}

fn choose_form(list: &InstructionList, id: InsnId, pool: &mut ConstantPool) -> Result<Form> {
    let raw = list.raw_form(id);
    let form = match list.get(id) {
        Insn::Label | Insn::Line(_) => Form::Pseudo,
        Insn::Simple(opcode) => Form::Plain(*opcode),
        Insn::Int { opcode, operand } => match *opcode {
            SIPUSH => Form::Short(SIPUSH, *operand as i16 as u16),
            BIPUSH => Form::Byte(BIPUSH, *operand as i8 as u8),
            opcode => Form::Byte(opcode, *operand as u8),
        },
        Insn::Var { opcode, var } => Form::Var {
            opcode: *opcode,
            var: *var,
            form: var_form(*opcode, *var, raw),
        },
        Insn::Iinc { var, incr } => Form::Iinc {
            var: *var,
            incr: *incr,
            wide: raw.map_or(false, |raw| raw.wide)
                || *var > 0xFF
                || *incr < i8::MIN as i16
                || *incr > i8::MAX as i16,
        },
        Insn::Jump { opcode, target } => Form::Jump {
            opcode: *opcode,
            target: *target,
            wide: raw.map_or(false, |raw| raw.opcode == GOTO_W || raw.opcode == JSR_W),
        },
        Insn::Ldc(constant) => {
            let index = match hinted(raw, |index| pool.constant_at(index).ok().as_ref() == Some(constant)) {
                Some(index) => index,
                None => pool.constant(constant)?,
            };
            let opcode = if constant.is_wide() {
                LDC2_W
            } else if index <= 0xFF && raw.map_or(true, |raw| raw.opcode != LDC_W) {
                LDC
            } else {
                LDC_W
            };
            Form::Ldc { opcode, index }
        }
        Insn::Type { opcode, class } => {
            let index = match hinted(raw, |index| pool.class_at(index).ok() == Some(class.as_str())) {
                Some(index) => index,
                None => pool.class(class)?,
            };
            Form::Short(*opcode, index)
        }
        Insn::Field { opcode, member } => {
            let index = match hinted(raw, |index| {
                pool.member_at(index).ok() == Some((member.clone(), MemberKind::Field))
            }) {
                Some(index) => index,
                None => pool.member(member, MemberKind::Field)?,
            };
            Form::Short(*opcode, index)
        }
        Insn::Method {
            opcode,
            member,
            interface,
        } => {
            let kind = if *interface {
                MemberKind::InterfaceMethod
            } else {
                MemberKind::Method
            };
            let index = match hinted(raw, |index| pool.member_at(index).ok() == Some((member.clone(), kind))) {
                Some(index) => index,
                None => pool.member(member, kind)?,
            };
            if *opcode == INVOKEINTERFACE {
                Form::Interface {
                    index,
                    count: (1 + descriptor::argument_slots(&member.descriptor)) as u8,
                }
            } else {
                Form::Short(*opcode, index)
            }
        }
        Insn::InvokeDynamic(call) => {
            let index = match hinted(raw, |index| pool.dynamic_at(index).ok().as_ref() == Some(call)) {
                Some(index) => index,
                None => pool.invoke_dynamic(call)?,
            };
            Form::Dynamic(index)
        }
        Insn::MultiANewArray { class, dims } => {
            let index = match hinted(raw, |index| pool.class_at(index).ok() == Some(class.as_str())) {
                Some(index) => index,
                None => pool.class(class)?,
            };
            Form::Multi { index, dims: *dims }
        }
        Insn::TableSwitch {
            low,
            high,
            default,
            targets,
        } => Form::Table {
            low: *low,
            high: *high,
            default: *default,
            targets: targets.clone(),
        },
        Insn::LookupSwitch { default, pairs } => Form::Lookup {
            default: *default,
            pairs: pairs.clone(),
        },
    };
    Ok(form)
}

/// Assigns bytecode offsets, widening `GOTO`/`JSR` whose displacement does not
/// fit 16 bits until the layout is stable. Returns the offset of every position
/// plus one trailing entry holding the code length.
fn layout(forms: &mut [Form], positions: &[Option<usize>], method: &str) -> Result<Vec<usize>> {
    loop {
        let mut offsets = Vec::with_capacity(forms.len() + 1);
        let mut pc = 0;
        for form in forms.iter() {
            offsets.push(pc);
            pc += form.size(pc);
        }
        offsets.push(pc);

        let mut widened = false;
        for position in 0..forms.len() {
            if let Form::Jump {
                opcode,
                target,
                wide,
            } = &mut forms[position]
            {
                if *wide {
                    continue;
                }
                let target = label_offset(*target, positions, &offsets)?;
                let delta = target as i64 - offsets[position] as i64;
                if delta < i16::MIN as i64 || delta > i16::MAX as i64 {
                    if *opcode == GOTO || *opcode == JSR {
                        *wide = true;
                        widened = true;
                    } else {
                        return Err(malformed(format!(
                            "conditional branch at {} in {} is out of range",
                            offsets[position], method
                        )));
                    }
                }
            }
        }
        if !widened {
            return Ok(offsets);
        }
    }
}

fn label_offset(label: Label, positions: &[Option<usize>], offsets: &[usize]) -> Result<usize> {
    positions
        .get(label.id().index())
        .copied()
        .flatten()
        .map(|position| offsets[position])
        .ok_or(Error::MissingLabel)
}

fn encode_code(method: &MethodUnit, code: &Code, pool: &mut ConstantPool) -> Result<Vec<u8>> {
    let list = &code.instructions;
    let ids = list.ids();
    let positions = list.positions();
    let mut forms = Vec::with_capacity(ids.len());
    for id in &ids {
        forms.push(choose_form(list, *id, pool)?);
    }
    let method_name = method.to_string();
    let offsets = layout(&mut forms, &positions, &method_name)?;
    let code_length = offsets[forms.len()];
    if code_length > u16::MAX as usize {
        return Err(malformed(format!("{} is too large", method_name)));
    }

    let mut out = Output::default();
    out.u16(code.max_stack);
    out.u16(code.max_locals);
    out.u32(code_length as u32);
    let start = out.len();
    for (position, form) in forms.iter().enumerate() {
        let pc = offsets[position];
        debug_assert_eq!(out.len() - start, pc);
        let relative = |label: Label| -> Result<i32> {
            Ok((label_offset(label, &positions, &offsets)? as i64 - pc as i64) as i32)
        };
        match form {
            Form::Pseudo => {}
            Form::Plain(opcode) => out.u8(*opcode),
            Form::Byte(opcode, operand) => {
                out.u8(*opcode);
                out.u8(*operand);
            }
            Form::Short(opcode, operand) => {
                out.u8(*opcode);
                out.u16(*operand);
            }
            Form::Var { opcode, var, form } => match form {
                VarForm::Compact => out.u8(compact_opcode(*opcode, *var)),
                VarForm::Normal => {
                    out.u8(*opcode);
                    out.u8(*var as u8);
                }
                VarForm::Wide => {
                    out.u8(WIDE);
                    out.u8(*opcode);
                    out.u16(*var);
                }
            },
            Form::Iinc { var, incr, wide } => {
                if *wide {
                    out.u8(WIDE);
                    out.u8(IINC);
                    out.u16(*var);
                    out.i16(*incr);
                } else {
                    out.u8(IINC);
                    out.u8(*var as u8);
                    out.u8(*incr as i8 as u8);
                }
            }
            Form::Jump {
                opcode,
                target,
                wide,
            } => {
                let delta = relative(*target)?;
                if *wide {
                    out.u8(if *opcode == GOTO { GOTO_W } else { JSR_W });
                    out.i32(delta);
                } else {
                    out.u8(*opcode);
                    out.i16(delta as i16);
                }
            }
            Form::Ldc { opcode, index } => {
                out.u8(*opcode);
                if *opcode == LDC {
                    out.u8(*index as u8);
                } else {
                    out.u16(*index);
                }
            }
            Form::Interface { index, count } => {
                out.u8(INVOKEINTERFACE);
                out.u16(*index);
                out.u8(*count);
                out.u8(0);
            }
            Form::Dynamic(index) => {
                out.u8(INVOKEDYNAMIC);
                out.u16(*index);
                out.u16(0);
            }
            Form::Multi { index, dims } => {
                out.u8(MULTIANEWARRAY);
                out.u16(*index);
                out.u8(*dims);
            }
            Form::Table {
                low,
                high,
                default,
                targets,
            } => {
                out.u8(TABLESWITCH);
                out.bytes(&[0; 3][..switch_padding(pc)]);
                out.i32(relative(*default)?);
                out.i32(*low);
                out.i32(*high);
                for target in targets {
                    out.i32(relative(*target)?);
                }
            }
            Form::Lookup { default, pairs } => {
                out.u8(LOOKUPSWITCH);
                out.bytes(&[0; 3][..switch_padding(pc)]);
                out.i32(relative(*default)?);
                out.i32(pairs.len() as i32);
                for (key, target) in pairs {
                    out.i32(*key);
                    out.i32(relative(*target)?);
                }
            }
        }
    }

    let mut ranges = Vec::new();
    for range in &code.exception_ranges {
        let start = label_offset(range.start, &positions, &offsets)?;
        let end = label_offset(range.end, &positions, &offsets)?;
        let handler = label_offset(range.handler, &positions, &offsets)?;
        if start >= end {
            debug!("dropping empty exception range in {}", method_name);
            continue;
        }
        let catch_type = match &range.catch_type {
            Some(class) => pool.class(class)?,
            None => 0,
        };
        ranges.push([start as u16, end as u16, handler as u16, catch_type]);
    }
    out.u16(ranges.len() as u16);
    for range in ranges {
        for value in range.iter() {
            out.u16(*value);
        }
    }

    let mut lines = Vec::new();
    for (position, id) in ids.iter().enumerate() {
        if let Insn::Line(line) = list.get(*id) {
            if offsets[position] < code_length {
                lines.push((offsets[position] as u16, *line));
            }
        }
    }
    let mut attributes = Vec::new();
    if !lines.is_empty() {
        let mut table = Output::default();
        table.u16(lines.len() as u16);
        for (pc, line) in lines {
            table.u16(pc);
            table.u16(line);
        }
        attributes.push((pool.utf8("LineNumberTable")?, table.0));
    }
    attributes.extend(raw_attributes(&code.attributes, pool)?);
    out.attributes(&attributes);
    Ok(out.0)
}

fn raw_attributes(attributes: &[Attribute], pool: &mut ConstantPool) -> Result<Vec<(u16, Vec<u8>)>> {
    attributes
        .iter()
        .map(|attribute| Ok((pool.utf8(&attribute.name)?, attribute.data.clone())))
        .collect()
}

fn annotation_attributes(annotations: &[Annotation], pool: &mut ConstantPool) -> Result<Vec<(u16, Vec<u8>)>> {
    let mut attributes = Vec::new();
    for (visible, name) in &[
        (true, "RuntimeVisibleAnnotations"),
        (false, "RuntimeInvisibleAnnotations"),
    ] {
        let group: Vec<&Annotation> = annotations
            .iter()
            .filter(|annotation| annotation.visible == *visible)
            .collect();
        if group.is_empty() {
            continue;
        }
        let mut out = Output::default();
        out.u16(group.len() as u16);
        for annotation in group {
            write_annotation(&mut out, annotation, pool)?;
        }
        attributes.push((pool.utf8(name)?, out.0));
    }
    Ok(attributes)
}

fn write_annotation(out: &mut Output, annotation: &Annotation, pool: &mut ConstantPool) -> Result<()> {
    out.u16(pool.utf8(&annotation.descriptor)?);
    out.u16(annotation.values.len() as u16);
    for (name, value) in &annotation.values {
        out.u16(pool.utf8(name)?);
        write_element_value(out, value, pool)?;
    }
    Ok(())
}

fn write_element_value(out: &mut Output, value: &ElementValue, pool: &mut ConstantPool) -> Result<()> {
    match value {
        ElementValue::Const {
            tag,
            value: Constant::String(text),
        } if *tag == b's' => {
            out.u8(b's');
            out.u16(pool.utf8(text)?);
        }
        ElementValue::Const { tag, value } => {
            out.u8(*tag);
            out.u16(pool.constant(value)?);
        }
        ElementValue::Enum {
            type_name,
            const_name,
        } => {
            out.u8(b'e');
            out.u16(pool.utf8(type_name)?);
            out.u16(pool.utf8(const_name)?);
        }
        ElementValue::Class(name) => {
            out.u8(b'c');
            out.u16(pool.utf8(name)?);
        }
        ElementValue::Annotation(annotation) => {
            out.u8(b'@');
            write_annotation(out, annotation, pool)?;
        }
        ElementValue::Array(values) => {
            out.u8(b'[');
            out.u16(values.len() as u16);
            for value in values {
                write_element_value(out, value, pool)?;
            }
        }
    }
    Ok(())
}

/// Encodes one class file.
pub fn encode(class: &ClassUnit) -> Result<Vec<u8>> {
    encode_class(class).map_err(|err| in_class(err, &class.name))
}

fn encode_class(class: &ClassUnit) -> Result<Vec<u8>> {
    let mut pool = class.pool.clone().unwrap_or_default();
    let mut body = Output::default();

    body.u16(class.access.bits());
    body.u16(pool.class(&class.name)?);
    body.u16(match &class.super_name {
        Some(name) => pool.class(name)?,
        None => 0,
    });
    body.u16(class.interfaces.len() as u16);
    for interface in &class.interfaces {
        body.u16(pool.class(interface)?);
    }

    body.u16(class.fields.len() as u16);
    for field in &class.fields {
        body.u16(field.access.bits());
        body.u16(pool.utf8(&field.name)?);
        body.u16(pool.utf8(&field.descriptor)?);
        let mut attributes = Vec::new();
        if let Some(constant) = &field.constant_value {
            let mut value = Output::default();
            value.u16(pool.constant(constant)?);
            attributes.push((pool.utf8("ConstantValue")?, value.0));
        }
        attributes.extend(annotation_attributes(&field.annotations, &mut pool)?);
        attributes.extend(raw_attributes(&field.attributes, &mut pool)?);
        body.attributes(&attributes);
    }

    body.u16(class.methods.len() as u16);
    for method in &class.methods {
        body.u16(method.access.bits());
        body.u16(pool.utf8(&method.name)?);
        body.u16(pool.utf8(&method.descriptor)?);
        let mut attributes = Vec::new();
        if let Some(code) = &method.code {
            let encoded = encode_code(method, code, &mut pool)?;
            attributes.push((pool.utf8("Code")?, encoded));
        }
        if !method.exceptions.is_empty() {
            let mut exceptions = Output::default();
            exceptions.u16(method.exceptions.len() as u16);
            for exception in &method.exceptions {
                exceptions.u16(pool.class(exception)?);
            }
            attributes.push((pool.utf8("Exceptions")?, exceptions.0));
        }
        attributes.extend(annotation_attributes(&method.annotations, &mut pool)?);
        attributes.extend(raw_attributes(&method.attributes, &mut pool)?);
        body.attributes(&attributes);
    }

    let mut attributes = Vec::new();
    if let Some(source_file) = &class.source_file {
        let mut value = Output::default();
        value.u16(pool.utf8(source_file)?);
        attributes.push((pool.utf8("SourceFile")?, value.0));
    }
    if !class.inner_classes.is_empty() {
        let mut table = Output::default();
        table.u16(class.inner_classes.len() as u16);
        for inner in &class.inner_classes {
            table.u16(pool.class(&inner.inner)?);
            table.u16(match &inner.outer {
                Some(outer) => pool.class(outer)?,
                None => 0,
            });
            table.u16(match &inner.name {
                Some(name) => pool.utf8(name)?,
                None => 0,
            });
            table.u16(inner.access.bits());
        }
        attributes.push((pool.utf8("InnerClasses")?, table.0));
    }
    attributes.extend(annotation_attributes(&class.annotations, &mut pool)?);
    attributes.extend(raw_attributes(&class.attributes, &mut pool)?);
    body.attributes(&attributes);

    let mut out = Output::default();
    out.u32(MAGIC);
    out.u16(class.minor_version);
    out.u16(class.major_version);
    pool.write(&mut out);
    out.bytes(&body.0);
    Ok(out.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::tests::mnemonics;

    const SWITCH_CODE: &[u8] = &[
        0x1a, // iload_0
        0xaa, 0, 0, // tableswitch + padding
        0, 0, 0, 23, // default -> 24
        0, 0, 0, 0, // low
        0, 0, 0, 1, // high
        0, 0, 0, 27, // 0 -> 28
        0, 0, 0, 31, // 1 -> 32
        0x13, 0, 8, // ldc_w #8
        0xac, // ireturn
        0x04, // iconst_1
        0xa7, 0xff, 0xfb, // goto 24
        0x84, 0, 1, // iinc 0 1
        0x1a, // iload_0
        0xac, // ireturn
    ];

    fn utf8(out: &mut Output, text: &str) {
        out.u8(1);
        out.u16(text.len() as u16);
        out.bytes(text.as_bytes());
    }

    /// A class `Test` with one static method `run(I)I` whose body is `code`.
    fn class_bytes(code: &[u8]) -> Vec<u8> {
        let mut out = Output::default();
        out.u32(MAGIC);
        out.u16(0);
        out.u16(52);
        out.u16(9);
        utf8(&mut out, "Test");
        out.u8(7);
        out.u16(1);
        utf8(&mut out, "java/lang/Object");
        out.u8(7);
        out.u16(3);
        utf8(&mut out, "run");
        utf8(&mut out, "(I)I");
        utf8(&mut out, "Code");
        out.u8(3);
        out.i32(70000);

        out.u16(0x0021);
        out.u16(2);
        out.u16(4);
        out.u16(0);
        out.u16(0);
        out.u16(1);
        out.u16(0x0009);
        out.u16(5);
        out.u16(6);
        out.u16(1);
        out.u16(7);
        out.u32(12 + code.len() as u32);
        out.u16(1);
        out.u16(1);
        out.u32(code.len() as u32);
        out.bytes(code);
        out.u16(0);
        out.u16(0);
        out.u16(0);
        out.0
    }

    #[test]
    fn untouched_class_round_trips_byte_for_byte() {
        let bytes = class_bytes(SWITCH_CODE);
        let class = decode(&bytes).unwrap();
        assert_eq!(class.name, "Test");
        assert_eq!(encode(&class).unwrap(), bytes);
    }

    #[test]
    fn code_decodes_to_canonical_instructions() {
        let class = decode(&class_bytes(SWITCH_CODE)).unwrap();
        let code = class.methods[0].code.as_ref().unwrap();
        let list = &code.instructions;
        assert_eq!(
            mnemonics(list),
            vec![
                "ILOAD",
                "TABLESWITCH",
                "LABEL",
                "LDC",
                "IRETURN",
                "LABEL",
                "ICONST_1",
                "GOTO",
                "LABEL",
                "IINC",
                "ILOAD",
                "IRETURN",
            ]
        );
        let ids = list.ids();
        assert_eq!(list.get(ids[3]), &Insn::Ldc(Constant::Int(70000)));
        assert_eq!(list.get(ids[7]).jump_targets(), vec![Label(ids[2])]);
        match list.get(ids[1]) {
            Insn::TableSwitch {
                default, targets, ..
            } => {
                assert_eq!(default.id(), ids[2]);
                assert_eq!(targets, &vec![Label(ids[5]), Label(ids[8])]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn changed_slots_pick_a_fitting_encoding() {
        let mut class = decode(&class_bytes(SWITCH_CODE)).unwrap();
        {
            let code = class.methods[0].code.as_mut().unwrap();
            code.max_locals = 301;
            let ids = code.instructions.ids();
            code.instructions.replace(ids[10], Insn::Var { opcode: ILOAD, var: 300 });
            *code.instructions.get_mut(ids[9]) = Insn::Iinc { var: 0, incr: 1000 };
        }
        let encoded = encode(&class).unwrap();
        let decoded = decode(&encoded).unwrap();
        let code = decoded.methods[0].code.as_ref().unwrap();
        let ids = code.instructions.ids();
        assert_eq!(code.max_locals, 301);
        assert_eq!(code.instructions.get(ids[9]), &Insn::Iinc { var: 0, incr: 1000 });
        assert_eq!(code.instructions.get(ids[10]), &Insn::Var { opcode: ILOAD, var: 300 });
    }

    #[test]
    fn new_entries_are_appended_to_the_pool() {
        let mut class = decode(&class_bytes(SWITCH_CODE)).unwrap();
        let original_len = class.pool.as_ref().unwrap().len();
        class.methods[0].annotations.push(Annotation {
            descriptor: "LObfuscatedName;".to_string(),
            visible: false,
            values: vec![(
                "value".to_string(),
                ElementValue::Const {
                    tag: b's',
                    value: Constant::String("ab".to_string()),
                },
            )],
        });
        let decoded = decode(&encode(&class).unwrap()).unwrap();
        assert!(decoded.pool.as_ref().unwrap().len() > original_len);
        assert_eq!(decoded.methods[0].annotations, class.methods[0].annotations);
        assert_eq!(decoded.methods[0].annotations[0].string_value("value"), Some("ab"));
    }

    #[test]
    fn built_class_encodes_without_original_pool() {
        let mut class = ClassUnit::new("deob/Statics", Some("java/lang/Object"), AccessFlags::PUBLIC);
        let mut method = MethodUnit::new("deob/Statics", "<clinit>", "()V", AccessFlags::STATIC);
        let mut code = Code::default();
        code.instructions.push(Insn::Ldc(Constant::Long(5)));
        code.instructions.push(Insn::Field {
            opcode: PUTSTATIC,
            member: MemberRef::new("deob/Statics", "field1", "J"),
        });
        code.instructions.push(Insn::Simple(RETURN));
        code.max_stack = 2;
        method.code = Some(code);
        class.methods.push(method);
        class.fields.push(FieldUnit::new("deob/Statics", "field1", "J", AccessFlags::STATIC));

        let decoded = decode(&encode(&class).unwrap()).unwrap();
        assert_eq!(decoded.name, "deob/Statics");
        assert_eq!(decoded.fields[0].name, "field1");
        let list = &decoded.methods[0].code.as_ref().unwrap().instructions;
        assert_eq!(mnemonics(list), vec!["LDC", "PUTSTATIC", "RETURN"]);
    }

    #[test]
    fn truncated_input_is_a_format_error() {
        let bytes = class_bytes(SWITCH_CODE);
        match decode(&bytes[..bytes.len() - 10]) {
            Err(Error::ClassFormat { class, .. }) => assert_eq!(class, "Test"),
            other => panic!("unexpected {:?}", other.map(|class| class.name)),
        }
        assert!(matches!(decode(&[0, 1, 2, 3]), Err(Error::ClassFormat { .. })));
    }

    #[test]
    fn modified_utf8_handles_nul_and_supplementary() {
        let text = "a\u{0}b\u{1F600}";
        let encoded = mutf8::encode(text);
        assert_eq!(&encoded[1..3], &[0xC0, 0x80]);
        assert_eq!(mutf8::decode(&encoded), text);
    }
}
