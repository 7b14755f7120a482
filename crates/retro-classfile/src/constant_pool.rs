use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::reader::{Reader, Writer};

/// One constant pool slot.
///
/// Floating point constants keep their raw bits so that a parsed pool is written back
/// bit-for-bit (and so entries can be hashed for interning).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CpInfo {
    /// Index 0 and the second slot of `Long`/`Double` entries.
    Unusable,
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref {
        class_index: u16,
        name_and_type_index: u16,
    },
    Methodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType(u16),
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    Module(u16),
    Package(u16),
}

impl CpInfo {
    pub fn kind(&self) -> &'static str {
        match self {
            CpInfo::Unusable => "Unusable",
            CpInfo::Utf8(_) => "Utf8",
            CpInfo::Integer(_) => "Integer",
            CpInfo::Float(_) => "Float",
            CpInfo::Long(_) => "Long",
            CpInfo::Double(_) => "Double",
            CpInfo::Class(_) => "Class",
            CpInfo::String(_) => "String",
            CpInfo::Fieldref { .. } => "Fieldref",
            CpInfo::Methodref { .. } => "Methodref",
            CpInfo::InterfaceMethodref { .. } => "InterfaceMethodref",
            CpInfo::NameAndType { .. } => "NameAndType",
            CpInfo::MethodHandle { .. } => "MethodHandle",
            CpInfo::MethodType(_) => "MethodType",
            CpInfo::Dynamic { .. } => "Dynamic",
            CpInfo::InvokeDynamic { .. } => "InvokeDynamic",
            CpInfo::Module(_) => "Module",
            CpInfo::Package(_) => "Package",
        }
    }

    fn is_wide(&self) -> bool {
        matches!(self, CpInfo::Long(_) | CpInfo::Double(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRefKind {
    Field,
    Method,
    InterfaceMethod,
}

/// A resolved `Fieldref`/`Methodref`/`InterfaceMethodref`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    pub kind: MemberRefKind,
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

/// Append-only constant pool.
///
/// Existing indices never move, so raw attribute payloads that embed pool indices stay valid
/// after new symbols are interned.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<CpInfo>,
    lookup: HashMap<CpInfo, u16>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self {
            entries: vec![CpInfo::Unusable],
            lookup: HashMap::new(),
        }
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `constant_pool_count` value: number of slots including index 0.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub(crate) fn parse(reader: &mut Reader<'_>) -> Result<Self> {
        let count = reader.read_u2()? as usize;
        let mut pool = ConstantPool::new();
        while pool.entries.len() < count {
            let tag = reader.read_u1()?;
            let entry = match tag {
                1 => {
                    let len = reader.read_u2()? as usize;
                    CpInfo::Utf8(decode_modified_utf8(reader.read_bytes(len)?)?)
                }
                3 => CpInfo::Integer(reader.read_i4()?),
                4 => CpInfo::Float(reader.read_u4()?),
                5 => CpInfo::Long(reader.read_u8()? as i64),
                6 => CpInfo::Double(reader.read_u8()?),
                7 => CpInfo::Class(reader.read_u2()?),
                8 => CpInfo::String(reader.read_u2()?),
                9 => CpInfo::Fieldref {
                    class_index: reader.read_u2()?,
                    name_and_type_index: reader.read_u2()?,
                },
                10 => CpInfo::Methodref {
                    class_index: reader.read_u2()?,
                    name_and_type_index: reader.read_u2()?,
                },
                11 => CpInfo::InterfaceMethodref {
                    class_index: reader.read_u2()?,
                    name_and_type_index: reader.read_u2()?,
                },
                12 => CpInfo::NameAndType {
                    name_index: reader.read_u2()?,
                    descriptor_index: reader.read_u2()?,
                },
                15 => CpInfo::MethodHandle {
                    reference_kind: reader.read_u1()?,
                    reference_index: reader.read_u2()?,
                },
                16 => CpInfo::MethodType(reader.read_u2()?),
                17 => CpInfo::Dynamic {
                    bootstrap_method_attr_index: reader.read_u2()?,
                    name_and_type_index: reader.read_u2()?,
                },
                18 => CpInfo::InvokeDynamic {
                    bootstrap_method_attr_index: reader.read_u2()?,
                    name_and_type_index: reader.read_u2()?,
                },
                19 => CpInfo::Module(reader.read_u2()?),
                20 => CpInfo::Package(reader.read_u2()?),
                other => return Err(Error::InvalidConstantPoolTag(other)),
            };
            pool.push(entry)?;
        }
        if pool.entries.len() != count {
            // A trailing long/double claimed a slot past the declared count.
            return Err(Error::MalformedAttribute("constant_pool"));
        }
        Ok(pool)
    }

    pub(crate) fn write(&self, out: &mut Writer) -> Result<()> {
        let count = u16::try_from(self.entries.len()).map_err(|_| Error::ConstantPoolOverflow)?;
        out.write_u2(count);
        for entry in &self.entries {
            match entry {
                CpInfo::Unusable => {}
                CpInfo::Utf8(value) => {
                    let bytes = encode_modified_utf8(value);
                    let len = u16::try_from(bytes.len()).map_err(|_| Error::InvalidModifiedUtf8)?;
                    out.write_u1(1);
                    out.write_u2(len);
                    out.write_bytes(&bytes);
                }
                CpInfo::Integer(v) => {
                    out.write_u1(3);
                    out.write_i4(*v);
                }
                CpInfo::Float(bits) => {
                    out.write_u1(4);
                    out.write_u4(*bits);
                }
                CpInfo::Long(v) => {
                    out.write_u1(5);
                    out.write_u8(*v as u64);
                }
                CpInfo::Double(bits) => {
                    out.write_u1(6);
                    out.write_u8(*bits);
                }
                CpInfo::Class(idx) => {
                    out.write_u1(7);
                    out.write_u2(*idx);
                }
                CpInfo::String(idx) => {
                    out.write_u1(8);
                    out.write_u2(*idx);
                }
                CpInfo::Fieldref {
                    class_index,
                    name_and_type_index,
                } => {
                    out.write_u1(9);
                    out.write_u2(*class_index);
                    out.write_u2(*name_and_type_index);
                }
                CpInfo::Methodref {
                    class_index,
                    name_and_type_index,
                } => {
                    out.write_u1(10);
                    out.write_u2(*class_index);
                    out.write_u2(*name_and_type_index);
                }
                CpInfo::InterfaceMethodref {
                    class_index,
                    name_and_type_index,
                } => {
                    out.write_u1(11);
                    out.write_u2(*class_index);
                    out.write_u2(*name_and_type_index);
                }
                CpInfo::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    out.write_u1(12);
                    out.write_u2(*name_index);
                    out.write_u2(*descriptor_index);
                }
                CpInfo::MethodHandle {
                    reference_kind,
                    reference_index,
                } => {
                    out.write_u1(15);
                    out.write_u1(*reference_kind);
                    out.write_u2(*reference_index);
                }
                CpInfo::MethodType(idx) => {
                    out.write_u1(16);
                    out.write_u2(*idx);
                }
                CpInfo::Dynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    out.write_u1(17);
                    out.write_u2(*bootstrap_method_attr_index);
                    out.write_u2(*name_and_type_index);
                }
                CpInfo::InvokeDynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    out.write_u1(18);
                    out.write_u2(*bootstrap_method_attr_index);
                    out.write_u2(*name_and_type_index);
                }
                CpInfo::Module(idx) => {
                    out.write_u1(19);
                    out.write_u2(*idx);
                }
                CpInfo::Package(idx) => {
                    out.write_u1(20);
                    out.write_u2(*idx);
                }
            }
        }
        Ok(())
    }

    fn push(&mut self, entry: CpInfo) -> Result<u16> {
        let width = if entry.is_wide() { 2 } else { 1 };
        if self.entries.len() + width > u16::MAX as usize {
            return Err(Error::ConstantPoolOverflow);
        }
        let index = self.entries.len() as u16;
        self.lookup.entry(entry.clone()).or_insert(index);
        self.entries.push(entry);
        if width == 2 {
            self.entries.push(CpInfo::Unusable);
        }
        Ok(index)
    }

    /// Returns the index of an equal entry, appending one if the pool has none.
    pub fn intern(&mut self, entry: CpInfo) -> Result<u16> {
        if let Some(&index) = self.lookup.get(&entry) {
            return Ok(index);
        }
        self.push(entry)
    }

    pub fn utf8(&mut self, value: &str) -> Result<u16> {
        self.intern(CpInfo::Utf8(value.to_string()))
    }

    /// Interns a `Class` entry; `name` is an internal name or an array descriptor.
    pub fn class(&mut self, name: &str) -> Result<u16> {
        let name_index = self.utf8(name)?;
        self.intern(CpInfo::Class(name_index))
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name_index = self.utf8(name)?;
        let descriptor_index = self.utf8(descriptor)?;
        self.intern(CpInfo::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class_index = self.class(class)?;
        let name_and_type_index = self.name_and_type(name, descriptor)?;
        self.intern(CpInfo::Fieldref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn method_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> Result<u16> {
        let class_index = self.class(class)?;
        let name_and_type_index = self.name_and_type(name, descriptor)?;
        if interface {
            self.intern(CpInfo::InterfaceMethodref {
                class_index,
                name_and_type_index,
            })
        } else {
            self.intern(CpInfo::Methodref {
                class_index,
                name_and_type_index,
            })
        }
    }

    pub fn get(&self, index: u16) -> Result<&CpInfo> {
        match self.entries.get(index as usize) {
            None | Some(CpInfo::Unusable) => Err(Error::InvalidConstantPoolIndex(index)),
            Some(entry) => Ok(entry),
        }
    }

    pub fn get_utf8(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            CpInfo::Utf8(value) => Ok(value),
            other => Err(mismatch(index, "Utf8", other)),
        }
    }

    pub fn get_class_name(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            CpInfo::Class(name_index) => self.get_utf8(*name_index),
            other => Err(mismatch(index, "Class", other)),
        }
    }

    pub fn get_name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index)? {
            CpInfo::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.get_utf8(*name_index)?, self.get_utf8(*descriptor_index)?)),
            other => Err(mismatch(index, "NameAndType", other)),
        }
    }

    pub fn get_member_ref(&self, index: u16) -> Result<MemberRef> {
        let (kind, class_index, name_and_type_index) = match self.get(index)? {
            CpInfo::Fieldref {
                class_index,
                name_and_type_index,
            } => (MemberRefKind::Field, *class_index, *name_and_type_index),
            CpInfo::Methodref {
                class_index,
                name_and_type_index,
            } => (MemberRefKind::Method, *class_index, *name_and_type_index),
            CpInfo::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => (
                MemberRefKind::InterfaceMethod,
                *class_index,
                *name_and_type_index,
            ),
            other => return Err(mismatch(index, "Methodref", other)),
        };
        let (name, descriptor) = self.get_name_and_type(name_and_type_index)?;
        Ok(MemberRef {
            kind,
            class: self.get_class_name(class_index)?.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        })
    }
}

fn mismatch(index: u16, expected: &'static str, found: &CpInfo) -> Error {
    Error::ConstantPoolTypeMismatch {
        index,
        expected,
        found: found.kind(),
    }
}

fn decode_modified_utf8(bytes: &[u8]) -> Result<String> {
    if bytes.iter().all(|b| *b != 0 && *b < 0x80) {
        return String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidModifiedUtf8);
    }

    let continuation = |b: Option<&u8>| -> Result<u16> {
        match b {
            Some(b) if b & 0xC0 == 0x80 => Ok((b & 0x3F) as u16),
            _ => Err(Error::InvalidModifiedUtf8),
        }
    };

    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b0 = bytes[i];
        if b0 & 0x80 == 0 {
            if b0 == 0 {
                return Err(Error::InvalidModifiedUtf8);
            }
            units.push(b0 as u16);
            i += 1;
        } else if b0 & 0xE0 == 0xC0 {
            let b1 = continuation(bytes.get(i + 1))?;
            units.push((((b0 & 0x1F) as u16) << 6) | b1);
            i += 2;
        } else if b0 & 0xF0 == 0xE0 {
            let b1 = continuation(bytes.get(i + 1))?;
            let b2 = continuation(bytes.get(i + 2))?;
            units.push((((b0 & 0x0F) as u16) << 12) | (b1 << 6) | b2);
            i += 3;
        } else {
            return Err(Error::InvalidModifiedUtf8);
        }
    }
    String::from_utf16(&units).map_err(|_| Error::InvalidModifiedUtf8)
}

fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}
