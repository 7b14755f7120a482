use crate::annotation::{Annotation, RUNTIME_INVISIBLE_ANNOTATIONS, RUNTIME_VISIBLE_ANNOTATIONS};
use crate::code::Code;
use crate::constant_pool::ConstantPool;
use crate::error::{Error, Result};
use crate::reader::{Reader, Writer};

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_BRIDGE: u16 = 0x0040;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;

const MAGIC: u32 = 0xCAFEBABE;

/// A class or interface.
///
/// Symbolic references (class names, member names and descriptors, attribute names) are held
/// as strings and interned into the constant pool on write. Attribute payloads stay raw; the
/// pool is append-only, so the indices they embed remain valid.
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: String,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<ClassMember>,
    pub methods: Vec<ClassMember>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMember {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub info: Vec<u8>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, info: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            info,
        }
    }
}

impl ClassFile {
    /// An empty class targeting the Java 6 format (no stack map frames required).
    pub fn new(this_class: &str, super_class: Option<&str>, access_flags: u16) -> Self {
        Self {
            minor_version: 0,
            major_version: 50,
            constant_pool: ConstantPool::new(),
            access_flags,
            this_class: this_class.to_string(),
            super_class: super_class.map(str::to_string),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let magic = reader.read_u4()?;
        if magic != MAGIC {
            return Err(Error::InvalidMagic(magic));
        }

        let minor_version = reader.read_u2()?;
        let major_version = reader.read_u2()?;
        let cp = ConstantPool::parse(&mut reader)?;

        let access_flags = reader.read_u2()?;
        let this_class = cp.get_class_name(reader.read_u2()?)?.to_string();
        let super_class_idx = reader.read_u2()?;
        let super_class = if super_class_idx == 0 {
            None
        } else {
            Some(cp.get_class_name(super_class_idx)?.to_string())
        };

        let interfaces_count = reader.read_u2()? as usize;
        let mut interfaces = Vec::with_capacity(interfaces_count);
        for _ in 0..interfaces_count {
            interfaces.push(cp.get_class_name(reader.read_u2()?)?.to_string());
        }

        let fields = parse_members(&mut reader, &cp)?;
        let methods = parse_members(&mut reader, &cp)?;
        let attributes = parse_attributes(&mut reader, &cp)?;

        reader.ensure_empty()?;

        Ok(Self {
            minor_version,
            major_version,
            constant_pool: cp,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    /// Serializes the class. A parsed class that was not modified is reproduced byte for byte.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut cp = self.constant_pool.clone();

        let mut body = Writer::new();
        body.write_u2(self.access_flags);
        body.write_u2(cp.class(&self.this_class)?);
        match &self.super_class {
            Some(name) => body.write_u2(cp.class(name)?),
            None => body.write_u2(0),
        }
        body.write_len_u2(self.interfaces.len())?;
        for name in &self.interfaces {
            body.write_u2(cp.class(name)?);
        }
        write_members(&mut body, &mut cp, &self.fields)?;
        write_members(&mut body, &mut cp, &self.methods)?;
        write_attributes(&mut body, &mut cp, &self.attributes)?;

        let mut out = Writer::new();
        out.write_u4(MAGIC);
        out.write_u2(self.minor_version);
        out.write_u2(self.major_version);
        cp.write(&mut out)?;
        out.write_bytes(&body.into_inner());
        Ok(out.into_inner())
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    /// The part of the internal name after the last `/`.
    pub fn simple_name(&self) -> &str {
        simple_name(&self.this_class)
    }

    pub fn annotations(&self) -> Result<Vec<Annotation>> {
        collect_annotations(&self.attributes, &self.constant_pool)
    }

    pub fn method(&self, name: &str, descriptor: &str) -> Option<&ClassMember> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn field(&self, name: &str, descriptor: &str) -> Option<&ClassMember> {
        self.fields
            .iter()
            .find(|f| f.name == name && f.descriptor == descriptor)
    }
}

/// The part of an internal name after the last `/`.
pub fn simple_name(internal_name: &str) -> &str {
    internal_name
        .rsplit_once('/')
        .map_or(internal_name, |(_, simple)| simple)
}

impl ClassMember {
    pub fn new(access_flags: u16, name: &str, descriptor: &str) -> Self {
        Self {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            attributes: Vec::new(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn annotations(&self, cp: &ConstantPool) -> Result<Vec<Annotation>> {
        collect_annotations(&self.attributes, cp)
    }

    /// Decodes the method body, if the member has one.
    pub fn code(&self, cp: &ConstantPool) -> Result<Option<Code>> {
        match self.attribute(Code::ATTRIBUTE_NAME) {
            Some(attr) => Ok(Some(Code::parse(&attr.info, cp)?)),
            None => Ok(None),
        }
    }

    /// Replaces the method body in place, keeping the attribute order of the member.
    pub fn set_code(&mut self, code: &Code, cp: &mut ConstantPool) -> Result<()> {
        let info = code.encode(cp)?;
        match self
            .attributes
            .iter_mut()
            .find(|a| a.name == Code::ATTRIBUTE_NAME)
        {
            Some(attr) => attr.info = info,
            None => self.attributes.push(Attribute::new(Code::ATTRIBUTE_NAME, info)),
        }
        Ok(())
    }
}

fn collect_annotations(attributes: &[Attribute], cp: &ConstantPool) -> Result<Vec<Annotation>> {
    let mut anns = Vec::new();
    for attr in attributes {
        if attr.name == RUNTIME_VISIBLE_ANNOTATIONS || attr.name == RUNTIME_INVISIBLE_ANNOTATIONS {
            anns.extend(Annotation::parse_all(&attr.info, cp)?);
        }
    }
    Ok(anns)
}

fn parse_members(reader: &mut Reader<'_>, cp: &ConstantPool) -> Result<Vec<ClassMember>> {
    let count = reader.read_u2()? as usize;
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        let access_flags = reader.read_u2()?;
        let name = cp.get_utf8(reader.read_u2()?)?.to_string();
        let descriptor = cp.get_utf8(reader.read_u2()?)?.to_string();
        let attributes = parse_attributes(reader, cp)?;
        members.push(ClassMember {
            access_flags,
            name,
            descriptor,
            attributes,
        });
    }
    Ok(members)
}

pub(crate) fn parse_attributes(
    reader: &mut Reader<'_>,
    cp: &ConstantPool,
) -> Result<Vec<Attribute>> {
    let attributes_count = reader.read_u2()? as usize;
    let mut attributes = Vec::with_capacity(attributes_count);
    for _ in 0..attributes_count {
        let name_index = reader.read_u2()?;
        let length = reader.read_u4()? as usize;
        let info = reader.read_bytes(length)?;
        attributes.push(Attribute {
            name: cp.get_utf8(name_index)?.to_string(),
            info: info.to_vec(),
        });
    }
    Ok(attributes)
}

fn write_members(out: &mut Writer, cp: &mut ConstantPool, members: &[ClassMember]) -> Result<()> {
    out.write_len_u2(members.len())?;
    for member in members {
        out.write_u2(member.access_flags);
        out.write_u2(cp.utf8(&member.name)?);
        out.write_u2(cp.utf8(&member.descriptor)?);
        write_attributes(out, cp, &member.attributes)?;
    }
    Ok(())
}

pub(crate) fn write_attributes(
    out: &mut Writer,
    cp: &mut ConstantPool,
    attributes: &[Attribute],
) -> Result<()> {
    out.write_len_u2(attributes.len())?;
    for attr in attributes {
        out.write_u2(cp.utf8(&attr.name)?);
        let len = u32::try_from(attr.info.len())
            .map_err(|_| Error::MalformedAttribute("attribute length"))?;
        out.write_u4(len);
        out.write_bytes(&attr.info);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{self, Insn};

    fn sample_class() -> ClassFile {
        let mut class = ClassFile::new("com/example/Greeter", Some("java/lang/Object"), ACC_PUBLIC | ACC_SUPER);
        class.interfaces.push("java/lang/Runnable".to_string());
        class
            .fields
            .push(ClassMember::new(ACC_PRIVATE, "name", "Ljava/lang/String;"));

        let super_init = class
            .constant_pool
            .method_ref("java/lang/Object", "<init>", "()V", false)
            .unwrap();
        let code = Code {
            max_stack: 1,
            max_locals: 1,
            bytecode: bytecode::assemble(&[
                Insn::op(bytecode::ALOAD_0),
                Insn::with_u2(bytecode::INVOKESPECIAL, super_init),
                Insn::op(bytecode::RETURN),
            ])
            .unwrap(),
            exception_table: Vec::new(),
            attributes: Vec::new(),
        };
        let mut init = ClassMember::new(ACC_PUBLIC, "<init>", "()V");
        init.set_code(&code, &mut class.constant_pool).unwrap();
        class.methods.push(init);
        class
            .methods
            .push(ClassMember::new(ACC_PUBLIC | ACC_ABSTRACT, "run", "()V"));
        class
    }

    #[test]
    fn written_class_parses_back() {
        let class = sample_class();
        let bytes = class.to_bytes().unwrap();
        let parsed = ClassFile::parse(&bytes).unwrap();

        assert_eq!(parsed.this_class, "com/example/Greeter");
        assert_eq!(parsed.super_class.as_deref(), Some("java/lang/Object"));
        assert_eq!(parsed.interfaces, vec!["java/lang/Runnable".to_string()]);
        assert_eq!(parsed.fields, class.fields);
        assert_eq!(parsed.methods, class.methods);

        let code = parsed.methods[0].code(&parsed.constant_pool).unwrap().unwrap();
        assert_eq!(code.bytecode.len(), 5);
        assert_eq!(code.bytecode[1], bytecode::INVOKESPECIAL);
        let index = u16::from_be_bytes([code.bytecode[2], code.bytecode[3]]);
        let target = parsed.constant_pool.get_member_ref(index).unwrap();
        assert_eq!((target.class.as_str(), target.name.as_str()), ("java/lang/Object", "<init>"));
    }

    #[test]
    fn unmodified_class_is_reproduced_byte_for_byte() {
        let bytes = sample_class().to_bytes().unwrap();
        let reparsed = ClassFile::parse(&bytes).unwrap();
        assert_eq!(reparsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_class().to_bytes().unwrap();
        bytes[0] = 0;
        assert!(matches!(ClassFile::parse(&bytes), Err(Error::InvalidMagic(_))));
    }

    #[test]
    fn simple_name_strips_package() {
        assert_eq!(simple_name("a/b/C$$Lambda$1"), "C$$Lambda$1");
        assert_eq!(simple_name("Top"), "Top");
    }
}
