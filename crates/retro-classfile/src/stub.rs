use crate::classfile::{ClassFile, ClassMember, ACC_ABSTRACT, ACC_INTERFACE, ACC_STATIC};
use crate::descriptor::{parse_method_descriptor, MethodDescriptor};
use crate::error::Result;

/// The declaration-level view of a class: supertypes, member signatures and annotation
/// types, without method bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassStub {
    pub internal_name: String,
    pub access_flags: u16,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    /// Internal names of the class-level annotation types.
    pub annotations: Vec<String>,
    pub fields: Vec<FieldStub>,
    pub methods: Vec<MethodStub>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldStub {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodStub {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub parsed_descriptor: MethodDescriptor,
}

impl ClassStub {
    pub fn from_classfile(class: &ClassFile) -> Result<Self> {
        let annotations = class
            .annotations()?
            .into_iter()
            .filter_map(|a| a.type_internal_name)
            .collect();

        let fields = class
            .fields
            .iter()
            .map(|f| FieldStub {
                access_flags: f.access_flags,
                name: f.name.clone(),
                descriptor: f.descriptor.clone(),
            })
            .collect();

        let methods = class
            .methods
            .iter()
            .map(MethodStub::from_member)
            .collect::<Result<Vec<_>>>()?;

        Ok(ClassStub {
            internal_name: class.this_class.clone(),
            access_flags: class.access_flags,
            super_class: class.super_class.clone(),
            interfaces: class.interfaces.clone(),
            annotations,
            fields,
            methods,
        })
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub fn has_annotation(&self, internal_name: &str) -> bool {
        self.annotations.iter().any(|a| a == internal_name)
    }

    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodStub> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn field(&self, name: &str, descriptor: &str) -> Option<&FieldStub> {
        self.fields
            .iter()
            .find(|f| f.name == name && f.descriptor == descriptor)
    }
}

impl MethodStub {
    fn from_member(member: &ClassMember) -> Result<Self> {
        Ok(MethodStub {
            access_flags: member.access_flags,
            name: member.name.clone(),
            descriptor: member.descriptor.clone(),
            parsed_descriptor: parse_method_descriptor(&member.descriptor)?,
        })
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }
}

impl ClassFile {
    pub fn stub(&self) -> Result<ClassStub> {
        ClassStub::from_classfile(self)
    }
}
