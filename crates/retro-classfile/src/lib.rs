#![forbid(unsafe_code)]

mod annotation;
pub mod bytecode;
mod classfile;
mod code;
mod constant_pool;
mod descriptor;
mod error;
mod frames;
mod patch;
mod reader;
mod stackmap;
mod stub;

pub use crate::annotation::{Annotation, RUNTIME_INVISIBLE_ANNOTATIONS, RUNTIME_VISIBLE_ANNOTATIONS};
pub use crate::bytecode::Insn;
pub use crate::classfile::{
    simple_name, Attribute, ClassFile, ClassMember, ACC_ABSTRACT, ACC_BRIDGE, ACC_FINAL,
    ACC_INTERFACE, ACC_NATIVE, ACC_PRIVATE, ACC_PROTECTED, ACC_PUBLIC, ACC_STATIC, ACC_SUPER,
    ACC_SYNTHETIC,
};
pub use crate::code::{
    encode_local_variables, parse_local_variables, Code, ExceptionHandler, LocalVariable,
    LINE_NUMBER_TABLE, LOCAL_VARIABLE_TABLE, LOCAL_VARIABLE_TYPE_TABLE, STACK_MAP_TABLE,
};
pub use crate::constant_pool::{ConstantPool, CpInfo, MemberRef, MemberRefKind};
pub use crate::descriptor::{parse_field_descriptor, parse_method_descriptor};
pub use crate::descriptor::{BaseType, FieldType, MethodDescriptor, ReturnType};
pub use crate::error::{Error, Result};
pub use crate::frames::{retype_frames, ClassHierarchy, HierarchyEntry, MethodShape};
pub use crate::patch::CodePatch;
pub use crate::stub::{ClassStub, FieldStub, MethodStub};
