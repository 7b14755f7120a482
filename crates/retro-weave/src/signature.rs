//! Descriptor rewriting: every reference token is resolved on its own and replaced by its
//! polyfill when one exists. Primitive tokens, arity and order never change.

use retro_classfile::{FieldType, MethodDescriptor, ReturnType};

use crate::resolve::Resolver;

pub fn rewrite_field_type(ty: &FieldType, resolver: &Resolver<'_>) -> FieldType {
    match ty {
        FieldType::Base(_) => ty.clone(),
        FieldType::Object(name) => match resolver.resolve(name) {
            Some(mapping) => FieldType::Object(mapping.polyfill),
            None => ty.clone(),
        },
        FieldType::Array(element) => FieldType::Array(Box::new(rewrite_field_type(element, resolver))),
    }
}

pub fn rewrite_method_descriptor(desc: &MethodDescriptor, resolver: &Resolver<'_>) -> MethodDescriptor {
    MethodDescriptor {
        params: desc
            .params
            .iter()
            .map(|p| rewrite_field_type(p, resolver))
            .collect(),
        return_type: match &desc.return_type {
            ReturnType::Void => ReturnType::Void,
            ReturnType::Type(ty) => ReturnType::Type(rewrite_field_type(ty, resolver)),
        },
    }
}
