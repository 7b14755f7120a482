//! Concrete forwarders for interface default methods that the lowering pass moved into a
//! companion class as static functions taking the receiver explicitly.

use std::collections::HashSet;

use retro_classfile::bytecode::{ALOAD_0, INVOKESTATIC};
use retro_classfile::{
    ClassFile, ClassMember, Code, Insn, MethodDescriptor, Result, ACC_PUBLIC,
};

use crate::diagnostics::{Diagnostic, Location};
use crate::resolve::Resolver;

/// An abstract interface method with a companion implementation.
struct Forwarder {
    name: String,
    descriptor: String,
    parsed: MethodDescriptor,
    companion: String,
    companion_descriptor: String,
}

pub(crate) fn synthesize_default_forwarders(
    class: &mut ClassFile,
    resolver: &Resolver<'_>,
) -> Vec<Diagnostic> {
    if class.is_interface() {
        return Vec::new();
    }

    let forwarders = collect_forwarders(class, resolver);
    let mut diagnostics = Vec::new();
    for forwarder in forwarders {
        match forwarder_method(class, &forwarder) {
            Ok(method) => {
                tracing::debug!(
                    target: crate::TRACE_TARGET,
                    class = %class.this_class,
                    method = %forwarder.name,
                    companion = %forwarder.companion,
                    "synthesized default-method forwarder"
                );
                class.methods.push(method);
            }
            Err(err) => diagnostics.push(Diagnostic::malformed(
                Location::method(&class.this_class, &forwarder.name, &forwarder.descriptor),
                err,
            )),
        }
    }
    diagnostics
}

fn collect_forwarders(class: &ClassFile, resolver: &Resolver<'_>) -> Vec<Forwarder> {
    let context = resolver.context();
    let conventions = resolver.conventions();

    // Anything with a body on the class or its superclasses already satisfies the method.
    let mut implemented: HashSet<(String, String)> = class
        .methods
        .iter()
        .map(|m| (m.name.clone(), m.descriptor.clone()))
        .collect();
    for superclass in context.superclasses(&class.this_class).into_iter().skip(1) {
        implemented.extend(
            superclass
                .methods
                .iter()
                .filter(|m| !m.is_abstract())
                .map(|m| (m.name.clone(), m.descriptor.clone())),
        );
    }

    let mut forwarders = Vec::new();
    for interface in context.interface_closure(&class.this_class) {
        let Some(stub) = context.lookup(&interface) else {
            continue;
        };
        let companion_name = conventions.companion_name(&interface);
        let Some(companion) = context.lookup(&companion_name) else {
            continue;
        };

        for method in stub.methods.iter().filter(|m| m.is_abstract() && !m.is_static()) {
            let key = (method.name.clone(), method.descriptor.clone());
            if implemented.contains(&key) {
                continue;
            }
            let companion_descriptor = format!("(L{interface};{}", &method.descriptor[1..]);
            let has_impl = companion
                .method(&method.name, &companion_descriptor)
                .is_some_and(|m| m.is_static());
            if !has_impl {
                continue;
            }
            implemented.insert(key);
            forwarders.push(Forwarder {
                name: method.name.clone(),
                descriptor: method.descriptor.clone(),
                parsed: method.parsed_descriptor.clone(),
                companion: companion_name.clone(),
                companion_descriptor,
            });
        }
    }
    forwarders
}

fn forwarder_method(class: &mut ClassFile, forwarder: &Forwarder) -> Result<ClassMember> {
    let mut cp = class.constant_pool.clone();
    let target = cp.method_ref(
        &forwarder.companion,
        &forwarder.name,
        &forwarder.companion_descriptor,
        false,
    )?;

    let mut insns = vec![Insn::op(ALOAD_0)];
    let mut slot = 1u16;
    for param in &forwarder.parsed.params {
        insns.push(Insn::load(param, slot));
        slot += param.slot_width();
    }
    insns.push(Insn::with_u2(INVOKESTATIC, target));
    insns.push(Insn::return_for(&forwarder.parsed.return_type));

    let code = Code {
        max_stack: slot.max(forwarder.parsed.return_type.slot_width()),
        max_locals: slot,
        bytecode: retro_classfile::bytecode::assemble(&insns)?,
        exception_table: Vec::new(),
        attributes: Vec::new(),
    };
    let mut method = ClassMember::new(ACC_PUBLIC, &forwarder.name, &forwarder.descriptor);
    method.set_code(&code, &mut cp)?;
    class.constant_pool = cp;
    Ok(method)
}
