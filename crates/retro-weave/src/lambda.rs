//! Retargets lambda carrier classes onto polyfill functional interfaces.
//!
//! Preprocessing adds a replacement factory returning the carrier type itself, and only then
//! the polyfill interface; once every call site in the batch has been redirected to that factory,
//! postprocessing drops the original interface and factory.

use retro_classfile::bytecode::{
    assemble, ARETURN, DUP, GETSTATIC, INVOKESPECIAL, NEW, PUTSTATIC, RETURN,
};
use retro_classfile::{
    parse_method_descriptor, ClassFile, ClassMember, Code, CodePatch, ConstantPool, Error, Insn,
    Result, ACC_FINAL, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC, ACC_SYNTHETIC,
};

use crate::config::Conventions;
use crate::diagnostics::{Diagnostic, Location};
use crate::resolve::{Resolver, RetroKind, RetroMapping};

const CLINIT: &str = "<clinit>";
const INIT: &str = "<init>";

pub(crate) fn preprocess_lambda_carrier(
    class: &mut ClassFile,
    resolver: &Resolver<'_>,
) -> Vec<Diagnostic> {
    let conventions = resolver.conventions();
    if !conventions.is_lambda_carrier(&class.this_class) {
        return Vec::new();
    }
    let Some(mapping) = carrier_mapping(class, resolver) else {
        return Vec::new();
    };

    let mut cp = class.constant_pool.clone();
    match plan_factory(class, &mut cp, conventions) {
        Ok(Some(plan)) => {
            class.constant_pool = cp;
            plan.commit(class);
            if !class.interfaces.contains(&mapping.polyfill) {
                class.interfaces.push(mapping.polyfill.clone());
            }
            tracing::debug!(
                target: crate::TRACE_TARGET,
                class = %class.this_class,
                polyfill = %mapping.polyfill,
                "added replacement lambda factory"
            );
            Vec::new()
        }
        Ok(None) => Vec::new(),
        Err(err) => vec![Diagnostic::malformed(
            Location::method(&class.this_class, &conventions.replacement_factory, ""),
            err,
        )],
    }
}

pub(crate) fn postprocess_lambda_carrier(class: &mut ClassFile, resolver: &Resolver<'_>) {
    let conventions = resolver.conventions();
    if !conventions.is_lambda_carrier(&class.this_class) {
        return;
    }
    let Some(mapping) = carrier_mapping(class, resolver) else {
        return;
    };
    // Only carriers that preprocessing completed are narrowed.
    let has_factory = class
        .methods
        .iter()
        .any(|m| m.name == conventions.replacement_factory);
    if !has_factory || !class.interfaces.contains(&mapping.polyfill) {
        return;
    }

    class.interfaces.retain(|i| *i == mapping.polyfill);
    class.methods.retain(|m| m.name != conventions.lambda_factory);
    tracing::debug!(
        target: crate::TRACE_TARGET,
        class = %class.this_class,
        polyfill = %mapping.polyfill,
        "removed original functional interface"
    );
}

/// The carrier's functional interface must map to a polyfill interface.
fn carrier_mapping(class: &ClassFile, resolver: &Resolver<'_>) -> Option<RetroMapping> {
    let interface = class.interfaces.first()?;
    let mapping = resolver.resolve(interface)?;
    (mapping.kind == RetroKind::Replacement && mapping.polyfill_is_interface).then_some(mapping)
}

enum ClinitChange {
    Replace(usize, ClassMember),
    Add(ClassMember),
}

struct FactoryPlan {
    factory: ClassMember,
    instance_field: Option<ClassMember>,
    clinit: Option<ClinitChange>,
}

impl FactoryPlan {
    fn commit(self, class: &mut ClassFile) {
        if let Some(field) = self.instance_field {
            class.fields.push(field);
        }
        match self.clinit {
            Some(ClinitChange::Replace(index, clinit)) => class.methods[index] = clinit,
            Some(ClinitChange::Add(clinit)) => class.methods.push(clinit),
            None => {}
        }
        class.methods.push(self.factory);
    }
}

/// Builds the replacement factory without touching `class`; new symbols go to `cp`.
/// `None` when the carrier already has one or lacks what the factory would need.
fn plan_factory(
    class: &ClassFile,
    cp: &mut ConstantPool,
    conventions: &Conventions,
) -> Result<Option<FactoryPlan>> {
    if class
        .methods
        .iter()
        .any(|m| m.name == conventions.replacement_factory)
    {
        return Ok(None);
    }
    let Some(original) = class
        .methods
        .iter()
        .find(|m| m.name == conventions.lambda_factory && m.is_static())
    else {
        return Ok(None);
    };

    let carrier = class.this_class.as_str();
    let carrier_desc = format!("L{carrier};");
    let params = parse_method_descriptor(&original.descriptor)?.params;
    let params_desc: String = params.iter().map(ToString::to_string).collect();
    let descriptor = format!("({params_desc}){carrier_desc}");

    let mut plan = FactoryPlan {
        factory: ClassMember::new(
            ACC_PUBLIC | ACC_STATIC,
            &conventions.replacement_factory,
            &descriptor,
        ),
        instance_field: None,
        clinit: None,
    };

    let code = if params.is_empty() {
        // Capture-free: hand out the shared singleton.
        let instance = conventions.lambda_instance_field.as_str();
        let has_instance = class
            .field(instance, &carrier_desc)
            .is_some_and(|f| f.is_static());
        if !has_instance {
            if class.method(INIT, "()V").is_none() {
                return Ok(None);
            }
            plan.clinit = Some(initialize_singleton(class, cp, instance, &carrier_desc)?);
            plan.instance_field = Some(ClassMember::new(
                ACC_PRIVATE | ACC_STATIC | ACC_FINAL | ACC_SYNTHETIC,
                instance,
                &carrier_desc,
            ));
        }
        let field = cp.field_ref(carrier, instance, &carrier_desc)?;
        Code {
            max_stack: 1,
            max_locals: 0,
            bytecode: assemble(&[Insn::with_u2(GETSTATIC, field), Insn::op(ARETURN)])?,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        }
    } else {
        // Capturing: a fresh instance per call.
        let init_desc = format!("({params_desc})V");
        if class.method(INIT, &init_desc).is_none() {
            return Ok(None);
        }
        let class_index = cp.class(carrier)?;
        let init = cp.method_ref(carrier, INIT, &init_desc, false)?;
        let mut insns = vec![Insn::with_u2(NEW, class_index), Insn::op(DUP)];
        let mut slot = 0u16;
        for param in &params {
            insns.push(Insn::load(param, slot));
            slot += param.slot_width();
        }
        insns.push(Insn::with_u2(INVOKESPECIAL, init));
        insns.push(Insn::op(ARETURN));
        Code {
            max_stack: 2 + slot,
            max_locals: slot,
            bytecode: assemble(&insns)?,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        }
    };

    plan.factory.set_code(&code, cp)?;
    Ok(Some(plan))
}

/// `instance = new Carrier();` at the start of the static initializer, creating one if the
/// carrier has none.
fn initialize_singleton(
    class: &ClassFile,
    cp: &mut ConstantPool,
    instance: &str,
    carrier_desc: &str,
) -> Result<ClinitChange> {
    let carrier = class.this_class.as_str();
    let class_index = cp.class(carrier)?;
    let init = cp.method_ref(carrier, INIT, "()V", false)?;
    let field = cp.field_ref(carrier, instance, carrier_desc)?;
    let insns = vec![
        Insn::with_u2(NEW, class_index),
        Insn::op(DUP),
        Insn::with_u2(INVOKESPECIAL, init),
        Insn::with_u2(PUTSTATIC, field),
    ];

    let existing = class
        .methods
        .iter()
        .position(|m| m.name == CLINIT && m.descriptor == "()V");
    match existing {
        Some(index) => {
            let mut clinit = class.methods[index].clone();
            let code = clinit
                .code(cp)?
                .ok_or(Error::MalformedAttribute("Code"))?;
            let mut patch = CodePatch::new();
            patch.insert_before(0, insns);
            let mut patched = patch.apply(&code)?;
            patched.max_stack = patched.max_stack.max(2);
            clinit.set_code(&patched, cp)?;
            Ok(ClinitChange::Replace(index, clinit))
        }
        None => {
            let mut body = insns;
            body.push(Insn::op(RETURN));
            let code = Code {
                max_stack: 2,
                max_locals: 0,
                bytecode: assemble(&body)?,
                exception_table: Vec::new(),
                attributes: Vec::new(),
            };
            let mut clinit = ClassMember::new(ACC_STATIC, CLINIT, "()V");
            clinit.set_code(&code, cp)?;
            Ok(ClinitChange::Add(clinit))
        }
    }
}
