//! Redirects constructor and method invocations onto polyfill types.
//!
//! Each method body is analyzed against a read-only constant pool first; only when at least
//! one site needs rewriting are new symbols interned and the body re-laid out. Casting the
//! operands of a rewritten call is done by spilling them into fresh local slots above the
//! method's existing locals and reloading each one with a `checkcast`.

use retro_classfile::bytecode::{
    decode, CHECKCAST, INVOKEINTERFACE, INVOKESPECIAL, INVOKESTATIC, INVOKEVIRTUAL, NEW,
};
use retro_classfile::{
    parse_method_descriptor, retype_frames, ClassFile, ClassMember, Code, CodePatch,
    ConstantPool, Error, FieldType, Insn, MethodShape, Result,
};

use crate::diagnostics::{Diagnostic, DiagnosticKind, Location};
use crate::resolve::{Resolver, RetroKind};
use crate::signature::rewrite_method_descriptor;

const INIT: &str = "<init>";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    opcode: u8,
    owner: String,
    name: String,
    descriptor: String,
    interface: bool,
}

/// One planned rewrite, expressed symbolically.
#[derive(Debug, Clone)]
struct SiteRewrite {
    pc: u32,
    rule: &'static str,
    /// The receiver is reloaded with a cast to this type.
    receiver_cast: Option<String>,
    /// Original parameter types, each with the type its reload is cast to.
    args: Vec<(FieldType, Option<String>)>,
    invoke: Invocation,
    /// Constructor rewrites also retarget the matching `new`.
    new_site: Option<(u32, String)>,
}

impl SiteRewrite {
    fn needs_spill(&self) -> bool {
        self.receiver_cast.is_some() || self.args.iter().any(|(_, cast)| cast.is_some())
    }
}

pub(crate) fn rewrite_call_sites(class: &mut ClassFile, resolver: &Resolver<'_>) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for index in 0..class.methods.len() {
        let method = &class.methods[index];
        let location = Location::method(&class.this_class, &method.name, &method.descriptor);
        let mut site_diagnostics = Vec::new();
        let mut cp = class.constant_pool.clone();
        match rewrite_method(method, &mut cp, resolver, &location, &mut site_diagnostics) {
            Ok(Some(rewritten)) => {
                class.methods[index] = rewritten;
                class.constant_pool = cp;
                diagnostics.append(&mut site_diagnostics);
            }
            Ok(None) => diagnostics.append(&mut site_diagnostics),
            Err(err) => diagnostics.push(Diagnostic::malformed(location, err)),
        }
    }
    diagnostics
}

/// Returns the rewritten member, or `None` when no site in it needs rewriting.
fn rewrite_method(
    method: &ClassMember,
    cp: &mut ConstantPool,
    resolver: &Resolver<'_>,
    location: &Location,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<Option<ClassMember>> {
    let Some(code) = method.code(cp)? else {
        return Ok(None);
    };
    let sites = plan_sites(&code, cp, resolver, location, diagnostics)?;
    if sites.is_empty() {
        return Ok(None);
    }

    let base = code.max_locals;
    let mut spill_width = 0u16;
    let mut patch = CodePatch::new();
    for site in &sites {
        let (insns, width) = materialize(site, cp, base)?;
        spill_width = spill_width.max(width);
        patch.replace(site.pc, insns);
        if let Some((new_pc, polyfill)) = &site.new_site {
            patch.replace(*new_pc, vec![Insn::with_u2(NEW, cp.class(polyfill)?)]);
        }
        tracing::debug!(
            target: crate::TRACE_TARGET,
            location = %location,
            pc = site.pc,
            rule = site.rule,
            owner = %site.invoke.owner,
            name = %site.invoke.name,
            descriptor = %site.invoke.descriptor,
            "rewrote call site"
        );
    }

    let mut rewritten_code = patch.apply(&code)?;
    rewritten_code.max_locals = base
        .checked_add(spill_width)
        .ok_or(Error::Other("local slot overflow"))?;
    let shape = MethodShape {
        this_class: &location.class,
        name: &method.name,
        descriptor: &method.descriptor,
        is_static: method.is_static(),
    };
    if retype_frames(&mut rewritten_code, cp, shape, resolver.context())? {
        tracing::debug!(
            target: crate::TRACE_TARGET,
            location = %location,
            "widened stack map frames"
        );
    }

    let mut rewritten = method.clone();
    rewritten.set_code(&rewritten_code, cp)?;
    Ok(Some(rewritten))
}

fn plan_sites(
    code: &Code,
    cp: &ConstantPool,
    resolver: &Resolver<'_>,
    location: &Location,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<Vec<SiteRewrite>> {
    let conventions = resolver.conventions();
    let context = resolver.context();

    let mut sites = Vec::new();
    // `new` instructions still waiting for their constructor call.
    let mut pending_new: Vec<(u32, String)> = Vec::new();

    for (pc, insn) in decode(&code.bytecode)? {
        let opcode = insn.opcode();
        let Some(index) = insn.u2_operand() else {
            continue;
        };
        match opcode {
            NEW => pending_new.push((pc, cp.get_class_name(index)?.to_string())),
            INVOKESPECIAL => {
                let target = cp.get_member_ref(index)?;
                if target.name != INIT {
                    continue;
                }
                // An `<init>` without a pending `new` of the same class is a `super(...)` or
                // `this(...)` call.
                let Some((new_pc, _)) = pending_new
                    .last()
                    .filter(|(_, class)| *class == target.class)
                    .cloned()
                else {
                    continue;
                };
                pending_new.pop();

                let Some(mapping) = resolver.resolve(&target.class) else {
                    continue;
                };
                if mapping.kind == RetroKind::Mixin {
                    continue;
                }
                let desc = parse_method_descriptor(&target.descriptor)?;
                let rewritten = rewrite_method_descriptor(&desc, resolver);
                sites.push(SiteRewrite {
                    pc,
                    rule: "constructor",
                    receiver_cast: None,
                    args: cast_args(&desc.params, &rewritten.params),
                    invoke: Invocation {
                        opcode: INVOKESPECIAL,
                        owner: mapping.polyfill.clone(),
                        name: INIT.to_string(),
                        descriptor: rewritten.to_string(),
                        interface: false,
                    },
                    new_site: Some((new_pc, mapping.polyfill)),
                });
            }
            INVOKESTATIC | INVOKEVIRTUAL | INVOKEINTERFACE => {
                let target = cp.get_member_ref(index)?;
                let is_static = opcode == INVOKESTATIC;
                let desc = parse_method_descriptor(&target.descriptor)?;

                if is_static && target.name == conventions.lambda_factory {
                    let params: String = desc.params.iter().map(ToString::to_string).collect();
                    let descriptor = format!("({params})L{};", target.class);
                    let declared = context
                        .lookup(&target.class)
                        .and_then(|carrier| carrier.method(&conventions.replacement_factory, &descriptor))
                        .is_some_and(|m| m.is_static());
                    if declared {
                        sites.push(SiteRewrite {
                            pc,
                            rule: "lambda factory",
                            receiver_cast: None,
                            args: desc.params.iter().map(|p| (p.clone(), None)).collect(),
                            invoke: Invocation {
                                opcode: INVOKESTATIC,
                                owner: target.class.clone(),
                                name: conventions.replacement_factory.clone(),
                                descriptor,
                                interface: false,
                            },
                            new_site: None,
                        });
                    }
                    continue;
                }

                let declaring = context.declaring_class(&target.class, &target.name, &target.descriptor);
                let Some(mapping) = resolver.resolve(declaring) else {
                    continue;
                };
                let rewritten = rewrite_method_descriptor(&desc, resolver);
                let args = cast_args(&desc.params, &rewritten.params);

                match mapping.kind {
                    RetroKind::Mixin => {
                        let descriptor = if is_static {
                            rewritten.to_string()
                        } else {
                            let params: String =
                                rewritten.params.iter().map(ToString::to_string).collect();
                            format!("(L{declaring};{params}){}", rewritten.return_type)
                        };
                        let found = context
                            .find_method(&mapping.polyfill, &target.name, &descriptor)
                            .is_some_and(|(_, m)| m.is_static());
                        if !found {
                            tracing::debug!(
                                target: crate::TRACE_TARGET,
                                location = %location,
                                pc,
                                polyfill = %mapping.polyfill,
                                name = %target.name,
                                descriptor = %descriptor,
                                "mixin counterpart not found"
                            );
                            diagnostics.push(Diagnostic {
                                location: location.clone().at(pc, code.line_number_at(pc)),
                                kind: DiagnosticKind::UnresolvedMixinMethod {
                                    polyfill: mapping.polyfill,
                                    name: target.name,
                                    descriptor,
                                },
                            });
                            continue;
                        }
                        sites.push(SiteRewrite {
                            pc,
                            rule: "mixin",
                            receiver_cast: (!is_static).then(|| declaring.to_string()),
                            args,
                            invoke: Invocation {
                                opcode: INVOKESTATIC,
                                owner: mapping.polyfill,
                                name: target.name,
                                descriptor,
                                interface: mapping.polyfill_is_interface,
                            },
                            new_site: None,
                        });
                    }
                    RetroKind::Replacement if is_static => {
                        let companion = conventions.companion_name(&mapping.polyfill);
                        let (owner, interface) = if mapping.polyfill_is_interface
                            && context.lookup(&companion).is_some()
                        {
                            (companion, false)
                        } else {
                            (mapping.polyfill, mapping.polyfill_is_interface)
                        };
                        sites.push(SiteRewrite {
                            pc,
                            rule: "static replacement",
                            receiver_cast: None,
                            args,
                            invoke: Invocation {
                                opcode: INVOKESTATIC,
                                owner,
                                name: target.name,
                                descriptor: rewritten.to_string(),
                                interface,
                            },
                            new_site: None,
                        });
                    }
                    RetroKind::Replacement => {
                        let opcode = if mapping.polyfill_is_interface {
                            INVOKEINTERFACE
                        } else {
                            INVOKEVIRTUAL
                        };
                        sites.push(SiteRewrite {
                            pc,
                            rule: "instance replacement",
                            receiver_cast: Some(mapping.polyfill.clone()),
                            args,
                            invoke: Invocation {
                                opcode,
                                owner: mapping.polyfill,
                                name: target.name,
                                descriptor: rewritten.to_string(),
                                interface: mapping.polyfill_is_interface,
                            },
                            new_site: None,
                        });
                    }
                }
            }
            _ => {}
        }
    }
    Ok(sites)
}

/// Every reference parameter is cast to its (possibly substituted) type; primitives pass
/// through.
fn cast_args(original: &[FieldType], rewritten: &[FieldType]) -> Vec<(FieldType, Option<String>)> {
    original
        .iter()
        .zip(rewritten)
        .map(|(orig, new)| (orig.clone(), new.class_entry_name()))
        .collect()
}

/// Instructions replacing the call at `site.pc`, and the number of spill slots used above
/// `base`.
fn materialize(site: &SiteRewrite, cp: &mut ConstantPool, base: u16) -> Result<(Vec<Insn>, u16)> {
    let mut insns = Vec::new();
    let mut width = 0u32;

    if site.needs_spill() {
        let slot = |offset: u32| -> Result<u16> {
            u16::try_from(u32::from(base) + offset).map_err(|_| Error::Other("local slot overflow"))
        };
        let receiver = FieldType::Object(String::new());

        let receiver_slot = match site.receiver_cast {
            Some(_) => {
                width += 1;
                Some(slot(0)?)
            }
            None => None,
        };
        let mut arg_slots = Vec::with_capacity(site.args.len());
        for (ty, _) in &site.args {
            arg_slots.push(slot(width)?);
            width += u32::from(ty.slot_width());
        }

        for ((ty, _), slot) in site.args.iter().zip(&arg_slots).rev() {
            insns.push(Insn::store(ty, *slot));
        }
        if let (Some(slot), Some(cast)) = (receiver_slot, &site.receiver_cast) {
            insns.push(Insn::store(&receiver, slot));
            insns.push(Insn::load(&receiver, slot));
            insns.push(Insn::with_u2(CHECKCAST, cp.class(cast)?));
        }
        for ((ty, cast), slot) in site.args.iter().zip(&arg_slots) {
            insns.push(Insn::load(ty, *slot));
            if let Some(cast) = cast {
                insns.push(Insn::with_u2(CHECKCAST, cp.class(cast)?));
            }
        }
    }

    let invoke = &site.invoke;
    let target = cp.method_ref(&invoke.owner, &invoke.name, &invoke.descriptor, invoke.interface)?;
    if invoke.opcode == INVOKEINTERFACE {
        let arg_slots = 1 + parse_method_descriptor(&invoke.descriptor)?.param_slots();
        let arg_slots = u8::try_from(arg_slots).map_err(|_| Error::InvalidDescriptor(invoke.descriptor.clone()))?;
        insns.push(Insn::invokeinterface(target, arg_slots));
    } else {
        insns.push(Insn::with_u2(invoke.opcode, target));
    }

    let width = u16::try_from(width).map_err(|_| Error::Other("local slot overflow"))?;
    Ok((insns, width))
}
