use std::collections::{HashMap, HashSet, VecDeque};

use retro_classfile::{ClassFile, ClassHierarchy, ClassStub, HierarchyEntry, MethodStub};
use retro_classpath::ClassPath;

/// Declaration-level facts about every class the weaver can see: the batch being rewritten,
/// overlaid on the classpath.
///
/// The batch part is an owned snapshot taken at a phase barrier, so workers of one phase all
/// read the same facts while each mutates only its own class.
#[derive(Debug)]
pub struct TypeContext<'a> {
    batch: HashMap<String, ClassStub>,
    classpath: &'a ClassPath,
}

impl<'a> TypeContext<'a> {
    /// Snapshots `classes`. A class whose members cannot be summarized is left out; it is
    /// still rewritten, it just cannot serve as a resolution target.
    pub fn new(classes: &[ClassFile], classpath: &'a ClassPath) -> Self {
        let mut batch = HashMap::with_capacity(classes.len());
        for class in classes {
            if let Ok(stub) = class.stub() {
                batch.entry(stub.internal_name.clone()).or_insert(stub);
            }
        }
        Self { batch, classpath }
    }

    pub fn lookup(&self, internal_name: &str) -> Option<&ClassStub> {
        self.batch
            .get(internal_name)
            .or_else(|| self.classpath.lookup(internal_name))
    }

    /// Superclass chain starting at `internal_name` itself. Stops at the first class that
    /// is not known.
    pub fn superclasses<'s>(&'s self, internal_name: &str) -> Vec<&'s ClassStub> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.lookup(internal_name);
        while let Some(stub) = current {
            if !seen.insert(stub.internal_name.as_str()) {
                break;
            }
            chain.push(stub);
            current = stub.super_class.as_deref().and_then(|s| self.lookup(s));
        }
        chain
    }

    /// Finds `name`/`descriptor` on `internal_name` or its superclasses.
    pub fn find_method(
        &self,
        internal_name: &str,
        name: &str,
        descriptor: &str,
    ) -> Option<(&ClassStub, &MethodStub)> {
        self.superclasses(internal_name)
            .into_iter()
            .find_map(|class| class.method(name, descriptor).map(|m| (class, m)))
    }

    /// Every interface `internal_name` implements, directly or through superclasses and
    /// superinterfaces, in breadth-first order. Unknown interfaces are listed but not
    /// expanded.
    pub fn interface_closure(&self, internal_name: &str) -> Vec<String> {
        let mut queue: VecDeque<String> = VecDeque::new();
        for class in self.superclasses(internal_name) {
            queue.extend(class.interfaces.iter().cloned());
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        while let Some(interface) = queue.pop_front() {
            if !seen.insert(interface.clone()) {
                continue;
            }
            if let Some(stub) = self.lookup(&interface) {
                queue.extend(stub.interfaces.iter().cloned());
            }
            out.push(interface);
        }
        out
    }

    /// The class that actually declares the method a call site names. Searches the owner,
    /// its superclasses, then its interfaces; falls back to the owner when nothing is known.
    pub fn declaring_class<'s>(&'s self, owner: &'s str, name: &str, descriptor: &str) -> &'s str {
        if let Some((class, _)) = self.find_method(owner, name, descriptor) {
            return &class.internal_name;
        }
        for interface in self.interface_closure(owner) {
            if let Some(stub) = self.lookup(&interface) {
                if stub.method(name, descriptor).is_some() {
                    return &stub.internal_name;
                }
            }
        }
        owner
    }
}

impl ClassHierarchy for TypeContext<'_> {
    fn entry(&self, internal_name: &str) -> Option<HierarchyEntry> {
        let stub = self.lookup(internal_name)?;
        Some(if stub.is_interface() {
            HierarchyEntry::Interface
        } else {
            HierarchyEntry::Class {
                super_class: stub.super_class.clone(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retro_classfile::{ClassMember, ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC};

    fn class(name: &str, super_class: &str, interfaces: &[&str]) -> ClassFile {
        let mut class = ClassFile::new(name, Some(super_class), ACC_PUBLIC);
        class.interfaces = interfaces.iter().map(|i| i.to_string()).collect();
        class
    }

    fn interface(name: &str, supers: &[&str], methods: &[&str]) -> ClassFile {
        let mut class = class(name, "java/lang/Object", supers);
        class.access_flags |= ACC_INTERFACE | ACC_ABSTRACT;
        for method in methods {
            class.methods.push(ClassMember::new(
                ACC_PUBLIC | ACC_ABSTRACT,
                method,
                "(Ljava/util/function/Consumer;)V",
            ));
        }
        class
    }

    #[test]
    fn batch_shadows_classpath_and_closure_is_breadth_first() {
        let library = vec![
            interface("java/lang/Iterable", &[], &["forEach"]),
            interface("java/util/Collection", &["java/lang/Iterable"], &[]),
            interface("java/util/List", &["java/util/Collection"], &[]),
        ];
        let classpath = ClassPath::from_classes(&library);

        let batch = vec![
            class("a/Base", "java/lang/Object", &["java/util/List"]),
            class("a/Impl", "a/Base", &["java/lang/Runnable"]),
        ];
        let context = TypeContext::new(&batch, &classpath);

        assert_eq!(
            context.interface_closure("a/Impl"),
            vec![
                "java/lang/Runnable".to_string(),
                "java/util/List".to_string(),
                "java/util/Collection".to_string(),
                "java/lang/Iterable".to_string(),
            ]
        );
        assert_eq!(
            context.declaring_class("java/util/List", "forEach", "(Ljava/util/function/Consumer;)V"),
            "java/lang/Iterable"
        );
        assert_eq!(context.declaring_class("x/Unknown", "m", "()V"), "x/Unknown");
        assert_eq!(context.superclasses("a/Impl").len(), 2);
    }
}
