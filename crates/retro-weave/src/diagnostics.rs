use std::fmt;

use thiserror::Error;

/// Where a diagnostic was raised. Class names are internal names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub class: String,
    /// Method name followed by its descriptor, e.g. `run()V`.
    pub method: Option<String>,
    /// Bytecode offset in the original method body.
    pub pc: Option<u32>,
    pub line: Option<u16>,
}

impl Location {
    pub fn class(class: &str) -> Self {
        Self {
            class: class.to_string(),
            method: None,
            pc: None,
            line: None,
        }
    }

    pub fn method(class: &str, name: &str, descriptor: &str) -> Self {
        Self {
            method: Some(format!("{name}{descriptor}")),
            ..Self::class(class)
        }
    }

    pub fn at(mut self, pc: u32, line: Option<u16>) -> Self {
        self.pc = Some(pc);
        self.line = line;
        self
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.class.replace('/', "."))?;
        if let Some(method) = &self.method {
            write!(f, "#{method}")?;
        }
        if let Some(pc) = self.pc {
            write!(f, "@{pc}")?;
        }
        if let Some(line) = self.line {
            write!(f, " (line {line})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiagnosticKind {
    #[error("mixin `{polyfill}` has no static `{name}{descriptor}`; call left unchanged")]
    UnresolvedMixinMethod {
        polyfill: String,
        name: String,
        descriptor: String,
    },
    #[error("malformed member left unchanged: {message}")]
    MalformedMember { message: String },
}

/// An advisory finding; never aborts the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub location: Location,
    pub kind: DiagnosticKind,
}

impl Diagnostic {
    pub fn malformed(location: Location, err: impl fmt::Display) -> Self {
        Self {
            location,
            kind: DiagnosticKind::MalformedMember {
                message: err.to_string(),
            },
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.kind)
    }
}
