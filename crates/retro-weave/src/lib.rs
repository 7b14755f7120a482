//! Bytecode weaver that retrofits compiled classes onto polyfill types.
//!
//! References to a newer standard-library type `pkg.Simple` are redirected to
//! `<namespace>.pkg._Simple` whenever that polyfill is visible, either in the batch being
//! woven or on the classpath. A polyfill annotated with the mixin marker is called through
//! static functions taking the original receiver explicitly; any other polyfill replaces
//! the original type outright.
//!
//! Weaving runs in three phases separated by barriers:
//!
//! 1. preprocess: lambda carriers gain the polyfill interface and a replacement factory,
//!    legacy local-variable entries are retyped, and default-method forwarders are added;
//! 2. rewrite: every call site is redirected;
//! 3. postprocess: lambda carriers drop their original interface and factory.
//!
//! Nothing aborts a batch. Problems are reported as [`Diagnostic`]s and the affected member
//! is left as it was.

#![forbid(unsafe_code)]

mod call_site;
mod config;
mod context;
mod defaults;
mod diagnostics;
mod lambda;
mod locals;
mod pipeline;
mod resolve;
mod signature;

pub use config::{ConfigError, Conventions, WeaveConfig};
pub use context::TypeContext;
pub use diagnostics::{Diagnostic, DiagnosticKind, Location};
pub use pipeline::{WeaveOutput, Weaver};
pub use resolve::{Resolver, RetroKind, RetroMapping};
pub use signature::{rewrite_field_type, rewrite_method_descriptor};

pub(crate) const TRACE_TARGET: &str = "retro.weave";
