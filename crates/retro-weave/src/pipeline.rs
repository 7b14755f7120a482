use rayon::prelude::*;
use retro_classfile::ClassFile;
use retro_classpath::ClassPath;

use crate::call_site::rewrite_call_sites;
use crate::config::{ConfigError, Conventions, WeaveConfig};
use crate::context::TypeContext;
use crate::defaults::synthesize_default_forwarders;
use crate::diagnostics::Diagnostic;
use crate::lambda::{postprocess_lambda_carrier, preprocess_lambda_carrier};
use crate::locals::fixup_local_variables;
use crate::resolve::Resolver;

#[derive(Debug)]
enum WorkerPool {
    Rayon(rayon::ThreadPool),
    /// Every phase runs on the calling thread.
    Inline,
}

fn build_worker_pool(threads: usize) -> WorkerPool {
    let mut threads = threads.max(1);
    loop {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("retro-weave-{idx}"))
            .build()
        {
            Ok(pool) => return WorkerPool::Rayon(pool),
            // Thread limits in constrained environments; retry with fewer workers.
            Err(_) if threads > 1 => {
                threads = (threads / 2).max(1);
            }
            Err(err) => {
                tracing::warn!(
                    target: crate::TRACE_TARGET,
                    error = %err,
                    "could not spawn worker threads; weaving inline"
                );
                return WorkerPool::Inline;
            }
        }
    }
}

/// The rewritten batch and everything worth reporting about it.
#[derive(Debug)]
pub struct WeaveOutput {
    /// Same classes, same order as the input.
    pub classes: Vec<ClassFile>,
    /// In batch order, phase by phase.
    pub diagnostics: Vec<Diagnostic>,
}

/// Runs the three rewriting phases over a batch of classes.
///
/// Each phase is a parallel pass over the batch against a fresh [`TypeContext`] snapshot;
/// the next phase starts only after every class has gone through the previous one.
#[derive(Debug)]
pub struct Weaver {
    conventions: Conventions,
    pool: WorkerPool,
}

impl Weaver {
    pub fn new(config: &WeaveConfig) -> Result<Self, ConfigError> {
        let conventions = config.conventions()?;
        let threads = config.threads.unwrap_or_else(rayon::current_num_threads);
        Ok(Self {
            conventions,
            pool: build_worker_pool(threads),
        })
    }

    pub fn conventions(&self) -> &Conventions {
        &self.conventions
    }

    /// Rewrites `classes`, resolving polyfills against the batch itself overlaid on
    /// `classpath`. Never fails as a whole: problems are reported per member.
    pub fn weave(&self, mut classes: Vec<ClassFile>, classpath: &ClassPath) -> WeaveOutput {
        let mut diagnostics = Vec::new();

        diagnostics.extend(self.run_phase("preprocess", &mut classes, classpath, |class, resolver| {
            let mut diagnostics = preprocess_lambda_carrier(class, resolver);
            diagnostics.extend(fixup_local_variables(class, resolver));
            diagnostics.extend(synthesize_default_forwarders(class, resolver));
            diagnostics
        }));
        diagnostics.extend(self.run_phase("rewrite", &mut classes, classpath, rewrite_call_sites));
        diagnostics.extend(self.run_phase("postprocess", &mut classes, classpath, |class, resolver| {
            postprocess_lambda_carrier(class, resolver);
            Vec::new()
        }));

        tracing::info!(
            target: crate::TRACE_TARGET,
            classes = classes.len(),
            diagnostics = diagnostics.len(),
            "weaving finished"
        );
        WeaveOutput {
            classes,
            diagnostics,
        }
    }

    fn run_phase<F>(
        &self,
        phase: &'static str,
        classes: &mut [ClassFile],
        classpath: &ClassPath,
        step: F,
    ) -> Vec<Diagnostic>
    where
        F: Fn(&mut ClassFile, &Resolver<'_>) -> Vec<Diagnostic> + Sync,
    {
        let _span = tracing::info_span!(target: crate::TRACE_TARGET, "phase", phase, classes = classes.len())
            .entered();

        let context = TypeContext::new(classes, classpath);
        let resolver = Resolver::new(&context, &self.conventions);
        let diagnostics: Vec<Diagnostic> = match &self.pool {
            WorkerPool::Rayon(pool) => pool.install(|| {
                classes
                    .par_iter_mut()
                    .flat_map_iter(|class| step(class, &resolver))
                    .collect()
            }),
            WorkerPool::Inline => classes
                .iter_mut()
                .flat_map(|class| step(class, &resolver))
                .collect(),
        };

        tracing::debug!(
            target: crate::TRACE_TARGET,
            phase,
            diagnostics = diagnostics.len(),
            "phase complete"
        );
        diagnostics
    }
}
