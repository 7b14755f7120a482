use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Naming conventions shared by the polyfill runtime and the lowering pass that ran before
/// weaving. Class names use the dotted binary form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeaveConfig {
    /// Package under which `pkg.Simple`'s polyfill lives as `<namespace>.pkg._Simple`.
    pub polyfill_namespace: String,
    /// Annotation type marking a polyfill that exposes static extension functions.
    pub mixin_marker: String,
    /// Suffix of the class holding an interface's lowered default-method bodies.
    pub companion_suffix: String,
    /// Regex the simple name of a lambda carrier class must match in full.
    pub lambda_class_pattern: String,
    /// Name of the factory method the lowering pass emits on every lambda carrier.
    pub lambda_factory: String,
    /// Prefix of polyfill simple names and of the replacement lambda factory.
    pub replacement_prefix: String,
    /// Static field holding the singleton of a capture-free lambda carrier.
    pub lambda_instance_field: String,
    /// Legacy wrapper type whose local-variable entries are retyped to its polyfill.
    pub local_variable_type: String,
    /// Worker threads; the rayon default when unset.
    pub threads: Option<usize>,
}

impl Default for WeaveConfig {
    fn default() -> Self {
        Self {
            polyfill_namespace: "io.github.retropiler.runtime".to_string(),
            mixin_marker: "io.github.retropiler.annotation.RetroMixin".to_string(),
            companion_suffix: "$".to_string(),
            lambda_class_pattern: r".+\$\$Lambda\$\d+".to_string(),
            lambda_factory: "lambdaFactory$".to_string(),
            replacement_prefix: "_".to_string(),
            lambda_instance_field: "instance".to_string(),
            local_variable_type: "java.util.Optional".to_string(),
            threads: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid `{key}`: {message}")]
    Invalid { key: &'static str, message: String },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Toml(err.message().to_string())
    }
}

impl WeaveConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Validates the configuration into the internal-name form the weaver works with.
    pub fn conventions(&self) -> Result<Conventions, ConfigError> {
        let required = [
            ("polyfill_namespace", &self.polyfill_namespace),
            ("mixin_marker", &self.mixin_marker),
            ("lambda_factory", &self.lambda_factory),
            ("replacement_prefix", &self.replacement_prefix),
            ("lambda_instance_field", &self.lambda_instance_field),
            ("local_variable_type", &self.local_variable_type),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key,
                    message: "must not be empty".to_string(),
                });
            }
        }
        if self.threads == Some(0) {
            return Err(ConfigError::Invalid {
                key: "threads",
                message: "must be at least 1".to_string(),
            });
        }

        let lambda_class = Regex::new(&format!("^(?:{})$", self.lambda_class_pattern))
            .map_err(|err| ConfigError::Invalid {
                key: "lambda_class_pattern",
                message: err.to_string(),
            })?;

        Ok(Conventions {
            polyfill_namespace: internal_name(&self.polyfill_namespace),
            mixin_marker: internal_name(&self.mixin_marker),
            companion_suffix: self.companion_suffix.clone(),
            lambda_class,
            lambda_factory: self.lambda_factory.clone(),
            replacement_factory: format!("{}{}", self.replacement_prefix, self.lambda_factory),
            replacement_prefix: self.replacement_prefix.clone(),
            lambda_instance_field: self.lambda_instance_field.clone(),
            local_variable_type: internal_name(&self.local_variable_type),
        })
    }
}

fn internal_name(binary_name: &str) -> String {
    binary_name.trim().replace('.', "/")
}

/// Validated conventions, with class names in internal (`a/b/C`) form.
#[derive(Debug, Clone)]
pub struct Conventions {
    pub polyfill_namespace: String,
    pub mixin_marker: String,
    pub companion_suffix: String,
    pub lambda_class: Regex,
    pub lambda_factory: String,
    pub replacement_factory: String,
    pub replacement_prefix: String,
    pub lambda_instance_field: String,
    pub local_variable_type: String,
}

impl Conventions {
    /// `pkg/Simple` -> `<namespace>/pkg/_Simple`.
    pub fn polyfill_name(&self, original: &str) -> String {
        match original.rsplit_once('/') {
            Some((package, simple)) => format!(
                "{}/{package}/{}{simple}",
                self.polyfill_namespace, self.replacement_prefix
            ),
            None => format!(
                "{}/{}{original}",
                self.polyfill_namespace, self.replacement_prefix
            ),
        }
    }

    pub fn is_polyfill(&self, internal_name: &str) -> bool {
        internal_name
            .strip_prefix(&self.polyfill_namespace)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    pub fn companion_name(&self, interface: &str) -> String {
        format!("{interface}{}", self.companion_suffix)
    }

    pub fn is_lambda_carrier(&self, internal_name: &str) -> bool {
        self.lambda_class
            .is_match(retro_classfile::simple_name(internal_name))
    }
}
