//! Plugin validation pipeline
//!
//! A [`PluginValidator`] runs every registered [`ValidationRule`] against a
//! descriptor. Rules never short-circuit each other: all of them run and the
//! errors are concatenated in registration order.

mod rules;
mod signature;

pub use rules::{AssemblyExistsRule, CustomRule, DependencyRule, VersionRule};
pub use signature::{
    SignatureRule, SignatureScheme, assembly_digest, decode_issuer_key, signature_path,
};

use crate::PluginDescriptor;
use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::success()
    }
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            errors: vec![error.into()],
        }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.is_valid = false;
        self.errors.push(error.into());
    }

    /// AND the validity, append the other result's errors
    pub fn merge(&mut self, other: ValidationResult) {
        self.is_valid &= other.is_valid;
        self.errors.extend(other.errors);
    }
}

#[async_trait]
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, descriptor: &PluginDescriptor) -> ValidationResult;
}

#[derive(Default)]
pub struct PluginValidator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl std::fmt::Debug for PluginValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginValidator")
            .field("rules", &self.rule_names())
            .finish()
    }
}

impl PluginValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assembly, dependency, version and signature checks, in that order
    pub fn standard(
        available: impl IntoIterator<Item = PluginDescriptor>,
        signature: SignatureRule,
    ) -> Self {
        Self::new()
            .with_rule(AssemblyExistsRule)
            .with_rule(DependencyRule::new(available))
            .with_rule(VersionRule)
            .with_rule(signature)
    }

    pub fn with_rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.add_rule(rule);
        self
    }

    pub fn add_rule(&mut self, rule: impl ValidationRule + 'static) {
        self.rules.push(Box::new(rule));
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    pub async fn validate(&self, descriptor: &PluginDescriptor) -> ValidationResult {
        let mut result = ValidationResult::success();
        for rule in &self.rules {
            let outcome = rule.validate(descriptor).await;
            if !outcome.is_valid {
                debug!(
                    plugin_id = %descriptor.id,
                    rule = rule.name(),
                    errors = ?outcome.errors,
                    "Validation rule failed"
                );
            }
            result.merge(outcome);
        }
        result
    }
}
