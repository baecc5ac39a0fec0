//! Skill manifest parsing: the `manifest.toml` contract a skill directory
//! must satisfy to be discoverable by the [`super::SkillRegistry`].
//!
//! Shape: `[kiso]` (`type`, `name`, `version`,
//! `description`), `[kiso.skill]` (`summary`, optional `session_secrets`,
//! optional `usage_guide`), `[kiso.skill.args]` (per-argument
//! `{type, required, default?, description}`), `[kiso.skill.env]`
//! (declared env-var keys), `[kiso.deps]` (`python`, `bin`).

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

/// A fully parsed `manifest.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SkillManifest {
    pub kiso: KisoSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KisoSection {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub skill: SkillSection,
    #[serde(default)]
    pub deps: DepsSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillSection {
    pub summary: String,
    #[serde(default)]
    pub session_secrets: Vec<String>,
    pub usage_guide: Option<String>,
    #[serde(default)]
    pub args: BTreeMap<String, ArgSpec>,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArgSpec {
    #[serde(rename = "type")]
    pub kind: ArgType,
    #[serde(default)]
    pub required: bool,
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
}

/// Declared argument primitive types. Skills declare their schema this
/// coarsely; finer validation (e.g. enums) is the skill's own job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ArgType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DepsSection {
    pub python: Option<String>,
    #[serde(default)]
    pub bin: Vec<String>,
}

/// Error produced validating a candidate `args` JSON string against a
/// skill's declared arg schema.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ArgsValidationError {
    #[error("args is not a JSON object")]
    NotAnObject,
    #[error("args is not valid JSON: {0}")]
    Malformed(String),
    #[error("missing required argument '{0}'")]
    MissingRequired(String),
    #[error("argument '{name}' expected type {expected:?}")]
    WrongType { name: String, expected: ArgType },
    #[error("unknown argument '{0}'")]
    UnknownArgument(String),
}

impl SkillManifest {
    /// Validate a raw `args` JSON string (as the planner emits it on a
    /// `skill` task) against this manifest's declared arg schema.
    ///
    /// Unknown keys are rejected rather than silently ignored: the
    /// planner must only ever address arguments the skill actually
    /// declared.
    pub fn validate_args(&self, args_json: Option<&str>) -> Result<Value, ArgsValidationError> {
        let value: Value = match args_json {
            Some(raw) => {
                serde_json::from_str(raw).map_err(|e| ArgsValidationError::Malformed(e.to_string()))?
            }
            None => Value::Object(serde_json::Map::new()),
        };
        let object = value.as_object().ok_or(ArgsValidationError::NotAnObject)?;

        for key in object.keys() {
            if !self.kiso.skill.args.contains_key(key) {
                return Err(ArgsValidationError::UnknownArgument(key.clone()));
            }
        }
        for (name, spec) in &self.kiso.skill.args {
            match object.get(name) {
                Some(v) => {
                    if !spec.kind.matches(v) {
                        return Err(ArgsValidationError::WrongType {
                            name: name.clone(),
                            expected: spec.kind,
                        });
                    }
                }
                None if spec.required => {
                    return Err(ArgsValidationError::MissingRequired(name.clone()));
                }
                None => {}
            }
        }
        Ok(value)
    }

    /// Declared ephemeral-secret keys this skill may read from the
    /// worker's ephemeral map.
    #[must_use]
    pub fn session_secret_keys(&self) -> &[String] {
        &self.kiso.skill.session_secrets
    }

    /// Declared deploy-secret env var keys this skill's subprocess
    /// receives.
    #[must_use]
    pub fn env_keys(&self) -> &[String] {
        &self.kiso.skill.env
    }
}
