//! Variable Resolver (§6.2) — external collaborator interface.
//!
//! `ResolveAll(ctx, definitions, resolution_context) -> map<name,string>`. No teacher
//! counterpart exists for this as a standalone seam (the teacher inlines string formatting
//! directly in `ralph_loop.rs`); this follows the small-trait-plus-`HashMap` shape already used
//! for `Config::categories`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Where a variable's value comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source_type", rename_all = "snake_case")]
pub enum VariableSource {
    /// A literal, fixed value.
    Literal { value: String },
    /// A prior phase's output, addressed by its `output_var_name`.
    PhaseOutput { phase_id: String },
    /// An environment variable.
    Env { name: String },
    /// A file on disk, read verbatim.
    File { path: String },
}

/// One entry in a variable catalog: `{name, source_type, source_config, required, default,
/// cache_ttl}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(flatten)]
    pub source: VariableSource,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default, with = "humantime_serde_opt")]
    pub cache_ttl: Option<std::time::Duration>,
}

/// Context available while resolving variables: task id, already-known phase outputs, and any
/// caller-supplied extra values (e.g. review comments, PR comments).
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    pub task_id: String,
    pub phase_outputs: HashMap<String, String>,
    pub extra: HashMap<String, String>,
}

#[async_trait]
pub trait VariableResolver: Send + Sync {
    async fn resolve_all(
        &self,
        definitions: &[VariableDefinition],
        ctx: &ResolutionContext,
    ) -> Result<HashMap<String, String>>;
}

/// Default resolver: reads from the resolution context, falls back to `default`, errors if a
/// `required` variable has no value.
pub struct DefaultVariableResolver;

#[async_trait]
impl VariableResolver for DefaultVariableResolver {
    async fn resolve_all(
        &self,
        definitions: &[VariableDefinition],
        ctx: &ResolutionContext,
    ) -> Result<HashMap<String, String>> {
        let mut out = HashMap::new();
        for def in definitions {
            let value = match &def.source {
                VariableSource::Literal { value } => Some(value.clone()),
                VariableSource::PhaseOutput { phase_id } => {
                    ctx.phase_outputs.get(phase_id).cloned()
                }
                VariableSource::Env { name } => std::env::var(name).ok(),
                VariableSource::File { path } => std::fs::read_to_string(path).ok(),
            }
            .or_else(|| ctx.extra.get(&def.name).cloned())
            .or_else(|| def.default.clone());

            match value {
                Some(v) => {
                    out.insert(def.name.clone(), v);
                }
                None if def.required => {
                    return Err(crate::Error::Config(format!(
                        "required variable '{}' could not be resolved",
                        def.name
                    )));
                }
                None => {}
            }
        }
        Ok(out)
    }
}

mod humantime_serde_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => humantime::format_duration(*d).to_string().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => humantime::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
