//! Workflow definition: phase templates, workflow phases, gates, lifecycle triggers (§3, §4.7,
//! §4.8).
//!
//! Grounded on `descartes-v2/src/workflow/config.rs`'s TOML-backed `WorkflowConfig` shape
//! (`WorkflowMeta`/`GateConfig`/stages-as-strings), reworked from the teacher's flat stage-list
//! model into the spec's graph-of-templates model: a `WorkflowPhase` names a `PhaseTemplate` and
//! a list of `depends_on` phase ids rather than assuming a single linear `stages` vector.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::phase::{BackpressureCheck, PhaseKind};
use crate::variables::VariableDefinition;
use crate::{Error, Result};

/// Where a phase's prompt text comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptSource {
    /// Bundled under the binary (e.g. `include_str!`'d at build time), addressed by name.
    Embedded { name: String },
    /// Literal prompt text in the workflow file itself.
    Inline { text: String },
    /// A path relative to `Config::prompts_dir`.
    Filesystem { path: PathBuf },
}

/// Reusable phase definition (§3 Phase Template).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTemplate {
    pub id: String,
    pub prompt_source: PromptSource,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub produces_artifact: bool,
    #[serde(default)]
    pub gate_type: GateType,
    #[serde(default)]
    pub retry_from_phase: Option<String>,
    #[serde(default)]
    pub output_var_name: Option<String>,
    /// Which status vocabulary the Response Parser (§4.1) should accept for this template.
    #[serde(default)]
    pub phase_kind: PhaseKind,
    /// Checks run before a `complete` verdict is accepted (§4.5).
    #[serde(default)]
    pub backpressure: Vec<BackpressureCheck>,
    /// Criteria handed to the judge for a post-backpressure success-criteria pass (§4.5).
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

fn default_max_iterations() -> u32 {
    10
}

/// Gate type vocabulary (§4.7): `auto | skip | ai | script | human`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    /// Approve immediately if `auto_approve_on_success` is configured.
    Auto,
    /// Approve unconditionally with reason "skipped by configuration".
    Skip,
    /// Call the external judge (§6.4).
    Ai,
    /// Pipe the gate's output JSON to an external script; non-zero exit overrides to rejected.
    Script,
    /// Pending until a human approves.
    Human,
}

impl Default for GateType {
    fn default() -> Self {
        GateType::Auto
    }
}

/// Loop-back condition vocabulary (§4.6 step 5): evaluated against the phase's just-produced
/// output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopCondition {
    HasFindings,
    NotEmpty,
    StatusNeedsFix,
}

/// Optional loop-back configuration on a workflow phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub condition: LoopCondition,
    pub loop_to_phase: String,
    pub max_iterations: u32,
}

/// Per-instance overrides of a template's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverrides {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub gate_type: Option<GateType>,
    #[serde(default)]
    pub iteration_cap: Option<u32>,
    #[serde(default)]
    pub extended_thinking: Option<bool>,
}

/// A before-phase trigger: an optional agent that runs before a phase and may inject variables
/// or, in gate mode, block (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeforePhaseTrigger {
    pub agent_id: String,
    #[serde(default)]
    pub gate_mode: bool,
}

/// Instance of a template within a workflow (§3 Workflow Phase).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPhase {
    pub template_id: String,
    pub sequence: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub overrides: PhaseOverrides,
    #[serde(default)]
    pub loop_config: Option<LoopConfig>,
    #[serde(default)]
    pub before_phase: Option<BeforePhaseTrigger>,
}

/// Workflow-lifecycle event a trigger reacts to (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    OnTaskCompleted,
    OnTaskFailed,
}

/// Workflow-lifecycle trigger. Reaction mode fires and forgets, logging errors; gate mode on
/// `on_task_completed` can force the task to `blocked`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleTrigger {
    pub event: LifecycleEvent,
    pub command: String,
    #[serde(default)]
    pub gate_mode: bool,
}

/// Static workflow definition (§3 Workflow): ordered phases plus lifecycle triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub workflow: WorkflowMeta,
    pub templates: HashMap<String, PhaseTemplate>,
    pub phases: Vec<WorkflowPhase>,
    #[serde(default)]
    pub triggers: Vec<LifecycleTrigger>,
    /// Config-level fallback retry map (template id -> retry target), used when a template has
    /// no `retry_from_phase` of its own (§4.7 retry target resolution).
    #[serde(default)]
    pub retry_map: HashMap<String, String>,
    /// Variable catalog resolved once per phase execution via the Variable Resolver (§6.2).
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMeta {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl WorkflowConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read workflow config: {}", e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: WorkflowConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse workflow config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every `template_id`/`depends_on`/`loop_to_phase` reference resolves, and that the
    /// dependency graph has no cycle (§3 invariant: "a dependency cycle is a configuration
    /// error").
    pub fn validate(&self) -> Result<()> {
        for phase in &self.phases {
            if !self.templates.contains_key(&phase.template_id) {
                return Err(Error::Config(format!(
                    "workflow phase references unknown template \"{}\"",
                    phase.template_id
                )));
            }
            for dep in &phase.depends_on {
                if !self.phases.iter().any(|p| &p.template_id == dep) {
                    return Err(Error::Config(format!(
                        "workflow phase \"{}\" depends on unknown phase \"{}\"",
                        phase.template_id, dep
                    )));
                }
            }
            if let Some(loop_config) = &phase.loop_config {
                if !self.phases.iter().any(|p| p.template_id == loop_config.loop_to_phase) {
                    return Err(Error::Config(format!(
                        "workflow phase \"{}\" loops to unknown phase \"{}\"",
                        phase.template_id, loop_config.loop_to_phase
                    )));
                }
            }
        }
        self.topological_order()?;
        Ok(())
    }

    /// Kahn's algorithm over `depends_on`, tie-broken by `sequence` (§4.6 phase ordering, §3
    /// invariant). Returns the ordered list of template ids.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for phase in &self.phases {
            in_degree.entry(phase.template_id.as_str()).or_insert(0);
            for dep in &phase.depends_on {
                *in_degree.entry(phase.template_id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(phase.template_id.as_str());
            }
        }

        let mut ready: Vec<&WorkflowPhase> = self
            .phases
            .iter()
            .filter(|p| in_degree.get(p.template_id.as_str()).copied().unwrap_or(0) == 0)
            .collect();
        ready.sort_by_key(|p| std::cmp::Reverse(p.sequence));

        let mut order = Vec::with_capacity(self.phases.len());
        let mut in_degree_mut = in_degree;
        while let Some(phase) = ready.pop() {
            order.push(phase.template_id.clone());
            if let Some(next_ids) = dependents.get(phase.template_id.as_str()) {
                for next_id in next_ids {
                    if let Some(count) = in_degree_mut.get_mut(next_id) {
                        *count -= 1;
                        if *count == 0 {
                            if let Some(next_phase) =
                                self.phases.iter().find(|p| p.template_id == *next_id)
                            {
                                ready.push(next_phase);
                            }
                        }
                    }
                }
            }
            ready.sort_by_key(|p| std::cmp::Reverse(p.sequence));
        }

        if order.len() != self.phases.len() {
            return Err(Error::Config(
                "workflow phase dependency graph contains a cycle".to_string(),
            ));
        }
        Ok(order)
    }

    pub fn phase(&self, template_id: &str) -> Option<&WorkflowPhase> {
        self.phases.iter().find(|p| p.template_id == template_id)
    }

    pub fn template(&self, template_id: &str) -> Option<&PhaseTemplate> {
        self.templates.get(template_id)
    }

    /// Retry target resolution (§4.7): explicit `retry_from_phase` on the template, else the
    /// config-level retry map, else no retry.
    pub fn retry_target(&self, template_id: &str) -> Option<&str> {
        self.templates
            .get(template_id)
            .and_then(|t| t.retry_from_phase.as_deref())
            .or_else(|| self.retry_map.get(template_id).map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> WorkflowConfig {
        let mut templates = HashMap::new();
        templates.insert(
            "specify".to_string(),
            PhaseTemplate {
                id: "specify".to_string(),
                prompt_source: PromptSource::Embedded { name: "specify".to_string() },
                max_iterations: 5,
                default_model: None,
                produces_artifact: true,
                gate_type: GateType::Auto,
                retry_from_phase: None,
                output_var_name: Some("spec".to_string()),
                phase_kind: PhaseKind::Standard,
                backpressure: vec![],
                success_criteria: vec![],
            },
        );
        templates.insert(
            "implement".to_string(),
            PhaseTemplate {
                id: "implement".to_string(),
                prompt_source: PromptSource::Embedded { name: "implement".to_string() },
                max_iterations: 10,
                default_model: None,
                produces_artifact: true,
                gate_type: GateType::Auto,
                retry_from_phase: None,
                output_var_name: None,
                phase_kind: PhaseKind::Implement,
                backpressure: vec![],
                success_criteria: vec![],
            },
        );
        templates.insert(
            "review".to_string(),
            PhaseTemplate {
                id: "review".to_string(),
                prompt_source: PromptSource::Embedded { name: "review".to_string() },
                max_iterations: 3,
                default_model: None,
                produces_artifact: false,
                gate_type: GateType::Ai,
                retry_from_phase: Some("implement".to_string()),
                output_var_name: None,
                phase_kind: PhaseKind::ReviewRound1,
                backpressure: vec![],
                success_criteria: vec![],
            },
        );

        WorkflowConfig {
            workflow: WorkflowMeta { name: "default".to_string(), description: None },
            templates,
            phases: vec![
                WorkflowPhase {
                    template_id: "specify".to_string(),
                    sequence: 0,
                    depends_on: vec![],
                    overrides: PhaseOverrides::default(),
                    loop_config: None,
                    before_phase: None,
                },
                WorkflowPhase {
                    template_id: "implement".to_string(),
                    sequence: 1,
                    depends_on: vec!["specify".to_string()],
                    overrides: PhaseOverrides::default(),
                    loop_config: None,
                    before_phase: None,
                },
                WorkflowPhase {
                    template_id: "review".to_string(),
                    sequence: 2,
                    depends_on: vec!["implement".to_string()],
                    overrides: PhaseOverrides::default(),
                    loop_config: Some(LoopConfig {
                        condition: LoopCondition::HasFindings,
                        loop_to_phase: "implement".to_string(),
                        max_iterations: 3,
                    }),
                    before_phase: None,
                },
            ],
            triggers: vec![],
            retry_map: HashMap::new(),
            variables: vec![],
        }
    }

    #[test]
    fn test_topological_order_respects_dependencies_and_sequence() {
        let config = sample_config();
        let order = config.topological_order().unwrap();
        assert_eq!(order, vec!["specify", "implement", "review"]);
    }

    #[test]
    fn test_topological_order_breaks_ties_by_ascending_sequence() {
        let mut templates = HashMap::new();
        for id in ["a", "b", "c"] {
            templates.insert(
                id.to_string(),
                PhaseTemplate {
                    id: id.to_string(),
                    prompt_source: PromptSource::Embedded { name: id.to_string() },
                    max_iterations: 1,
                    default_model: None,
                    produces_artifact: false,
                    gate_type: GateType::Auto,
                    retry_from_phase: None,
                    output_var_name: None,
                    phase_kind: PhaseKind::Standard,
                    backpressure: vec![],
                    success_criteria: vec![],
                },
            );
        }
        // All three are simultaneously ready (no depends_on), so the sort by sequence number is
        // the only thing that determines order.
        let config = WorkflowConfig {
            workflow: WorkflowMeta { name: "ties".to_string(), description: None },
            templates,
            phases: vec![
                WorkflowPhase {
                    template_id: "c".to_string(),
                    sequence: 2,
                    depends_on: vec![],
                    overrides: PhaseOverrides::default(),
                    loop_config: None,
                    before_phase: None,
                },
                WorkflowPhase {
                    template_id: "a".to_string(),
                    sequence: 0,
                    depends_on: vec![],
                    overrides: PhaseOverrides::default(),
                    loop_config: None,
                    before_phase: None,
                },
                WorkflowPhase {
                    template_id: "b".to_string(),
                    sequence: 1,
                    depends_on: vec![],
                    overrides: PhaseOverrides::default(),
                    loop_config: None,
                    before_phase: None,
                },
            ],
            triggers: vec![],
            retry_map: HashMap::new(),
            variables: vec![],
        };
        let order = config.topological_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_validate_rejects_unknown_template_reference() {
        let mut config = sample_config();
        config.phases[0].template_id = "nonexistent".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_dependency_cycle() {
        let mut config = sample_config();
        config.phases[0].depends_on.push("review".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_retry_target_prefers_template_field_over_retry_map() {
        let mut config = sample_config();
        config.retry_map.insert("review".to_string(), "specify".to_string());
        assert_eq!(config.retry_target("review"), Some("implement"));
    }

    #[test]
    fn test_retry_target_falls_back_to_retry_map() {
        let mut config = sample_config();
        config.templates.get_mut("review").unwrap().retry_from_phase = None;
        config.retry_map.insert("review".to_string(), "specify".to_string());
        assert_eq!(config.retry_target("review"), Some("specify"));
    }

    #[test]
    fn test_parse_toml_roundtrip_shape() {
        let toml_text = r#"
[workflow]
name = "default"

[templates.specify]
id = "specify"
produces_artifact = true
gate_type = "auto"

[templates.specify.prompt_source]
kind = "embedded"
name = "specify"

[[phases]]
template_id = "specify"
sequence = 0
"#;
        let config = WorkflowConfig::parse(toml_text).unwrap();
        assert_eq!(config.workflow.name, "default");
        assert_eq!(config.phases.len(), 1);
    }
}
