//! The ordered, immutable stage topology.

use std::fmt;
use std::sync::Arc;

use crate::config::Settings;
use crate::options::JobOptions;
use crate::stages::command::CommandAdapter;
use crate::stages::context::{StageAdapter, StageInputs};
use crate::stages::error::RegistryError;
use crate::stages::passthrough::PassthroughMaskAdapter;
use crate::storage::{StageDir, WorkspaceLayout};

/// Decides from a job's options whether a stage's bypass adapter runs.
pub type BypassRule = fn(&JobOptions) -> bool;

/// One pipeline step and its directory contract.
#[derive(Clone)]
pub struct StageDescriptor {
    pub name: &'static str,
    pub label: &'static str,
    /// Share of overall progress, in percent.
    pub weight: u8,
    /// Directories read by the stage; the first is its primary input.
    pub inputs: Vec<StageDir>,
    pub output: StageDir,
    adapter: Arc<dyn StageAdapter>,
    /// Substituted when the job opts out of this stage.
    bypass: Option<(BypassRule, Arc<dyn StageAdapter>)>,
}

impl StageDescriptor {
    pub fn new(
        name: &'static str,
        label: &'static str,
        weight: u8,
        inputs: Vec<StageDir>,
        output: StageDir,
        adapter: Arc<dyn StageAdapter>,
    ) -> Self {
        Self {
            name,
            label,
            weight,
            inputs,
            output,
            adapter,
            bypass: None,
        }
    }

    pub fn with_bypass(mut self, when: BypassRule, bypass: Arc<dyn StageAdapter>) -> Self {
        self.bypass = Some((when, bypass));
        self
    }

    /// The adapter to run for a job with `options`.
    pub fn adapter_for(&self, options: &JobOptions) -> &dyn StageAdapter {
        match &self.bypass {
            Some((when, bypass)) if when(options) => bypass.as_ref(),
            _ => self.adapter.as_ref(),
        }
    }

    pub fn inputs_in(&self, layout: &WorkspaceLayout) -> StageInputs {
        StageInputs::new(
            self.inputs
                .iter()
                .map(|dir| (*dir, layout.dir(*dir)))
                .collect(),
        )
    }
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("inputs", &self.inputs)
            .field("output", &self.output)
            .field("bypass", &self.bypass.is_some())
            .finish()
    }
}

/// The five adapters of the standard topology.
pub struct StageAdapters {
    pub segmentation: Arc<dyn StageAdapter>,
    pub sparse: Arc<dyn StageAdapter>,
    pub dense: Arc<dyn StageAdapter>,
    pub mesh: Arc<dyn StageAdapter>,
    pub export: Arc<dyn StageAdapter>,
}

impl StageAdapters {
    /// External tools from settings. With segmentation disabled globally
    /// the segmentation tool is replaced by passthrough masks.
    pub fn from_settings(settings: &Settings) -> Self {
        let tools = &settings.tools;
        let segmentation: Arc<dyn StageAdapter> = if settings.segmentation.enabled {
            Arc::new(CommandAdapter::new(tools.segmentation.clone()))
        } else {
            Arc::new(PassthroughMaskAdapter)
        };
        Self {
            segmentation,
            sparse: Arc::new(CommandAdapter::new(tools.sparse.clone())),
            dense: Arc::new(CommandAdapter::new(tools.dense.clone())),
            mesh: Arc::new(CommandAdapter::new(tools.mesh.clone())),
            export: Arc::new(CommandAdapter::new(tools.export.clone())),
        }
    }
}

/// Linear stage sequence, built once and shared read-only.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<StageDescriptor>,
}

impl StageRegistry {
    /// Validates and freezes a custom topology.
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self, RegistryError> {
        if stages.is_empty() {
            return Err(RegistryError::Empty);
        }

        let total: u32 = stages.iter().map(|s| u32::from(s.weight)).sum();
        if total != 100 {
            return Err(RegistryError::InvalidWeights { total });
        }

        let mut available = vec![StageDir::Images];
        for stage in &stages {
            if stage.inputs.is_empty() {
                return Err(RegistryError::NoInputs {
                    stage: stage.name.to_string(),
                });
            }
            if let Some(dir) = stage.inputs.iter().find(|d| !available.contains(d)) {
                return Err(RegistryError::UnresolvedInput {
                    stage: stage.name.to_string(),
                    dir: *dir,
                });
            }
            available.push(stage.output);
        }

        Ok(Self { stages })
    }

    /// segmentation → sparse → dense → mesh → export.
    pub fn standard(adapters: StageAdapters) -> Self {
        let passthrough: Arc<dyn StageAdapter> = Arc::new(PassthroughMaskAdapter);
        let stages = vec![
            StageDescriptor::new(
                "segmentation",
                "segmentation",
                20,
                vec![StageDir::Images],
                StageDir::Masks,
                adapters.segmentation,
            )
            .with_bypass(|options| !options.enable_segmentation, passthrough),
            StageDescriptor::new(
                "sparse",
                "sparse reconstruction",
                30,
                vec![StageDir::Images, StageDir::Masks],
                StageDir::Sparse,
                adapters.sparse,
            ),
            StageDescriptor::new(
                "dense",
                "dense reconstruction",
                10,
                vec![StageDir::Sparse, StageDir::Images],
                StageDir::Dense,
                adapters.dense,
            ),
            StageDescriptor::new(
                "mesh",
                "mesh reconstruction",
                10,
                vec![StageDir::Dense],
                StageDir::Mesh,
                adapters.mesh,
            ),
            StageDescriptor::new(
                "export",
                "mesh export",
                30,
                vec![StageDir::Mesh],
                StageDir::Output,
                adapters.export,
            ),
        ];
        Self { stages }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::standard(StageAdapters::from_settings(settings))
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Progress floor of stage `index`: the summed weight of all earlier stages.
    pub fn floor(&self, index: usize) -> u8 {
        self.stages
            .iter()
            .take(index)
            .map(|s| s.weight)
            .fold(0u8, |acc, w| acc.saturating_add(w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::context::{StageContext, StageOutcome};
    use crate::stages::error::StageError;
    use std::path::Path;

    struct Noop;

    impl StageAdapter for Noop {
        fn run(
            &self,
            _inputs: &StageInputs,
            _output_dir: &Path,
            _options: &JobOptions,
            _ctx: &StageContext,
        ) -> Result<StageOutcome, StageError> {
            Ok(StageOutcome::default())
        }
    }

    fn noop() -> Arc<dyn StageAdapter> {
        Arc::new(Noop)
    }

    fn noop_adapters() -> StageAdapters {
        StageAdapters {
            segmentation: noop(),
            sparse: noop(),
            dense: noop(),
            mesh: noop(),
            export: noop(),
        }
    }

    #[test]
    fn test_standard_topology() {
        let registry = StageRegistry::standard(noop_adapters());
        let names: Vec<&str> = registry.stages().iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["segmentation", "sparse", "dense", "mesh", "export"]);

        let floors: Vec<u8> = (0..registry.len()).map(|i| registry.floor(i)).collect();
        assert_eq!(floors, vec![0, 20, 50, 60, 70]);
        assert_eq!(registry.floor(registry.len()), 100);
    }

    #[test]
    fn test_standard_topology_validates() {
        let registry = StageRegistry::standard(noop_adapters());
        assert!(StageRegistry::new(registry.stages().to_vec()).is_ok());
    }

    #[test]
    fn test_weights_must_sum_to_100() {
        let stages = vec![StageDescriptor::new(
            "only",
            "only",
            90,
            vec![StageDir::Images],
            StageDir::Output,
            noop(),
        )];
        assert_eq!(
            StageRegistry::new(stages).unwrap_err(),
            RegistryError::InvalidWeights { total: 90 }
        );
    }

    #[test]
    fn test_inputs_must_be_produced_earlier() {
        let stages = vec![
            StageDescriptor::new(
                "mesh",
                "mesh",
                50,
                vec![StageDir::Dense],
                StageDir::Mesh,
                noop(),
            ),
            StageDescriptor::new(
                "export",
                "export",
                50,
                vec![StageDir::Mesh],
                StageDir::Output,
                noop(),
            ),
        ];
        assert_eq!(
            StageRegistry::new(stages).unwrap_err(),
            RegistryError::UnresolvedInput {
                stage: "mesh".to_string(),
                dir: StageDir::Dense
            }
        );
    }

    #[test]
    fn test_empty_registry_rejected() {
        assert_eq!(StageRegistry::new(vec![]).unwrap_err(), RegistryError::Empty);
    }

    #[test]
    fn test_segmentation_bypass_follows_options() {
        let registry = StageRegistry::standard(noop_adapters());
        let segmentation = &registry.stages()[0];

        let enabled = JobOptions::default();
        let disabled = JobOptions {
            enable_segmentation: false,
            ..JobOptions::default()
        };

        let chosen = segmentation.adapter_for(&enabled) as *const dyn StageAdapter as *const ();
        let bypassed = segmentation.adapter_for(&disabled) as *const dyn StageAdapter as *const ();
        assert_ne!(chosen, bypassed);

        let sparse = &registry.stages()[1];
        let a = sparse.adapter_for(&enabled) as *const dyn StageAdapter as *const ();
        let b = sparse.adapter_for(&disabled) as *const dyn StageAdapter as *const ();
        assert_eq!(a, b);
    }

    #[test]
    fn test_inputs_in_layout() {
        let registry = StageRegistry::standard(noop_adapters());
        let layout = WorkspaceLayout {
            job_id: "job".to_string(),
            root: std::path::PathBuf::from("/w/job"),
        };
        let inputs = registry.stages()[2].inputs_in(&layout);
        assert_eq!(inputs.primary(), Some(Path::new("/w/job/sparse")));
        assert_eq!(
            inputs.get(StageDir::Images),
            Some(Path::new("/w/job/images"))
        );
    }
}
