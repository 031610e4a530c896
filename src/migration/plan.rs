use super::runner::MigrationContext;
use crate::core::{Result, SchemaVersion, StateError};
use std::sync::Arc;

type StepFn = dyn Fn(&mut MigrationContext<'_>) + Send + Sync;

/// One versioned upgrade.
#[derive(Clone)]
pub struct MigrationStep {
    version: SchemaVersion,
    description: String,
    apply: Arc<StepFn>,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

impl MigrationStep {
    pub fn new<F>(version: impl Into<SchemaVersion>, apply: F) -> Self
    where
        F: Fn(&mut MigrationContext<'_>) + Send + Sync + 'static,
    {
        Self {
            version: version.into(),
            description: String::new(),
            apply: Arc::new(apply),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn apply(&self, ctx: &mut MigrationContext<'_>) {
        (self.apply)(ctx)
    }
}

/// Ordered list of migration steps with strictly increasing versions.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Version an entity is at once every step has run.
    pub fn latest_version(&self) -> SchemaVersion {
        self.steps
            .last()
            .map(MigrationStep::version)
            .unwrap_or(SchemaVersion::ZERO)
    }

    /// Appends a step. Its version must be valid and above every existing step.
    pub fn add_step(&mut self, step: MigrationStep) -> Result<()> {
        if !step.version.is_valid() {
            return Err(StateError::MigrationError(format!(
                "Migration version {} must be a positive finite number",
                step.version
            )));
        }
        if let Some(last) = self.steps.last() {
            if step.version <= last.version {
                return Err(StateError::MigrationError(format!(
                    "Migration version {} must be greater than {}",
                    step.version, last.version
                )));
            }
        }
        self.steps.push(step);
        Ok(())
    }

    /// Fluent builder method to add a step.
    pub fn with_step(mut self, step: MigrationStep) -> Result<Self> {
        self.add_step(step)?;
        Ok(self)
    }

    /// Helper to add a step from a version and a closure.
    pub fn add<F>(&mut self, version: impl Into<SchemaVersion>, apply: F) -> Result<()>
    where
        F: Fn(&mut MigrationContext<'_>) + Send + Sync + 'static,
    {
        self.add_step(MigrationStep::new(version, apply))
    }

    /// Steps above `current`, in order.
    pub fn pending(&self, current: SchemaVersion) -> impl Iterator<Item = &MigrationStep> {
        self.steps.iter().filter(move |step| current < step.version)
    }
}
