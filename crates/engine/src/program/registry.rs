//! Programs and the program registry
//!
//! A program is a named, closed table of labelled steps. Labels are
//! resolved once, when the program is built, so dispatch is a plain map
//! lookup and never reflection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::context::StepContext;
use crate::strand::{semaphore, Frame, StepError, StepOutcome, StepResult};

/// One labelled step of a program
///
/// The step reads and writes the top frame through the context and returns
/// exactly one outcome. It may be re-run after a lease expiry, so any domain
/// action it performs must be safe to repeat.
#[async_trait]
pub trait Step: Send + Sync + 'static {
    async fn run(&self, ctx: &mut StepContext) -> StepResult;
}

/// Adapter turning a plain function into a [`Step`]
///
/// ```ignore
/// fn start<'a>(ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
///     Box::pin(async move { Ok(StepOutcome::transition("wait")) })
/// }
///
/// let program = Program::builder("Demo").step_fn("start", start).build()?;
/// ```
pub struct FnStep<F>(pub F);

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: for<'a> Fn(&'a mut StepContext) -> BoxFuture<'a, StepResult> + Send + Sync + 'static,
{
    async fn run(&self, ctx: &mut StepContext) -> StepResult {
        (self.0)(ctx).await
    }
}

/// Hook invoked after lease acquisition and before the step
///
/// Returning an outcome overrides the step for this dispatch.
#[async_trait]
pub trait BeforeRun: Send + Sync + 'static {
    async fn before_run(&self, ctx: &mut StepContext) -> Result<Option<StepOutcome>, StepError>;
}

/// Checks the initial frame handed to `assemble`
pub type FrameValidator = Arc<dyn Fn(&Frame) -> Result<(), StepError> + Send + Sync>;

/// Cooperative cancellation through the `destroy` semaphore
///
/// Installed by [`ProgramBuilder::teardown`]. While the semaphore is raised
/// the strand is steered to the teardown label; a pushed sub-call sitting on
/// the teardown label returns instead, so the outer level can tear down.
pub struct DestroyGuard {
    teardown_label: String,
}

impl DestroyGuard {
    pub fn new(teardown_label: impl Into<String>) -> Self {
        Self {
            teardown_label: teardown_label.into(),
        }
    }
}

#[async_trait]
impl BeforeRun for DestroyGuard {
    async fn before_run(&self, ctx: &mut StepContext) -> Result<Option<StepOutcome>, StepError> {
        if !ctx.is_raised(semaphore::DESTROY).await? {
            return Ok(None);
        }

        if ctx.label() != self.teardown_label {
            Ok(Some(StepOutcome::transition(self.teardown_label.clone())))
        } else if ctx.depth() > 1 {
            Ok(Some(StepOutcome::returning(semaphore::CANCELLED_BY_DESTROY)))
        } else {
            Ok(None)
        }
    }
}

/// A named, closed set of labelled steps
pub struct Program {
    name: String,
    start_label: String,
    steps: HashMap<String, Arc<dyn Step>>,
    hooks: Vec<Arc<dyn BeforeRun>>,
    teardown_label: Option<String>,
    steady_labels: HashSet<String>,
    validator: Option<FrameValidator>,
}

impl Program {
    /// Start building a program
    pub fn builder(name: impl Into<String>) -> ProgramBuilder {
        ProgramBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Label new strands of this program start at
    pub fn start_label(&self) -> &str {
        &self.start_label
    }

    /// Look up the step for a label
    pub fn step(&self, label: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(label).cloned()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.steps.contains_key(label)
    }

    /// All labels, sorted
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<_> = self.steps.keys().map(|s| s.as_str()).collect();
        labels.sort_unstable();
        labels
    }

    pub fn teardown_label(&self) -> Option<&str> {
        self.teardown_label.as_deref()
    }

    /// Whether a label means the managed resource is up and serving
    pub fn is_steady(&self, label: &str) -> bool {
        self.steady_labels.contains(label)
    }

    /// Run the frame validator, if any
    pub fn validate(&self, frame: &Frame) -> Result<(), StepError> {
        match &self.validator {
            Some(validator) => validator(frame),
            None => Ok(()),
        }
    }

    /// Run the before-run hooks in order; the first override wins
    pub async fn before_run(
        &self,
        ctx: &mut StepContext,
    ) -> Result<Option<StepOutcome>, StepError> {
        for hook in &self.hooks {
            if let Some(outcome) = hook.before_run(ctx).await? {
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name)
            .field("start_label", &self.start_label)
            .field("labels", &self.labels())
            .field("teardown_label", &self.teardown_label)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Builder for [`Program`]
///
/// # Example
///
/// ```ignore
/// let program = Program::builder("Counter")
///     .step("start", Count)
///     .step("loop", Count)
///     .build()?;
/// ```
pub struct ProgramBuilder {
    name: String,
    start_label: String,
    steps: Vec<(String, Arc<dyn Step>)>,
    hooks: Vec<Arc<dyn BeforeRun>>,
    teardown_label: Option<String>,
    steady_labels: Vec<String>,
    validator: Option<FrameValidator>,
}

impl ProgramBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_label: "start".to_string(),
            steps: Vec::new(),
            hooks: Vec::new(),
            teardown_label: None,
            steady_labels: Vec::new(),
            validator: None,
        }
    }

    /// Set the start label (default `start`)
    pub fn start_at(mut self, label: impl Into<String>) -> Self {
        self.start_label = label.into();
        self
    }

    /// Add a step under a label
    pub fn step(mut self, label: impl Into<String>, step: impl Step) -> Self {
        self.steps.push((label.into(), Arc::new(step)));
        self
    }

    /// Add a plain function as a step
    pub fn step_fn<F>(self, label: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut StepContext) -> BoxFuture<'a, StepResult> + Send + Sync + 'static,
    {
        self.step(label, FnStep(f))
    }

    /// Add a before-run hook; hooks run in registration order
    pub fn before_run(mut self, hook: impl BeforeRun) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Declare the teardown label and install the destroy guard ahead of
    /// any other hook
    pub fn teardown(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        self.hooks.insert(0, Arc::new(DestroyGuard::new(label.clone())));
        self.teardown_label = Some(label);
        self
    }

    /// Labels during which the managed resource counts as running
    pub fn steady<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steady_labels.extend(labels.into_iter().map(Into::into));
        self
    }

    /// Validate the initial frame at assemble time
    pub fn validate_with<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Frame) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Finish the program, checking every referenced label exists
    pub fn build(self) -> Result<Program, RegistryError> {
        let mut steps = HashMap::with_capacity(self.steps.len());
        for (label, step) in self.steps {
            if steps.insert(label.clone(), step).is_some() {
                return Err(RegistryError::DuplicateLabel {
                    program: self.name,
                    label,
                });
            }
        }

        let referenced = std::iter::once(&self.start_label)
            .chain(self.teardown_label.iter())
            .chain(self.steady_labels.iter());
        for label in referenced {
            if !steps.contains_key(label) {
                return Err(RegistryError::MissingLabel {
                    program: self.name.clone(),
                    label: label.clone(),
                });
            }
        }

        Ok(Program {
            name: self.name,
            start_label: self.start_label,
            steps,
            hooks: self.hooks,
            teardown_label: self.teardown_label,
            steady_labels: self.steady_labels.into_iter().collect(),
            validator: self.validator,
        })
    }
}

/// Registry of programs by name
///
/// Built once at startup and shared read-only with the dispatcher.
#[derive(Default)]
pub struct ProgramRegistry {
    programs: HashMap<String, Arc<Program>>,
}

impl ProgramRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a program
    pub fn register(&mut self, program: Program) -> Result<(), RegistryError> {
        if self.programs.contains_key(program.name()) {
            return Err(RegistryError::DuplicateProgram(program.name().to_string()));
        }
        self.programs
            .insert(program.name().to_string(), Arc::new(program));
        Ok(())
    }

    /// Register a program, builder style
    pub fn with(mut self, program: Program) -> Result<Self, RegistryError> {
        self.register(program)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Program>> {
        self.programs.get(name).cloned()
    }

    /// Resolve `(program, label)` to a program and step
    pub fn resolve(
        &self,
        program: &str,
        label: &str,
    ) -> Result<(Arc<Program>, Arc<dyn Step>), RegistryError> {
        let found = self
            .get(program)
            .ok_or_else(|| RegistryError::UnknownProgram(program.to_string()))?;
        let step = found
            .step(label)
            .ok_or_else(|| RegistryError::UnknownLabel {
                program: program.to_string(),
                label: label.to_string(),
            })?;
        Ok((found, step))
    }

    /// Check if a program is registered
    pub fn contains(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }

    /// Get the number of registered programs
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Get all registered program names
    pub fn program_names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for ProgramRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramRegistry")
            .field("programs", &self.programs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Program not registered
    #[error("unknown program: {0}")]
    UnknownProgram(String),

    /// Program has no step for the label
    #[error("program {program} has no label {label}")]
    UnknownLabel { program: String, label: String },

    /// Program name registered twice
    #[error("program already registered: {0}")]
    DuplicateProgram(String),

    /// Label defined twice in one program
    #[error("program {program} defines label {label} twice")]
    DuplicateLabel { program: String, label: String },

    /// Start, teardown or steady label without a step
    #[error("program {program} references undefined label {label}")]
    MissingLabel { program: String, label: String },
}
