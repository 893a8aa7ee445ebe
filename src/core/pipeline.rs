//! One "generate code -> deploy -> run" cycle.
//!
//! A cycle walks `INIT -> AUTHENTICATED -> CONTENT_PUSHED -> DEPLOYED ->
//! EXECUTED`; the first failing step ends it, and the error is classified
//! with the last state reached. Nothing carries over between cycles except
//! the project pointers and the per-project locks that keep two pushes to
//! the same project from racing.

use crate::adapters::storage::{validate_container_id, ProjectPointers};
use crate::core::bundler::Bundler;
use crate::core::credential_store::CredentialSource;
use crate::domain::model::{
    Credential, CycleReport, DeployedRun, FileKind, GeneratedScript, PipelineStage,
    ProjectHandle, SourceUnit, Target, GENERATED_UNIT_NAME,
};
use crate::domain::ports::{CodeGenerator, ScriptPlatform, Storage};
use crate::utils::error::{AgentError, ClassifiedError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

pub const DEFAULT_ENTRY_POINT: &str = "main";

const NO_EXPLANATION: &str = "No explanation provided";

/// Pushed as the entry point when a project is first provisioned.
pub const PLACEHOLDER_CODE: &str = "function main() {\n  return \"ready\";\n}\n";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub entry_point: String,
    /// Support files pushed alongside every generated unit.
    pub library_dir: Option<PathBuf>,
    /// Deadline for a whole cycle, measured from its start.
    pub timeout: Option<Duration>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            library_dir: None,
            timeout: None,
        }
    }
}

type LockRegistry = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Held while a project (or a container being resolved) is in use. On drop
/// the registry forgets every slot nobody holds or waits on.
struct KeyLock<'a> {
    registry: &'a LockRegistry,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, slot| Arc::strong_count(slot) > 1);
    }
}

pub struct DeploymentPipeline<P: ScriptPlatform, S: Storage> {
    platform: P,
    bundler: Bundler,
    pointers: ProjectPointers<S>,
    settings: PipelineSettings,
    locks: LockRegistry,
}

/// Await `fut` unless the cycle deadline passes first.
async fn within<T, F>(
    deadline: Option<Instant>,
    fut: F,
    on_timeout: impl FnOnce() -> AgentError,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout()),
        },
        None => fut.await,
    }
}

fn timed_out(step: &str) -> String {
    format!("timed out during {}", step)
}

impl<P: ScriptPlatform, S: Storage> DeploymentPipeline<P, S> {
    pub fn new(
        platform: P,
        bundler: Bundler,
        pointers: ProjectPointers<S>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            platform,
            bundler,
            pointers,
            settings,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn platform(&self) -> &P {
        &self.platform
    }

    /// Waits for `key`. A wait abandoned by a timeout still prunes its slot.
    async fn lock(&self, key: String) -> KeyLock<'_> {
        let mut held = KeyLock {
            registry: &self.locks,
            guard: None,
        };
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        held.guard = Some(slot.lock_owned().await);
        held
    }

    fn advance(stage: &mut PipelineStage, next: PipelineStage) {
        tracing::info!("Pipeline {} -> {}", stage, next);
        *stage = next;
    }

    fn deadline(&self) -> Option<Instant> {
        self.settings.timeout.map(|timeout| Instant::now() + timeout)
    }

    fn fail(stage: PipelineStage, error: AgentError) -> ClassifiedError {
        let classified = ClassifiedError::classify(stage, error);
        tracing::error!(
            "Pipeline failed after {} ({:?}): {}",
            stage,
            classified.category,
            classified.source
        );
        classified
    }

    async fn authenticate(
        &self,
        source: &CredentialSource,
        deadline: Option<Instant>,
        stage: &mut PipelineStage,
    ) -> Result<Credential> {
        let credential = within(deadline, source.acquire(), || {
            AgentError::AuthorizationError {
                message: timed_out("credential acquisition"),
            }
        })
        .await?;
        Self::advance(stage, PipelineStage::Authenticated);
        Ok(credential)
    }

    /// Generate code for `instruction`, then deploy and run it. The
    /// credential is acquired first so a rejected caller never costs a
    /// generator call.
    pub async fn run_instruction(
        &self,
        generator: &dyn CodeGenerator,
        source: &CredentialSource,
        target: &Target,
        instruction: &str,
    ) -> std::result::Result<CycleReport, ClassifiedError> {
        let mut stage = PipelineStage::Init;
        self.instruction_cycle(generator, source, target, instruction, &mut stage)
            .await
            .map_err(|e| Self::fail(stage, e))
    }

    async fn instruction_cycle(
        &self,
        generator: &dyn CodeGenerator,
        source: &CredentialSource,
        target: &Target,
        instruction: &str,
        stage: &mut PipelineStage,
    ) -> Result<CycleReport> {
        validate_target(target)?;
        let deadline = self.deadline();
        let credential = self.authenticate(source, deadline, stage).await?;

        tracing::info!("Generating script for instruction");
        let script = within(deadline, generate(generator, instruction), || {
            AgentError::GenerationError {
                message: timed_out("code generation"),
            }
        })
        .await?;

        let explanation = if script.explanation.trim().is_empty() {
            NO_EXPLANATION.to_string()
        } else {
            script.explanation
        };
        let units = vec![SourceUnit::new(
            GENERATED_UNIT_NAME,
            FileKind::ServerCode,
            script.code,
        )];

        let run = self
            .push_deploy_run(
                &credential,
                target,
                units,
                &self.settings.entry_point,
                deadline,
                stage,
            )
            .await?;
        Ok(CycleReport { explanation, run })
    }

    pub async fn deploy_and_run(
        &self,
        source: &CredentialSource,
        target: &Target,
        generated_units: Vec<SourceUnit>,
        entry_point: &str,
    ) -> std::result::Result<DeployedRun, ClassifiedError> {
        let mut stage = PipelineStage::Init;
        let deadline = self.deadline();
        let outcome: Result<DeployedRun> = async {
            validate_target(target)?;
            let credential = self.authenticate(source, deadline, &mut stage).await?;
            self.push_deploy_run(
                &credential,
                target,
                generated_units,
                entry_point,
                deadline,
                &mut stage,
            )
            .await
        }
        .await;
        outcome.map_err(|e| Self::fail(stage, e))
    }

    async fn push_deploy_run(
        &self,
        credential: &Credential,
        target: &Target,
        generated_units: Vec<SourceUnit>,
        entry_point: &str,
        deadline: Option<Instant>,
        stage: &mut PipelineStage,
    ) -> Result<DeployedRun> {
        let handle = self.resolve_project(credential, target, deadline).await?;

        let project_lock = async { Ok(self.lock(handle.project_id.clone()).await) };
        let _guard = within(deadline, project_lock, || AgentError::PushError {
            status: None,
            payload: timed_out("wait for a concurrent push to the same project"),
        })
        .await?;

        let units = self
            .bundler
            .assemble(generated_units, self.settings.library_dir.as_deref())?;

        let version = within(
            deadline,
            self.platform.push_content(credential, &handle, &units),
            || AgentError::PushError {
                status: None,
                payload: timed_out("content push"),
            },
        )
        .await?;
        Self::advance(stage, PipelineStage::ContentPushed);

        let deployment = within(
            deadline,
            self.platform.create_deployment(credential, &handle, &version),
            || AgentError::DeploymentError {
                status: None,
                payload: timed_out("deployment creation"),
            },
        )
        .await?;
        Self::advance(stage, PipelineStage::Deployed);

        let result = within(
            deadline,
            self.platform
                .execute(credential, &deployment, entry_point, &[]),
            || AgentError::ExecutionError {
                status: None,
                payload: timed_out("script execution"),
            },
        )
        .await?;
        Self::advance(stage, PipelineStage::Executed);

        if !result.success() {
            tracing::warn!("Deployed script reported an error");
        }
        Ok(DeployedRun {
            handle,
            version,
            deployment,
            result,
        })
    }

    async fn resolve_project(
        &self,
        credential: &Credential,
        target: &Target,
        deadline: Option<Instant>,
    ) -> Result<ProjectHandle> {
        let container_id = match target {
            Target::Project(project_id) => {
                return Ok(ProjectHandle {
                    project_id: project_id.clone(),
                    container_id: None,
                })
            }
            Target::Container(container_id) => container_id,
        };

        // two first runs for one container must not both create a project
        let _guard = self.lock(format!("container:{}", container_id)).await;
        if let Some(project_id) = self.pointers.lookup(container_id).await? {
            tracing::debug!("Reusing project {} for {}", project_id, container_id);
            return Ok(ProjectHandle {
                project_id,
                container_id: Some(container_id.clone()),
            });
        }

        let handle = within(
            deadline,
            self.platform.create_project(credential, container_id),
            || AgentError::ProjectCreateError {
                status: None,
                payload: timed_out("project creation"),
            },
        )
        .await?;
        self.pointers
            .record(container_id, &handle.project_id)
            .await?;
        Ok(handle)
    }

    /// Create a fresh project for `container_id`, push the placeholder entry
    /// point with the library files, and point the container at it.
    pub async fn provision(
        &self,
        source: &CredentialSource,
        container_id: &str,
    ) -> std::result::Result<ProjectHandle, ClassifiedError> {
        let mut stage = PipelineStage::Init;
        self.provision_inner(source, container_id, &mut stage)
            .await
            .map_err(|e| Self::fail(stage, e))
    }

    async fn provision_inner(
        &self,
        source: &CredentialSource,
        container_id: &str,
        stage: &mut PipelineStage,
    ) -> Result<ProjectHandle> {
        validate_container_id(container_id)?;
        let deadline = self.deadline();
        let credential = self.authenticate(source, deadline, stage).await?;

        let _guard = self.lock(format!("container:{}", container_id)).await;
        let handle = within(
            deadline,
            self.platform.create_project(&credential, container_id),
            || AgentError::ProjectCreateError {
                status: None,
                payload: timed_out("project creation"),
            },
        )
        .await?;

        let units = self.bundler.assemble(
            vec![SourceUnit::new(
                GENERATED_UNIT_NAME,
                FileKind::ServerCode,
                PLACEHOLDER_CODE,
            )],
            self.settings.library_dir.as_deref(),
        )?;
        within(
            deadline,
            self.platform.push_content(&credential, &handle, &units),
            || AgentError::PushError {
                status: None,
                payload: timed_out("content push"),
            },
        )
        .await?;
        Self::advance(stage, PipelineStage::ContentPushed);

        self.pointers
            .record(container_id, &handle.project_id)
            .await?;
        tracing::info!(
            "Provisioned project {} for container {}",
            handle.project_id,
            container_id
        );
        Ok(handle)
    }
}

fn validate_target(target: &Target) -> Result<()> {
    match target {
        Target::Container(container_id) => validate_container_id(container_id),
        Target::Project(_) => Ok(()),
    }
}

async fn generate(generator: &dyn CodeGenerator, instruction: &str) -> Result<GeneratedScript> {
    let script = generator.generate(instruction).await.map_err(|e| match e {
        AgentError::GenerationError { .. } => e,
        other => AgentError::GenerationError {
            message: other.to_string(),
        },
    })?;
    if script.code.trim().is_empty() {
        return Err(AgentError::GenerationError {
            message: "generator returned no code".to_string(),
        });
    }
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::storage::LocalStorage;
    use crate::core::bundler::Manifest;
    use crate::domain::model::{Deployment, ExecutionResult, Version};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Records pushed unit names; pushes sleep to expose overlap.
    #[derive(Default)]
    struct SlowPlatform {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        versions: AtomicUsize,
        pushed: std::sync::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ScriptPlatform for SlowPlatform {
        async fn create_project(&self, _: &Credential, container_id: &str) -> Result<ProjectHandle> {
            Ok(ProjectHandle {
                project_id: format!("project-for-{}", container_id),
                container_id: Some(container_id.to_string()),
            })
        }

        async fn push_content(
            &self,
            _: &Credential,
            handle: &ProjectHandle,
            units: &[SourceUnit],
        ) -> Result<Version> {
            self.pushed
                .lock()
                .unwrap()
                .push(units.iter().map(|u| u.name.clone()).collect());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Version {
                project_id: handle.project_id.clone(),
                number: self.versions.fetch_add(1, Ordering::SeqCst) as u64 + 1,
            })
        }

        async fn create_deployment(
            &self,
            _: &Credential,
            _: &ProjectHandle,
            version: &Version,
        ) -> Result<Deployment> {
            Ok(Deployment {
                deployment_id: format!("dep-{}", version.number),
                version_number: version.number,
                manifest_file: "appsscript".to_string(),
            })
        }

        async fn execute(
            &self,
            _: &Credential,
            _: &Deployment,
            _: &str,
            _: &[serde_json::Value],
        ) -> Result<ExecutionResult> {
            Ok(ExecutionResult::Returned {
                value: serde_json::Value::Null,
            })
        }
    }

    struct CountingGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CodeGenerator for CountingGenerator {
        async fn generate(&self, _: &str) -> Result<GeneratedScript> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GeneratedScript {
                explanation: String::new(),
                code: "function main(){}".to_string(),
            })
        }
    }

    fn pipeline(dir: &TempDir) -> DeploymentPipeline<SlowPlatform, LocalStorage> {
        DeploymentPipeline::new(
            SlowPlatform::default(),
            Bundler::new(Manifest {
                time_zone: "UTC".to_string(),
                exception_logging: "CLOUD".to_string(),
                runtime_version: "V8".to_string(),
                oauth_scopes: vec![],
                execution_api: None,
            }),
            ProjectPointers::new(LocalStorage::new(dir.path().to_string_lossy())),
            PipelineSettings::default(),
        )
    }

    fn units() -> Vec<SourceUnit> {
        vec![SourceUnit::new(
            GENERATED_UNIT_NAME,
            FileKind::ServerCode,
            "function main(){}",
        )]
    }

    fn registry_len(pipeline: &DeploymentPipeline<SlowPlatform, LocalStorage>) -> usize {
        pipeline.locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_same_project_cycles_are_serialized() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let source = CredentialSource::supplied("ya29.token");
        let target = Target::Project("shared".to_string());

        let (a, b) = tokio::join!(
            pipeline.deploy_and_run(&source, &target, units(), "main"),
            pipeline.deploy_and_run(&source, &target, units(), "main"),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(pipeline.platform.max_in_flight.load(Ordering::SeqCst), 1);
        let mut numbers = vec![a.unwrap().version.number, b.unwrap().version.number];
        numbers.sort();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_distinct_projects_run_concurrently() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let source = CredentialSource::supplied("ya29.token");
        let first = Target::Project("one".to_string());
        let second = Target::Project("two".to_string());

        let (a, b) = tokio::join!(
            pipeline.deploy_and_run(&source, &first, units(), "main"),
            pipeline.deploy_and_run(&source, &second, units(), "main"),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(pipeline.platform.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lock_registry_is_emptied_after_cycles() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let source = CredentialSource::supplied("ya29.token");

        for i in 0..8 {
            let target = if i % 2 == 0 {
                Target::Project(format!("project-{}", i))
            } else {
                Target::Container(format!("sheet-{}", i))
            };
            pipeline
                .deploy_and_run(&source, &target, units(), "main")
                .await
                .unwrap();
        }
        let first = Target::Project("a".to_string());
        let second = Target::Project("b".to_string());
        let (a, b) = tokio::join!(
            pipeline.deploy_and_run(&source, &first, units(), "main"),
            pipeline.deploy_and_run(&source, &first, units(), "main"),
        );
        assert!(a.is_ok() && b.is_ok());
        pipeline
            .deploy_and_run(&source, &second, units(), "main")
            .await
            .unwrap();

        assert_eq!(registry_len(&pipeline), 0);
    }

    #[tokio::test]
    async fn test_timed_out_lock_wait_leaves_no_slot() {
        let dir = TempDir::new().unwrap();
        let mut pipeline = pipeline(&dir);
        pipeline.settings.timeout = Some(Duration::from_millis(20));
        let source = CredentialSource::supplied("ya29.token");
        let target = Target::Project("busy".to_string());

        let (a, b) = tokio::join!(
            pipeline.deploy_and_run(&source, &target, units(), "main"),
            pipeline.deploy_and_run(&source, &target, units(), "main"),
        );

        assert!(a.is_err() && b.is_err());
        assert_eq!(registry_len(&pipeline), 0);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_in_flight_step() {
        let dir = TempDir::new().unwrap();
        let mut pipeline = pipeline(&dir);
        pipeline.settings.timeout = Some(Duration::from_millis(10));
        let source = CredentialSource::supplied("ya29.token");

        let err = pipeline
            .deploy_and_run(&source, &Target::Project("p".to_string()), units(), "main")
            .await
            .unwrap_err();

        assert_eq!(err.stage, PipelineStage::Authenticated);
        assert!(matches!(err.source, AgentError::PushError { status: None, .. }));
    }

    #[tokio::test]
    async fn test_container_target_records_pointer_once() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let source = CredentialSource::supplied("ya29.token");
        let target = Target::Container("sheet-9".to_string());

        let run = pipeline
            .deploy_and_run(&source, &target, units(), "main")
            .await
            .unwrap();
        assert_eq!(run.handle.project_id, "project-for-sheet-9");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sheet-9.script-id")).unwrap(),
            "project-for-sheet-9"
        );
    }

    #[tokio::test]
    async fn test_rejected_bearer_skips_generation() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let generator = CountingGenerator {
            calls: AtomicUsize::new(0),
        };

        for token in ["", "   ", "two words"] {
            let err = pipeline
                .run_instruction(
                    &generator,
                    &CredentialSource::supplied(token),
                    &Target::Project("p".to_string()),
                    "add a button",
                )
                .await
                .unwrap_err();
            assert_eq!(err.stage, PipelineStage::Init);
            assert_eq!(err.http_status(), 401);
        }
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        assert!(pipeline.platform.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_carries_generated_manifest_and_library_in_order() {
        let dir = TempDir::new().unwrap();
        let library = TempDir::new().unwrap();
        std::fs::create_dir_all(library.path().join("lib")).unwrap();
        std::fs::write(library.path().join("lib/util.js"), "function util(){}").unwrap();
        std::fs::write(library.path().join("sidebar.html"), "<div></div>").unwrap();

        let mut pipeline = pipeline(&dir);
        pipeline.settings.library_dir = Some(library.path().to_path_buf());
        let generator = CountingGenerator {
            calls: AtomicUsize::new(0),
        };

        let report = pipeline
            .run_instruction(
                &generator,
                &CredentialSource::supplied("ya29.token"),
                &Target::Project("p".to_string()),
                "add a button",
            )
            .await
            .unwrap();

        assert_eq!(report.explanation, NO_EXPLANATION);
        let pushed = pipeline.platform.pushed.lock().unwrap();
        assert_eq!(
            pushed[0],
            vec!["generated", "appsscript", "lib/util", "sidebar"]
        );
    }

    #[tokio::test]
    async fn test_missing_library_dir_stops_before_push() {
        let dir = TempDir::new().unwrap();
        let mut pipeline = pipeline(&dir);
        pipeline.settings.library_dir = Some(dir.path().join("no-such-dir"));
        let source = CredentialSource::supplied("ya29.token");

        let err = pipeline
            .deploy_and_run(&source, &Target::Project("p".to_string()), units(), "main")
            .await
            .unwrap_err();

        assert_eq!(err.stage, PipelineStage::Authenticated);
        assert!(matches!(err.source, AgentError::BundlingError { .. }));
        assert!(pipeline.platform.pushed.lock().unwrap().is_empty());
        assert_eq!(pipeline.platform.versions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provision_rejects_bad_container_before_any_call() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);

        let err = pipeline
            .provision(&CredentialSource::supplied("ya29.token"), "../escape")
            .await
            .unwrap_err();

        assert_eq!(err.http_status(), 400);
        assert!(pipeline.platform.pushed.lock().unwrap().is_empty());
    }
}
