use clap::Parser;
use sheet_agent::adapters::authorizer::LoopbackAuthorizer;
use sheet_agent::adapters::llm::ChatCompletionGenerator;
use sheet_agent::adapters::oauth::{ClientSecrets, GoogleOAuthClient};
use sheet_agent::config::{AgentConfig, CliArgs, Command};
use sheet_agent::domain::model::{ExecutionResult, FileKind, GENERATED_UNIT_NAME};
use sheet_agent::utils::error::ErrorSeverity;
use sheet_agent::utils::validation::{validate_required_field, Validate};
use sheet_agent::utils::logger;
use sheet_agent::{
    AgentError, Bundler, ClassifiedError, CredentialSource, CredentialStore, DeploymentPipeline,
    LocalStorage, PipelineStage, ProjectManager, ProjectPointers, SourceUnit, Target, TokenCache,
};
use std::path::Path;
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "sheet-agent.toml";

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    if args.json_logs {
        logger::init_json_logger();
    } else {
        logger::init_cli_logger(args.verbose);
    }

    tracing::info!("🚀 Starting sheet-agent");

    match run(args).await {
        Ok(true) => {}
        // the deployed script raised; already reported
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!(
                "❌ Failed at {} (Category: {:?}, Severity: {:?}): {}",
                e.stage,
                e.category,
                e.source.severity(),
                e.source
            );
            eprintln!("❌ {}", e.message);
            eprintln!("💡 {}", e.source.recovery_suggestion());

            let exit_code = match e.source.severity() {
                ErrorSeverity::Low => 0,
                ErrorSeverity::Medium => 2,
                ErrorSeverity::High => 1,
                ErrorSeverity::Critical => 3,
            };
            if exit_code > 0 {
                std::process::exit(exit_code);
            }
        }
    }
}

fn setup_error(e: AgentError) -> ClassifiedError {
    ClassifiedError::classify(PipelineStage::Init, e)
}

fn load_config(path: &Path) -> Result<AgentConfig, AgentError> {
    let config = if !path.exists() && path == Path::new(DEFAULT_CONFIG_PATH) {
        tracing::info!("No {} found, using defaults", DEFAULT_CONFIG_PATH);
        AgentConfig::default()
    } else {
        tracing::info!("📁 Loading configuration from: {}", path.display());
        AgentConfig::from_file(path)?
    };
    config.validate()?;
    Ok(config)
}

fn credential_source(
    config: &AgentConfig,
    token: Option<String>,
) -> Result<CredentialSource, AgentError> {
    if let Some(token) = token {
        tracing::debug!("Using bearer token from the command line");
        return Ok(CredentialSource::supplied(token));
    }

    let secrets_path = validate_required_field(
        "oauth.client_secrets_path",
        &config.oauth.client_secrets_path,
    )?;
    let mut secrets = ClientSecrets::from_file(secrets_path)?;
    if let Some(uri) = &config.oauth.token_uri {
        secrets.token_uri = uri.clone();
    }
    if let Some(uri) = &config.oauth.auth_uri {
        secrets.auth_uri = uri.clone();
    }

    let oauth = Arc::new(GoogleOAuthClient::new(secrets));
    let store = CredentialStore::new(
        TokenCache::new(&config.oauth.token_cache_path),
        config.platform.scopes.clone(),
        oauth.clone(),
    )
    .with_authorizer(Arc::new(LoopbackAuthorizer::new(oauth)));
    Ok(CredentialSource::Managed(Arc::new(store)))
}

fn resolve_target(
    script_id: Option<String>,
    spreadsheet: Option<String>,
) -> Result<Target, AgentError> {
    match (script_id, spreadsheet) {
        (Some(id), _) => Ok(Target::Project(id)),
        (None, Some(container)) => Ok(Target::Container(container)),
        (None, None) => Err(AgentError::MissingConfigError {
            field: "--script-id or --spreadsheet".to_string(),
        }),
    }
}

fn report_result(result: &ExecutionResult) -> bool {
    match result {
        ExecutionResult::Returned { value } => {
            println!("✅ Script returned: {}", value);
            true
        }
        ExecutionResult::ScriptFailed { failure } => {
            eprintln!("⚠️ Script raised an error: {}", failure.message);
            for frame in &failure.stack {
                eprintln!(
                    "    at {} (line {})",
                    frame.function.as_deref().unwrap_or("<anonymous>"),
                    frame
                        .line_number
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "?".to_string())
                );
            }
            false
        }
    }
}

async fn run(args: CliArgs) -> Result<bool, ClassifiedError> {
    let config = load_config(&args.config).map_err(setup_error)?;
    let bundler = Bundler::new(config.manifest());

    if let Command::Bundle { dir } = &args.command {
        let dir = dir.as_ref().or(config.pipeline.library_dir.as_ref());
        let units = match dir {
            Some(dir) => bundler.bundle(dir),
            None => bundler.assemble(Vec::new(), None),
        }
        .map_err(setup_error)?;
        for unit in &units {
            println!("{:<40} {:?} ({} bytes)", unit.name, unit.kind, unit.content.len());
        }
        return Ok(true);
    }

    let source = credential_source(&config, args.token.clone()).map_err(setup_error)?;
    let platform = ProjectManager::new(&config.platform.api_base, &config.platform.script_title);
    let pointers = ProjectPointers::new(LocalStorage::new(
        config.pipeline.state_dir.to_string_lossy(),
    ));
    let pipeline = DeploymentPipeline::new(platform, bundler, pointers, config.pipeline_settings());

    match args.command {
        Command::Provision { spreadsheet } => {
            let handle = pipeline.provision(&source, &spreadsheet).await?;
            println!("✅ Script created: {}", handle.project_id);
            Ok(true)
        }
        Command::Run {
            target,
            instruction,
        } => {
            let target =
                resolve_target(target.script_id, target.spreadsheet).map_err(setup_error)?;
            let api_key =
                validate_required_field("llm.api_key", &config.llm.api_key).map_err(setup_error)?;
            let mut generator =
                ChatCompletionGenerator::new(&config.llm.endpoint, &config.llm.model, api_key);
            if let Some(prompt) = &config.llm.system_prompt {
                generator = generator.with_system_prompt(prompt);
            }

            let report = pipeline
                .run_instruction(&generator, &source, &target, &instruction)
                .await?;
            println!("📝 {}", report.explanation);
            println!(
                "📦 Project {} version {} deployment {}",
                report.run.handle.project_id,
                report.run.version.number,
                report.run.deployment.deployment_id
            );
            Ok(report_result(&report.run.result))
        }
        Command::Push {
            target,
            file,
            entry_point,
        } => {
            let target =
                resolve_target(target.script_id, target.spreadsheet).map_err(setup_error)?;
            let code = std::fs::read_to_string(&file)
                .map_err(|e| AgentError::BundlingError {
                    path: file.clone(),
                    message: e.to_string(),
                })
                .map_err(setup_error)?;
            let kind = FileKind::from_extension(file.extension().and_then(|ext| ext.to_str()));
            let units = vec![SourceUnit::new(GENERATED_UNIT_NAME, kind, code)];
            let entry_point = entry_point.unwrap_or_else(|| config.pipeline.entry_point.clone());

            let run = pipeline
                .deploy_and_run(&source, &target, units, &entry_point)
                .await?;
            println!(
                "📦 Project {} version {} deployment {}",
                run.handle.project_id, run.version.number, run.deployment.deployment_id
            );
            Ok(report_result(&run.result))
        }
        Command::Bundle { .. } => Ok(true),
    }
}
