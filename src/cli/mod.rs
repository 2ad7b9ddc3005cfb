//! CLI subcommands: init, validate, schema, provision, plan, describe.
//!
//! Provisioning runs against the filesystem providers rooted at the state
//! directory: objects under `<state_dir>/objects`, the role table in
//! `<state_dir>/roles.yaml`, stack locks under `<state_dir>/<service>/`.

use crate::build::toolchain::{CargoToolchain, PrebuiltToolchain, Toolchain};
use crate::core::workflow::{self, ProvisionOutcome, ProvisionRequest, Providers};
use crate::core::{parser, planner, state, types};
use crate::provenance::eventlog;
use crate::provider::local::{LocalConvergenceTarget, LocalIdentityService, LocalObjectStorage};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Object storage root inside the state directory.
pub const OBJECTS_DIR: &str = "objects";

/// Role name to ARN table inside the state directory.
pub const ROLES_FILE: &str = "roles.yaml";

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stratus project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate stratus.yaml without building anything
    Validate {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,
    },

    /// Print the JSON schema of stratus.yaml
    Schema,

    /// Build, package, upload and converge the service
    Provision {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// Compile and assemble, but upload and converge nothing
        #[arg(long)]
        dry_run: bool,

        /// Build id (default: generated)
        #[arg(long)]
        build_id: Option<String>,

        /// Ship this binary instead of compiling with cargo
        #[arg(long)]
        prebuilt: Option<PathBuf>,

        /// Log level exported to the deployed functions
        #[arg(long, default_value = "info")]
        function_log_level: String,

        /// Write the indented template here
        #[arg(long)]
        template_out: Option<PathBuf>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Show what a provision would change in the recorded stack
    Plan {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// Build id (default: generated)
        #[arg(long)]
        build_id: Option<String>,

        /// Ship this binary instead of compiling with cargo
        #[arg(long)]
        prebuilt: Option<PathBuf>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Show the recorded stack and its latest events
    Describe {
        /// Service (stack) name
        #[arg(short, long)]
        service: String,

        /// Number of events to show
        #[arg(long, default_value_t = 10)]
        events: usize,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Schema => cmd_schema(),
        Commands::Provision {
            file,
            dry_run,
            build_id,
            prebuilt,
            function_log_level,
            template_out,
            state_dir,
        } => {
            let options = RunOptions {
                build_id,
                prebuilt,
                log_level: function_log_level,
                template_out,
            };
            cmd_provision(&file, &state_dir, dry_run, options).await
        }
        Commands::Plan {
            file,
            build_id,
            prebuilt,
            state_dir,
        } => {
            let options = RunOptions {
                build_id,
                prebuilt,
                ..RunOptions::default()
            };
            cmd_plan(&file, &state_dir, options).await
        }
        Commands::Describe {
            service,
            events,
            state_dir,
        } => cmd_describe(&state_dir, &service, events),
    }
}

/// Per-run knobs shared by provision and plan.
#[derive(Debug, Default)]
struct RunOptions {
    build_id: Option<String>,
    prebuilt: Option<PathBuf>,
    log_level: String,
    template_out: Option<PathBuf>,
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("stratus.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let name = path
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .filter(|n| parser::is_valid_service_name(n))
        .unwrap_or_else(|| "my-service".to_string());

    let template = format!(
        r#"version: "1.0"
name: {name}
bucket: {name}-artifacts
build:
  manifest_dir: .
functions:
  - handler: {crate_name}::handler
    role:
      inline:
        privileges: []
    options:
      memory_size: 128
      timeout: 3
"#,
        name = name,
        crate_name = name.replace('-', "_"),
    );

    std::fs::write(&config_path, template)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;
    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir)
        .map_err(|e| format!("cannot create {}: {}", state_dir.display(), e))?;

    println!("Initialized stratus project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);

    if errors.is_empty() {
        let customs: usize = config.functions.iter().map(|f| f.custom_resources.len()).sum();
        println!(
            "OK: {} ({} functions, {} custom resources, site: {})",
            config.name,
            config.functions.len(),
            customs,
            if config.site.is_some() { "yes" } else { "no" }
        );
        Ok(())
    } else {
        for e in &errors {
            println!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

fn cmd_schema() -> Result<(), String> {
    println!("{}", parser::config_schema()?);
    Ok(())
}

/// Parse and validate a stratus config file, returning errors if invalid.
fn parse_and_validate(file: &Path) -> Result<types::ServiceConfig, String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err("validation failed".to_string())
}

/// Filesystem providers rooted at `state_dir`.
fn local_providers(state_dir: &Path, prebuilt: Option<&Path>) -> Result<Providers, String> {
    let storage = Arc::new(LocalObjectStorage::new(state_dir.join(OBJECTS_DIR)));
    let identity = LocalIdentityService::from_file(&state_dir.join(ROLES_FILE))?;
    let toolchain: Arc<dyn Toolchain> = match prebuilt {
        Some(path) => Arc::new(PrebuiltToolchain::from_file(path)?),
        None => Arc::new(CargoToolchain::new()),
    };
    Ok(Providers {
        identity: Arc::new(identity),
        convergence: Arc::new(LocalConvergenceTarget::new(state_dir, Arc::clone(&storage))),
        storage,
        toolchain,
    })
}

fn build_request(config: &types::ServiceConfig, options: RunOptions) -> Result<ProvisionRequest, String> {
    let mut request = ProvisionRequest::from_config(config)?;
    request.build_id = options.build_id;
    request.template_out = options.template_out;
    if !options.log_level.is_empty() {
        request.log_level = options.log_level;
    }
    Ok(request)
}

async fn cmd_provision(
    file: &Path,
    state_dir: &Path,
    dry_run: bool,
    options: RunOptions,
) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let providers = local_providers(state_dir, options.prebuilt.as_deref())?;
    let mut request = build_request(&config, options)?;
    request.dry_run = dry_run;
    request.state_dir = Some(state_dir.to_path_buf());

    let outcome = workflow::provision(request, providers)
        .await
        .map_err(|e| e.to_string())?;
    print_outcome(&config, &outcome);
    Ok(())
}

fn print_outcome(config: &types::ServiceConfig, outcome: &ProvisionOutcome) {
    println!("Provisioned: {} (build {})", config.name, outcome.build_id);
    println!("  Archive: s3://{}/{}", config.bucket, outcome.archive_key);
    if let Some(site_key) = &outcome.site_key {
        println!("  Site: s3://{}/{}", config.bucket, site_key);
    }
    println!("  Resources: {}", outcome.resource_count);
    match &outcome.stack {
        Some(stack) => println!("  Stack: {} ({})", stack.stack_name, stack.stack_id),
        None => println!("  Stack: not converged (dry run)"),
    }
}

async fn cmd_plan(file: &Path, state_dir: &Path, options: RunOptions) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let providers = local_providers(state_dir, options.prebuilt.as_deref())?;
    let mut request = build_request(&config, options)?;
    request.dry_run = true;

    let outcome = workflow::provision(request, providers)
        .await
        .map_err(|e| e.to_string())?;
    let template: serde_json::Value = serde_json::from_str(&outcome.template)
        .map_err(|e| format!("invalid template JSON: {}", e))?;

    let lock = state::load_lock(state_dir, &config.name)?;
    let plan = planner::plan(&config.name, &template, lock.as_ref())?;
    print_plan(&plan);
    Ok(())
}

/// Display a plan to stdout.
fn print_plan(plan: &types::ExecutionPlan) {
    println!("Planning: {} ({} resources)", plan.stack, plan.changes.len());
    println!();
    for change in &plan.changes {
        println!("  {}", planner::describe_change(change));
    }
    println!();
    println!(
        "Plan: {} to add, {} to change, {} to delete, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_delete, plan.unchanged
    );
}

fn cmd_describe(state_dir: &Path, service: &str, events: usize) -> Result<(), String> {
    let Some(lock) = state::load_lock(state_dir, service)? else {
        println!("No stack recorded for {}. Run `stratus provision` first.", service);
        return Ok(());
    };

    println!("Stack: {} ({})", lock.stack, lock.stack_id);
    println!("  Generated: {}", lock.generated_at);
    println!("  Generator: {}", lock.generator);
    println!("  Template: {}", lock.template_hash);
    for (key, value) in &lock.tags {
        println!("  Tag {}: {}", key, value);
    }
    println!("  Resources: {}", lock.resources.len());
    for (name, resource) in &lock.resources {
        println!("    {}: {} [{}]", name, resource.resource_type, resource.hash);
    }

    let log = eventlog::read_events(state_dir, service)?;
    if !log.is_empty() {
        println!();
        println!("Events (latest {} of {}):", events.min(log.len()), log.len());
        for entry in log.iter().skip(log.len().saturating_sub(events)) {
            let body = serde_json::to_string(&entry.event)
                .map_err(|e| format!("serialize error: {}", e))?;
            println!("  {} {}", entry.ts, body);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Project {
        dir: tempfile::TempDir,
    }

    impl Project {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("bootstrap.bin"), b"ELF").unwrap();
            Self { dir }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn write_config(&self, memory: u32) -> PathBuf {
            let file = self.path("stratus.yaml");
            std::fs::write(
                &file,
                format!(
                    r#"
version: "1.0"
name: hello
bucket: artifacts
build:
  work_dir: {work}
functions:
  - handler: hello::greet
    role:
      inline:
        privileges:
          - actions: ["s3:GetObject"]
            resource: "arn:aws:s3:::data/*"
    options:
      memory_size: {memory}
"#,
                    work = self.path("work").display(),
                    memory = memory,
                ),
            )
            .unwrap();
            file
        }

        fn provision(&self, file: &Path, dry_run: bool) -> Commands {
            Commands::Provision {
                file: file.to_path_buf(),
                dry_run,
                build_id: Some("b-1".into()),
                prebuilt: Some(self.path("bootstrap.bin")),
                function_log_level: "debug".into(),
                template_out: Some(self.path("template.json")),
                state_dir: self.path("state"),
            }
        }

        fn plan(&self, file: &Path) -> Result<(), String> {
            let options = RunOptions {
                build_id: Some("b-1".into()),
                prebuilt: Some(self.path("bootstrap.bin")),
                ..RunOptions::default()
            };
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(cmd_plan(file, &self.path("state"), options))
        }
    }

    #[test]
    fn test_init() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("my-service");
        std::fs::create_dir_all(&sub).unwrap();
        cmd_init(&sub).unwrap();
        assert!(sub.join("state").is_dir());

        let config = parser::parse_config_file(&sub.join("stratus.yaml")).unwrap();
        assert_eq!(config.name, "my-service");
        assert_eq!(config.functions[0].handler, "my_service::handler");
        assert!(parser::validate_config(&config).is_empty());
    }

    #[test]
    fn test_init_unusable_directory_name() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("2024_api");
        std::fs::create_dir_all(&sub).unwrap();
        cmd_init(&sub).unwrap();

        let config = parser::parse_config_file(&sub.join("stratus.yaml")).unwrap();
        assert_eq!(config.name, "my-service");
        assert!(parser::validate_config(&config).is_empty());
    }

    #[test]
    fn test_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stratus.yaml"), "exists").unwrap();
        assert!(cmd_init(dir.path()).is_err());
    }

    #[test]
    fn test_validate_valid_and_invalid() {
        let project = Project::new();
        let file = project.write_config(256);
        cmd_validate(&file).unwrap();

        let bad = project.path("bad.yaml");
        std::fs::write(
            &bad,
            "version: \"2.0\"\nname: hello\nbucket: \"\"\nfunctions: []\n",
        )
        .unwrap();
        assert_eq!(cmd_validate(&bad).unwrap_err(), "2 validation error(s)");
        assert_eq!(parse_and_validate(&bad).unwrap_err(), "validation failed");
    }

    #[test]
    fn test_validate_missing_file() {
        assert!(cmd_validate(Path::new("/nonexistent/stratus.yaml")).is_err());
    }

    #[test]
    fn test_schema() {
        cmd_schema().unwrap();
    }

    #[test]
    fn test_local_providers_read_role_table() {
        let project = Project::new();
        let state_dir = project.path("state");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(state_dir.join(ROLES_FILE), "ops: arn:aws:iam::1:role/ops\n").unwrap();
        let providers = local_providers(&state_dir, Some(&project.path("bootstrap.bin"))).unwrap();

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let arn = runtime.block_on(providers.identity.lookup_role("ops")).unwrap();
        assert_eq!(arn, "arn:aws:iam::1:role/ops");
        assert!(local_providers(&state_dir, Some(&project.path("missing.bin"))).is_err());
    }

    #[tokio::test]
    async fn test_provision_converges_and_records() {
        let project = Project::new();
        let file = project.write_config(256);
        dispatch(project.provision(&file, false)).await.unwrap();

        let state_dir = project.path("state");
        let lock = state::load_lock(&state_dir, "hello").unwrap().unwrap();
        assert_eq!(lock.resources.len(), 2);
        assert_eq!(lock.tags[workflow::TAG_BUILD_ID], "b-1");
        assert!(state_dir.join(OBJECTS_DIR).join("artifacts/hello/hello-b-1.zip").exists());
        assert!(project.path("template.json").exists());

        let events = eventlog::read_events(&state_dir, "hello").unwrap();
        assert!(events.len() >= 2);

        cmd_describe(&state_dir, "hello", 3).unwrap();
    }

    #[tokio::test]
    async fn test_provision_dry_run_leaves_no_stack() {
        let project = Project::new();
        let file = project.write_config(256);
        dispatch(project.provision(&file, true)).await.unwrap();

        let state_dir = project.path("state");
        assert!(state::load_lock(&state_dir, "hello").unwrap().is_none());
        assert!(!state_dir.join(OBJECTS_DIR).exists());
    }

    #[tokio::test]
    async fn test_provision_unknown_named_role_fails() {
        let project = Project::new();
        let file = project.path("stratus.yaml");
        std::fs::write(
            &file,
            format!(
                "version: \"1.0\"\nname: hello\nbucket: artifacts\nbuild:\n  work_dir: {}\nfunctions:\n  - handler: hello::greet\n    role: {{ name: ghost }}\n",
                project.path("work").display()
            ),
        )
        .unwrap();
        let err = dispatch(project.provision(&file, false)).await.unwrap_err();
        assert!(err.contains("ghost"), "{}", err);
        assert!(state::load_lock(&project.path("state"), "hello").unwrap().is_none());
    }

    #[test]
    fn test_plan_against_recorded_stack() {
        let project = Project::new();
        let file = project.write_config(256);

        // Nothing recorded yet: everything is a create.
        project.plan(&file).unwrap();

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime
            .block_on(dispatch(project.provision(&file, false)))
            .unwrap();
        let lock = state::load_lock(&project.path("state"), "hello").unwrap().unwrap();

        let file = project.write_config(512);
        project.plan(&file).unwrap();
        // Plan never converges.
        let after = state::load_lock(&project.path("state"), "hello").unwrap().unwrap();
        assert_eq!(after.template_hash, lock.template_hash);
    }

    #[test]
    fn test_describe_without_stack() {
        let dir = tempfile::tempdir().unwrap();
        cmd_describe(dir.path(), "hello", 10).unwrap();
    }
}
