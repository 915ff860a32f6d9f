//! CLI command definitions and argument parsing

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use addon_updater::profile::CredentialOverrides;
use addon_updater::{
    EngineConfig, InstallControl, OptionalPackageAction, Options, Plan, Profile, ProgressEvent,
    UpdateEngine, UpdateError,
};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::output::{self, JsonResponse, OutputFormat};
use crate::ExitCode;

/// Addon updater - check, install and roll back addon updates
#[derive(Parser, Debug)]
#[command(name = "addon-updater")]
#[command(version, about = "Addon updater - check, install and roll back addon updates")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Profile TOML file
    #[arg(short, long, global = true, env = "ADDON_UPDATER_PROFILE")]
    pub profile: Option<PathBuf>,

    /// Engine config TOML file
    #[arg(long, global = true, env = "ADDON_UPDATER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format: text or json
    #[arg(long, default_value = "text", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(flatten)]
    pub credentials: CredentialArgs,
}

/// One-shot credential replacements; the profile file is not modified.
#[derive(Args, Debug, Default)]
pub struct CredentialArgs {
    #[arg(long, global = true)]
    pub login: Option<String>,

    #[arg(long, global = true, env = "ADDON_UPDATER_LICENSE_KEY", hide_env_values = true)]
    pub license_key: Option<String>,

    #[arg(long, global = true, env = "ADDON_UPDATER_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

impl CredentialArgs {
    fn overrides(&self) -> CredentialOverrides {
        CredentialOverrides {
            login: self.login.clone(),
            license_key: self.license_key.clone(),
            password: self.password.clone(),
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compute an update plan and print it
    Check(PlanArgs),
    /// Compute a plan and install it
    Update(UpdateArgs),
    /// Show whether a rollback snapshot exists
    RollbackInfo,
    /// Restore the files changed by the last install
    Rollback,
}

/// Options shared by `check` and `update`
#[derive(Args, Debug, Default)]
pub struct PlanArgs {
    /// Reinstall every file and delete files the catalog does not claim
    #[arg(long)]
    pub fresh: bool,

    /// Re-hash every known file and re-download mismatches
    #[arg(long)]
    pub repair: bool,

    #[arg(long)]
    pub beta: bool,

    #[arg(long)]
    pub alpha: bool,

    /// Install an optional package even without detection markers (repeatable)
    #[arg(long = "install-optional", value_name = "ID")]
    pub install_optional: Vec<String>,

    /// Skip an optional package (repeatable)
    #[arg(long = "ignore-optional", value_name = "ID")]
    pub ignore_optional: Vec<String>,
}

impl PlanArgs {
    pub fn options(&self) -> Options {
        let mut optional_packages = HashMap::new();
        for id in &self.install_optional {
            optional_packages.insert(id.clone(), OptionalPackageAction::Install);
        }
        for id in &self.ignore_optional {
            optional_packages.insert(id.clone(), OptionalPackageAction::Ignore);
        }
        Options {
            alpha: self.alpha,
            beta: self.beta,
            fresh: self.fresh,
            repair: self.repair,
            optional_packages,
        }
    }
}

/// Arguments for the update command
#[derive(Args, Debug)]
pub struct UpdateArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    /// Only print the plan; do not install
    #[arg(long)]
    pub dry_run: bool,
}

/// Read a profile from TOML.
pub fn load_profile(path: &Path) -> anyhow::Result<Profile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading profile {}", path.display()))?;
    let profile: Profile =
        toml::from_str(&content).with_context(|| format!("parsing profile {}", path.display()))?;
    Ok(profile)
}

/// Engine config from `path`, or defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

impl Cli {
    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: EngineConfig) -> anyhow::Result<ExitCode> {
        let Some(profile_path) = self.profile.as_deref() else {
            eprintln!("Error: a profile file is required (--profile or ADDON_UPDATER_PROFILE)");
            return Ok(ExitCode::InvalidInput);
        };
        let profile = load_profile(profile_path)?.with_overrides(&self.credentials.overrides());
        debug!(profile_id = %profile.id, provider = %profile.provider, "Profile loaded");

        let engine = UpdateEngine::new(config)?;
        engine.start();
        let outcome = self.run(&engine, &profile).await;
        engine.stop();

        match outcome {
            Ok(code) => Ok(code),
            Err(CommandError { command, error }) => {
                let code = ExitCode::for_error(&error);
                match self.output {
                    OutputFormat::Text => eprintln!("Error: {error}"),
                    OutputFormat::Json => {
                        let body = JsonResponse::failure(command, error.to_string());
                        println!("{}", serde_json::to_string_pretty(&body)?);
                    }
                }
                Ok(code)
            }
        }
    }

    async fn run(&self, engine: &UpdateEngine, profile: &Profile) -> Result<ExitCode, CommandError> {
        match &self.command {
            Commands::Check(args) => {
                let plan = engine
                    .create_plan(profile, &args.options())
                    .await
                    .map_err(CommandError::in_command("check"))?;
                output::emit(self.output, "check", &plan, output::render_plan);
                Ok(ExitCode::Success)
            }
            Commands::Update(args) => self.update(engine, profile, args).await,
            Commands::RollbackInfo => {
                let info = engine.rollback_info(profile).await;
                output::emit(self.output, "rollback-info", &info, output::render_rollback_info);
                Ok(ExitCode::Success)
            }
            Commands::Rollback => {
                let result = engine
                    .rollback(profile)
                    .await
                    .map_err(CommandError::in_command("rollback"))?;
                output::emit(self.output, "rollback", &result, output::render_rollback);
                Ok(ExitCode::Success)
            }
        }
    }

    async fn update(
        &self,
        engine: &UpdateEngine,
        profile: &Profile,
        args: &UpdateArgs,
    ) -> Result<ExitCode, CommandError> {
        let plan = engine
            .create_plan(profile, &args.plan.options())
            .await
            .map_err(CommandError::in_command("update"))?;
        if self.output == OutputFormat::Text {
            println!("{}", output::render_plan(&plan));
        }
        if args.dry_run || plan.is_empty() {
            if self.output == OutputFormat::Json {
                output::emit(self.output, "update", &plan, output::render_plan);
            } else if plan.is_empty() {
                println!("Nothing to install.");
            }
            return Ok(ExitCode::Success);
        }

        let result = self
            .install(engine, profile, &plan)
            .await
            .map_err(CommandError::in_command("update"))?;
        output::emit(self.output, "update", &result, output::render_install);
        Ok(ExitCode::Success)
    }

    /// Install `plan`, printing progress and cancelling on Ctrl-C.
    async fn install(
        &self,
        engine: &UpdateEngine,
        profile: &Profile,
        plan: &Plan,
    ) -> Result<addon_updater::InstallResult, UpdateError> {
        let control = InstallControl::new();
        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(64);

        let show_progress = self.output == OutputFormat::Text;
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if show_progress {
                    println!("{}", output::render_progress(&event));
                }
            }
        });

        let interrupt = {
            let control = control.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling install");
                    control.cancel();
                }
            })
        };

        info!(plan_id = %plan.plan_id, actions = plan.actions.len(), "Installing plan");
        let result = engine.install(profile, &plan.plan_id, Some(tx), &control).await;
        interrupt.abort();
        if let Err(e) = printer.await {
            debug!(error = %e, "Progress printer stopped");
        }
        result
    }
}

/// Engine error tagged with the command that produced it.
struct CommandError {
    command: &'static str,
    error: UpdateError,
}

impl CommandError {
    fn in_command(command: &'static str) -> impl Fn(UpdateError) -> CommandError {
        move |error| CommandError { command, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use addon_updater::ProviderKind;
    use tempfile::TempDir;

    #[test]
    fn test_parse_check_with_flags() {
        let cli = Cli::try_parse_from([
            "addon-updater",
            "--profile",
            "p.toml",
            "check",
            "--fresh",
            "--install-optional",
            "livery-pack",
        ])
        .unwrap();
        assert_eq!(cli.profile.as_deref(), Some(Path::new("p.toml")));
        let Commands::Check(args) = cli.command else {
            panic!("expected check");
        };
        let options = args.options();
        assert!(options.fresh);
        assert_eq!(
            options.optional_packages.get("livery-pack"),
            Some(&OptionalPackageAction::Install)
        );
    }

    #[test]
    fn test_parse_update_and_rollback_commands() {
        let cli = Cli::try_parse_from(["addon-updater", "update", "--dry-run", "--output", "json"]).unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Update(UpdateArgs { dry_run: true, .. })));

        let cli = Cli::try_parse_from(["addon-updater", "rollback-info"]).unwrap();
        assert!(matches!(cli.command, Commands::RollbackInfo));
        let cli = Cli::try_parse_from(["addon-updater", "rollback", "--password", "pw"]).unwrap();
        assert!(matches!(cli.command, Commands::Rollback));
        assert_eq!(cli.credentials.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_load_profile_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("profile.toml");
        std::fs::write(
            &path,
            r#"
id = "jet"
host = "https://store.example.com/"
productDir = "/games/jet"
provider = "archive"
productId = 42
ignoreList = ["liveries/"]
"#,
        )
        .unwrap();

        let profile = load_profile(&path).unwrap();
        assert_eq!(profile.id, "jet");
        assert_eq!(profile.provider, ProviderKind::Archive);
        assert_eq!(profile.product_id, Some(42));
        assert_eq!(profile.ignore_list, vec!["liveries/"]);
        assert_eq!(profile.normalized_host().unwrap(), "https://store.example.com");
    }

    #[test]
    fn test_load_profile_missing_file() {
        let temp = TempDir::new().unwrap();
        assert!(load_profile(&temp.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_load_config_defaults_without_path() {
        let config = load_config(None).unwrap();
        assert!(config.integrity.gzip_fallback);
    }
}
