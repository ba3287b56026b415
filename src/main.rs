mod compose;
mod config;
mod environment;
mod error;
mod profiles;
mod registry;

use clap::{Parser, Subcommand};
use compose::{ComposeController, DockerRunner, RealDockerRunner, StopOutcome, PRIMARY_SERVICE};
use config::{resolve_config_path, resolve_services_dir, ConfigStore};
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, MultiSelect};
use environment::{sanitize_folder_name, Environment};
use error::{AnydevError, ProcessErrorDetails, Result};
use registry::{require_environment, Registry};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "anydev",
    version,
    about = "Create and manage container-backed development environments"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long = "services-dir", global = true)]
    services_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start or restart the environment in the current directory.
    #[command(visible_aliases = ["start", "restart"], aliases = ["u", "r"])]
    Up,
    /// Stop the environment in the current directory.
    #[command(visible_alias = "stop", alias = "d")]
    Down,
    /// Follow the logs of a service until interrupted.
    #[command(visible_alias = "log", alias = "g")]
    Logs {
        #[arg(default_value = PRIMARY_SERVICE)]
        service: String,
    },
    /// Open a shell (or run a command) in the primary service container.
    #[command(visible_alias = "terminal", alias = "t")]
    Shell {
        #[arg(default_value = "/bin/sh")]
        command: String,
    },
    #[command(hide = true, alias = "b")]
    Bash,
    /// List registered environments, dropping ones that are no longer valid.
    #[command(visible_alias = "ls", alias = "l")]
    List,
    /// Register an existing environment directory.
    Add { path: Option<PathBuf> },
    /// Remove an environment from the registry.
    Forget { name: String },
    /// Manage the shared services composition.
    #[command(visible_alias = "svc", aliases = ["s", "service", "srv"])]
    Services {
        #[command(subcommand)]
        command: ServicesCommand,
    },
    /// Choose active service profiles and project preferences.
    #[command(visible_alias = "config", alias = "c")]
    Configure {
        #[arg(long = "profile", conflicts_with = "no_profiles")]
        profiles: Vec<String>,
        #[arg(long)]
        no_profiles: bool,
        #[arg(long)]
        projects_path: Option<String>,
        #[arg(long, conflicts_with = "no_organize")]
        organize: bool,
        #[arg(long)]
        no_organize: bool,
    },
    /// Check that docker and the anydev configuration are usable.
    Doctor,
}

#[derive(Subcommand, Debug)]
enum ServicesCommand {
    #[command(visible_aliases = ["restart", "start"], alias = "r")]
    Up,
    #[command(visible_alias = "stop")]
    Down,
    Profiles,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    services_dir: PathBuf,
    cwd: PathBuf,
    json: bool,
}

#[derive(Debug, Default)]
struct ConfigureArgs {
    profiles: Vec<String>,
    no_profiles: bool,
    projects_path: Option<String>,
    organize: Option<bool>,
}

impl ConfigureArgs {
    fn is_empty(&self) -> bool {
        self.profiles.is_empty()
            && !self.no_profiles
            && self.projects_path.is_none()
            && self.organize.is_none()
    }
}

fn main() -> std::result::Result<(), AnydevError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let ctx = build_context(&cli)?;
    let mut store = ConfigStore::load(&ctx.config_path);
    let runner = RealDockerRunner;

    let result = match cli.command {
        Commands::Up => handle_up(&ctx, &mut store, &runner),
        Commands::Down => handle_down(&ctx, &mut store, &runner),
        Commands::Logs { service } => handle_logs(&ctx, &mut store, &service, &runner),
        Commands::Shell { command } => handle_shell(&ctx, &mut store, &command, &runner),
        Commands::Bash => handle_shell(&ctx, &mut store, "/bin/bash", &runner),
        Commands::List => handle_list(&ctx, &mut store),
        Commands::Add { path } => handle_add(&ctx, &mut store, path),
        Commands::Forget { name } => handle_forget(&ctx, &mut store, &name),
        Commands::Services { command } => handle_services(&ctx, &mut store, command, &runner),
        Commands::Configure {
            profiles,
            no_profiles,
            projects_path,
            organize,
            no_organize,
        } => {
            let organize = match (organize, no_organize) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            handle_configure(
                &ctx,
                &mut store,
                ConfigureArgs {
                    profiles,
                    no_profiles,
                    projects_path,
                    organize,
                },
                &runner,
            )
        }
        Commands::Doctor => match handle_doctor(&ctx, &store, &runner) {
            Ok(true) => Ok(()),
            Ok(false) => std::process::exit(1),
            Err(err) => Err(err),
        },
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.process_details().cloned(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{} {err}", style("error:").red().bold());
        }
        std::process::exit(err.exit_code());
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env("ANYDEV_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .try_init();
}

fn build_context(cli: &Cli) -> Result<Context> {
    Ok(Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        services_dir: resolve_services_dir(cli.services_dir.as_ref()),
        cwd: env::current_dir()?,
        json: cli.json,
    })
}

fn controller<'a, R: DockerRunner>(ctx: &Context, runner: &'a R) -> ComposeController<'a, R> {
    ComposeController::new(runner).with_passthrough(!ctx.json)
}

/// Validates the current directory, registering it on first sight.
fn current_environment(ctx: &Context, store: &mut ConfigStore) -> Result<Environment> {
    let (env, created) = require_environment(store, &ctx.cwd)?;
    if created {
        note(ctx, &format!("Environment '{}' registered.", env.name));
    }
    Ok(env)
}

/// Active profiles that the manifest in `dir` declares. Selected profiles it
/// does not declare are left out of the command line.
fn profiles_for(store: &ConfigStore, dir: &Path) -> Result<Vec<String>> {
    let active = &store.document().active_profiles;
    if active.is_empty() {
        return Ok(Vec::new());
    }
    let Some(manifest) = profiles::find_manifest(dir) else {
        return Ok(Vec::new());
    };
    let available = profiles::available_profiles(&manifest)?;
    for stale in profiles::stale_profiles(active, &available) {
        tracing::debug!(profile = stale, manifest = %manifest.display(), "profile not declared; skipping");
    }
    Ok(active
        .iter()
        .filter(|p| available.contains(p))
        .cloned()
        .collect())
}

fn handle_up<R: DockerRunner>(ctx: &Context, store: &mut ConfigStore, runner: &R) -> Result<()> {
    let env = current_environment(ctx, store)?;
    let profiles = profiles_for(store, &env.path)?;
    note(ctx, "Asking Docker to start the environment...");
    let previous = controller(ctx, runner).start(&env.path, &profiles)?;
    report(
        ctx,
        &format!("Environment '{}' started.", env.name),
        json!({
            "action": "up",
            "environment": env,
            "profiles": profiles,
            "restarted": previous == StopOutcome::Stopped,
        }),
    )
}

fn handle_down<R: DockerRunner>(ctx: &Context, store: &mut ConfigStore, runner: &R) -> Result<()> {
    let env = current_environment(ctx, store)?;
    let outcome = controller(ctx, runner).stop(&env.path)?;
    let message = match outcome {
        StopOutcome::NotRunning => format!("Environment '{}' is not currently running.", env.name),
        StopOutcome::Stopped => format!("Environment '{}' stopped.", env.name),
    };
    report(
        ctx,
        &message,
        json!({
            "action": "down",
            "environment": env,
            "was_running": outcome == StopOutcome::Stopped,
        }),
    )
}

fn handle_logs<R: DockerRunner>(
    ctx: &Context,
    store: &mut ConfigStore,
    service: &str,
    runner: &R,
) -> Result<()> {
    let env = current_environment(ctx, store)?;
    let interrupted = install_interrupt_flag()?;
    note(ctx, "Tailing logs. Press Ctrl+C to exit.");
    controller(ctx, runner).tail_logs(&env.path, service, &interrupted)
}

fn handle_shell<R: DockerRunner>(
    ctx: &Context,
    store: &mut ConfigStore,
    command: &str,
    runner: &R,
) -> Result<()> {
    let env = current_environment(ctx, store)?;
    note(ctx, &format!("Opening terminal with {command}"));
    controller(ctx, runner).shell(&env.path, command)
}

fn install_interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))?;
    Ok(flag)
}

fn handle_list(ctx: &Context, store: &mut ConfigStore) -> Result<()> {
    let reconciled = Registry::new(store).list_valid()?;
    if ctx.json {
        let unreadable: Vec<_> = reconciled
            .unreadable
            .iter()
            .map(|(env, reason)| json!({"environment": env, "reason": reason}))
            .collect();
        return output(
            ctx,
            json!({
                "environments": reconciled.valid,
                "dropped": reconciled.dropped,
                "unreadable": unreadable,
            }),
        );
    }

    for env in &reconciled.dropped {
        println!(
            "{}",
            style(format!(
                "Environment {} is no longer valid. Removed it from tracked environments.",
                env.name
            ))
            .yellow()
        );
    }
    for (env, reason) in &reconciled.unreadable {
        println!(
            "{}",
            style(format!("Environment {} could not be checked: {reason}", env.name)).yellow()
        );
    }
    println!("{}", style("AnyDev Environments").bold().cyan());
    if reconciled.valid.is_empty() {
        println!("{}", style("No environments registered.").dim());
        return Ok(());
    }
    let name_width = column_width(reconciled.valid.iter().map(|e| e.name.as_str()), "Environment");
    let template_width = column_width(
        reconciled.valid.iter().map(|e| e.template.as_str()),
        "Template",
    );
    println!(
        "{} {} {}",
        style(format!("{:<name_width$}", "Environment")).bold(),
        style(format!("{:<template_width$}", "Template")).bold(),
        style("Path").bold()
    );
    for env in &reconciled.valid {
        println!(
            "{} {} {}",
            style(format!("{:<name_width$}", env.name)).cyan(),
            style(format!("{:<template_width$}", env.template)).magenta(),
            style(env.path.display()).green()
        );
    }
    Ok(())
}

fn column_width<'a>(values: impl Iterator<Item = &'a str>, header: &str) -> usize {
    values
        .map(|v| v.chars().count())
        .chain(std::iter::once(header.len()))
        .max()
        .unwrap_or(0)
}

fn handle_add(ctx: &Context, store: &mut ConfigStore, path: Option<PathBuf>) -> Result<()> {
    let dir = match path {
        Some(path) if path.is_absolute() => path,
        Some(path) => ctx.cwd.join(path),
        None => ctx.cwd.clone(),
    };
    let (env, created) = require_environment(store, &dir)?;
    if sanitize_folder_name(&env.name) != env.name {
        tracing::warn!(
            name = %env.name,
            "directory name contains characters that new environments would not use"
        );
    }
    let message = if created {
        format!("Environment '{}' registered.", env.name)
    } else {
        format!("Environment '{}' is already registered.", env.name)
    };
    report(
        ctx,
        &message,
        json!({"action": "add", "environment": env, "created": created}),
    )
}

fn handle_forget(ctx: &Context, store: &mut ConfigStore, name: &str) -> Result<()> {
    let removed = Registry::new(store).unregister(name)?;
    let message = if removed {
        format!("Environment '{name}' removed from tracked environments.")
    } else {
        format!("Environment '{name}' was not registered.")
    };
    report(
        ctx,
        &message,
        json!({"action": "forget", "name": name, "removed": removed}),
    )
}

fn services_manifest(ctx: &Context) -> Result<PathBuf> {
    profiles::find_manifest(&ctx.services_dir).ok_or_else(|| {
        AnydevError::Config(format!(
            "no services composition found in {}; set --services-dir or ANYDEV_SERVICES_DIR",
            ctx.services_dir.display()
        ))
    })
}

/// Stop-then-start of the shared services with the active profiles they
/// declare. Returns the profiles passed to docker.
fn start_services<R: DockerRunner>(
    ctx: &Context,
    store: &ConfigStore,
    runner: &R,
) -> Result<Vec<String>> {
    let profiles = profiles_for(store, &ctx.services_dir)?;
    if profiles.is_empty() {
        note(ctx, "Asking Docker to start the shared services...");
    } else {
        note(ctx, "Asking Docker to start chosen services...");
    }
    controller(ctx, runner).start(&ctx.services_dir, &profiles)?;
    Ok(profiles)
}

fn handle_services<R: DockerRunner>(
    ctx: &Context,
    store: &mut ConfigStore,
    command: ServicesCommand,
    runner: &R,
) -> Result<()> {
    match command {
        ServicesCommand::Up => {
            services_manifest(ctx)?;
            if !store.is_configured() {
                tracing::warn!("anydev is not configured yet; run `anydev configure` to choose profiles");
            }
            let profiles = start_services(ctx, store, runner)?;
            report(
                ctx,
                "Shared services started.",
                json!({"action": "services_up", "profiles": profiles}),
            )
        }
        ServicesCommand::Down => {
            services_manifest(ctx)?;
            let outcome = controller(ctx, runner).stop(&ctx.services_dir)?;
            let message = match outcome {
                StopOutcome::NotRunning => "Shared services are not currently running.",
                StopOutcome::Stopped => "Shared services stopped.",
            };
            report(
                ctx,
                message,
                json!({"action": "services_down", "was_running": outcome == StopOutcome::Stopped}),
            )
        }
        ServicesCommand::Profiles => {
            let available = profiles::available_profiles(&services_manifest(ctx)?)?;
            let active = &store.document().active_profiles;
            let stale = profiles::stale_profiles(active, &available);
            if ctx.json {
                return output(
                    ctx,
                    json!({"available": available, "active": active, "stale": stale}),
                );
            }
            for profile in &available {
                let marker = if active.contains(profile) { "[x]" } else { "[ ]" };
                println!("{marker} {profile}");
            }
            for profile in stale {
                println!("{}", style(format!("[!] {profile} (not declared)")).dim());
            }
            Ok(())
        }
    }
}

fn handle_configure<R: DockerRunner>(
    ctx: &Context,
    store: &mut ConfigStore,
    args: ConfigureArgs,
    runner: &R,
) -> Result<()> {
    if args.is_empty() {
        if !ctx.json && io::stdin().is_terminal() {
            return configure_interactive(ctx, store, runner);
        }
        return output(ctx, serde_json::to_value(store.document())?);
    }

    if args.no_profiles {
        profiles::set_active_profiles(store, &[]);
    } else if !args.profiles.is_empty() {
        check_declared(ctx, &args.profiles)?;
        profiles::set_active_profiles(store, &args.profiles);
    }
    if let Some(path) = args.projects_path.as_deref() {
        store.document_mut().set_projects_path(path);
    }
    if let Some(organize) = args.organize {
        store.document_mut().set_organize_projects(organize);
    }
    store.save()?;
    report(
        ctx,
        &format!("Configuration saved to {}.", store.path().display()),
        serde_json::to_value(store.document())?,
    )
}

/// Rejects a new selection naming profiles the services manifest does not
/// declare. Without a manifest the selection is taken as-is.
fn check_declared(ctx: &Context, selection: &[String]) -> Result<()> {
    let Some(manifest) = profiles::find_manifest(&ctx.services_dir) else {
        tracing::warn!(
            dir = %ctx.services_dir.display(),
            "no services composition found; storing profiles without checking them"
        );
        return Ok(());
    };
    let available = profiles::available_profiles(&manifest)?;
    let unknown: Vec<&str> = selection
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty() && !available.iter().any(|a| a == p))
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }
    Err(AnydevError::Validation(format!(
        "unknown profile(s): {} (available: {})",
        unknown.join(", "),
        available.join(", ")
    )))
}

fn configure_interactive<R: DockerRunner>(
    ctx: &Context,
    store: &mut ConfigStore,
    runner: &R,
) -> Result<()> {
    let theme = ColorfulTheme::default();
    println!("{}", style("Starting interactive configuration...").yellow().bold());
    if store.is_configured() {
        println!(
            "{}",
            style("Existing configuration found. Using it for default values.").dim()
        );
    }

    match profiles::find_manifest(&ctx.services_dir) {
        Some(manifest) => {
            let available = profiles::available_profiles(&manifest)?;
            let checked: Vec<bool> = available
                .iter()
                .map(|p| store.document().active_profiles.contains(p))
                .collect();
            let picked = MultiSelect::with_theme(&theme)
                .with_prompt("Which profiles would you like to use?")
                .items(&available)
                .defaults(&checked)
                .interact()?;
            let selection: Vec<String> = picked.into_iter().map(|i| available[i].clone()).collect();
            if selection.is_empty() {
                println!(
                    "{}",
                    style("No profiles selected. Using minimal configuration.").yellow()
                );
            } else {
                println!(
                    "{}",
                    style(format!("Selected profiles: {}", selection.join(", "))).green()
                );
            }
            profiles::set_active_profiles(store, &selection);
        }
        None => println!(
            "{}",
            style(format!(
                "No services composition found in {}; skipping profile selection.",
                ctx.services_dir.display()
            ))
            .dim()
        ),
    }

    let projects_path = Input::<String>::with_theme(&theme)
        .with_prompt("Where do you want to put your projects?")
        .default(store.document().projects_path.clone())
        .allow_empty(true)
        .interact_text()?;
    store.document_mut().set_projects_path(&projects_path);
    if let Some(dir) = store.document().projects_dir() {
        if !dir.is_dir() {
            let create = Confirm::with_theme(&theme)
                .with_prompt(format!(
                    "That directory doesn't exist. Should I try to create it? ({})",
                    dir.display()
                ))
                .default(true)
                .interact()?;
            if create {
                std::fs::create_dir_all(&dir)?;
            }
        }
        let organize = Confirm::with_theme(&theme)
            .with_prompt("Organize new projects into folders by template?")
            .default(store.document().organize_projects)
            .interact()?;
        store.document_mut().set_organize_projects(organize);
    }

    store.save()?;
    println!("{}", style("Configuration complete!").green().bold());

    if profiles::find_manifest(&ctx.services_dir).is_some() {
        let restart = Confirm::with_theme(&theme)
            .with_prompt("Do you want to (re)start the service containers now?")
            .default(true)
            .interact()?;
        if restart {
            start_services(ctx, store, runner)?;
            println!("{}", style("Shared services started.").green().bold());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    remediation: Option<String>,
}

fn doctor_check(id: &str, ok: bool, message: impl Into<String>, remediation: &str) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        message: message.into(),
        remediation: if ok { None } else { Some(remediation.to_string()) },
    }
}

fn collect_doctor_checks<R: DockerRunner>(
    ctx: &Context,
    store: &ConfigStore,
    runner: &R,
) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();
    let installed = which::which("docker").is_ok();
    checks.push(doctor_check(
        "docker_installed",
        installed,
        if installed {
            "docker found on PATH"
        } else {
            "docker not found on PATH"
        },
        "Install Docker and ensure `docker` is on your PATH.",
    ));
    let reachable = installed && controller(ctx, runner).is_tool_available();
    checks.push(doctor_check(
        "docker_daemon",
        reachable,
        if reachable {
            "docker daemon is reachable"
        } else {
            "docker daemon is not reachable"
        },
        "Start Docker Desktop (or dockerd) and retry.",
    ));
    checks.push(doctor_check(
        "config",
        store.is_configured(),
        format!("configuration at {}", store.path().display()),
        "Run `anydev configure` to create it.",
    ));
    let manifest = profiles::find_manifest(&ctx.services_dir);
    checks.push(doctor_check(
        "services_manifest",
        manifest.is_some(),
        match &manifest {
            Some(path) => format!("services composition at {}", path.display()),
            None => format!("no services composition in {}", ctx.services_dir.display()),
        },
        "Set --services-dir or ANYDEV_SERVICES_DIR to your shared services directory.",
    ));
    checks
}

/// Prints every check and reports whether docker is usable. The report
/// itself is the output, so a failing docker check is not an error value.
fn handle_doctor<R: DockerRunner>(ctx: &Context, store: &ConfigStore, runner: &R) -> Result<bool> {
    let checks = collect_doctor_checks(ctx, store, runner);
    let docker_ok = checks
        .iter()
        .filter(|check| check.id.starts_with("docker"))
        .all(|check| check.ok);

    if ctx.json {
        let payload = JsonResult {
            ok: docker_ok,
            result: Some(json!({ "checks": checks })),
            error: if docker_ok {
                None
            } else {
                Some("docker is not available; is the docker daemon running?".to_string())
            },
            error_details: None,
        };
        print_json(&payload)?;
        return Ok(docker_ok);
    }

    for check in &checks {
        let state = if check.ok {
            style("ok").green()
        } else {
            style("fail").red()
        };
        println!("[{state}] {} - {}", check.id, check.message);
        if let Some(remediation) = &check.remediation {
            println!("  remediation: {remediation}");
        }
    }
    Ok(docker_ok)
}

/// Progress line for humans; silent in `--json` mode.
fn note(ctx: &Context, message: &str) {
    if !ctx.json {
        println!("{}", style(message).cyan());
    }
}

fn report(ctx: &Context, message: &str, payload: serde_json::Value) -> Result<()> {
    if ctx.json {
        return output(ctx, payload);
    }
    println!("{}", style(message).green().bold());
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<()> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", serde_yaml::to_string(&payload)?.trim_end());
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::tests::MockDockerRunner;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    const SERVICES_MANIFEST: &str = r#"
services:
  proxy:
    image: traefik
  mysql:
    image: mysql
    profiles: ["db"]
  mailpit:
    image: mailpit
    profiles: ["mail", "db"]
"#;

    fn make_env_dir(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(".env.example"),
            "ANYDEV=true\nANYDEV_TEMPLATE=python\n",
        )
        .unwrap();
        dir
    }

    fn make_context(root: &TempDir, cwd: &Path) -> Context {
        let services_dir = root.path().join("services");
        fs::create_dir_all(&services_dir).unwrap();
        fs::write(services_dir.join("docker-compose.yml"), SERVICES_MANIFEST).unwrap();
        Context {
            config_path: root.path().join("config").join("config.yaml"),
            services_dir,
            cwd: cwd.to_path_buf(),
            json: true,
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn up_registers_environment_and_starts_it() {
        let root = tempdir().unwrap();
        let env_dir = make_env_dir(root.path(), "shop");
        let ctx = make_context(&root, &env_dir);
        let mut store = ConfigStore::load(&ctx.config_path);
        let runner = MockDockerRunner::default();
        runner.push_stdout("[]");

        handle_up(&ctx, &mut store, &runner).unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].args, strings(&["compose", "up", "-d"]));
        assert_eq!(calls[1].cwd, fs::canonicalize(&env_dir).unwrap());
        let reloaded = ConfigStore::load(&ctx.config_path);
        assert_eq!(reloaded.document().projects["shop"].template, "python");
    }

    #[test]
    fn up_passes_only_profiles_the_environment_declares() {
        let root = tempdir().unwrap();
        let env_dir = make_env_dir(root.path(), "shop");
        fs::write(
            env_dir.join("docker-compose.yml"),
            "services:\n  app:\n    image: python\n  cache:\n    image: redis\n    profiles: [cache]\n",
        )
        .unwrap();
        let ctx = make_context(&root, &env_dir);
        let mut store = ConfigStore::load(&ctx.config_path);
        profiles::set_active_profiles(&mut store, &strings(&["cache", "retired"]));
        let runner = MockDockerRunner::default();
        runner.push_stdout("[]");

        handle_up(&ctx, &mut store, &runner).unwrap();

        let calls = runner.calls();
        assert_eq!(
            calls[1].args,
            strings(&["compose", "--profile", "cache", "up", "-d"])
        );
    }

    #[test]
    fn up_outside_environment_fails_before_docker() {
        let root = tempdir().unwrap();
        let plain = root.path().join("plain");
        fs::create_dir_all(&plain).unwrap();
        let ctx = make_context(&root, &plain);
        let mut store = ConfigStore::load(&ctx.config_path);
        let runner = MockDockerRunner::default();

        let err = handle_up(&ctx, &mut store, &runner).expect_err("not an environment");
        assert_eq!(err.exit_code(), 1);
        assert!(runner.calls().is_empty());
        assert!(!ctx.config_path.exists());
    }

    #[test]
    fn down_on_stopped_environment_is_a_no_op() {
        let root = tempdir().unwrap();
        let env_dir = make_env_dir(root.path(), "blog");
        let ctx = make_context(&root, &env_dir);
        let mut store = ConfigStore::load(&ctx.config_path);
        let runner = MockDockerRunner::default();
        runner.push_stdout("[]");

        handle_down(&ctx, &mut store, &runner).unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].args.iter().any(|a| a == "ps"));
    }

    #[test]
    fn services_up_uses_active_profiles() {
        let root = tempdir().unwrap();
        let ctx = make_context(&root, root.path());
        let mut store = ConfigStore::load(&ctx.config_path);
        profiles::set_active_profiles(&mut store, &strings(&["mail", "db"]));
        let runner = MockDockerRunner::default();
        runner.push_stdout("{\"Service\":\"proxy\"}\n");

        handle_services(&ctx, &mut store, ServicesCommand::Up, &runner).unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.cwd == ctx.services_dir));
        assert_eq!(calls[1].args, strings(&["compose", "--profile", "*", "down"]));
        assert_eq!(
            calls[2].args,
            strings(&["compose", "--profile", "db", "--profile", "mail", "up", "-d"])
        );
    }

    #[test]
    fn services_up_after_clearing_profiles_has_no_profile_flags() {
        let root = tempdir().unwrap();
        let ctx = make_context(&root, root.path());
        let mut store = ConfigStore::load(&ctx.config_path);
        profiles::set_active_profiles(&mut store, &strings(&["db"]));
        profiles::set_active_profiles(&mut store, &[]);
        let runner = MockDockerRunner::default();
        runner.push_stdout("[]");

        handle_services(&ctx, &mut store, ServicesCommand::Up, &runner).unwrap();

        let calls = runner.calls();
        assert_eq!(calls[1].args, strings(&["compose", "up", "-d"]));
        assert!(!calls[1].args.iter().any(|a| a == "--profile"));
    }

    #[test]
    fn restart_after_configure_uses_saved_selection() {
        let root = tempdir().unwrap();
        let ctx = make_context(&root, root.path());
        let mut store = ConfigStore::load(&ctx.config_path);
        let runner = MockDockerRunner::default();
        handle_configure(
            &ctx,
            &mut store,
            ConfigureArgs {
                profiles: strings(&["mail"]),
                ..ConfigureArgs::default()
            },
            &runner,
        )
        .unwrap();
        assert!(runner.calls().is_empty());
        runner.push_stdout("[{\"Service\":\"proxy\"},{\"Service\":\"mysql\"}]");

        let profiles = start_services(&ctx, &store, &runner).unwrap();

        assert_eq!(profiles, strings(&["mail"]));
        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].args, strings(&["compose", "--profile", "*", "down"]));
        assert_eq!(calls[2].args, strings(&["compose", "--profile", "mail", "up", "-d"]));
    }

    #[test]
    fn configure_rejects_undeclared_profiles() {
        let root = tempdir().unwrap();
        let ctx = make_context(&root, root.path());
        let mut store = ConfigStore::load(&ctx.config_path);
        let err = handle_configure(
            &ctx,
            &mut store,
            ConfigureArgs {
                profiles: strings(&["db", "gpu"]),
                ..ConfigureArgs::default()
            },
            &MockDockerRunner::default(),
        )
        .expect_err("gpu is not declared");
        assert!(err.to_string().contains("gpu"));
        assert!(!ctx.config_path.exists());
    }

    #[test]
    fn configure_persists_selection_and_paths() {
        let root = tempdir().unwrap();
        let ctx = make_context(&root, root.path());
        let mut store = ConfigStore::load(&ctx.config_path);
        handle_configure(
            &ctx,
            &mut store,
            ConfigureArgs {
                profiles: strings(&["mail"]),
                projects_path: Some("/srv/projects".to_string()),
                organize: Some(true),
                ..ConfigureArgs::default()
            },
            &MockDockerRunner::default(),
        )
        .unwrap();

        let reloaded = ConfigStore::load(&ctx.config_path);
        assert!(reloaded.is_configured());
        let doc = reloaded.document();
        assert_eq!(
            doc.active_profiles.iter().cloned().collect::<Vec<_>>(),
            strings(&["mail"])
        );
        assert_eq!(doc.projects_path, "/srv/projects");
        assert!(doc.organize_projects);

        let mut store = reloaded;
        handle_configure(
            &ctx,
            &mut store,
            ConfigureArgs {
                no_profiles: true,
                projects_path: Some(String::new()),
                ..ConfigureArgs::default()
            },
            &MockDockerRunner::default(),
        )
        .unwrap();
        let doc = ConfigStore::load(&ctx.config_path).document().clone();
        assert!(doc.active_profiles.is_empty());
        assert!(!doc.organize_projects);
    }

    #[test]
    fn forget_removes_registered_environment() {
        let root = tempdir().unwrap();
        let env_dir = make_env_dir(root.path(), "api");
        let ctx = make_context(&root, &env_dir);
        let mut store = ConfigStore::load(&ctx.config_path);
        handle_add(&ctx, &mut store, None).unwrap();
        assert!(store.document().projects.contains_key("api"));

        handle_forget(&ctx, &mut store, "api").unwrap();
        handle_forget(&ctx, &mut store, "api").unwrap();
        assert!(ConfigStore::load(&ctx.config_path)
            .document()
            .projects
            .is_empty());
    }
    #[test]
    fn list_drops_environments_that_lost_their_marker() {
        let root = tempdir().unwrap();
        let env_dir = make_env_dir(root.path(), "old");
        let ctx = make_context(&root, &env_dir);
        let mut store = ConfigStore::load(&ctx.config_path);
        handle_add(&ctx, &mut store, None).unwrap();
        fs::write(env_dir.join(".env.example"), "ANYDEV=false\nANYDEV_TEMPLATE=python\n").unwrap();

        handle_list(&ctx, &mut store).unwrap();

        assert!(store.document().projects.is_empty());
        assert!(ConfigStore::load(&ctx.config_path)
            .document()
            .projects
            .is_empty());
    }

    #[test]
    fn doctor_reports_configuration_and_manifest() {
        let root = tempdir().unwrap();
        let ctx = make_context(&root, root.path());
        let store = ConfigStore::load(&ctx.config_path);
        let runner = MockDockerRunner::default();

        let checks = collect_doctor_checks(&ctx, &store, &runner);
        let by_id = |id: &str| checks.iter().find(|c| c.id == id).cloned().unwrap();
        assert!(!by_id("config").ok);
        assert!(by_id("config").remediation.is_some());
        assert!(by_id("services_manifest").ok);
        assert!(by_id("services_manifest").remediation.is_none());
    }
}
