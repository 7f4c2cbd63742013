use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wikideploy_core::api::{MediaWikiConnector, fetch_wiki_index};
use wikideploy_core::config::{
    BotCredentials, DEFAULT_CONFIG_FILENAME, DeployConfig, DeployTrigger, load_config,
};
use wikideploy_core::deploy::{
    DeployNotice, DeployableItem, ItemOutcome, deploy_items, deploy_resources,
};
use wikideploy_core::protect::{
    ModuleSource, ProtectionBatch, ProtectionPolicy, plan_module_targets, plan_template_targets,
    reconcile_all,
};
use wikideploy_core::rate_limit::{FixedDelay, NoDelay, RateLimiter};
use wikideploy_core::remove::{RemovalFilter, RemovalOutcome, remove_dev_copies, sweep_targets};
use wikideploy_core::report::RunReport;
use wikideploy_core::session::SessionRegistry;
use wikideploy_core::sources::{
    TEMPLATE_LIST, discover_modules, discover_resources, has_local_version, parse_module_path,
    read_module, read_resource, read_template_list,
};
use wikideploy_core::wiki::WikiId;

const RESYNC_REASON: &str = "Automated Weekly Re-Sync";

#[derive(Debug, Parser)]
#[command(
    name = "wikideploy",
    version,
    about = "Deploy git-maintained Lua modules and site resources to a MediaWiki farm"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", default_value = ".")]
    project_root: PathBuf,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print the run summary as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Deploy Lua modules; all of lua/wikis when no files are given")]
    Deploy(DeployArgs),
    #[command(
        name = "deploy-resources",
        about = "Deploy scripts and stylesheets to commons"
    )]
    DeployResources(ResourceArgs),
    #[command(about = "Protect deployed modules and shadow commons modules")]
    Protect(ProtectArgs),
    #[command(
        name = "protect-templates",
        about = "Protect the listed templates on one wiki"
    )]
    ProtectTemplates(TemplateArgs),
    #[command(
        name = "remove-dev",
        about = "Delete preview copies of a dev environment"
    )]
    RemoveDev(RemoveDevArgs),
}

#[derive(Debug, Args)]
struct DeployArgs {
    files: Vec<PathBuf>,
    #[arg(
        long,
        help = "Deploy every file to this wiki instead of the one in its path"
    )]
    wiki: Option<String>,
    #[arg(long, help = "Edit summary reason (defaults to the last commit)")]
    reason: Option<String>,
}

#[derive(Debug, Args)]
struct ResourceArgs {
    files: Vec<PathBuf>,
    #[arg(long, help = "Edit summary reason (defaults to the last commit)")]
    reason: Option<String>,
    #[arg(
        long,
        help = "Resource cache version (defaults to the last commit hash)"
    )]
    cache_version: Option<String>,
}

#[derive(Debug, Args)]
struct ProtectArgs {
    files: Vec<PathBuf>,
    #[arg(long, help = "Only protect on this wiki (env WIKI_TO_PROTECT)")]
    wiki: Option<String>,
}

#[derive(Debug, Args)]
struct TemplateArgs {
    #[arg(long, help = "Wiki to protect on (env WIKI_TO_PROTECT)")]
    wiki: Option<String>,
    #[arg(long, value_name = "PATH", help = "Template list, one name per line")]
    list: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RemoveDevArgs {
    #[arg(long, help = "Environment marker (defaults to LUA_DEV_ENV_NAME)")]
    marker: Option<String>,
    #[arg(long, help = "Also delete sub-environment copies")]
    include_sub_envs: bool,
    #[arg(
        long = "wiki",
        value_name = "WIKI",
        help = "Limit the sweep to these wikis"
    )]
    wikis: Vec<String>,
    #[arg(long, help = "Include commons when sweeping the whole farm")]
    include_commons: bool,
}

struct RunContext {
    project_root: PathBuf,
    config: DeployConfig,
    json: bool,
    trigger: DeployTrigger,
}

impl RunContext {
    fn registry(&self) -> Result<SessionRegistry<MediaWikiConnector>> {
        let connector = MediaWikiConnector::from_config(&self.config)?;
        let credentials = BotCredentials::from_env()?;
        let delay = self.config.rate_limit();
        let limiter: Arc<dyn RateLimiter> = if delay.is_zero() {
            Arc::new(NoDelay)
        } else {
            Arc::new(FixedDelay::new(delay))
        };
        Ok(SessionRegistry::new(connector, credentials, limiter))
    }

    fn open_report(&self) -> Result<RunReport> {
        match env::var_os("GITHUB_STEP_SUMMARY").filter(|value| !value.is_empty()) {
            Some(path) => RunReport::with_summary_file(Path::new(&path)),
            None => Ok(RunReport::new()),
        }
    }

    fn finish(&self, report: &RunReport) -> Result<ExitCode> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report.summary())?);
        }
        Ok(if report.all_succeeded() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_tracing();

    let Some(command) = cli.command else {
        let mut command = Cli::command();
        command.print_help()?;
        println!();
        return Ok(ExitCode::SUCCESS);
    };

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.project_root.join(DEFAULT_CONFIG_FILENAME));
    let context = RunContext {
        config: load_config(&config_path)?,
        project_root: cli.project_root,
        json: cli.json,
        trigger: DeployTrigger::from_env(),
    };

    match command {
        Commands::Deploy(args) => run_deploy(&context, args),
        Commands::DeployResources(args) => run_deploy_resources(&context, args),
        Commands::Protect(args) => run_protect(&context, args),
        Commands::ProtectTemplates(args) => run_protect_templates(&context, args),
        Commands::RemoveDev(args) => run_remove_dev(&context, args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_deploy(context: &RunContext, args: DeployArgs) -> Result<ExitCode> {
    let explicit = !args.files.is_empty();
    let files = if explicit {
        args.files
    } else {
        discover_modules(&context.project_root)?
    };
    let reason = resolve_reason(args.reason, explicit)?;
    let wiki_override = args.wiki.as_deref().map(WikiId::parse).transpose()?;
    let suffix = context.config.dev_env_name();

    let mut batches: BTreeMap<WikiId, Vec<DeployableItem>> = BTreeMap::new();
    for path in &files {
        let Some(wiki) = wiki_override
            .clone()
            .or_else(|| parse_module_path(path).map(|source| source.wiki))
        else {
            bail!(
                "cannot tell the target wiki of {} (expected lua/wikis/<wiki>/...; use --wiki)",
                normalize_path(path)
            );
        };
        let item = read_module(&context.project_root, path, suffix.as_deref())?;
        batches.entry(wiki).or_default().push(item);
    }

    let registry = context.registry()?;
    let mut report = context.open_report()?;
    for (wiki, items) in &batches {
        info!(wiki = %wiki, files = items.len(), "deploying modules");
        let outcomes = deploy_items(&registry, wiki, items, &reason, &mut report);
        print_deploy_outcomes(&outcomes, context.trigger);
    }
    info!(requests = registry.request_count(), "deploy finished");

    if !report.all_succeeded() {
        println!("::warning::Some modules were not deployed!");
    }
    context.finish(&report)
}

fn run_deploy_resources(context: &RunContext, args: ResourceArgs) -> Result<ExitCode> {
    let explicit = !args.files.is_empty();
    let files = if explicit {
        args.files
    } else {
        discover_resources(&context.project_root)?
    };
    let reason = resolve_reason(args.reason, explicit)?;
    let cache_version = match args.cache_version {
        Some(version) => Some(version),
        None => match git_output(&["log", "-1", "--pretty=%h"]) {
            Ok(version) => Some(version),
            Err(error) => {
                warn!(error = %format!("{error:#}"), "no cache version available");
                None
            }
        },
    };
    let items = files
        .iter()
        .map(|path| read_resource(&context.project_root, path))
        .collect::<Result<Vec<_>>>()?;

    let registry = context.registry()?;
    let mut report = context.open_report()?;
    let outcome = deploy_resources(
        &registry,
        &items,
        &reason,
        cache_version.as_deref(),
        &mut report,
    );
    print_deploy_outcomes(&outcome.items, context.trigger);

    match outcome.cache_updated {
        Some(true) => println!("Resource cache version updated successfully!"),
        Some(false) => println!("::error::Resource cache version unable to be updated!"),
        None if !report.all_succeeded() => {
            println!("::error::Some files were not deployed; resource cache version not updated!")
        }
        None => {}
    }
    context.finish(&report)
}

fn run_protect(context: &RunContext, args: ProtectArgs) -> Result<ExitCode> {
    let wiki_to_protect = args
        .wiki
        .or_else(|| env_value("WIKI_TO_PROTECT"))
        .as_deref()
        .map(WikiId::parse)
        .transpose()?;
    let files = if !args.files.is_empty() {
        args.files
    } else if wiki_to_protect.is_some() {
        discover_modules(&context.project_root)?
    } else {
        println!("Nothing to protect");
        return Ok(ExitCode::SUCCESS);
    };

    let mut sources: Vec<ModuleSource> = Vec::with_capacity(files.len());
    for path in &files {
        match parse_module_path(path) {
            Some(source) => sources.push(source),
            None => warn!(path = %normalize_path(path), "not a module path, skipping"),
        }
    }
    let needs_farm = wiki_to_protect.is_none() && sources.iter().any(|s| s.wiki.is_commons());
    let all_wikis = if needs_farm {
        fetch_wiki_index(&context.config)?
    } else {
        Vec::new()
    };
    let targets = plan_module_targets(
        &sources,
        wiki_to_protect.as_ref(),
        &all_wikis,
        |wiki, module| has_local_version(&context.project_root, wiki, module),
    );

    let registry = context.registry()?;
    let mut report = context.open_report()?;
    let policy = ProtectionPolicy::from_config(&context.config);
    let batch = reconcile_all(&registry, &targets, &policy, &mut report);
    print_protection_failures(&batch);
    context.finish(&report)
}

fn run_protect_templates(context: &RunContext, args: TemplateArgs) -> Result<ExitCode> {
    let Some(wiki) = args.wiki.or_else(|| env_value("WIKI_TO_PROTECT")) else {
        bail!("protect-templates requires --wiki or WIKI_TO_PROTECT");
    };
    let wiki = WikiId::parse(&wiki)?;
    let list = args
        .list
        .unwrap_or_else(|| context.project_root.join(TEMPLATE_LIST));
    let names = read_template_list(&list)?;
    let targets = plan_template_targets(&wiki, names.iter().map(String::as_str));

    let registry = context.registry()?;
    let mut report = context.open_report()?;
    let policy = ProtectionPolicy::from_config(&context.config);
    let batch = reconcile_all(&registry, &targets, &policy, &mut report);
    print_protection_failures(&batch);
    context.finish(&report)
}

fn run_remove_dev(context: &RunContext, args: RemoveDevArgs) -> Result<ExitCode> {
    let Some(marker) = args.marker.or_else(|| context.config.dev_env_name()) else {
        bail!("remove-dev requires --marker or LUA_DEV_ENV_NAME");
    };
    let explicit = args
        .wikis
        .iter()
        .map(|wiki| WikiId::parse(wiki))
        .collect::<Result<Vec<_>>>()?;
    let farm = if explicit.is_empty() {
        fetch_wiki_index(&context.config)?
    } else {
        Vec::new()
    };
    let wikis = sweep_targets(&explicit, &farm, args.include_commons);
    let filter = RemovalFilter::from_flags(args.include_sub_envs);

    let registry = context.registry()?;
    let mut report = context.open_report()?;
    for wiki in &wikis {
        info!(wiki = %wiki, marker = %marker, "sweeping dev copies");
        let records = remove_dev_copies(&registry, wiki, &marker, filter, &mut report)?;
        for record in records
            .iter()
            .filter(|record| matches!(record.outcome, RemovalOutcome::Failed(_)))
        {
            println!(
                "::warning::could not delete {} on {}",
                record.title, record.wiki
            );
        }
    }
    context.finish(&report)
}

fn print_deploy_outcomes(outcomes: &[ItemOutcome], trigger: DeployTrigger) {
    for outcome in outcomes {
        let path = normalize_path(&outcome.source_path);
        println!("::group::Checking {path}");
        match &outcome.page {
            Some(page) => println!("...page = {page}"),
            None => println!("...skipping - no magic comment found"),
        }
        if let Some(line) = outcome
            .notice
            .as_ref()
            .map(|notice| notice_line(notice, &path, trigger))
        {
            println!("{line}");
        }
        println!("::endgroup::");
    }
}

fn notice_line(notice: &DeployNotice, path: &str, trigger: DeployTrigger) -> String {
    match (notice, trigger) {
        (DeployNotice::Changed, DeployTrigger::Push) => {
            format!("::notice file={path}::File changed")
        }
        (DeployNotice::Changed, DeployTrigger::Other) => {
            format!("::warning file={path}::File changed")
        }
        (DeployNotice::Failed, _) => format!("::warning file={path}::failed to deploy"),
    }
}

fn print_protection_failures(batch: &ProtectionBatch) {
    if batch.all_applied() {
        return;
    }
    println!("::warning::Some pages could not be protected");
    println!("::group::Failed protections");
    for record in batch.failures() {
        println!("... {}", record.target);
    }
    println!("::endgroup::");
}

fn resolve_reason(reason: Option<String>, explicit_files: bool) -> Result<String> {
    if let Some(reason) = reason.map(|reason| reason.trim().to_string())
        && !reason.is_empty()
    {
        return Ok(reason);
    }
    if explicit_files {
        git_output(&["log", "-1", "--pretty=%h %s"])
    } else {
        Ok(RESYNC_REASON.to_string())
    }
}

fn git_output(args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .context("failed to run git")?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
