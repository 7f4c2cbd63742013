//! Locating deployable files in the repository checkout.
//!
//! Modules live at `lua/wikis/<wiki>/<module path>.lua`; site resources live below `javascript/`
//! and `stylesheets/`.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::deploy::DeployableItem;
use crate::protect::ModuleSource;
use crate::wiki::WikiId;

pub const MODULE_ROOT: &str = "lua/wikis";
pub const SCRIPT_ROOT: &str = "javascript";
pub const STYLESHEET_ROOT: &str = "stylesheets";
pub const TEMPLATE_LIST: &str = "templates/templatesToProtect";

/// Split a module path into its wiki and module name. Anything outside `lua/wikis/<wiki>/` or
/// not ending in `.lua` yields `None`.
pub fn parse_module_path(path: &Path) -> Option<ModuleSource> {
    let parts = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>();
    let start = parts
        .windows(2)
        .position(|pair| pair[0] == "lua" && pair[1] == "wikis")?;
    let rest = &parts[start + 2..];
    if rest.len() < 2 {
        return None;
    }
    let wiki = WikiId::parse(rest[0]).ok()?;
    let module = rest[1..].join("/");
    let module = module.strip_suffix(".lua")?;
    if module.is_empty() {
        return None;
    }
    Some(ModuleSource {
        wiki,
        module: module.to_string(),
    })
}

/// Every module file below `project_root`, sorted by path.
pub fn discover_modules(project_root: &Path) -> Result<Vec<PathBuf>> {
    collect_files(&project_root.join(MODULE_ROOT), project_root, &["lua"])
}

/// Every deployable script and stylesheet below `project_root`, sorted by path.
pub fn discover_resources(project_root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = collect_files(&project_root.join(SCRIPT_ROOT), project_root, &["js"])?;
    files.extend(collect_files(
        &project_root.join(STYLESHEET_ROOT),
        project_root,
        &["scss", "css"],
    )?);
    files.sort();
    Ok(files)
}

fn collect_files(base: &Path, project_root: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(base).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", base.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|item| item.to_str())
            .unwrap_or("");
        if !extensions.contains(&ext) {
            continue;
        }
        let relative = path.strip_prefix(project_root).unwrap_or(path);
        files.push(relative.to_path_buf());
    }
    files.sort();
    Ok(files)
}

/// Whether `wiki` carries its own copy of `module`. Commons is never considered an override.
pub fn has_local_version(project_root: &Path, wiki: &WikiId, module: &str) -> bool {
    if wiki.is_commons() {
        return false;
    }
    project_root
        .join(MODULE_ROOT)
        .join(wiki.as_str())
        .join(format!("{module}.lua"))
        .is_file()
}

pub fn read_module(
    project_root: &Path,
    path: &Path,
    page_suffix: Option<&str>,
) -> Result<DeployableItem> {
    let content = read_source(project_root, path)?;
    Ok(DeployableItem::module(path, content, page_suffix))
}

pub fn read_resource(project_root: &Path, path: &Path) -> Result<DeployableItem> {
    let content = read_source(project_root, path)?;
    Ok(DeployableItem::resource(path, content))
}

fn read_source(project_root: &Path, path: &Path) -> Result<String> {
    let full = if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    };
    fs::read_to_string(&full).with_context(|| format!("failed to read {}", full.display()))
}

/// Template names to protect, one per line.
pub fn read_template_list(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read template list {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect())
}
