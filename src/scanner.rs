use anyhow::{Context, Result};
use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

fn default_overrides(repo_root: &Path, opts: &ScanOptions) -> Result<Override> {
    let mut ob = OverrideBuilder::new(repo_root);

    // Common high-noise artifacts. Override globs follow ripgrep `-g`
    // semantics: a leading `!` excludes.
    // Note: For directories, include patterns for both the directory entry and its descendants,
    // otherwise walkers may still descend into the directory.

    // Lockfiles
    ob.add("!**/*.lock")?;
    ob.add("!**/package-lock.json")?;
    ob.add("!**/pnpm-lock.yaml")?;
    ob.add("!**/yarn.lock")?;

    // Sourcemaps + images/icons
    ob.add("!**/*.map")?;
    ob.add("!**/*.svg")?;
    ob.add("!**/*.png")?;
    ob.add("!**/*.ico")?;
    ob.add("!**/*.jpg")?;
    ob.add("!**/*.jpeg")?;
    ob.add("!**/*.gif")?;

    // Common build outputs / heavy dirs
    for d in [
        ".git",
        "node_modules",
        "target",
        "dist",
        "build",
        "coverage",
        ".next",
        ".nuxt",
        ".vscode-test",
        ".vscode",
        "out",
        ".symledger",
    ] {
        ob.add(&format!("!**/{d}"))?;
        ob.add(&format!("!**/{d}/**"))?;
    }

    // Config-excluded directory names
    for d in &opts.exclude_dir_names {
        let d = d.trim().trim_matches('/');
        if d.is_empty() {
            continue;
        }
        ob.add(&format!("!**/{d}"))?;
        ob.add(&format!("!**/{d}/**"))?;
    }

    // Repo-registered ignore globs (repo.register `ignore` parameter).
    for g in &opts.ignore_globs {
        let g = g.trim();
        if g.is_empty() {
            continue;
        }
        // Registered globs always exclude; a whitelist glob would flip the
        // override set into only-matching mode and drop everything else.
        let g = g.trim_start_matches('!');
        ob.add(&format!("!{g}"))?;
    }

    Ok(ob.build()?)
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub abs_path: PathBuf,
    pub rel_path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub repo_root: PathBuf,
    pub max_file_bytes: u64,
    pub exclude_dir_names: Vec<String>,
    pub ignore_globs: Vec<String>,
}

pub fn scan_workspace(opts: &ScanOptions) -> Result<Vec<FileEntry>> {
    let meta = std::fs::metadata(&opts.repo_root)
        .with_context(|| format!("Repo root does not exist: {}", opts.repo_root.display()))?;
    if !meta.is_dir() {
        anyhow::bail!("Repo root is not a directory: {}", opts.repo_root.display());
    }

    let mut entries = Vec::new();
    let overrides = default_overrides(&opts.repo_root, opts)?;
    let walker = WalkBuilder::new(&opts.repo_root)
        .standard_filters(true) // .gitignore, .ignore, hidden, etc.
        .overrides(overrides)
        .build();

    for item in walker {
        let dent = match item {
            Ok(d) => d,
            Err(_) => continue,
        };

        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }

        let abs_path = dent.into_path();
        // Overrides already handle excluded/junk patterns.

        let bytes = match std::fs::metadata(&abs_path).map(|m| m.len()) {
            Ok(b) => b,
            Err(_) => continue,
        };

        if bytes == 0 || bytes > opts.max_file_bytes {
            continue;
        }

        let rel_path = path_relative_to(&abs_path, &opts.repo_root)
            .with_context(|| format!("Failed to relativize path: {}", abs_path.display()))?;

        entries.push(FileEntry { abs_path, rel_path, bytes });
    }

    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(entries)
}

fn path_relative_to(path: &Path, base: &Path) -> Result<PathBuf> {
    let rel = path
        .strip_prefix(base)
        .with_context(|| format!("{} is not under {}", path.display(), base.display()))?;
    Ok(rel.to_path_buf())
}
