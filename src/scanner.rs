use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::generator::Generator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanGlobOptions {
    pub base_path: PathBuf,
    pub respect_gitignore: bool,
    pub include_node_modules: bool,
    pub include_binary_files: bool,
    pub include_css_files: bool,
    pub include_lock_files: bool,
}

impl Default for ScanGlobOptions {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            respect_gitignore: true,
            include_node_modules: false,
            include_binary_files: false,
            include_css_files: false,
            include_lock_files: false,
        }
    }
}

/// Tokens found in a set of files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub tokens: BTreeSet<String>,
    pub files_scanned: usize,
}

/// Walks `options.base_path` and returns files matching `patterns` and none
/// of `ignore_patterns`, in walk order.
pub fn collect_files(
    patterns: &[String],
    ignore_patterns: &[String],
    options: &ScanGlobOptions,
) -> Result<Vec<PathBuf>> {
    if patterns.is_empty() {
        return Err(Error::Scan(
            "at least one glob pattern is required".to_string(),
        ));
    }

    let globset = build_globset(patterns)?;
    let ignore_set = build_globset(ignore_patterns)?;
    let mut paths = Vec::new();
    let mut seen = HashSet::new();

    let roots = walk_roots(patterns, &options.base_path);
    let mut builder = WalkBuilder::new(&roots[0]);
    for root in &roots[1..] {
        builder.add(root);
    }
    builder
        .hidden(false)
        .git_ignore(options.respect_gitignore)
        .git_global(options.respect_gitignore)
        .git_exclude(options.respect_gitignore);

    for entry in builder.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        let relative_path = path.strip_prefix(&options.base_path).unwrap_or(path);
        if !globset.is_match(relative_path) && !globset.is_match(path) {
            continue;
        }
        if ignore_set.is_match(relative_path) || ignore_set.is_match(path) {
            continue;
        }
        if should_skip_file(path, options) {
            trace!(path = %path.display(), "filtered out");
            continue;
        }
        if seen.insert(path.to_path_buf()) {
            paths.push(path.to_path_buf());
        }
    }

    debug!(files = paths.len(), "collected source files");
    Ok(paths)
}

/// Runs every file through the generator's extractors, with the path as
/// the source id. Files that are not UTF-8 text are skipped.
pub async fn scan_files(generator: &Generator, paths: &[PathBuf]) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    for path in paths {
        let code = match fs::read_to_string(path) {
            Ok(code) => code,
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                debug!(path = %path.display(), "skipping non-text file");
                continue;
            }
            Err(err) => return Err(Error::io(path, err)),
        };
        let id = path.to_string_lossy();
        let tokens = std::mem::take(&mut result.tokens);
        result.tokens = generator
            .apply_extractors(&code, Some(id.as_ref()), Some(tokens))
            .await?;
        result.files_scanned += 1;
    }
    Ok(result)
}

fn walk_roots(patterns: &[String], base: &Path) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    for pattern in patterns {
        let root = glob_root(pattern);
        let root = if root.is_absolute() {
            root
        } else {
            base.to_path_buf()
        };
        if !roots.contains(&root) {
            roots.push(root);
        }
    }
    roots
}

/// The literal directory prefix of a glob.
pub fn glob_root(pattern: &str) -> PathBuf {
    let Some(first_meta) = pattern.find(['*', '?', '[', '{']) else {
        if pattern.ends_with(['/', '\\']) {
            return PathBuf::from(pattern);
        }
        let path = Path::new(pattern);
        if path.extension().is_some() {
            return path.parent().unwrap_or(Path::new(".")).to_path_buf();
        }
        return path.to_path_buf();
    };

    let prefix = &pattern[..first_meta];
    match prefix.rfind(['/', '\\']) {
        Some(idx) => PathBuf::from(&prefix[..=idx]),
        None => PathBuf::from("."),
    }
}

pub fn should_skip_file(path: &Path, options: &ScanGlobOptions) -> bool {
    if !options.include_node_modules
        && path
            .components()
            .any(|component| component.as_os_str() == "node_modules")
    {
        return true;
    }

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("");
    if !options.include_lock_files && is_lock_file(file_name) {
        return true;
    }

    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase());
    if let Some(ext) = ext.as_deref() {
        if !options.include_css_files && is_css_extension(ext) {
            return true;
        }
        if !options.include_binary_files && is_binary_extension(ext) {
            return true;
        }
    }

    false
}

fn is_css_extension(ext: &str) -> bool {
    matches!(ext, "css" | "scss" | "sass" | "less" | "styl" | "pcss")
}

fn is_binary_extension(ext: &str) -> bool {
    matches!(
        ext,
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "ico" | "avif" | "mp4" | "webm" | "mp3"
            | "wav" | "zip" | "gz" | "pdf" | "woff" | "woff2" | "ttf" | "otf"
    )
}

fn is_lock_file(file_name: &str) -> bool {
    file_name.ends_with(".lock")
        || file_name.ends_with(".lockb")
        || matches!(
            file_name,
            "package-lock.json" | "pnpm-lock.yaml" | "npm-shrinkwrap.json"
        )
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|err| Error::Scan(format!("invalid glob pattern '{}': {}", pattern, err)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|err| Error::Scan(format!("failed to build glob set: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::{ScanGlobOptions, collect_files, glob_root, scan_files, should_skip_file};
    use crate::error::Error;
    use crate::extractor::SourceExtractor;
    use crate::generator::Generator;
    use crate::resolve::{Preset, UserConfig};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    fn options(base: &Path) -> ScanGlobOptions {
        ScanGlobOptions {
            base_path: base.to_path_buf(),
            ..ScanGlobOptions::default()
        }
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        let mut names = paths
            .iter()
            .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn collects_matching_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("nested")).expect("mkdir");
        fs::write(dir.path().join("nested/example.html"), "<div></div>").expect("write");
        fs::write(dir.path().join("notes.md"), "# notes").expect("write");

        let files = collect_files(&["**/*.html".to_string()], &[], &options(dir.path()))
            .expect("collect");
        assert_eq!(names(&files), vec!["example.html"]);
    }

    #[test]
    fn default_filters_drop_css_binary_lock_and_node_modules() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        fs::create_dir_all(base.join("src")).expect("mkdir");
        fs::create_dir_all(base.join("node_modules/lib")).expect("mkdir");
        fs::write(base.join("src/index.html"), "<div></div>").expect("write");
        fs::write(base.join("src/styles.css"), ".x{}").expect("write");
        fs::write(base.join("src/logo.png"), "png").expect("write");
        fs::write(base.join("yarn.lock"), "").expect("write");
        fs::write(base.join("node_modules/lib/index.html"), "<b></b>").expect("write");

        let files = collect_files(&["**/*".to_string()], &[], &options(base)).expect("collect");
        assert_eq!(names(&files), vec!["index.html"]);
    }

    #[test]
    fn honours_ignore_globs_and_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        fs::create_dir_all(base.join("vendor")).expect("mkdir");
        fs::create_dir_all(base.join("node_modules/lib")).expect("mkdir");
        fs::write(base.join("vendor/a.html"), "").expect("write");
        fs::write(base.join("node_modules/lib/b.html"), "").expect("write");
        fs::write(base.join("c.html"), "").expect("write");

        let ignored = collect_files(
            &["**/*.html".to_string()],
            &["vendor/**".to_string()],
            &options(base),
        )
        .expect("collect");
        assert_eq!(names(&ignored), vec!["c.html"]);

        let everything = collect_files(
            &["**/*.html".to_string()],
            &[],
            &ScanGlobOptions {
                include_node_modules: true,
                ..options(base)
            },
        )
        .expect("collect");
        assert_eq!(names(&everything), vec!["a.html", "b.html", "c.html"]);
    }

    #[test]
    fn rejects_empty_and_invalid_patterns() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            collect_files(&[], &[], &options(dir.path())),
            Err(Error::Scan(_))
        ));
        assert!(matches!(
            collect_files(&["a/[".to_string()], &[], &options(dir.path())),
            Err(Error::Scan(_))
        ));
    }

    #[test]
    fn walks_absolute_pattern_roots() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("page.html"), "").expect("write");
        let pattern = format!("{}/*.html", dir.path().display());
        let elsewhere = tempfile::tempdir().expect("tempdir");

        let files = collect_files(&[pattern], &[], &options(elsewhere.path())).expect("collect");
        assert_eq!(names(&files), vec!["page.html"]);
        assert_eq!(glob_root("src/**/*.html"), PathBuf::from("src/"));
        assert_eq!(glob_root("**/*.rs"), PathBuf::from("."));
        assert_eq!(glob_root("/srv/app/*.html"), PathBuf::from("/srv/app/"));
        assert_eq!(glob_root("pages/index.html"), PathBuf::from("pages"));
    }

    #[test]
    fn skips_by_name_and_extension() {
        let options = ScanGlobOptions::default();
        assert!(should_skip_file(Path::new("Cargo.lock"), &options));
        assert!(should_skip_file(Path::new("a/node_modules/x.js"), &options));
        assert!(should_skip_file(Path::new("font.WOFF2"), &options));
        assert!(!should_skip_file(Path::new("src/app.tsx"), &options));
        assert!(!should_skip_file(
            Path::new("theme.css"),
            &ScanGlobOptions {
                include_css_files: true,
                ..ScanGlobOptions::default()
            }
        ));
    }

    #[tokio::test]
    async fn extracts_tokens_per_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let html = dir.path().join("index.html");
        let script = dir.path().join("app.ts");
        fs::write(&html, r#"<div class="p-2 hover:text-sm"></div>"#).expect("write");
        fs::write(&script, r#"const cls = clsx("flex", { "m-1": active });"#).expect("write");

        let generator = Generator::new(UserConfig::new(
            Preset::new("scan").extractor(Arc::new(SourceExtractor)),
        ));
        let result = scan_files(&generator, &[html, script]).await.expect("scan");
        assert_eq!(result.files_scanned, 2);
        for token in ["p-2", "hover:text-sm", "flex", "m-1"] {
            assert!(result.tokens.contains(token), "missing {}", token);
        }
        assert!(!result.tokens.contains("cls"));
    }
}
