pub mod bracket;
pub mod cache;
pub mod color;
pub mod config;
pub mod error;
pub mod extractor;
pub mod generator;
pub mod layer;
pub mod preprocess;
pub mod resolve;
pub mod rule;
pub mod scanner;
pub mod shortcut;
pub mod sort;
pub mod stringify;
pub mod theme;
pub mod types;
pub mod variant;

pub use error::{Error, Result};
pub use extractor::{Extraction, ExtractSource, Extractor, SourceExtractor, SplitExtractor};
pub use generator::{GenerateInput, GenerateOptions, Generator};
pub use layer::GenerateResult;
pub use preprocess::{Blocked, BlocklistEntry};
pub use resolve::{Preflight, Preset, ResolvedConfig, UserConfig};
pub use rule::{Rule, RuleContext, RuleMatch};
pub use shortcut::{Shortcut, ShortcutValue};
pub use theme::Theme;
pub use types::{CompiledUtil, CssBlock, CssValue, MatchContext};
pub use variant::{Relation, Variant};

use clap::{Args, Parser, Subcommand};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::scanner::{ScanGlobOptions, collect_files, glob_root, scan_files};

#[derive(Debug, Parser)]
#[command(name = "atomframe", version, about = "Generate atomic CSS from the tokens in your sources")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Print the tokens found in the matching files.
    Scan {
        #[arg(required = true)]
        inputs: Vec<String>,
        #[arg(long)]
        ignore: Vec<String>,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate CSS for the matching files.
    Build(BuildArgs),
    /// Build, then rebuild whenever a source or the config changes.
    Watch {
        #[command(flatten)]
        build: BuildArgs,
        /// Poll the filesystem instead of using native events.
        #[arg(long)]
        poll: bool,
        #[arg(long = "poll-interval", default_value_t = 500)]
        poll_interval_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct BuildArgs {
    #[arg(required = true)]
    pub inputs: Vec<String>,
    /// Output file; stdout when omitted.
    #[arg(short, long)]
    pub out: Option<PathBuf>,
    #[arg(long)]
    pub minify: bool,
    /// Config file; `atomframe.toml` is used when present.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub ignore: Vec<String>,
    #[arg(long)]
    pub no_preflights: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliError {
    pub message: String,
}

impl From<Error> for CliError {
    fn from(err: Error) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

pub fn run(command: Command) -> Result<(), CliError> {
    match command {
        Command::Scan {
            inputs,
            ignore,
            config,
        } => run_scan(inputs, ignore, config),
        Command::Build(args) => {
            let runtime = runtime()?;
            let generator = Generator::new(load_config(args.config.as_deref())?);
            let summary = runtime.block_on(build_once(&generator, &args))?;
            summary.report();
            Ok(())
        }
        Command::Watch {
            build,
            poll,
            poll_interval_ms,
        } => run_watch(build, poll, poll_interval_ms),
    }
}

pub fn run_from_env() -> Result<(), CliError> {
    run(Cli::parse().command)
}

pub fn parse_args<I>(args: I) -> Result<Command, CliError>
where
    I: IntoIterator<Item = String>,
{
    let argv = std::iter::once("atomframe".to_string()).chain(args);
    Cli::try_parse_from(argv)
        .map(|cli| cli.command)
        .map_err(|err| CliError {
            message: err.to_string(),
        })
}

fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError {
            message: format!("failed to start runtime: {}", err),
        })
}

fn load_config(path: Option<&Path>) -> Result<UserConfig> {
    let default_path = Path::new(config::DEFAULT_CONFIG_FILE);
    let config = match path {
        Some(path) => config::load(path)?,
        None if default_path.is_file() => config::load(default_path)?,
        None => {
            warn!("no config file found; no rules are defined");
            UserConfig::default()
        }
    };
    Ok(config.with_preset(Preset::new("cli").extractor(Arc::new(SourceExtractor))))
}

fn config_path(path: Option<&Path>) -> Option<PathBuf> {
    match path {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default_path = PathBuf::from(config::DEFAULT_CONFIG_FILE);
            default_path.is_file().then_some(default_path)
        }
    }
}

fn run_scan(
    inputs: Vec<String>,
    ignore: Vec<String>,
    config: Option<PathBuf>,
) -> Result<(), CliError> {
    let runtime = runtime()?;
    let generator = Generator::new(load_config(config.as_deref())?);
    let files = collect_files(&inputs, &ignore, &ScanGlobOptions::default())?;
    let result = runtime.block_on(scan_files(&generator, &files))?;

    for token in &result.tokens {
        println!("{}", token);
    }
    eprintln!(
        "scanned {} files, found {} tokens",
        result.files_scanned,
        result.tokens.len()
    );
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BuildSummary {
    files_scanned: usize,
    tokens: usize,
    matched: usize,
    blocked: Vec<String>,
    out: Option<PathBuf>,
}

impl BuildSummary {
    fn report(&self) {
        for message in &self.blocked {
            eprintln!("blocked: {}", message);
        }
        let target = self
            .out
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "stdout".to_string());
        eprintln!(
            "scanned {} files, matched {} of {} tokens, wrote {}",
            self.files_scanned, self.matched, self.tokens, target
        );
    }
}

async fn build_once(generator: &Generator, args: &BuildArgs) -> Result<BuildSummary> {
    let files = collect_files(&args.inputs, &args.ignore, &ScanGlobOptions::default())?;
    let scanned = scan_files(generator, &files).await?;
    let token_count = scanned.tokens.len();
    let options = GenerateOptions {
        minify: args.minify,
        preflights: !args.no_preflights,
        ..GenerateOptions::default()
    };
    let result = generator.generate(scanned.tokens, &options).await?;

    let mut css = result.css().to_string();
    if !css.is_empty() && !args.minify {
        css.push('\n');
    }
    match &args.out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
            }
            fs::write(path, css).map_err(|err| Error::io(path, err))?;
        }
        None => print!("{}", css),
    }

    Ok(BuildSummary {
        files_scanned: scanned.files_scanned,
        tokens: token_count,
        matched: result.matched.len(),
        blocked: result
            .blocked
            .iter()
            .map(|blocked| match &blocked.message {
                Some(message) => format!("{} ({})", blocked.token, message),
                None => blocked.token.clone(),
            })
            .collect(),
        out: args.out.clone(),
    })
}

fn run_watch(args: BuildArgs, poll: bool, poll_interval_ms: u64) -> Result<(), CliError> {
    let runtime = runtime()?;
    let generator = Generator::new(load_config(args.config.as_deref())?);
    runtime.block_on(build_once(&generator, &args))?.report();

    let (tx, rx) = channel();
    let ignore_set = build_globset(&args.ignore).ok();
    let mut watcher: Box<dyn notify::Watcher> = if poll {
        Box::new(
            notify::PollWatcher::new(
                tx,
                notify::Config::default()
                    .with_poll_interval(Duration::from_millis(poll_interval_ms)),
            )
            .map_err(|err| Error::Watch(format!("failed to start poll watcher: {}", err)))?,
        )
    } else {
        Box::new(
            notify::recommended_watcher(tx)
                .map_err(|err| Error::Watch(format!("failed to start watcher: {}", err)))?,
        )
    };

    let config_file = config_path(args.config.as_deref());
    for root in watch_roots(&args.inputs, config_file.as_deref()) {
        watcher
            .watch(&root, notify::RecursiveMode::Recursive)
            .map_err(|err| Error::Watch(format!("failed to watch {}: {}", root.display(), err)))?;
    }

    let out_file = args.out.as_deref().map(absolute);
    let config_abs = config_file.as_deref().map(absolute);
    eprintln!("watching for changes (press Ctrl+C to stop)...");

    let mut last_event = Instant::now();
    loop {
        let event = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(Ok(event)) => event,
            Ok(Err(err)) => {
                warn!(error = %err, "watch error");
                continue;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let paths = event
            .paths
            .iter()
            .map(|path| absolute(path))
            .filter(|path| Some(path) != out_file.as_ref())
            .filter(|path| !is_ignored(path, ignore_set.as_ref()))
            .collect::<Vec<_>>();
        if paths.is_empty() {
            continue;
        }

        let config_changed = config_abs
            .as_ref()
            .is_some_and(|config| paths.iter().any(|path| path == config));
        if !config_changed && last_event.elapsed() < Duration::from_millis(200) {
            continue;
        }
        last_event = Instant::now();

        if config_changed {
            match load_config(args.config.as_deref()) {
                Ok(config) => {
                    generator.set_config(config, None);
                    info!(generation = generator.generation(), "config reloaded");
                }
                Err(err) => {
                    eprintln!("config reload failed: {}", err);
                    continue;
                }
            }
        }

        debug!(paths = paths.len(), "change detected");
        eprintln!("change detected, rebuilding...");
        match runtime.block_on(build_once(&generator, &args)) {
            Ok(summary) => summary.report(),
            Err(err) => eprintln!("build failed: {}", err),
        }
    }

    Ok(())
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn is_ignored(path: &Path, ignore_set: Option<&GlobSet>) -> bool {
    ignore_set.is_some_and(|set| set.is_match(path))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|err| Error::Scan(format!("invalid glob pattern '{}': {}", pattern, err)))?,
        );
    }
    builder
        .build()
        .map_err(|err| Error::Scan(format!("failed to build glob set: {}", err)))
}

fn watch_roots(patterns: &[String], config: Option<&Path>) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    let mut seen = HashSet::new();
    let config = config.map(|path| path.to_string_lossy().into_owned());

    for pattern in patterns.iter().chain(config.iter()) {
        let root = glob_root(pattern);
        let normalized = if root.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            root
        };
        if seen.insert(normalized.clone()) {
            roots.push(normalized);
        }
    }

    roots
}

#[cfg(test)]
mod tests {
    use super::{BuildArgs, Command, Generator, build_once, parse_args, watch_roots};
    use crate::config;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn parses_build_flags() {
        let command = parse_args(args(&[
            "build", "-o", "out.css", "--minify", "-c", "site.toml", "--ignore", "dist/**",
            "src/**/*.html",
        ]))
        .expect("parse");
        assert_eq!(
            command,
            Command::Build(BuildArgs {
                inputs: vec!["src/**/*.html".to_string()],
                out: Some(PathBuf::from("out.css")),
                minify: true,
                config: Some(PathBuf::from("site.toml")),
                ignore: vec!["dist/**".to_string()],
                no_preflights: false,
            })
        );
    }

    #[test]
    fn parses_watch_and_scan() {
        let watch = parse_args(args(&["watch", "--poll", "--poll-interval", "50", "src/**/*"]))
            .expect("watch");
        let Command::Watch {
            build,
            poll,
            poll_interval_ms,
        } = watch
        else {
            panic!("expected watch, got {:?}", watch);
        };
        assert!(poll);
        assert_eq!(poll_interval_ms, 50);
        assert_eq!(build.inputs, vec!["src/**/*"]);

        let scan = parse_args(args(&["scan", "--ignore", "a/**", "b/**"])).expect("scan");
        assert_eq!(
            scan,
            Command::Scan {
                inputs: vec!["b/**".to_string()],
                ignore: vec!["a/**".to_string()],
                config: None,
            }
        );
    }

    #[test]
    fn rejects_unknown_commands_and_missing_inputs() {
        assert!(parse_args(args(&["serve"])).is_err());
        assert!(parse_args(args(&["build", "--minify"])).is_err());
        assert!(parse_args(args(&["watch", "--poll-interval", "soon", "x"])).is_err());
    }

    #[test]
    fn watches_pattern_and_config_roots() {
        assert_eq!(
            watch_roots(
                &["src/**/*.html".to_string(), "src/*.ts".to_string()],
                Some(Path::new("atomframe.toml"))
            ),
            vec![PathBuf::from("src/"), PathBuf::from(".")]
        );
    }

    #[tokio::test]
    async fn builds_css_from_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        fs::write(
            base.join("atomframe.toml"),
            r#"
[theme.spacing]
2 = "0.5rem"

[[rules]]
pattern = '^p-(\d+)$'
css = { padding = "{theme:spacing.$1}" }

[[variants]]
builtin = "pseudo"

[[blocklist]]
match = "p-666"
message = "cursed"
"#,
        )
        .expect("config");
        fs::write(
            base.join("index.html"),
            r#"<div class="p-2 hover:p-2 p-666 unknown"></div>"#,
        )
        .expect("source");

        let loaded = config::load(&base.join("atomframe.toml")).expect("load");
        let generator = Generator::new(
            loaded.with_preset(
                crate::Preset::new("cli").extractor(std::sync::Arc::new(crate::SourceExtractor)),
            ),
        );
        let out = base.join("dist/out.css");
        let build = BuildArgs {
            inputs: vec![format!("{}/*.html", base.display())],
            out: Some(out.clone()),
            minify: false,
            config: None,
            ignore: Vec::new(),
            no_preflights: true,
        };
        let summary = build_once(&generator, &build).await.expect("build");
        assert_eq!(summary.files_scanned, 1);
        assert_eq!(summary.matched, 2);
        assert_eq!(summary.blocked, vec!["p-666 (cursed)"]);
        assert_eq!(
            fs::read_to_string(&out).expect("output"),
            "/* layer: default */\n.p-2 {\n  padding: 0.5rem;\n}\n.hover\\:p-2:hover {\n  padding: 0.5rem;\n}\n"
        );
    }
}
