use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cache::{CacheKey, Compiled, TokenCache};
use crate::error::{Error, Result};
use crate::extractor::ExtractSource;
use crate::layer::{GenerateResult, Layer};
use crate::preprocess::{
    Blocked, expand_groups_in_source, expand_variant_group, has_variant_group, run_preprocess,
    split_important,
};
use crate::resolve::{DEFAULT_LAYER, ResolvedConfig, UserConfig, resolve_config};
use crate::rule::{RuleContext, RuleMeta};
use crate::shortcut::{ShortcutHit, ShortcutValue};
use crate::sort::{merge_utils, sort_utils};
use crate::stringify::normalize_entries;
use crate::types::{CompiledUtil, CssValue, MatchContext, PARENT_JOINER, UtilBody};
use crate::variant::{VariantBranch, VariantEnv, peel_variants};

/// Rounds of follow-up extraction before giving up on a fixed point.
pub const MAX_EXTRACT_ROUNDS: usize = 8;

/// Deepest shortcut nesting followed before a branch is dropped.
pub const MAX_SHORTCUT_DEPTH: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Emit configured preflights.
    pub preflights: bool,
    /// Emit the configured safelist.
    pub safelist: bool,
    pub minify: bool,
    /// Source path, handed to extractors.
    pub id: Option<String>,
    /// Fail the call when an extractor fails or times out.
    pub strict_extractors: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            preflights: true,
            safelist: true,
            minify: false,
            id: None,
            strict_extractors: false,
        }
    }
}

/// Either raw source text to run through the extractors, or tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateInput {
    Source(String),
    Tokens(Vec<String>),
}

impl From<&str> for GenerateInput {
    fn from(code: &str) -> Self {
        GenerateInput::Source(code.to_string())
    }
}

impl From<String> for GenerateInput {
    fn from(code: String) -> Self {
        GenerateInput::Source(code)
    }
}

impl From<Vec<String>> for GenerateInput {
    fn from(tokens: Vec<String>) -> Self {
        GenerateInput::Tokens(tokens)
    }
}

impl From<Vec<&str>> for GenerateInput {
    fn from(tokens: Vec<&str>) -> Self {
        GenerateInput::Tokens(tokens.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for GenerateInput {
    fn from(tokens: &[&str]) -> Self {
        GenerateInput::Tokens(tokens.iter().map(|token| token.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for GenerateInput {
    fn from(tokens: [&str; N]) -> Self {
        GenerateInput::Tokens(tokens.iter().map(|token| token.to_string()).collect())
    }
}

impl From<BTreeSet<String>> for GenerateInput {
    fn from(tokens: BTreeSet<String>) -> Self {
        GenerateInput::Tokens(tokens.into_iter().collect())
    }
}

struct Snapshot {
    generation: u64,
    config: Arc<ResolvedConfig>,
    cache: TokenCache,
    blocked: Mutex<IndexMap<String, Blocked>>,
    inner_blocked: Mutex<IndexMap<String, Vec<String>>>,
}

pub struct Generator {
    snapshot: ArcSwap<Snapshot>,
    defaults: Mutex<Option<UserConfig>>,
    generation: AtomicU64,
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("Generator")
            .field("generation", &snapshot.generation)
            .field("config", &snapshot.config)
            .field("cached", &snapshot.cache.len())
            .finish()
    }
}

impl Default for Generator {
    fn default() -> Self {
        Self::new(UserConfig::default())
    }
}

impl Generator {
    pub fn new(config: UserConfig) -> Self {
        Self::build(config, None)
    }

    /// Like [`Generator::new`], with `defaults` contributing before every
    /// preset of `config`. The defaults are kept across [`set_config`].
    ///
    /// [`set_config`]: Generator::set_config
    pub fn with_defaults(config: UserConfig, defaults: UserConfig) -> Self {
        Self::build(config, Some(defaults))
    }

    fn build(config: UserConfig, defaults: Option<UserConfig>) -> Self {
        let resolved = resolve_config(&config, defaults.as_ref());
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::new(1, resolved)),
            defaults: Mutex::new(defaults),
            generation: AtomicU64::new(1),
        }
    }

    /// Swaps in a new configuration and an empty cache in one step.
    /// Calls already running keep the snapshot they started with.
    pub fn set_config(&self, config: UserConfig, defaults: Option<UserConfig>) {
        let mut stored = self.defaults.lock();
        if defaults.is_some() {
            *stored = defaults;
        }
        let resolved = resolve_config(&config, stored.as_ref());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.snapshot
            .store(Arc::new(Snapshot::new(generation, resolved)));
        debug!(generation, "configuration reloaded");
    }

    pub fn generation(&self) -> u64 {
        self.snapshot.load().generation
    }

    pub fn config(&self) -> Arc<ResolvedConfig> {
        Arc::clone(&self.snapshot.load().config)
    }

    /// Compiles one token. `None` means the token produces no CSS.
    pub fn parse_token(
        &self,
        token: &str,
        separators: Option<&[String]>,
    ) -> Result<Option<Arc<[CompiledUtil]>>> {
        self.snapshot.load().parse_token(token, separators)
    }

    /// Runs every configured extractor over `code`, following discovered
    /// sources to a fixed point. Extractor failures are logged and skipped.
    pub async fn apply_extractors(
        &self,
        code: &str,
        id: Option<&str>,
        into: Option<BTreeSet<String>>,
    ) -> Result<BTreeSet<String>> {
        let snapshot = self.snapshot.load_full();
        let mut tokens = into.unwrap_or_default();
        snapshot.extract(code, id, false, &mut tokens).await?;
        Ok(tokens)
    }

    /// Every variant branch `raw` peels into. `current` defaults to the
    /// preprocessed token.
    pub fn match_variants(&self, raw: &str, current: Option<&str>) -> Vec<VariantBranch> {
        self.snapshot.load().match_variants(raw, current)
    }

    /// The blocklist entry suppressing `token`, if any, checked against the
    /// raw token, its preprocessed form, and each variant-peeled remainder.
    pub fn get_blocked(&self, token: &str) -> Option<Blocked> {
        self.snapshot.load().find_blocked(token)
    }

    /// Runs the rule table, internal rules included, against `token` without
    /// variants or shortcuts.
    pub fn invoke_rule(&self, token: &str) -> Result<Option<Vec<CssValue>>> {
        let snapshot = self.snapshot.load();
        let config = &snapshot.config;
        let context = MatchContext::for_token(token);
        let ctx = RuleContext::new(token, token, &config.theme, &context, config.strict_theme);
        Ok(config.rules.match_rules(&ctx, true)?.map(|hit| hit.values))
    }

    pub async fn generate(
        &self,
        input: impl Into<GenerateInput>,
        options: &GenerateOptions,
    ) -> Result<GenerateResult> {
        let snapshot = self.snapshot.load_full();
        let mut tokens = BTreeSet::new();
        match input.into() {
            GenerateInput::Source(code) => {
                snapshot
                    .extract(
                        &code,
                        options.id.as_deref(),
                        options.strict_extractors,
                        &mut tokens,
                    )
                    .await?;
            }
            GenerateInput::Tokens(list) => {
                for token in &list {
                    collect_tokens(token, &snapshot.config.separators, &mut tokens);
                }
            }
        }
        snapshot.assemble(tokens, options)
    }

    /// Synchronous generation from a known token list.
    pub fn generate_tokens<I, S>(&self, tokens: I, options: &GenerateOptions) -> Result<GenerateResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let snapshot = self.snapshot.load_full();
        let mut set = BTreeSet::new();
        for token in tokens {
            collect_tokens(token.as_ref(), &snapshot.config.separators, &mut set);
        }
        snapshot.assemble(set, options)
    }
}

fn collect_tokens(input: &str, separators: &[String], into: &mut BTreeSet<String>) {
    for token in expand_variant_group(input, separators).split_whitespace() {
        into.insert(token.to_string());
    }
}

impl Snapshot {
    fn new(generation: u64, config: ResolvedConfig) -> Self {
        Self {
            generation,
            config: Arc::new(config),
            cache: TokenCache::new(),
            blocked: Mutex::new(IndexMap::new()),
            inner_blocked: Mutex::new(IndexMap::new()),
        }
    }

    fn record_blocked(&self, token: &str, candidate: &str) -> bool {
        let Some(entry) = self.config.blocklist.find(candidate) else {
            return false;
        };
        let mut blocked = self.blocked.lock();
        if !blocked.contains_key(token) {
            let record = Blocked::new(token, entry);
            warn!(
                token,
                pattern = %entry.matcher,
                message = record.message.as_deref().unwrap_or_default(),
                "token blocked"
            );
            blocked.insert(token.to_string(), record);
        }
        true
    }

    fn parse_token(&self, raw: &str, separators: Option<&[String]>) -> Result<Compiled> {
        if self.record_blocked(raw, raw) {
            return Ok(None);
        }
        self.cache
            .get_or_compile(CacheKey::new(raw, separators), || {
                self.compile_token(raw, separators)
            })
    }

    fn compile_token(&self, raw: &str, separators: Option<&[String]>) -> Result<Compiled> {
        let config = &self.config;
        let Some(processed) = run_preprocess(raw, &config.preprocess) else {
            trace!(token = raw, "dropped by preprocess hook");
            return Ok(None);
        };
        if self.record_blocked(raw, &processed) {
            return Ok(None);
        }

        let separators = separators.unwrap_or(&config.separators);
        let parts = if has_variant_group(&processed, separators) {
            expand_variant_group(&processed, separators)
                .split_whitespace()
                .map(str::to_string)
                .collect()
        } else {
            vec![processed]
        };

        let mut utils = Vec::new();
        let mut chain = Vec::new();
        for part in &parts {
            let start = MatchContext::for_token(raw);
            match self.compile_with(raw, part, separators, start, &mut chain, false)? {
                Some(compiled) => utils.extend(compiled),
                None => return Ok(None),
            }
        }

        for hook in &config.postprocess {
            for util in &mut utils {
                hook(util);
            }
        }

        trace!(token = raw, utils = utils.len(), "token compiled");
        if utils.is_empty() {
            Ok(None)
        } else {
            Ok(Some(utils.into()))
        }
    }

    fn compile_with(
        &self,
        raw: &str,
        current: &str,
        separators: &[String],
        mut start: MatchContext,
        chain: &mut Vec<String>,
        allow_internal: bool,
    ) -> Result<Option<Vec<CompiledUtil>>> {
        let config = &self.config;
        let (current, important) = split_important(current);
        start.important |= important;

        let env = VariantEnv {
            theme: &config.theme,
            separators,
        };
        let blocklist = &config.blocklist;
        let peeled = peel_variants(raw, current, start, &config.variants, &env, &|rest| {
            blocklist.is_blocked(rest)
        });
        if let Some(rest) = peeled.blocked {
            self.record_blocked(raw, &rest);
            return Ok(None);
        }

        let mut utils = Vec::new();
        for branch in peeled.branches {
            let (rest, important) = split_important(&branch.rest);
            let mut context = branch.context;
            context.important |= important;
            let ctx = RuleContext::new(raw, rest, &config.theme, &context, config.strict_theme);

            if let Some(hit) = config.shortcuts.find(&ctx) {
                if chain.iter().any(|name| name == rest) {
                    warn!(token = raw, shortcut = rest, "shortcut cycle detected");
                    continue;
                }
                if chain.len() >= MAX_SHORTCUT_DEPTH {
                    warn!(
                        token = raw,
                        shortcut = rest,
                        depth = chain.len(),
                        "shortcut nesting too deep"
                    );
                    continue;
                }
                chain.push(rest.to_string());
                let expanded = self.expand_shortcut(raw, &hit, &context, separators, chain);
                chain.pop();
                utils.extend(expanded?);
                continue;
            }

            if let Some(hit) = config.rules.match_rules(&ctx, allow_internal)? {
                utils.extend(build_utils(
                    raw,
                    hit.index,
                    &hit.rule.meta,
                    hit.values,
                    &context,
                ));
            }
        }
        Ok(Some(utils))
    }

    fn expand_shortcut(
        &self,
        raw: &str,
        hit: &ShortcutHit<'_>,
        context: &MatchContext,
        separators: &[String],
        chain: &mut Vec<String>,
    ) -> Result<Vec<CompiledUtil>> {
        let mut inner = Vec::new();
        match &hit.value {
            ShortcutValue::Tokens(list) => {
                for entry in list {
                    for token in expand_variant_group(entry, separators).split_whitespace() {
                        if self.record_blocked(token, token) {
                            let mut inner_blocked = self.inner_blocked.lock();
                            let tokens = inner_blocked.entry(raw.to_string()).or_default();
                            if !tokens.iter().any(|seen| seen == token) {
                                tokens.push(token.to_string());
                            }
                            continue;
                        }
                        let compiled =
                            self.compile_with(raw, token, separators, context.clone(), chain, true)?;
                        if let Some(compiled) = compiled {
                            inner.extend(compiled);
                        }
                    }
                }
            }
            ShortcutValue::Css(values) => {
                inner.extend(build_utils(
                    raw,
                    hit.index,
                    &RuleMeta::default(),
                    values.clone(),
                    context,
                ));
            }
        }

        let shortcut = hit.shortcut;
        Ok(merge_shortcut(
            inner,
            hit.index,
            shortcut.layer(),
            shortcut.meta.no_merge,
        ))
    }

    fn match_variants(&self, raw: &str, current: Option<&str>) -> Vec<VariantBranch> {
        let config = &self.config;
        let processed = match current {
            Some(current) => current.to_string(),
            None => match run_preprocess(raw, &config.preprocess) {
                Some(processed) => processed,
                None => return Vec::new(),
            },
        };
        let (current, important) = split_important(&processed);
        let mut start = MatchContext::for_token(raw);
        start.important = important;
        let env = VariantEnv {
            theme: &config.theme,
            separators: &config.separators,
        };
        let blocklist = &config.blocklist;
        peel_variants(raw, current, start, &config.variants, &env, &|rest| {
            blocklist.is_blocked(rest)
        })
        .branches
    }

    fn find_blocked(&self, raw: &str) -> Option<Blocked> {
        let config = &self.config;
        let blocklist = &config.blocklist;
        if let Some(entry) = blocklist.find(raw) {
            return Some(Blocked::new(raw, entry));
        }
        let processed = run_preprocess(raw, &config.preprocess)?;
        if let Some(entry) = blocklist.find(&processed) {
            return Some(Blocked::new(raw, entry));
        }
        let (current, _) = split_important(&processed);
        let env = VariantEnv {
            theme: &config.theme,
            separators: &config.separators,
        };
        let peeled = peel_variants(
            raw,
            current,
            MatchContext::for_token(raw),
            &config.variants,
            &env,
            &|rest| blocklist.is_blocked(rest),
        );
        let rest = peeled.blocked?;
        blocklist.find(&rest).map(|entry| Blocked::new(raw, entry))
    }

    async fn extract(
        &self,
        code: &str,
        id: Option<&str>,
        strict: bool,
        tokens: &mut BTreeSet<String>,
    ) -> Result<()> {
        let config = &self.config;
        let timeout = config.extractor_timeout;
        let mut pending = vec![ExtractSource {
            id: id.map(str::to_string),
            code: expand_groups_in_source(code, &config.separators),
        }];
        let mut seen = HashSet::new();

        for round in 1..=MAX_EXTRACT_ROUNDS {
            if pending.is_empty() {
                return Ok(());
            }
            let batch = std::mem::take(&mut pending);
            let tasks = batch.iter().flat_map(|source| {
                config.extractors.iter().map(move |extractor| async move {
                    let outcome = tokio::time::timeout(
                        timeout,
                        extractor.extract(&source.code, source.id.as_deref()),
                    )
                    .await;
                    (extractor.name().to_string(), outcome)
                })
            });

            for (name, outcome) in join_all(tasks).await {
                let extraction = match outcome {
                    Ok(Ok(extraction)) => extraction,
                    Ok(Err(err)) => {
                        if strict {
                            return Err(err);
                        }
                        warn!(extractor = %name, error = %err, "extractor failed");
                        continue;
                    }
                    Err(_) => {
                        let err = Error::ExtractorTimeout {
                            name,
                            millis: timeout.as_millis() as u64,
                        };
                        if strict {
                            return Err(err);
                        }
                        warn!(error = %err, "extractor skipped");
                        continue;
                    }
                };

                tokens.extend(extraction.tokens.into_iter().filter(|token| !token.is_empty()));
                for source in extraction.sources {
                    if seen.insert((source.id.clone(), source.code.clone())) {
                        pending.push(ExtractSource {
                            code: expand_groups_in_source(&source.code, &config.separators),
                            id: source.id,
                        });
                    }
                }
            }
            trace!(round, tokens = tokens.len(), "extraction round finished");
        }

        if !pending.is_empty() {
            warn!(
                pending = pending.len(),
                "extraction did not settle after {} rounds", MAX_EXTRACT_ROUNDS
            );
        }
        Ok(())
    }

    fn assemble(
        &self,
        mut tokens: BTreeSet<String>,
        options: &GenerateOptions,
    ) -> Result<GenerateResult> {
        let config = &self.config;
        if options.safelist {
            for token in &config.safelist {
                collect_tokens(token, &config.separators, &mut tokens);
            }
        }

        let mut matched = BTreeSet::new();
        let mut blocked = Vec::new();
        let mut buckets: IndexMap<String, Vec<CompiledUtil>> = IndexMap::new();
        for token in &tokens {
            match self.parse_token(token, None)? {
                Some(utils) => {
                    matched.insert(token.clone());
                    if let Some(inner) = self.inner_blocked.lock().get(token) {
                        let records = self.blocked.lock();
                        for name in inner {
                            if let Some(record) = records.get(name) {
                                blocked.push(record.clone());
                            }
                        }
                    }
                    for util in utils.iter() {
                        buckets
                            .entry(util.layer.clone())
                            .or_default()
                            .push(util.clone());
                    }
                }
                None => {
                    if let Some(record) = self.blocked.lock().get(token) {
                        blocked.push(record.clone());
                    }
                }
            }
        }

        let mut reported = HashSet::new();
        blocked.retain(|record: &Blocked| reported.insert(record.token.clone()));

        let mut preflights: IndexMap<String, Vec<String>> = IndexMap::new();
        if options.preflights {
            for preflight in &config.preflights {
                if let Some(css) = preflight.render(&config.theme) {
                    preflights
                        .entry(preflight.layer().to_string())
                        .or_default()
                        .push(css);
                }
            }
        }

        let names = buckets
            .keys()
            .chain(preflights.keys())
            .map(String::as_str)
            .collect::<Vec<_>>();
        let layers = config
            .sort_layers(names)
            .into_iter()
            .map(|name| {
                let mut layer = Layer::new(name, config.layer_priority(name));
                for css in preflights.get(name).into_iter().flatten() {
                    layer.push_preflight(css.clone());
                }
                if let Some(utils) = buckets.get(name) {
                    layer.set_utils(merge_utils(sort_utils(utils.clone())));
                }
                layer
            })
            .collect::<Vec<_>>();

        debug!(
            generation = self.generation,
            tokens = tokens.len(),
            matched = matched.len(),
            blocked = blocked.len(),
            "css generated"
        );
        Ok(GenerateResult::new(layers, options.minify, matched, blocked))
    }
}

fn build_utils(
    token: &str,
    order: usize,
    meta: &RuleMeta,
    values: Vec<CssValue>,
    context: &MatchContext,
) -> Vec<CompiledUtil> {
    let parent = context.parent();
    let full_selector = context.full_selector();

    values
        .into_iter()
        .enumerate()
        .filter_map(|(position, value)| match value {
            CssValue::Raw(css) => {
                if css.trim().is_empty() {
                    return None;
                }
                Some(CompiledUtil {
                    token: token.to_string(),
                    order,
                    sub_order: position,
                    sort: context.sort + meta.sort.unwrap_or(0),
                    selector: String::new(),
                    body: UtilBody::Raw(css),
                    parent: None,
                    parent_order: 0,
                    layer: context
                        .layer
                        .clone()
                        .or_else(|| meta.layer.clone())
                        .unwrap_or_else(|| DEFAULT_LAYER.to_string()),
                    no_merge: true,
                })
            }
            CssValue::Block(block) => {
                let entries = normalize_entries(&block.entries, context.important);
                if entries.is_empty() {
                    return None;
                }
                let selector = match &block.selector {
                    Some(template) if template.contains('&') => {
                        template.replace('&', &full_selector)
                    }
                    Some(template) => format!("{} {}", template, full_selector),
                    None => full_selector.clone(),
                };
                let parent = match (parent.clone(), block.parent) {
                    (Some(outer), Some(inner)) => Some(format!("{}{}{}", outer, PARENT_JOINER, inner)),
                    (outer, inner) => outer.or(inner),
                };
                Some(CompiledUtil {
                    token: token.to_string(),
                    order,
                    sub_order: position,
                    sort: context.sort + block.sort.or(meta.sort).unwrap_or(0),
                    selector,
                    body: UtilBody::Declarations(entries),
                    parent,
                    parent_order: context.parent_order,
                    layer: block
                        .layer
                        .or_else(|| context.layer.clone())
                        .or_else(|| meta.layer.clone())
                        .unwrap_or_else(|| DEFAULT_LAYER.to_string()),
                    no_merge: context.no_merge || block.no_merge || meta.no_merge,
                })
            }
        })
        .collect()
}

fn merge_shortcut(
    inner: Vec<CompiledUtil>,
    order: usize,
    layer: &str,
    no_merge: bool,
) -> Vec<CompiledUtil> {
    let mut merged: Vec<CompiledUtil> = Vec::with_capacity(inner.len());
    for util in inner {
        if !no_merge && !util.no_merge && !util.is_raw() {
            let target = merged.iter_mut().find(|existing| {
                !existing.no_merge
                    && !existing.is_raw()
                    && existing.selector == util.selector
                    && existing.parent == util.parent
            });
            if let Some(target) = target {
                if let (UtilBody::Declarations(into), UtilBody::Declarations(from)) =
                    (&mut target.body, util.body)
                {
                    for entry in from {
                        if !into.contains(&entry) {
                            into.push(entry);
                        }
                    }
                }
                continue;
            }
        }
        merged.push(util);
    }

    for (position, util) in merged.iter_mut().enumerate() {
        util.order = order;
        util.sub_order = position;
        util.layer = layer.to_string();
        util.no_merge |= no_merge;
    }
    merged
}
