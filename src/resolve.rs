use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::debug;

use crate::extractor::{Extractor, SplitExtractor};
use crate::preprocess::{Blocklist, BlocklistEntry, PreprocessFn};
use crate::rule::{Rule, RuleSet};
use crate::shortcut::{SHORTCUTS_LAYER, Shortcut, ShortcutSet};
use crate::theme::Theme;
use crate::types::CompiledUtil;
use crate::variant::Variant;

pub const DEFAULT_LAYER: &str = "default";
pub const PREFLIGHTS_LAYER: &str = "preflights";
pub const DEFAULT_SEPARATORS: &[&str] = &[":", "-"];
pub const DEFAULT_EXTRACTOR_TIMEOUT: Duration = Duration::from_secs(5);

pub type PostprocessFn = Arc<dyn Fn(&mut CompiledUtil) + Send + Sync>;
pub type PreflightFn = Arc<dyn Fn(&Theme) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub enum PreflightBody {
    Css(String),
    Dynamic(PreflightFn),
}

/// Base styles emitted independently of any token.
#[derive(Clone)]
pub struct Preflight {
    pub body: PreflightBody,
    pub layer: Option<String>,
}

impl fmt::Debug for Preflight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            PreflightBody::Css(css) => css.as_str(),
            PreflightBody::Dynamic(_) => "<dynamic>",
        };
        f.debug_struct("Preflight")
            .field("body", &body)
            .field("layer", &self.layer)
            .finish()
    }
}

impl Preflight {
    pub fn css(css: impl Into<String>) -> Self {
        Self {
            body: PreflightBody::Css(css.into()),
            layer: None,
        }
    }

    pub fn dynamic<F>(render: F) -> Self
    where
        F: Fn(&Theme) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            body: PreflightBody::Dynamic(Arc::new(render)),
            layer: None,
        }
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    pub fn layer(&self) -> &str {
        self.layer.as_deref().unwrap_or(PREFLIGHTS_LAYER)
    }

    pub fn render(&self, theme: &Theme) -> Option<String> {
        match &self.body {
            PreflightBody::Css(css) => Some(css.clone()),
            PreflightBody::Dynamic(render) => render(theme),
        }
    }
}

/// A bundle of configuration contributions. Presets may nest; nested
/// presets contribute before the preset holding them.
#[derive(Clone, Default)]
pub struct Preset {
    pub name: String,
    pub presets: Vec<Preset>,
    pub rules: Vec<Rule>,
    pub variants: Vec<Variant>,
    pub shortcuts: Vec<Shortcut>,
    pub theme: Theme,
    pub layers: IndexMap<String, i32>,
    pub separators: Vec<String>,
    pub preprocess: Vec<PreprocessFn>,
    pub postprocess: Vec<PostprocessFn>,
    pub blocklist: Vec<BlocklistEntry>,
    pub safelist: Vec<String>,
    pub preflights: Vec<Preflight>,
    pub extractors: Vec<Arc<dyn Extractor>>,
}

impl fmt::Debug for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preset")
            .field("name", &self.name)
            .field("presets", &self.presets)
            .field("rules", &self.rules.len())
            .field("variants", &self.variants.len())
            .field("shortcuts", &self.shortcuts.len())
            .field("layers", &self.layers)
            .field("separators", &self.separators)
            .field("blocklist", &self.blocklist)
            .field("safelist", &self.safelist)
            .finish_non_exhaustive()
    }
}

impl Preset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn preset(mut self, preset: Preset) -> Self {
        self.presets.push(preset);
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn variant(mut self, variant: Variant) -> Self {
        self.variants.push(variant);
        self
    }

    pub fn variants(mut self, variants: impl IntoIterator<Item = Variant>) -> Self {
        self.variants.extend(variants);
        self
    }

    pub fn shortcut(mut self, shortcut: Shortcut) -> Self {
        self.shortcuts.push(shortcut);
        self
    }

    pub fn theme(mut self, theme: Theme) -> Self {
        self.theme.merge(&theme);
        self
    }

    pub fn layer(mut self, name: impl Into<String>, priority: i32) -> Self {
        self.layers.insert(name.into(), priority);
        self
    }

    pub fn separators<I, S>(mut self, separators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.separators = separators.into_iter().map(Into::into).collect();
        self
    }

    pub fn preprocess<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.preprocess.push(Arc::new(hook));
        self
    }

    pub fn postprocess<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut CompiledUtil) + Send + Sync + 'static,
    {
        self.postprocess.push(Arc::new(hook));
        self
    }

    pub fn block(mut self, entry: BlocklistEntry) -> Self {
        self.blocklist.push(entry);
        self
    }

    pub fn safelist<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.safelist.extend(tokens.into_iter().map(Into::into));
        self
    }

    pub fn preflight(mut self, preflight: Preflight) -> Self {
        self.preflights.push(preflight);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractors.push(extractor);
        self
    }
}

/// What a caller hands to the engine: presets plus its own contributions.
#[derive(Debug, Clone)]
pub struct UserConfig {
    pub presets: Vec<Preset>,
    pub user: Preset,
    /// Report theme misses as errors instead of silently skipping rules.
    pub strict_theme: bool,
    pub extractor_timeout: Duration,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            presets: Vec::new(),
            user: Preset::new("user"),
            strict_theme: false,
            extractor_timeout: DEFAULT_EXTRACTOR_TIMEOUT,
        }
    }
}

impl UserConfig {
    pub fn new(user: Preset) -> Self {
        Self {
            user,
            ..Self::default()
        }
    }

    pub fn with_preset(mut self, preset: Preset) -> Self {
        self.presets.push(preset);
        self
    }

    pub fn strict_theme(mut self, strict: bool) -> Self {
        self.strict_theme = strict;
        self
    }

    pub fn extractor_timeout(mut self, timeout: Duration) -> Self {
        self.extractor_timeout = timeout;
        self
    }
}

/// The merged, immutable configuration.
#[derive(Clone)]
pub struct ResolvedConfig {
    pub rules: RuleSet,
    pub variants: Vec<Variant>,
    pub shortcuts: ShortcutSet,
    pub theme: Theme,
    /// Layer priorities, sorted by (priority, name).
    pub layers: Vec<(String, i32)>,
    /// Longest first, so `::` wins over `:`.
    pub separators: Vec<String>,
    pub preprocess: Vec<PreprocessFn>,
    pub postprocess: Vec<PostprocessFn>,
    pub blocklist: Blocklist,
    pub safelist: Vec<String>,
    pub preflights: Vec<Preflight>,
    pub extractors: Vec<Arc<dyn Extractor>>,
    pub strict_theme: bool,
    pub extractor_timeout: Duration,
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("rules", &self.rules.len())
            .field("variants", &self.variants.len())
            .field("shortcuts", &self.shortcuts.len())
            .field("layers", &self.layers)
            .field("separators", &self.separators)
            .field("safelist", &self.safelist)
            .field("strict_theme", &self.strict_theme)
            .finish_non_exhaustive()
    }
}

impl ResolvedConfig {
    /// Priority of a layer. Layers nobody declared sit at 0.
    pub fn layer_priority(&self, layer: &str) -> i32 {
        self.layers
            .iter()
            .find(|(name, _)| name == layer)
            .map(|(_, priority)| *priority)
            .unwrap_or(0)
    }

    /// Orders layer names by (priority, name).
    pub fn sort_layers<'a>(&self, layers: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        let mut layers = layers.into_iter().collect::<Vec<_>>();
        layers.sort_by(|a, b| {
            self.layer_priority(a)
                .cmp(&self.layer_priority(b))
                .then_with(|| a.cmp(b))
        });
        layers.dedup();
        layers
    }
}

fn default_layers() -> IndexMap<String, i32> {
    [
        (PREFLIGHTS_LAYER.to_string(), -100),
        (SHORTCUTS_LAYER.to_string(), -10),
        (DEFAULT_LAYER.to_string(), 0),
    ]
    .into_iter()
    .collect()
}

fn flatten_presets<'a>(preset: &'a Preset, out: &mut Vec<&'a Preset>) {
    for nested in &preset.presets {
        flatten_presets(nested, out);
    }
    out.push(preset);
}

/// Merges `defaults` (if any) and `config` into a resolved configuration.
///
/// Contribution order is: default presets, default user preset, presets,
/// user preset. Later contributions win for layers and separators; a
/// redeclared layer priority silently replaces the earlier one.
pub fn resolve_config(config: &UserConfig, defaults: Option<&UserConfig>) -> ResolvedConfig {
    let mut sources = Vec::new();
    for layer in defaults.into_iter().chain(std::iter::once(config)) {
        for preset in &layer.presets {
            flatten_presets(preset, &mut sources);
        }
        flatten_presets(&layer.user, &mut sources);
    }

    let mut rules = Vec::new();
    let mut variants = Vec::new();
    let mut shortcuts = Vec::new();
    let mut theme = Theme::new();
    let mut layers = default_layers();
    let mut separators: Vec<String> = Vec::new();
    let mut preprocess = Vec::new();
    let mut postprocess = Vec::new();
    let mut blocklist = Vec::new();
    let mut safelist = Vec::new();
    let mut preflights = Vec::new();
    let mut extractors = Vec::new();
    let mut seen_safelist = HashSet::new();

    for source in &sources {
        rules.extend(source.rules.iter().cloned());
        variants.extend(source.variants.iter().cloned());
        shortcuts.extend(source.shortcuts.iter().cloned());
        theme.merge(&source.theme);
        for (name, priority) in &source.layers {
            if let Some(previous) = layers.insert(name.clone(), *priority) {
                if previous != *priority {
                    debug!(
                        layer = %name,
                        previous,
                        priority,
                        preset = %source.name,
                        "layer priority overridden"
                    );
                }
            }
        }
        if !source.separators.is_empty() {
            separators = source.separators.clone();
        }
        preprocess.extend(source.preprocess.iter().cloned());
        postprocess.extend(source.postprocess.iter().cloned());
        blocklist.extend(source.blocklist.iter().cloned());
        for token in &source.safelist {
            if seen_safelist.insert(token.clone()) {
                safelist.push(token.clone());
            }
        }
        preflights.extend(source.preflights.iter().cloned());
        extractors.extend(source.extractors.iter().cloned());
    }

    if separators.is_empty() {
        separators = DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect();
    }
    separators.retain(|separator| !separator.is_empty());
    separators.sort_by_key(|separator| std::cmp::Reverse(separator.len()));
    separators.dedup();

    variants.sort_by_key(|variant| variant.meta.order);

    if extractors.is_empty() {
        extractors.push(Arc::new(SplitExtractor) as Arc<dyn Extractor>);
    }

    let mut layers = layers.into_iter().collect::<Vec<_>>();
    layers.sort_by(|(a_name, a), (b_name, b)| a.cmp(b).then_with(|| a_name.cmp(b_name)));

    let resolved = ResolvedConfig {
        rules: RuleSet::new(rules),
        variants,
        shortcuts: ShortcutSet::new(shortcuts),
        theme,
        layers,
        separators,
        preprocess,
        postprocess,
        blocklist: Blocklist::new(blocklist),
        safelist,
        preflights,
        extractors,
        strict_theme: config.strict_theme,
        extractor_timeout: config.extractor_timeout,
    };
    debug!(
        presets = sources.len(),
        rules = resolved.rules.len(),
        static_rules = resolved.rules.static_count(),
        variants = resolved.variants.len(),
        shortcuts = resolved.shortcuts.len(),
        "configuration resolved"
    );
    resolved
}

#[cfg(test)]
mod tests {
    use super::{Preset, UserConfig, resolve_config};
    use crate::rule::Rule;
    use crate::theme::Theme;
    use crate::types::css;
    use crate::variant::Variant;

    fn base() -> Preset {
        let mut theme = Theme::new();
        theme.set("spacing.4", "1rem").set("colors.red.500", "#ef4444");
        Preset::new("base")
            .theme(theme)
            .rule(Rule::fixed("flex", css([("display", "flex")])))
            .rule(Rule::pattern(r"^p-(\d+)$", |_, _| None).expect("pattern"))
            .layer("components", 5)
            .safelist(["flex"])
    }

    #[test]
    fn merges_presets_in_order() {
        let mut theme = Theme::new();
        theme.set("spacing.4", "16px");
        let user = Preset::new("user")
            .theme(theme)
            .rule(Rule::fixed("block", css([("display", "block")])))
            .safelist(["flex", "block"]);
        let resolved = resolve_config(&UserConfig::new(user).with_preset(base()), None);

        assert_eq!(resolved.rules.len(), 3);
        assert_eq!(resolved.rules.static_count(), 2);
        assert_eq!(resolved.theme.resolve("spacing.4").as_deref(), Some("16px"));
        assert_eq!(
            resolved.theme.resolve("colors.red.500").as_deref(),
            Some("#ef4444")
        );
        assert_eq!(resolved.safelist, vec!["flex", "block"]);
        assert_eq!(resolved.extractors.len(), 1);
    }

    #[test]
    fn sorts_layers_and_lets_last_priority_win() {
        let override_layer = Preset::new("late").layer("components", -50);
        let resolved = resolve_config(
            &UserConfig::default()
                .with_preset(base())
                .with_preset(override_layer),
            None,
        );
        let names = resolved
            .layers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["preflights", "components", "shortcuts", "default"]);
        assert_eq!(resolved.layer_priority("components"), -50);
        assert_eq!(resolved.layer_priority("unknown"), 0);
        assert_eq!(
            resolved.sort_layers(["zeta", "default", "preflights", "alpha"]),
            vec!["preflights", "alpha", "default", "zeta"]
        );
    }

    #[test]
    fn orders_separators_longest_first() {
        let user = Preset::new("user").separators([":", "::", "-"]);
        let resolved = resolve_config(&UserConfig::new(user), None);
        assert_eq!(resolved.separators, vec!["::", ":", "-"]);

        let resolved = resolve_config(&UserConfig::default(), None);
        assert_eq!(resolved.separators, vec![":", "-"]);
    }

    #[test]
    fn sorts_variants_by_order() {
        let user = Preset::new("user")
            .variant(Variant::pseudo("late", ":late").with_order(10))
            .variant(Variant::pseudo("early", ":early").with_order(-1))
            .variant(Variant::pseudo("middle", ":middle"));
        let resolved = resolve_config(&UserConfig::new(user), None);
        let names = resolved
            .variants
            .iter()
            .map(|variant| variant.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["early", "middle", "late"]);
    }

    #[test]
    fn places_defaults_and_nested_presets_first() {
        let nested = Preset::new("outer")
            .preset(Preset::new("inner").rule(Rule::fixed("inner", css([("a", "b")]))))
            .rule(Rule::fixed("outer", css([("c", "d")])));
        let defaults = UserConfig::new(Preset::new("defaults").rule(Rule::fixed(
            "default",
            css([("e", "f")]),
        )));
        let resolved = resolve_config(&UserConfig::default().with_preset(nested), Some(&defaults));
        let names = resolved
            .rules
            .rules()
            .iter()
            .map(|rule| rule.matcher.describe())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["default", "inner", "outer"]);
    }
}
