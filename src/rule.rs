use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::{Captures, Regex};
use tracing::trace;

use crate::error::{Error, Result};
use crate::stringify::{normalize_entries, render_rule};
use crate::theme::Theme;
use crate::types::{CssEntry, CssValue, MatchContext};

pub type RuleFn =
    Arc<dyn Fn(&RuleMatch<'_>, &RuleContext<'_>) -> Option<Vec<CssValue>> + Send + Sync>;

/// How a rule or shortcut recognizes its input.
#[derive(Clone)]
pub enum Matcher {
    Static(String),
    Pattern(Regex),
}

impl Matcher {
    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Matcher::Pattern)
            .map_err(|err| Error::pattern(pattern, err))
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Matcher::Static(_))
    }

    pub fn describe(&self) -> &str {
        match self {
            Matcher::Static(name) => name,
            Matcher::Pattern(regex) => regex.as_str(),
        }
    }

    pub fn matches<'t>(&self, input: &'t str) -> Option<RuleMatch<'t>> {
        match self {
            Matcher::Static(name) => (name == input).then_some(RuleMatch {
                input,
                captures: None,
            }),
            Matcher::Pattern(regex) => regex.captures(input).map(|captures| RuleMatch {
                input,
                captures: Some(captures),
            }),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Static(name) => f.debug_tuple("Static").field(name).finish(),
            Matcher::Pattern(regex) => f.debug_tuple("Pattern").field(&regex.as_str()).finish(),
        }
    }
}

/// Captured groups of a successful match. Group 0 is the whole input.
pub struct RuleMatch<'t> {
    input: &'t str,
    captures: Option<Captures<'t>>,
}

impl<'t> RuleMatch<'t> {
    pub fn input(&self) -> &'t str {
        self.input
    }

    pub fn get(&self, idx: usize) -> Option<&'t str> {
        match &self.captures {
            Some(captures) => captures.get(idx).map(|m| m.as_str()),
            None if idx == 0 => Some(self.input),
            None => None,
        }
    }

    pub fn name(&self, name: &str) -> Option<&'t str> {
        self.captures
            .as_ref()
            .and_then(|captures| captures.name(name))
            .map(|m| m.as_str())
    }

    pub fn len(&self) -> usize {
        self.captures.as_ref().map(Captures::len).unwrap_or(1)
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub enum RuleBody {
    Static(Vec<CssValue>),
    Dynamic(RuleFn),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleMeta {
    /// Excluded from direct matching; only shortcut expansions reach it.
    pub internal: bool,
    pub layer: Option<String>,
    pub sort: Option<i32>,
    pub no_merge: bool,
}

#[derive(Clone)]
pub struct Rule {
    pub matcher: Matcher,
    pub body: RuleBody,
    pub meta: RuleMeta,
}

impl Rule {
    pub fn fixed(name: impl Into<String>, values: Vec<CssValue>) -> Self {
        Self {
            matcher: Matcher::Static(name.into()),
            body: RuleBody::Static(values),
            meta: RuleMeta::default(),
        }
    }

    pub fn pattern<F>(pattern: &str, handler: F) -> Result<Self>
    where
        F: Fn(&RuleMatch<'_>, &RuleContext<'_>) -> Option<Vec<CssValue>> + Send + Sync + 'static,
    {
        Ok(Self {
            matcher: Matcher::pattern(pattern)?,
            body: RuleBody::Dynamic(Arc::new(handler)),
            meta: RuleMeta::default(),
        })
    }

    pub fn with_meta(mut self, meta: RuleMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn internal(mut self) -> Self {
        self.meta.internal = true;
        self
    }

    pub fn layer(mut self, layer: impl Into<String>) -> Self {
        self.meta.layer = Some(layer.into());
        self
    }

    fn apply(&self, matched: &RuleMatch<'_>, ctx: &RuleContext<'_>) -> Option<Vec<CssValue>> {
        match &self.body {
            RuleBody::Static(values) => Some(values.clone()),
            RuleBody::Dynamic(handler) => handler(matched, ctx),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("matcher", &self.matcher)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Read-only view handed to rule and shortcut handlers.
pub struct RuleContext<'a> {
    /// The token as submitted.
    pub raw: &'a str,
    /// What is left after variants were peeled.
    pub current: &'a str,
    pub theme: &'a Theme,
    pub variant: &'a MatchContext,
    strict_theme: bool,
    missing: RefCell<Vec<String>>,
}

impl<'a> RuleContext<'a> {
    pub fn new(
        raw: &'a str,
        current: &'a str,
        theme: &'a Theme,
        variant: &'a MatchContext,
        strict_theme: bool,
    ) -> Self {
        Self {
            raw,
            current,
            theme,
            variant,
            strict_theme,
            missing: RefCell::new(Vec::new()),
        }
    }

    /// Theme lookup by dotted path. Misses are remembered so strict mode
    /// can report them when no rule ends up matching.
    pub fn theme(&self, path: &str) -> Option<String> {
        let found = self.theme.resolve(path);
        if found.is_none() {
            self.missing.borrow_mut().push(path.to_string());
        }
        found
    }

    pub fn theme_dashed(&self, namespace: &str, key: &str) -> Option<String> {
        let found = self.theme.resolve_dashed(namespace, key);
        if found.is_none() {
            self.missing
                .borrow_mut()
                .push(format!("{}.{}", namespace, key));
        }
        found
    }

    pub fn variant_names(&self) -> &[String] {
        &self.variant.variants
    }

    pub fn strict_theme(&self) -> bool {
        self.strict_theme
    }

    /// Renders entries as a full rule for the current selector and parents.
    pub fn construct_css(&self, entries: &[CssEntry]) -> String {
        let normalized = normalize_entries(entries, self.variant.important);
        render_rule(
            &self.variant.full_selector(),
            &normalized,
            self.variant.parent().as_deref(),
            true,
        )
    }

    fn take_missing(&self) -> Vec<String> {
        std::mem::take(&mut *self.missing.borrow_mut())
    }
}

/// The rule list split for lookup: exact names in a table, patterns in
/// declaration order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    static_rules: HashMap<String, usize>,
    dynamic_rules: Vec<usize>,
}

/// The winning rule for one remainder.
#[derive(Debug, Clone)]
pub struct RuleHit<'r> {
    pub index: usize,
    pub rule: &'r Rule,
    pub values: Vec<CssValue>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut static_rules = HashMap::new();
        let mut dynamic_rules = Vec::new();
        for (idx, rule) in rules.iter().enumerate() {
            match &rule.matcher {
                Matcher::Static(name) => {
                    static_rules.insert(name.clone(), idx);
                }
                Matcher::Pattern(_) => dynamic_rules.push(idx),
            }
        }
        Self {
            rules,
            static_rules,
            dynamic_rules,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn static_count(&self) -> usize {
        self.static_rules.len()
    }

    /// Finds the first rule producing output for `ctx.current`.
    ///
    /// A handler returning `None` passes the remainder on to the next
    /// pattern. In strict theme mode a theme miss is reported only when no
    /// later rule matched.
    pub fn match_rules<'r>(
        &'r self,
        ctx: &RuleContext<'_>,
        allow_internal: bool,
    ) -> Result<Option<RuleHit<'r>>> {
        let current = ctx.current;

        if let Some(&idx) = self.static_rules.get(current) {
            let rule = &self.rules[idx];
            if allow_internal || !rule.meta.internal {
                if let Some(matched) = rule.matcher.matches(current) {
                    if let Some(values) = rule.apply(&matched, ctx) {
                        trace!(token = ctx.raw, rule = idx, "static rule matched");
                        return Ok(Some(RuleHit {
                            index: idx,
                            rule,
                            values,
                        }));
                    }
                }
            }
        }

        let mut first_missing = None;
        for &idx in &self.dynamic_rules {
            let rule = &self.rules[idx];
            if rule.meta.internal && !allow_internal {
                continue;
            }
            let Some(matched) = rule.matcher.matches(current) else {
                continue;
            };
            match rule.apply(&matched, ctx) {
                Some(values) => {
                    trace!(token = ctx.raw, rule = idx, "pattern rule matched");
                    ctx.take_missing();
                    return Ok(Some(RuleHit {
                        index: idx,
                        rule,
                        values,
                    }));
                }
                None => {
                    let missing = ctx.take_missing();
                    if first_missing.is_none() {
                        first_missing = missing.into_iter().next();
                    }
                }
            }
        }

        if ctx.strict_theme {
            if let Some(key) = first_missing {
                return Err(Error::MissingThemeKey {
                    token: ctx.raw.to_string(),
                    key,
                });
            }
        }
        Ok(None)
    }
}
