use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::rule::{Matcher, RuleContext, RuleMatch};
use crate::types::CssValue;

/// Layer shortcut output lands in unless the shortcut names another.
pub const SHORTCUTS_LAYER: &str = "shortcuts";

pub type ShortcutFn =
    Arc<dyn Fn(&RuleMatch<'_>, &RuleContext<'_>) -> Option<ShortcutValue> + Send + Sync>;

/// What a shortcut expands to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShortcutValue {
    /// Token lists; each entry may hold several whitespace separated tokens
    /// and variant groups.
    Tokens(Vec<String>),
    Css(Vec<CssValue>),
}

#[derive(Clone)]
pub enum ShortcutBody {
    Value(ShortcutValue),
    Dynamic(ShortcutFn),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShortcutMeta {
    pub layer: Option<String>,
    pub no_merge: bool,
}

#[derive(Clone)]
pub struct Shortcut {
    pub matcher: Matcher,
    pub body: ShortcutBody,
    pub meta: ShortcutMeta,
}

impl fmt::Debug for Shortcut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shortcut")
            .field("matcher", &self.matcher)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl Shortcut {
    /// `name` expands to the whitespace separated `tokens`.
    pub fn new(name: impl Into<String>, tokens: impl Into<String>) -> Self {
        Self::list(name, vec![tokens.into()])
    }

    pub fn list(name: impl Into<String>, tokens: Vec<String>) -> Self {
        Self {
            matcher: Matcher::Static(name.into()),
            body: ShortcutBody::Value(ShortcutValue::Tokens(tokens)),
            meta: ShortcutMeta::default(),
        }
    }

    pub fn css(name: impl Into<String>, values: Vec<CssValue>) -> Self {
        Self {
            matcher: Matcher::Static(name.into()),
            body: ShortcutBody::Value(ShortcutValue::Css(values)),
            meta: ShortcutMeta::default(),
        }
    }

    pub fn pattern<F>(pattern: &str, handler: F) -> Result<Self>
    where
        F: Fn(&RuleMatch<'_>, &RuleContext<'_>) -> Option<ShortcutValue> + Send + Sync + 'static,
    {
        Ok(Self {
            matcher: Matcher::pattern(pattern)?,
            body: ShortcutBody::Dynamic(Arc::new(handler)),
            meta: ShortcutMeta::default(),
        })
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.meta.layer = Some(layer.into());
        self
    }

    pub fn no_merge(mut self) -> Self {
        self.meta.no_merge = true;
        self
    }

    pub fn name(&self) -> &str {
        self.matcher.describe()
    }

    pub fn layer(&self) -> &str {
        self.meta.layer.as_deref().unwrap_or(SHORTCUTS_LAYER)
    }

    fn expand(&self, matched: &RuleMatch<'_>, ctx: &RuleContext<'_>) -> Option<ShortcutValue> {
        match &self.body {
            ShortcutBody::Value(value) => Some(value.clone()),
            ShortcutBody::Dynamic(handler) => handler(matched, ctx),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShortcutHit<'s> {
    pub index: usize,
    pub shortcut: &'s Shortcut,
    pub value: ShortcutValue,
}

#[derive(Debug, Clone, Default)]
pub struct ShortcutSet {
    shortcuts: Vec<Shortcut>,
    static_shortcuts: HashMap<String, usize>,
    dynamic_shortcuts: Vec<usize>,
}

impl ShortcutSet {
    pub fn new(shortcuts: Vec<Shortcut>) -> Self {
        let mut static_shortcuts = HashMap::new();
        let mut dynamic_shortcuts = Vec::new();
        for (idx, shortcut) in shortcuts.iter().enumerate() {
            match &shortcut.matcher {
                Matcher::Static(name) => {
                    static_shortcuts.insert(name.clone(), idx);
                }
                Matcher::Pattern(_) => dynamic_shortcuts.push(idx),
            }
        }
        Self {
            shortcuts,
            static_shortcuts,
            dynamic_shortcuts,
        }
    }

    pub fn len(&self) -> usize {
        self.shortcuts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shortcuts.is_empty()
    }

    pub fn shortcuts(&self) -> &[Shortcut] {
        &self.shortcuts
    }

    /// One expansion step for `ctx.current`: the static table first, then
    /// patterns in declaration order.
    pub fn find<'s>(&'s self, ctx: &RuleContext<'_>) -> Option<ShortcutHit<'s>> {
        let current = ctx.current;
        let candidates = self
            .static_shortcuts
            .get(current)
            .into_iter()
            .chain(self.dynamic_shortcuts.iter());

        for &idx in candidates {
            let shortcut = &self.shortcuts[idx];
            let Some(matched) = shortcut.matcher.matches(current) else {
                continue;
            };
            if let Some(value) = shortcut.expand(&matched, ctx) {
                trace!(token = ctx.raw, shortcut = shortcut.name(), "shortcut matched");
                return Some(ShortcutHit {
                    index: idx,
                    shortcut,
                    value,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{SHORTCUTS_LAYER, Shortcut, ShortcutSet, ShortcutValue};
    use crate::rule::RuleContext;
    use crate::theme::Theme;
    use crate::types::{MatchContext, css};

    fn set() -> ShortcutSet {
        ShortcutSet::new(vec![
            Shortcut::new("btn", "px-4 py-1 rounded"),
            Shortcut::css("card", css([("border-radius", "8px")])).with_layer("components"),
            Shortcut::pattern(r"^btn-(\w+)$", |m, _| {
                let color = m.get(1)?;
                (color != "none").then(|| {
                    ShortcutValue::Tokens(vec![format!("btn bg-{}-500", color)])
                })
            })
            .expect("pattern"),
        ])
    }

    fn find(set: &ShortcutSet, token: &str) -> Option<(usize, ShortcutValue)> {
        let theme = Theme::new();
        let variant = MatchContext::for_token(token);
        let ctx = RuleContext::new(token, token, &theme, &variant, false);
        set.find(&ctx).map(|hit| (hit.index, hit.value))
    }

    #[test]
    fn expands_static_names() {
        let (idx, value) = find(&set(), "btn").expect("btn");
        assert_eq!(idx, 0);
        assert_eq!(value, ShortcutValue::Tokens(vec!["px-4 py-1 rounded".into()]));
    }

    #[test]
    fn expands_patterns_and_falls_through() {
        let (idx, value) = find(&set(), "btn-red").expect("btn-red");
        assert_eq!(idx, 2);
        assert_eq!(value, ShortcutValue::Tokens(vec!["btn bg-red-500".into()]));
        assert!(find(&set(), "btn-none").is_none());
        assert!(find(&set(), "link").is_none());
    }

    #[test]
    fn defaults_to_shortcuts_layer() {
        let set = set();
        assert_eq!(set.shortcuts()[0].layer(), SHORTCUTS_LAYER);
        assert_eq!(set.shortcuts()[1].layer(), "components");
    }
}
