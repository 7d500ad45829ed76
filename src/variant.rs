use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::bracket::get_bracket;
use crate::theme::Theme;
use crate::types::MatchContext;

/// Upper bound on peel steps for one token, across all fan-out branches.
pub const MAX_VARIANT_STEPS: usize = 500;

pub type VariantFn =
    Arc<dyn Fn(&str, &MatchContext, &VariantEnv<'_>) -> Option<VariantApplied> + Send + Sync>;

/// Known pseudo-classes, in the order their rules are emitted.
pub const PSEUDO_CLASSES: &[(&str, &str)] = &[
    ("first", ":first-child"),
    ("last", ":last-child"),
    ("only", ":only-child"),
    ("odd", ":nth-child(odd)"),
    ("even", ":nth-child(even)"),
    ("visited", ":visited"),
    ("checked", ":checked"),
    ("focus-within", ":focus-within"),
    ("hover", ":hover"),
    ("focus", ":focus"),
    ("focus-visible", ":focus-visible"),
    ("active", ":active"),
    ("enabled", ":enabled"),
    ("disabled", ":disabled"),
    ("required", ":required"),
    ("invalid", ":invalid"),
    ("empty", ":empty"),
];

pub const PSEUDO_ELEMENTS: &[(&str, &str)] = &[
    ("before", "::before"),
    ("after", "::after"),
    ("placeholder", "::placeholder"),
    ("marker", "::marker"),
    ("file", "::file-selector-button"),
    ("first-line", "::first-line"),
    ("first-letter", "::first-letter"),
];

pub fn pseudo_class(name: &str) -> Option<&'static str> {
    PSEUDO_CLASSES
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, pseudo)| *pseudo)
}

/// What a variant handler hands back: the new remainder and one context per
/// fan-out branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantApplied {
    pub rest: String,
    pub contexts: Vec<MatchContext>,
}

impl VariantApplied {
    pub fn single(rest: impl Into<String>, context: MatchContext) -> Self {
        Self {
            rest: rest.into(),
            contexts: vec![context],
        }
    }
}

/// Read-only data available to variant handlers.
pub struct VariantEnv<'a> {
    pub theme: &'a Theme,
    pub separators: &'a [String],
}

impl<'a> VariantEnv<'a> {
    /// Strips `prefix` plus one separator off `input`, leaving a non-empty
    /// remainder.
    pub fn strip<'i>(&self, input: &'i str, prefix: &str) -> Option<&'i str> {
        let after = input.strip_prefix(prefix)?;
        self.strip_separator(after)
    }

    pub fn strip_separator<'i>(&self, input: &'i str) -> Option<&'i str> {
        self.separators.iter().find_map(|separator| {
            input
                .strip_prefix(separator.as_str())
                .filter(|rest| !rest.is_empty())
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantMeta {
    /// Variants are stably sorted by this before matching.
    pub order: i32,
    /// May apply again to the same token after it already succeeded.
    pub multi_pass: bool,
    /// Added to the context sort key.
    pub sort: i32,
}

#[derive(Clone)]
pub struct Variant {
    pub name: String,
    pub handler: VariantFn,
    pub meta: VariantMeta,
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variant")
            .field("name", &self.name)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Relationship between the marker element and the target of a relational
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// `group-*`: target is a descendant of the marker.
    Descendant,
    /// `peer-*`: target is a later sibling of the marker.
    Sibling,
    /// `parent-*`: target is a direct child of the marker.
    Child,
    /// `previous-*`: target directly follows the marker.
    Adjacent,
}

impl Relation {
    fn combinator(self) -> &'static str {
        match self {
            Relation::Descendant => " ",
            Relation::Sibling => " ~ ",
            Relation::Child => " > ",
            Relation::Adjacent => " + ",
        }
    }
}

impl Variant {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, &MatchContext, &VariantEnv<'_>) -> Option<VariantApplied>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            meta: VariantMeta::default(),
        }
    }

    /// `name:` appends a pseudo-class or pseudo-element.
    pub fn pseudo(name: impl Into<String>, pseudo: impl Into<String>) -> Self {
        let name = name.into();
        let prefix = name.clone();
        let pseudo = pseudo.into();
        Self::new(name, move |input, ctx, env| {
            let rest = env.strip(input, &prefix)?;
            Some(VariantApplied::single(rest, ctx.with_pseudo(&pseudo)))
        })
    }

    /// `name:` wraps the rule in a parent such as a media query.
    pub fn parent(name: impl Into<String>, parent: impl Into<String>, order: i32) -> Self {
        let name = name.into();
        let prefix = name.clone();
        let parent = parent.into();
        Self::new(name, move |input, ctx, env| {
            let rest = env.strip(input, &prefix)?;
            Some(VariantApplied::single(rest, ctx.with_parent(&parent, order)))
        })
    }

    /// `name:` rewrites the selector through a template, `&` being the
    /// current selector (`.dark &`).
    pub fn selector(name: impl Into<String>, template: impl Into<String>) -> Self {
        let name = name.into();
        let prefix = name.clone();
        let template = template.into();
        Self::new(name, move |input, ctx, env| {
            let rest = env.strip(input, &prefix)?;
            Some(VariantApplied::single(rest, ctx.with_selector(&template)))
        })
    }

    /// `name-<pseudo>:` targets elements related to a marker class, e.g.
    /// `group-hover:` or `peer-[.open]:`.
    pub fn relational(name: impl Into<String>, marker: impl Into<String>, relation: Relation) -> Self {
        let name = name.into();
        let prefix = format!("{}-", name);
        let marker = marker.into();
        Self::new(name, move |input, ctx, env| {
            let after = input.strip_prefix(&prefix)?;
            let (state, rest) = split_state(after, env)?;
            let mut next = ctx.clone();
            next.prefix = format!("{}{}", marker, state);
            let template = format!("{}{}&", next.prefix, relation.combinator());
            Some(VariantApplied::single(rest, next.with_selector(&template)))
        })
    }

    /// `[template]:` with an `&` selector template, or `[@rule]:` for an
    /// arbitrary parent. Underscores read as spaces.
    pub fn arbitrary() -> Self {
        Self::new("arbitrary", |input, ctx, env| {
            let bracket = get_bracket(input, '[', ']')?;
            if !bracket.before.is_empty() {
                return None;
            }
            let rest = env.strip_separator(bracket.rest)?;
            let inner = bracket.inner().replace('_', " ");
            if inner.trim().is_empty() {
                return None;
            }
            let next = if inner.starts_with('@') {
                ctx.with_parent(&inner, 0)
            } else if inner.contains('&') {
                ctx.with_selector(&inner)
            } else {
                return None;
            };
            Some(VariantApplied::single(rest, next))
        })
    }

    /// One pseudo variant per known pseudo-class and pseudo-element. Pseudo
    /// classes carry a sort key equal to their table position.
    pub fn pseudo_variants() -> Vec<Variant> {
        let classes = PSEUDO_CLASSES
            .iter()
            .enumerate()
            .map(|(idx, (name, pseudo))| Variant::pseudo(*name, *pseudo).with_sort(idx as i32 + 1));
        let elements = PSEUDO_ELEMENTS
            .iter()
            .map(|(name, pseudo)| Variant::pseudo(*name, *pseudo));
        let mut variants = classes.chain(elements).collect::<Vec<_>>();
        // `first-letter` must be tried before `first` when `-` separates.
        variants.sort_by_key(|variant| std::cmp::Reverse(variant.name.len()));
        variants
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.meta.order = order;
        self
    }

    pub fn with_sort(mut self, sort: i32) -> Self {
        self.meta.sort = sort;
        self
    }

    pub fn multi_pass(mut self) -> Self {
        self.meta.multi_pass = true;
        self
    }
}

fn split_state<'i>(after: &'i str, env: &VariantEnv<'_>) -> Option<(String, &'i str)> {
    if after.starts_with('[') {
        let bracket = get_bracket(after, '[', ']')?;
        let rest = env.strip_separator(bracket.rest)?;
        let state = bracket.inner().replace('_', " ");
        let state = if state.starts_with(':') || state.starts_with('.') || state.starts_with('[') {
            state
        } else {
            format!(":{}", state)
        };
        return Some((state, rest));
    }

    // Longest pseudo name first so `focus-within` wins over `focus`.
    let mut candidates = PSEUDO_CLASSES.iter().collect::<Vec<_>>();
    candidates.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));
    candidates.into_iter().find_map(|(name, pseudo)| {
        let rest = env.strip(after, name)?;
        Some((pseudo.to_string(), rest))
    })
}

/// One fully peeled compilation branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantBranch {
    pub rest: String,
    pub context: MatchContext,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeelResult {
    pub branches: Vec<VariantBranch>,
    /// Set when an intermediate remainder hit the blocklist.
    pub blocked: Option<String>,
}

struct Pending {
    rest: String,
    context: MatchContext,
    applied: Vec<(usize, String)>,
}

/// Peels variants off `current` until none applies.
///
/// Every non multi-pass variant applies at most once per branch; a
/// multi-pass variant is never re-applied to the same remainder. Fan-out
/// branches are processed in the order the handler returned them.
pub fn peel_variants(
    raw: &str,
    current: &str,
    start: MatchContext,
    variants: &[Variant],
    env: &VariantEnv<'_>,
    is_blocked: &dyn Fn(&str) -> bool,
) -> PeelResult {
    let mut result = PeelResult::default();
    let mut queue = VecDeque::from([Pending {
        rest: current.to_string(),
        context: start,
        applied: Vec::new(),
    }]);
    let mut steps = 0usize;

    while let Some(pending) = queue.pop_front() {
        steps += 1;
        if steps > MAX_VARIANT_STEPS {
            warn!(token = raw, "variant peeling exceeded {} steps", MAX_VARIANT_STEPS);
            result.branches.clear();
            return result;
        }

        let mut applied_any = false;
        for (idx, variant) in variants.iter().enumerate() {
            let seen = pending.applied.iter().any(|(applied, rest)| {
                *applied == idx && (!variant.meta.multi_pass || *rest == pending.rest)
            });
            if seen {
                continue;
            }
            let Some(applied) = (variant.handler)(&pending.rest, &pending.context, env) else {
                continue;
            };
            if applied.contexts.is_empty() || applied.rest.is_empty() {
                continue;
            }
            applied_any = true;
            trace!(token = raw, variant = %variant.name, rest = %applied.rest, "variant applied");

            if is_blocked(&applied.rest) {
                result.branches.clear();
                result.blocked = Some(applied.rest);
                return result;
            }

            let mut history = pending.applied.clone();
            history.push((idx, pending.rest.clone()));
            for context in applied.contexts {
                queue.push_back(Pending {
                    rest: applied.rest.clone(),
                    context: context
                        .with_sort(variant.meta.sort)
                        .with_variant(&variant.name),
                    applied: history.clone(),
                });
            }
            break;
        }

        if !applied_any {
            result.branches.push(VariantBranch {
                rest: pending.rest,
                context: pending.context,
            });
        }
    }

    result
}
