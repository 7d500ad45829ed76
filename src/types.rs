/// Separator placed between chained parents (`@media a $$ @supports b`).
pub const PARENT_JOINER: &str = " $$ ";

pub type CssEntry = (String, String);
pub type CssEntries = Vec<CssEntry>;

/// Builds an ordered entry list from property/value pairs.
pub fn entries<I, K, V>(pairs: I) -> CssEntries
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

/// Shorthand for a handler result holding a single declaration block.
pub fn css<I, K, V>(pairs: I) -> Vec<CssValue>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    vec![CssValue::Block(CssBlock::new(entries(pairs)))]
}

/// One declaration block emitted by a rule handler.
///
/// `selector` is a template in which `&` stands for the selector built for
/// the token, so a handler can target `& > *` or `&::placeholder`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CssBlock {
    pub entries: CssEntries,
    pub selector: Option<String>,
    pub parent: Option<String>,
    pub layer: Option<String>,
    pub sort: Option<i32>,
    pub no_merge: bool,
}

impl CssBlock {
    pub fn new(entries: CssEntries) -> Self {
        Self {
            entries,
            ..Self::default()
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    pub fn with_sort(mut self, sort: i32) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn no_merge(mut self) -> Self {
        self.no_merge = true;
        self
    }
}

/// A single item produced by a rule or shortcut.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CssValue {
    Block(CssBlock),
    /// Raw CSS spliced into the output verbatim, e.g. an `@keyframes` body.
    Raw(String),
}

impl From<CssBlock> for CssValue {
    fn from(block: CssBlock) -> Self {
        CssValue::Block(block)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtilBody {
    Declarations(CssEntries),
    Raw(String),
}

/// The compiled form of one token (one element per emitted block).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUtil {
    pub token: String,
    /// Declaration index of the winning rule or shortcut. Primary sort key.
    pub order: usize,
    /// Position inside a shortcut expansion.
    pub sub_order: usize,
    pub sort: i32,
    /// Final selector. Empty for raw CSS.
    pub selector: String,
    pub body: UtilBody,
    pub parent: Option<String>,
    pub parent_order: i32,
    pub layer: String,
    pub no_merge: bool,
}

impl CompiledUtil {
    pub fn is_raw(&self) -> bool {
        matches!(self.body, UtilBody::Raw(_))
    }

    pub fn declarations(&self) -> &[CssEntry] {
        match &self.body {
            UtilBody::Declarations(entries) => entries,
            UtilBody::Raw(_) => &[],
        }
    }

    /// Merge key: utils with equal keys can share one block.
    pub fn merge_key(&self) -> Option<(&str, Option<&str>, &str)> {
        if self.no_merge || self.is_raw() {
            return None;
        }
        Some((&self.selector, self.parent.as_deref(), &self.layer))
    }
}

/// Accumulator threaded through the variant pipeline into rule matching.
///
/// Variant handlers never mutate a context in place; every `with_*` method
/// returns a new value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchContext {
    /// Compound selector for the token, without pseudo suffixes.
    pub selector: String,
    /// Pseudo-class and pseudo-element suffix, pseudo-elements last.
    pub pseudo: String,
    /// Wrapping constructs, outermost first.
    pub parents: Vec<String>,
    pub parent_order: i32,
    pub sort: i32,
    pub no_merge: bool,
    /// Scratch selector set by relational variants before composing.
    pub prefix: String,
    pub layer: Option<String>,
    pub important: bool,
    /// Names of the variants applied so far, in application order.
    pub variants: Vec<String>,
}

impl MatchContext {
    pub fn for_token(raw: &str) -> Self {
        Self {
            selector: format!(".{}", crate::stringify::escape_selector(raw)),
            ..Self::default()
        }
    }

    /// Selector with the pseudo suffix applied.
    pub fn full_selector(&self) -> String {
        format!("{}{}", self.selector, self.pseudo)
    }

    /// Parents joined with [`PARENT_JOINER`], if any.
    pub fn parent(&self) -> Option<String> {
        if self.parents.is_empty() {
            None
        } else {
            Some(self.parents.join(PARENT_JOINER))
        }
    }

    /// Appends a pseudo-class or pseudo-element. Pseudo-classes are kept in
    /// front of any pseudo-element already present.
    pub fn with_pseudo(&self, pseudo: &str) -> Self {
        let mut next = self.clone();
        if pseudo.starts_with("::") {
            next.pseudo.push_str(pseudo);
        } else if let Some(idx) = next.pseudo.find("::") {
            next.pseudo.insert_str(idx, pseudo);
        } else {
            next.pseudo.push_str(pseudo);
        }
        next
    }

    /// Rewrites the selector with a template where `&` is the current one.
    pub fn with_selector(&self, template: &str) -> Self {
        let mut next = self.clone();
        next.selector = if template.contains('&') {
            template.replace('&', &self.selector)
        } else {
            format!("{} {}", template, self.selector)
        };
        next
    }

    pub fn with_parent(&self, parent: &str, order: i32) -> Self {
        let mut next = self.clone();
        next.parents.push(parent.to_string());
        next.parent_order = next.parent_order.max(order);
        next
    }

    pub fn with_sort(&self, sort: i32) -> Self {
        let mut next = self.clone();
        next.sort += sort;
        next
    }

    pub fn with_variant(mut self, name: &str) -> Self {
        self.variants.push(name.to_string());
        self
    }
}
