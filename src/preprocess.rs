use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::bracket::get_bracket;
use crate::error::{Error, Result};

/// Nesting depth up to which `a:(b c:(d e))` groups are expanded.
pub const MAX_GROUP_DEPTH: usize = 5;

/// Rewrites a token before matching. `None` leaves it unchanged, an empty
/// string drops it.
pub type PreprocessFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Expands variant-group shorthand in a whitespace separated list.
///
/// `hover:(p-1 m-2)` becomes `hover:p-1 hover:m-2`, `border-(~ red)`
/// becomes `border border-red`, and `!` in front of an item moves in front
/// of the whole expanded token.
pub fn expand_variant_group(input: &str, separators: &[String]) -> String {
    split_top_level(input)
        .into_iter()
        .flat_map(|word| expand_word(word, separators, MAX_GROUP_DEPTH))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Expands variant groups embedded in arbitrary source text, leaving
/// everything around the grouped words untouched.
pub fn expand_groups_in_source(code: &str, separators: &[String]) -> String {
    let mut out = String::with_capacity(code.len());
    let mut rest = code;

    'scan: loop {
        let mut word_start = 0;
        for (idx, ch) in rest.char_indices() {
            if is_source_boundary(ch) {
                word_start = idx + ch.len_utf8();
                continue;
            }
            if ch != '(' {
                continue;
            }
            let word = &rest[word_start..idx + 1];
            let Some(open) = group_start(word, separators) else {
                continue;
            };
            if word_start + open != idx {
                continue;
            }
            let Some(group) = get_bracket(&rest[idx..], '(', ')') else {
                continue;
            };
            let mut end = idx + group.matched.len();
            end += rest[end..]
                .find(is_source_boundary)
                .unwrap_or(rest.len() - end);

            out.push_str(&rest[..word_start]);
            out.push_str(&expand_variant_group(&rest[word_start..end], separators));
            rest = &rest[end..];
            continue 'scan;
        }
        out.push_str(rest);
        return out;
    }
}

fn is_source_boundary(ch: char) -> bool {
    ch.is_whitespace() || matches!(ch, '"' | '\'' | '`' | '<' | '{' | '}' | '=' | ';' | ',')
}

/// Whether `input` contains a group that [`expand_variant_group`] would
/// rewrite.
pub fn has_variant_group(input: &str, separators: &[String]) -> bool {
    split_top_level(input)
        .into_iter()
        .any(|word| group_start(word, separators).is_some())
}

fn expand_word(word: &str, separators: &[String], depth: usize) -> Vec<String> {
    if depth == 0 {
        return vec![word.to_string()];
    }
    let Some(open) = group_start(word, separators) else {
        return vec![word.to_string()];
    };
    let Some(group) = get_bracket(&word[open..], '(', ')') else {
        return vec![word.to_string()];
    };
    let prefix = &word[..open];
    let items = split_top_level(group.inner());
    if items.is_empty() {
        return vec![word.to_string()];
    }

    items
        .into_iter()
        .flat_map(|item| {
            let expanded = if item == "~" {
                let bare = separators
                    .iter()
                    .find_map(|separator| prefix.strip_suffix(separator.as_str()))
                    .unwrap_or(prefix);
                format!("{}{}", bare, group.rest)
            } else if let Some(item) = item.strip_prefix('!') {
                format!("!{}{}{}", prefix, item, group.rest)
            } else {
                format!("{}{}{}", prefix, item, group.rest)
            };
            expand_word(&expanded, separators, depth - 1)
        })
        .collect()
}

fn group_start(word: &str, separators: &[String]) -> Option<usize> {
    let mut square = 0usize;
    for (idx, ch) in word.char_indices() {
        match ch {
            '[' => square += 1,
            ']' => square = square.saturating_sub(1),
            '(' if square == 0 && idx > 0 => {
                let prefix = &word[..idx];
                let ends_with_separator = separators.iter().any(|separator| {
                    !separator.is_empty()
                        && prefix.len() > separator.len()
                        && prefix.ends_with(separator.as_str())
                });
                if ends_with_separator {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits on whitespace that is not nested in `()` or `[]`.
pub(crate) fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = None;

    for (idx, ch) in input.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            _ => {}
        }
        if ch.is_whitespace() && depth == 0 {
            if let Some(begin) = start.take() {
                parts.push(&input[begin..idx]);
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(begin) = start {
        parts.push(&input[begin..]);
    }
    parts
}

/// Runs the preprocess hooks in order. Returns `None` when a hook drops the
/// token.
pub fn run_preprocess(token: &str, hooks: &[PreprocessFn]) -> Option<String> {
    let mut current = token.to_string();
    for hook in hooks {
        if let Some(next) = hook(&current) {
            current = next;
        }
        if current.is_empty() {
            return None;
        }
    }
    Some(current)
}

/// Strips an important modifier written as `!p-4` or `p-4!`.
pub fn split_important(token: &str) -> (&str, bool) {
    if token.len() > 1 {
        if let Some(rest) = token.strip_prefix('!') {
            return (rest, true);
        }
        if let Some(rest) = token.strip_suffix('!') {
            return (rest, true);
        }
    }
    (token, false)
}

#[derive(Clone)]
pub enum BlockMatcher {
    Exact(String),
    Pattern(Regex),
}

impl fmt::Debug for BlockMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockMatcher::Exact(value) => f.debug_tuple("Exact").field(value).finish(),
            BlockMatcher::Pattern(regex) => f.debug_tuple("Pattern").field(&regex.as_str()).finish(),
        }
    }
}

impl fmt::Display for BlockMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockMatcher::Exact(value) => f.write_str(value),
            BlockMatcher::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

/// A blocklist pattern with an optional diagnostic message. `{token}` in the
/// message is replaced with the blocked token.
#[derive(Debug, Clone)]
pub struct BlocklistEntry {
    pub matcher: BlockMatcher,
    pub message: Option<String>,
}

impl BlocklistEntry {
    pub fn exact(token: impl Into<String>) -> Self {
        Self {
            matcher: BlockMatcher::Exact(token.into()),
            message: None,
        }
    }

    pub fn pattern(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|err| Error::pattern(pattern, err))?;
        Ok(Self {
            matcher: BlockMatcher::Pattern(regex),
            message: None,
        })
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn matches(&self, token: &str) -> bool {
        match &self.matcher {
            BlockMatcher::Exact(value) => value == token,
            BlockMatcher::Pattern(regex) => regex.is_match(token),
        }
    }

    pub fn render_message(&self, token: &str) -> Option<String> {
        self.message
            .as_ref()
            .map(|message| message.replace("{token}", token))
    }
}

/// A token suppressed by the blocklist.
#[derive(Debug, Clone)]
pub struct Blocked {
    pub token: String,
    pub entry: BlocklistEntry,
    pub message: Option<String>,
}

impl Blocked {
    pub fn new(token: &str, entry: &BlocklistEntry) -> Self {
        Self {
            token: token.to_string(),
            entry: entry.clone(),
            message: entry.render_message(token),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    entries: Vec<BlocklistEntry>,
}

impl Blocklist {
    pub fn new(entries: Vec<BlocklistEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BlocklistEntry] {
        &self.entries
    }

    pub fn find(&self, token: &str) -> Option<&BlocklistEntry> {
        self.entries.iter().find(|entry| entry.matches(token))
    }

    pub fn is_blocked(&self, token: &str) -> bool {
        self.find(token).is_some()
    }
}
