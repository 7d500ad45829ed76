use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::preprocess::split_top_level;

/// A further source discovered while extracting, e.g. an imported file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractSource {
    pub id: Option<String>,
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub tokens: Vec<String>,
    /// Sources to run through the extractors in a later round.
    pub sources: Vec<ExtractSource>,
}

impl Extraction {
    pub fn tokens(tokens: Vec<String>) -> Self {
        Self {
            tokens,
            sources: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, code: &str, id: Option<&str>) -> Result<Extraction>;
}

/// Splits on whitespace, quotes, and statement punctuation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitExtractor;

#[async_trait]
impl Extractor for SplitExtractor {
    fn name(&self) -> &str {
        "split"
    }

    async fn extract(&self, code: &str, _id: Option<&str>) -> Result<Extraction> {
        Ok(Extraction::tokens(split_tokens(code)))
    }
}

pub fn split_tokens(code: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    code.split(|ch: char| ch.is_whitespace() || matches!(ch, '"' | '\'' | '`' | ';' | '{' | '}'))
        .map(|token| token.trim_start_matches(['\\', ':']))
        .filter(|token| is_valid_candidate(token))
        .filter(|token| seen.insert(token.to_string()))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Markup,
    Script,
    Markdown,
    Data,
    Other,
}

impl SourceKind {
    pub fn from_id(id: Option<&str>) -> Self {
        let ext = id
            .and_then(|id| id.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("html" | "htm" | "vue" | "svelte" | "astro") => SourceKind::Markup,
            Some("js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs") => SourceKind::Script,
            Some("md" | "mdx") => SourceKind::Markdown,
            Some("yaml" | "yml" | "toml" | "json") => SourceKind::Data,
            _ => SourceKind::Other,
        }
    }
}

/// Structure-aware extraction for markup, script, markdown and data files.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceExtractor;

#[async_trait]
impl Extractor for SourceExtractor {
    fn name(&self) -> &str {
        "source"
    }

    async fn extract(&self, code: &str, id: Option<&str>) -> Result<Extraction> {
        Ok(Extraction::tokens(extract_from_source(
            code,
            SourceKind::from_id(id),
        )))
    }
}

pub fn extract_from_source(code: &str, kind: SourceKind) -> Vec<String> {
    let candidates = match kind {
        SourceKind::Markup | SourceKind::Data => class_attributes(code),
        SourceKind::Script => {
            let mut candidates = string_literals(code);
            candidates.extend(class_helpers(code));
            candidates.extend(class_attributes(code));
            candidates
        }
        SourceKind::Markdown | SourceKind::Other => {
            let mut candidates = class_attributes(code);
            candidates.extend(string_literals(code));
            candidates
        }
    };

    let mut seen = HashSet::new();
    candidates
        .iter()
        .flat_map(|candidate| split_top_level(candidate.trim()))
        .filter(|token| is_valid_candidate(token))
        .filter(|token| seen.insert(token.to_string()))
        .map(str::to_string)
        .collect()
}

const CLASS_ATTRIBUTES: [&str; 5] = ["class", "className", "class:list", ":class", "v-bind:class"];
const CLASS_HELPERS: [&str; 4] = ["clsx", "classnames", "tw", "cva"];

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(text: &'a str, pos: usize) -> Self {
        Self { text, pos }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn quoted(&mut self, quote: char) -> String {
        let mut value = String::new();
        while let Some(ch) = self.bump() {
            if ch == '\\' {
                if let Some(next) = self.bump() {
                    value.push('\\');
                    value.push(next);
                }
                continue;
            }
            if ch == quote {
                break;
            }
            value.push(ch);
        }
        value
    }

    fn template(&mut self) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut current = String::new();
        while let Some(ch) = self.bump() {
            match ch {
                '`' => break,
                '\\' => {
                    if let Some(next) = self.bump() {
                        current.push('\\');
                        current.push(next);
                    }
                }
                '$' if self.peek() == Some('{') => {
                    self.bump();
                    if !current.is_empty() {
                        pieces.push(std::mem::take(&mut current));
                    }
                    self.balanced_tail('{', '}');
                }
                _ => current.push(ch),
            }
        }
        if !current.is_empty() {
            pieces.push(current);
        }
        pieces
    }

    fn skip_literal(&mut self) -> bool {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.bump();
                self.quoted(quote);
                true
            }
            Some('`') => {
                self.bump();
                self.template();
                true
            }
            _ => false,
        }
    }

    fn balanced(&mut self, open: char, close: char) -> &'a str {
        if self.peek() != Some(open) {
            return "";
        }
        self.bump();
        let start = self.pos;
        let end = self.balanced_tail(open, close);
        &self.text[start..end]
    }

    fn balanced_tail(&mut self, open: char, close: char) -> usize {
        let mut depth = 1usize;
        loop {
            if self.skip_literal() {
                continue;
            }
            let here = self.pos;
            let Some(ch) = self.bump() else {
                return self.text.len();
            };
            if ch == open {
                depth += 1;
            } else if ch == close {
                depth -= 1;
                if depth == 0 {
                    return here;
                }
            }
        }
    }
}

fn string_literals(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = Cursor::at(text, 0);
    while let Some(ch) = cursor.bump() {
        match ch {
            '"' | '\'' => {
                let value = cursor.quoted(ch);
                if !value.is_empty() {
                    out.push(value);
                }
            }
            '`' => out.extend(cursor.template()),
            _ => {}
        }
    }
    out
}

fn class_attributes(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for attr in CLASS_ATTRIBUTES {
        for (idx, _) in text.match_indices(attr) {
            if !has_boundaries(text, idx, attr.len(), is_attribute_char) {
                continue;
            }
            let mut cursor = Cursor::at(text, idx + attr.len());
            cursor.skip_whitespace();
            if cursor.bump() != Some('=') {
                continue;
            }
            cursor.skip_whitespace();
            match cursor.peek() {
                Some(quote @ ('"' | '\'')) => {
                    cursor.bump();
                    out.push(cursor.quoted(quote));
                }
                Some('{') => {
                    let inner = cursor.balanced('{', '}');
                    let mut values = string_literals(inner);
                    values.extend(object_keys(inner));
                    out.extend(values);
                }
                Some(_) => {
                    let start = cursor.pos;
                    while cursor
                        .peek()
                        .is_some_and(|ch| !ch.is_whitespace() && ch != '>')
                    {
                        cursor.bump();
                    }
                    out.push(text[start..cursor.pos].to_string());
                }
                None => {}
            }
        }
    }
    out
}

fn class_helpers(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for helper in CLASS_HELPERS {
        for (idx, _) in text.match_indices(helper) {
            if !has_boundaries(text, idx, helper.len(), is_identifier_char) {
                continue;
            }
            let mut cursor = Cursor::at(text, idx + helper.len());
            cursor.skip_whitespace();
            let args = cursor.balanced('(', ')');
            if !args.is_empty() {
                out.extend(string_literals(args));
                out.extend(object_keys(args));
            }
        }
    }
    out
}

fn object_keys(text: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut cursor = Cursor::at(text, 0);
    while cursor.peek().is_some() {
        if cursor.skip_literal() {
            continue;
        }
        if cursor.peek() == Some('{') {
            let body = cursor.balanced('{', '}');
            keys.extend(top_level_entries(body).into_iter().filter_map(object_key));
            continue;
        }
        cursor.bump();
    }
    keys
}

fn top_level_entries(body: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut cursor = Cursor::at(body, 0);
    let mut depth = 0usize;
    let mut start = 0;
    while cursor.peek().is_some() {
        if cursor.skip_literal() {
            continue;
        }
        match cursor.bump() {
            Some('{' | '[' | '(') => depth += 1,
            Some('}' | ']' | ')') => depth = depth.saturating_sub(1),
            Some(',') if depth == 0 => {
                entries.push(body[start..cursor.pos - 1].trim());
                start = cursor.pos;
            }
            _ => {}
        }
    }
    entries.push(body[start..].trim());
    entries.retain(|entry| !entry.is_empty());
    entries
}

fn object_key(entry: &str) -> Option<String> {
    if entry.starts_with("...") {
        return None;
    }
    let mut cursor = Cursor::at(entry, 0);
    let key = match cursor.peek()? {
        quote @ ('"' | '\'') => {
            cursor.bump();
            let key = cursor.quoted(quote);
            cursor.skip_whitespace();
            return (cursor.peek() == Some(':')).then_some(key);
        }
        ch if is_identifier_char(ch) => {
            let start = cursor.pos;
            while cursor.peek().is_some_and(is_identifier_char) {
                cursor.bump();
            }
            entry[start..cursor.pos].to_string()
        }
        _ => return None,
    };
    cursor.skip_whitespace();
    matches!(cursor.peek(), None | Some(':' | ',' | '}')).then_some(key)
}

fn has_boundaries(text: &str, idx: usize, len: usize, inner: fn(char) -> bool) -> bool {
    let prev = text[..idx].chars().next_back();
    let next = text[idx + len..].chars().next();
    prev.is_none_or(|ch| !inner(ch)) && next.is_none_or(|ch| !inner(ch) || ch == '=')
}

fn is_attribute_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}

fn is_identifier_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '$'
}

/// Whether `token` could be a utility: only class-safe characters, balanced
/// brackets, quotes only inside brackets, and at least one letter.
pub fn is_valid_candidate(token: &str) -> bool {
    if token.is_empty()
        || token.starts_with(['.', '/'])
        || token.ends_with([':', '\\'])
        || token.len() > 512
    {
        return false;
    }

    let mut has_letter = false;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (idx, ch) in token.chars().enumerate() {
        has_letter |= ch.is_ascii_alphabetic() || ch == '[';
        if !(ch.is_ascii_alphanumeric() || "-_/:.%#[]()!&>+,'\"\\~@*=$".contains(ch)) {
            return false;
        }
        if let Some(active) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == active {
                quote = None;
            }
            continue;
        }
        match ch {
            '[' | '(' => depth += 1,
            ']' | ')' => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            '\'' | '"' if depth > 0 => quote = Some(ch),
            '\'' | '"' | '>' | '&' | ',' | '=' | '*' | '~' | '@' | '$' if depth == 0 => {
                return false;
            }
            '!' if idx > 0 && depth == 0 && idx + 1 != token.len() => return false,
            _ => {}
        }
    }

    quote.is_none() && depth == 0 && has_letter
}
