/// A balanced bracket found inside a larger string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bracket<'a> {
    /// The bracketed text, delimiters included.
    pub matched: &'a str,
    /// Everything after the closing delimiter.
    pub rest: &'a str,
    /// Everything before the opening delimiter.
    pub before: &'a str,
}

impl<'a> Bracket<'a> {
    /// The bracketed text without its delimiters.
    pub fn inner(&self) -> &'a str {
        let mut chars = self.matched.chars();
        chars.next();
        chars.next_back();
        chars.as_str()
    }
}

/// Finds the first balanced `open`..`close` run in `input`.
pub fn get_bracket(input: &str, open: char, close: char) -> Option<Bracket<'_>> {
    if input.is_empty() {
        return None;
    }

    let mut depth = 0usize;
    let mut open_at = None;

    for (idx, ch) in input.char_indices() {
        if ch == open {
            if open_at.is_none() {
                open_at = Some(idx);
            }
            depth += 1;
        } else if ch == close {
            if depth == 0 {
                return None;
            }
            depth -= 1;
            if depth == 0 {
                let start = open_at?;
                let end = idx + ch.len_utf8();
                return Some(Bracket {
                    matched: &input[start..end],
                    rest: &input[end..],
                    before: &input[..start],
                });
            }
        }
    }

    None
}

/// Splits `input` at the first top-level occurrence of any separator.
///
/// Returns the component and the remainder after the separator, or the whole
/// input and an empty remainder when no separator occurs at depth zero. A
/// separator at the very start or end of the input, or an unbalanced closing
/// delimiter, is "no match".
pub fn get_string_component<'a>(
    input: &'a str,
    open: char,
    close: char,
    separators: &[&str],
) -> Option<(&'a str, &'a str)> {
    if input.is_empty() || separators.is_empty() {
        return None;
    }

    let mut depth = 0usize;
    for (idx, ch) in input.char_indices() {
        if ch == open {
            depth += 1;
            continue;
        }
        if ch == close {
            if depth == 0 {
                return None;
            }
            depth -= 1;
            continue;
        }
        if depth > 0 {
            continue;
        }
        for separator in separators {
            if separator.is_empty() || !input[idx..].starts_with(separator) {
                continue;
            }
            if idx == 0 || idx + separator.len() == input.len() {
                return None;
            }
            return Some((&input[..idx], &input[idx + separator.len()..]));
        }
    }

    Some((input, ""))
}

/// Splits `input` into every top-level component, respecting `(`..`)`
/// nesting. Gives up after `limit` components.
pub fn get_string_components<'a>(
    input: &'a str,
    separators: &[&str],
    limit: usize,
) -> Option<Vec<&'a str>> {
    get_string_components_with(input, '(', ')', separators, limit)
}

pub fn get_string_components_with<'a>(
    input: &'a str,
    open: char,
    close: char,
    separators: &[&str],
    limit: usize,
) -> Option<Vec<&'a str>> {
    let mut components = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        if components.len() >= limit {
            return None;
        }
        let (component, next) = get_string_component(rest, open, close, separators)?;
        components.push(component);
        rest = next;
    }

    if components.is_empty() {
        None
    } else {
        Some(components)
    }
}

/// An arbitrary value written as `[hint:value]` or `[value]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbitraryValue {
    pub hint: Option<String>,
    pub value: String,
}

/// Decodes an arbitrary bracket value.
///
/// Underscores become spaces unless escaped as `\_`; an optional leading
/// `type:` hint is split off when it is a plain identifier.
pub fn arbitrary_value(input: &str) -> Option<ArbitraryValue> {
    let bracket = get_bracket(input, '[', ']')?;
    if !bracket.before.is_empty() || !bracket.rest.is_empty() {
        return None;
    }
    let inner = bracket.inner();
    if inner.trim().is_empty() {
        return None;
    }

    let (hint, raw) = match inner.split_once(':') {
        Some((hint, raw))
            if !hint.is_empty()
                && !raw.is_empty()
                && hint.chars().all(|ch| ch.is_ascii_alphabetic() || ch == '-') =>
        {
            (Some(hint.to_string()), raw)
        }
        _ => (None, inner),
    };

    Some(ArbitraryValue {
        hint,
        value: decode_underscores(raw),
    })
}

fn decode_underscores(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if chars.peek() == Some(&'_') => {
                out.push('_');
                chars.next();
            }
            '_' => out.push(' '),
            _ => out.push(ch),
        }
    }
    out
}
