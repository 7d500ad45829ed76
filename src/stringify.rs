use crate::types::{CssEntries, CssEntry, PARENT_JOINER};

const IMPORTANT: &str = " !important";

pub fn escape_selector(class: &str) -> String {
    let mut escaped = String::with_capacity(class.len() * 2);

    for (idx, ch) in class.chars().enumerate() {
        match ch {
            '0'..='9' if idx == 0 => {
                escaped.push_str(&format!("\\3{} ", ch));
            }
            '-' if idx == 0 && class.len() == 1 => escaped.push_str("\\-"),
            '\\' => escaped.push_str("\\\\"),
            ' ' => escaped.push_str("\\ "),
            ':' | '/' | '[' | ']' | '(' | ')' | '&' | '>' | '<' | '+' | '~' | ',' | '%'
            | '=' | '!' | '*' | '@' | '#' | '\'' | '"' | '.' | '$' | '^' | '|' | '{' | '}'
            | '?' | ';' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            _ => escaped.push(ch),
        }
    }

    escaped
}

/// Drops empty declarations and applies the important flag.
pub fn normalize_entries(entries: &[CssEntry], important: bool) -> CssEntries {
    entries
        .iter()
        .filter(|(key, value)| !key.trim().is_empty() && !value.trim().is_empty())
        .map(|(key, value)| {
            let value = value.trim();
            let value = if important && !value.ends_with("!important") {
                format!("{}{}", value, IMPORTANT)
            } else {
                value.to_string()
            };
            (key.trim().to_string(), value)
        })
        .collect()
}

/// Declarations in minified form: `a:b;c:d`.
pub fn entries_to_css(entries: &[CssEntry]) -> String {
    entries
        .iter()
        .map(|(key, value)| format!("{}:{}", key, value))
        .collect::<Vec<_>>()
        .join(";")
}

/// Renders one rule, nested inside its parents.
pub fn render_rule(
    selector: &str,
    entries: &[CssEntry],
    parent: Option<&str>,
    minify: bool,
) -> String {
    let rule = if minify {
        format!("{}{{{}}}", selector, entries_to_css(entries))
    } else {
        let body = entries
            .iter()
            .map(|(key, value)| format!("  {}: {};", key, value))
            .collect::<Vec<_>>()
            .join("\n");
        format!("{} {{\n{}\n}}", selector, body)
    };
    wrap_parents(&rule, parent, minify)
}

pub fn wrap_parents(css: &str, parent: Option<&str>, minify: bool) -> String {
    let Some(parent) = parent else {
        return css.to_string();
    };
    parent
        .rsplit(PARENT_JOINER)
        .fold(css.to_string(), |inner, wrapper| wrap_rule(wrapper, &inner, minify))
}

fn wrap_rule(wrapper: &str, rule: &str, minify: bool) -> String {
    if minify {
        format!("{}{{{}}}", wrapper, rule)
    } else {
        format!("{} {{\n{}\n}}", wrapper, indent_css_block(rule, 2))
    }
}

pub fn indent_css_block(css: &str, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    css.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{}{}", pad, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapses formatting whitespace of raw CSS for minified output.
pub fn minify_raw(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for ch in css.chars() {
        if let Some(active) = quote {
            out.push(ch);
            if ch == active {
                quote = None;
            }
            continue;
        }
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            let prev = out.chars().last();
            let glue = matches!(ch, '{' | '}' | ';' | ':' | ',')
                || matches!(prev, Some('{' | '}' | ';' | ':' | ',') | None);
            if !glue {
                out.push(' ');
            }
            pending_space = false;
        }
        if ch == '"' || ch == '\'' {
            quote = Some(ch);
        }
        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::{
        entries_to_css, escape_selector, minify_raw, normalize_entries, render_rule, wrap_parents,
    };
    use crate::types::entries;
    use pretty_assertions::assert_eq;

    #[test]
    fn escapes_special_characters() {
        assert_eq!(escape_selector("sm:p-4"), r"sm\:p-4");
        assert_eq!(escape_selector("w-1/2"), r"w-1\/2");
        assert_eq!(escape_selector("w-[10px]"), r"w-\[10px\]");
        assert_eq!(escape_selector("2xl:p-1"), r"\32 xl\:p-1");
        assert_eq!(escape_selector("!p-4"), r"\!p-4");
    }

    #[test]
    fn applies_important_and_drops_empty() {
        let normalized = normalize_entries(
            &entries([("color", "red"), ("margin", " "), ("padding", "1rem !important")]),
            true,
        );
        assert_eq!(
            normalized,
            entries([("color", "red !important"), ("padding", "1rem !important")])
        );
    }

    #[test]
    fn renders_pretty_and_minified() {
        let body = entries([("padding", "1rem"), ("margin", "0")]);
        assert_eq!(entries_to_css(&body), "padding:1rem;margin:0");
        assert_eq!(
            render_rule(".p-4", &body, None, false),
            ".p-4 {\n  padding: 1rem;\n  margin: 0;\n}"
        );
        assert_eq!(
            render_rule(".p-4", &body, Some("@media (min-width: 640px)"), true),
            "@media (min-width: 640px){.p-4{padding:1rem;margin:0}}"
        );
    }

    #[test]
    fn nests_chained_parents() {
        let body = entries([("color", "red")]);
        assert_eq!(
            render_rule(".a", &body, Some("@media x $$ @supports y"), false),
            "@media x {\n  @supports y {\n    .a {\n      color: red;\n    }\n  }\n}"
        );
    }

    #[test]
    fn wraps_outermost_parent_first() {
        assert_eq!(
            wrap_parents(".a{color:red}", Some("@media x $$ @supports y $$ @layer z"), true),
            "@media x{@supports y{@layer z{.a{color:red}}}}"
        );
        assert_eq!(wrap_parents(".a{}", None, true), ".a{}");
    }

    #[test]
    fn minifies_raw_css() {
        assert_eq!(
            minify_raw("@keyframes spin {\n  from { transform: rotate(0deg); }\n}"),
            "@keyframes spin{from{transform:rotate(0deg);}}"
        );
        assert_eq!(minify_raw("a { content: \"x  y\"; }"), "a{content:\"x  y\";}");
    }
}
