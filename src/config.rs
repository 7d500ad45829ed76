use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::color::{color_to_string, opacity_to_alpha, parse_css_color};
use crate::error::{Error, Result};
use crate::preprocess::BlocklistEntry;
use crate::resolve::{Preflight, Preset, UserConfig};
use crate::rule::{Matcher, Rule, RuleBody, RuleContext, RuleFn, RuleMatch, RuleMeta};
use crate::shortcut::{Shortcut, ShortcutValue};
use crate::theme::Theme;
use crate::types::{CssBlock, CssValue};
use crate::variant::{Relation, Variant};

/// Conventional config file name looked up by the CLI.
pub const DEFAULT_CONFIG_FILE: &str = "atomframe.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    name: Option<String>,
    strict_theme: bool,
    extractor_timeout_ms: Option<u64>,
    theme: toml::Table,
    layers: BTreeMap<String, i32>,
    separators: Vec<String>,
    safelist: Vec<String>,
    rules: Vec<RuleDef>,
    variants: Vec<VariantDef>,
    shortcuts: Vec<ShortcutDef>,
    blocklist: Vec<BlockDef>,
    preflights: Vec<PreflightDef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RuleDef {
    #[serde(rename = "match")]
    exact: Option<String>,
    pattern: Option<String>,
    css: toml::Table,
    raw: Option<String>,
    selector: Option<String>,
    parent: Option<String>,
    layer: Option<String>,
    sort: Option<i32>,
    no_merge: bool,
    internal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum Builtin {
    Pseudo,
    Arbitrary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum RelationDef {
    Descendant,
    Sibling,
    Child,
    Adjacent,
}

impl From<RelationDef> for Relation {
    fn from(relation: RelationDef) -> Self {
        match relation {
            RelationDef::Descendant => Relation::Descendant,
            RelationDef::Sibling => Relation::Sibling,
            RelationDef::Child => Relation::Child,
            RelationDef::Adjacent => Relation::Adjacent,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct VariantDef {
    name: Option<String>,
    builtin: Option<Builtin>,
    pseudo: Option<String>,
    parent: Option<String>,
    parent_order: i32,
    selector: Option<String>,
    relational: Option<String>,
    relation: Option<RelationDef>,
    order: i32,
    sort: i32,
    multi_pass: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenList {
    One(String),
    Many(Vec<String>),
}

impl Default for TokenList {
    fn default() -> Self {
        TokenList::Many(Vec::new())
    }
}

impl TokenList {
    fn into_vec(self) -> Vec<String> {
        match self {
            TokenList::One(tokens) => vec![tokens],
            TokenList::Many(tokens) => tokens,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ShortcutDef {
    name: Option<String>,
    pattern: Option<String>,
    tokens: TokenList,
    layer: Option<String>,
    no_merge: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BlockDef {
    #[serde(rename = "match")]
    exact: Option<String>,
    pattern: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PreflightDef {
    css: String,
    layer: Option<String>,
}

/// Reads a config file into a user configuration whose `user` preset holds
/// everything the file declares.
pub fn load(path: &Path) -> Result<UserConfig> {
    let text = fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
    parse(&text, path)
}

/// Parses config text. `origin` only labels errors.
pub fn parse(text: &str, origin: &Path) -> Result<UserConfig> {
    let file: ConfigFile = toml::from_str(text).map_err(|err| Error::ConfigParse {
        path: origin.to_path_buf(),
        message: err.message().to_string(),
    })?;

    let strict_theme = file.strict_theme;
    let timeout = file.extractor_timeout_ms.map(Duration::from_millis);
    let preset = build_preset(file)?;
    debug!(
        path = %origin.display(),
        rules = preset.rules.len(),
        variants = preset.variants.len(),
        shortcuts = preset.shortcuts.len(),
        "config loaded"
    );

    let mut config = UserConfig::new(preset).strict_theme(strict_theme);
    if let Some(timeout) = timeout {
        config = config.extractor_timeout(timeout);
    }
    Ok(config)
}

fn build_preset(file: ConfigFile) -> Result<Preset> {
    let mut preset = Preset::new(file.name.unwrap_or_else(|| "config".to_string()))
        .theme(Theme::from_toml(file.theme))
        .separators(file.separators)
        .safelist(file.safelist);

    for (name, priority) in file.layers {
        preset = preset.layer(name, priority);
    }
    for def in file.rules {
        preset = preset.rule(build_rule(def)?);
    }
    for def in file.variants {
        preset = preset.variants(build_variants(def)?);
    }
    for def in file.shortcuts {
        preset = preset.shortcut(build_shortcut(def)?);
    }
    for def in file.blocklist {
        preset = preset.block(build_block(def)?);
    }
    for def in file.preflights {
        let mut preflight = Preflight::css(def.css);
        if let Some(layer) = def.layer {
            preflight = preflight.with_layer(layer);
        }
        preset = preset.preflight(preflight);
    }
    Ok(preset)
}

fn build_rule(def: RuleDef) -> Result<Rule> {
    let mut declarations = Vec::with_capacity(def.css.len());
    for (property, value) in &def.css {
        let value = match value {
            toml::Value::String(text) => text.clone(),
            toml::Value::Integer(number) => number.to_string(),
            toml::Value::Float(number) => number.to_string(),
            other => {
                return Err(Error::InvalidPreset(format!(
                    "rule property `{}` must be a string or number, found {}",
                    property,
                    other.type_str()
                )));
            }
        };
        declarations.push((property.clone(), value));
    }
    if declarations.is_empty() && def.raw.is_none() {
        return Err(Error::InvalidPreset(format!(
            "rule `{}` has neither `css` nor `raw`",
            def.exact.as_deref().or(def.pattern.as_deref()).unwrap_or_default()
        )));
    }

    let template = RuleTemplate {
        declarations,
        raw: def.raw,
        selector: def.selector,
        parent: def.parent,
    };
    let meta = RuleMeta {
        internal: def.internal,
        layer: def.layer,
        sort: def.sort,
        no_merge: def.no_merge,
    };

    let rule = match (def.exact, def.pattern) {
        (Some(name), None) => {
            let body: RuleFn = Arc::new(move |m, ctx| template.render(m, ctx));
            Rule {
                matcher: Matcher::Static(name),
                body: RuleBody::Dynamic(body),
                meta: RuleMeta::default(),
            }
        }
        (None, Some(pattern)) => Rule::pattern(&pattern, move |m, ctx| template.render(m, ctx))?,
        _ => {
            return Err(Error::InvalidPreset(
                "a rule needs exactly one of `match` or `pattern`".to_string(),
            ));
        }
    };
    Ok(rule.with_meta(meta))
}

#[derive(Debug, Clone)]
struct RuleTemplate {
    declarations: Vec<(String, String)>,
    raw: Option<String>,
    selector: Option<String>,
    parent: Option<String>,
}

impl RuleTemplate {
    fn render(&self, m: &RuleMatch<'_>, ctx: &RuleContext<'_>) -> Option<Vec<CssValue>> {
        let mut values = Vec::new();
        if let Some(raw) = &self.raw {
            values.push(CssValue::Raw(render_template(raw, m, ctx)?));
        }
        if !self.declarations.is_empty() {
            let mut entries = Vec::with_capacity(self.declarations.len());
            for (property, value) in &self.declarations {
                entries.push((property.clone(), render_template(value, m, ctx)?));
            }
            let mut block = CssBlock::new(entries);
            if let Some(selector) = &self.selector {
                block = block.with_selector(render_template(selector, m, ctx)?);
            }
            if let Some(parent) = &self.parent {
                block = block.with_parent(render_template(parent, m, ctx)?);
            }
            values.push(CssValue::Block(block));
        }
        Some(values)
    }
}

fn render_template(template: &str, m: &RuleMatch<'_>, ctx: &RuleContext<'_>) -> Option<String> {
    let substituted = substitute_captures(template, m);
    let mut out = String::with_capacity(substituted.len());
    let mut rest = substituted.as_str();

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Some(out);
        };
        let reference = &after[..end];
        match reference.split_once(':') {
            Some(("theme", path)) => out.push_str(&theme_lookup(path, ctx)?),
            Some(("color", path)) => out.push_str(&color_lookup(path, ctx)?),
            _ => {
                out.push('{');
                out.push_str(reference);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}

fn substitute_captures(template: &str, m: &RuleMatch<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '$' {
            if let Some(idx) = chars.peek().and_then(|next| next.to_digit(10)) {
                chars.next();
                out.push_str(m.get(idx as usize).unwrap_or_default());
                continue;
            }
        }
        out.push(ch);
    }
    out
}

fn theme_lookup(path: &str, ctx: &RuleContext<'_>) -> Option<String> {
    if let Some(found) = ctx.theme.resolve(path) {
        return Some(found);
    }
    match path.split_once('.') {
        Some((namespace, key)) => ctx.theme_dashed(namespace, key),
        None => ctx.theme(path),
    }
}

fn color_lookup(path: &str, ctx: &RuleContext<'_>) -> Option<String> {
    let color = theme_lookup(path, ctx)?;
    let opacity = ctx
        .current
        .rsplit_once('/')
        .map(|(_, opacity)| opacity)
        .filter(|opacity| !opacity.is_empty() && opacity.chars().all(|ch| ch.is_ascii_digit()));
    let Some(opacity) = opacity else {
        return Some(color);
    };
    let alpha = opacity_to_alpha(opacity)?;
    match parse_css_color(&color) {
        Some(parsed) => Some(color_to_string(&parsed, Some(alpha.as_str()))),
        None => Some(color),
    }
}

fn build_variants(def: VariantDef) -> Result<Vec<Variant>> {
    if let Some(builtin) = def.builtin {
        return Ok(match builtin {
            Builtin::Pseudo => Variant::pseudo_variants(),
            Builtin::Arbitrary => vec![Variant::arbitrary()],
        });
    }

    let Some(name) = def.name else {
        return Err(Error::InvalidPreset(
            "a variant needs a `name` or a `builtin`".to_string(),
        ));
    };
    let variant = match (def.pseudo, def.parent, def.selector, def.relational) {
        (Some(pseudo), None, None, None) => Variant::pseudo(name, pseudo),
        (None, Some(parent), None, None) => Variant::parent(name, parent, def.parent_order),
        (None, None, Some(template), None) => Variant::selector(name, template),
        (None, None, None, Some(marker)) => Variant::relational(
            name,
            marker,
            def.relation.unwrap_or(RelationDef::Descendant).into(),
        ),
        _ => {
            return Err(Error::InvalidPreset(format!(
                "variant `{}` needs exactly one of `pseudo`, `parent`, `selector`, `relational`",
                name
            )));
        }
    };

    let mut variant = variant.with_order(def.order).with_sort(def.sort);
    if def.multi_pass {
        variant = variant.multi_pass();
    }
    Ok(vec![variant])
}

fn build_shortcut(def: ShortcutDef) -> Result<Shortcut> {
    let tokens = def.tokens.into_vec();
    if tokens.iter().all(|entry| entry.trim().is_empty()) {
        return Err(Error::InvalidPreset(format!(
            "shortcut `{}` expands to nothing",
            def.name.as_deref().or(def.pattern.as_deref()).unwrap_or_default()
        )));
    }

    let mut shortcut = match (def.name, def.pattern) {
        (Some(name), None) => Shortcut::list(name, tokens),
        (None, Some(pattern)) => Shortcut::pattern(&pattern, move |m, _| {
            Some(ShortcutValue::Tokens(
                tokens
                    .iter()
                    .map(|entry| substitute_captures(entry, m))
                    .collect(),
            ))
        })?,
        _ => {
            return Err(Error::InvalidPreset(
                "a shortcut needs exactly one of `name` or `pattern`".to_string(),
            ));
        }
    };
    if let Some(layer) = def.layer {
        shortcut = shortcut.with_layer(layer);
    }
    if def.no_merge {
        shortcut = shortcut.no_merge();
    }
    Ok(shortcut)
}

fn build_block(def: BlockDef) -> Result<BlocklistEntry> {
    let entry = match (def.exact, def.pattern) {
        (Some(token), None) => BlocklistEntry::exact(token),
        (None, Some(pattern)) => BlocklistEntry::pattern(&pattern)?,
        _ => {
            return Err(Error::InvalidPreset(
                "a blocklist entry needs exactly one of `match` or `pattern`".to_string(),
            ));
        }
    };
    Ok(match def.message {
        Some(message) => entry.with_message(message),
        None => entry,
    })
}

#[cfg(test)]
mod tests {
    use super::{load, parse};
    use crate::error::Error;
    use crate::generator::{GenerateOptions, Generator};
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    const SITE: &str = r##"
name = "site"
strict_theme = false
extractor_timeout_ms = 250
safelist = ["flex"]

[theme.spacing]
1 = "0.25rem"
4 = "1rem"

[theme.colors.red]
500 = "#ef4444"

[layers]
components = -5

[[rules]]
match = "flex"
css = { display = "flex" }

[[rules]]
pattern = '^p-(\d+)$'
css = { padding = "{theme:spacing.$1}" }

[[rules]]
pattern = '^bg-([a-z]+-\d+)(?:/\d+)?$'
css = { background-color = "{color:colors.$1}" }

[[rules]]
match = "card"
layer = "components"
css = { border-radius = "0.5rem", box-shadow = "0 1px 2px rgb(0 0 0 / 0.1)" }

[[rules]]
match = "animate-ping"
raw = "@keyframes ping { 75%, 100% { transform: scale(2); opacity: 0; } }"
css = { animation = "ping 1s infinite" }

[[variants]]
builtin = "pseudo"

[[variants]]
name = "sm"
parent = "@media (min-width: 640px)"
parent_order = 1

[[variants]]
name = "dark"
selector = ".dark &"

[[variants]]
name = "peer"
relational = ".peer"
relation = "sibling"

[[shortcuts]]
name = "btn"
tokens = "p-1 bg-red-500"

[[shortcuts]]
pattern = '^stack-(\d+)$'
tokens = ["flex p-$1"]
layer = "components"

[[blocklist]]
match = "float-left"
message = "use flex instead of {token}"

[[preflights]]
css = "html { line-height: 1.5; }"
"##;

    fn site() -> Generator {
        Generator::new(parse(SITE, Path::new("site.toml")).expect("config"))
    }

    fn bare() -> GenerateOptions {
        GenerateOptions {
            preflights: false,
            safelist: false,
            ..GenerateOptions::default()
        }
    }

    #[test]
    fn loads_config_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("atomframe.toml");
        fs::write(&path, SITE).expect("write");
        let config = load(&path).expect("load");
        assert_eq!(config.user.name, "site");
        assert_eq!(config.extractor_timeout, Duration::from_millis(250));
        assert_eq!(config.user.safelist, vec!["flex"]);
        assert_eq!(config.user.layers.get("components"), Some(&-5));
    }

    #[test]
    fn reports_missing_and_malformed_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = load(&dir.path().join("absent.toml")).expect_err("missing");
        assert!(matches!(missing, Error::Io { .. }));

        let malformed = parse("rules = 3", Path::new("bad.toml")).expect_err("malformed");
        assert!(matches!(malformed, Error::ConfigParse { ref path, .. } if path == Path::new("bad.toml")));

        let unknown = parse("colour = 1", Path::new("typo.toml")).expect_err("unknown key");
        assert!(matches!(unknown, Error::ConfigParse { .. }));
    }

    #[test]
    fn rejects_ambiguous_definitions() {
        let rule = parse("[[rules]]\ncss = { color = \"red\" }", Path::new("x.toml"));
        assert!(matches!(rule, Err(Error::InvalidPreset(_))));

        let variant = parse(
            "[[variants]]\nname = \"x\"\npseudo = \":hover\"\nparent = \"@media print\"",
            Path::new("x.toml"),
        );
        assert!(matches!(variant, Err(Error::InvalidPreset(_))));

        let pattern = parse("[[rules]]\npattern = '('\ncss = { a = \"b\" }", Path::new("x.toml"));
        assert!(matches!(pattern, Err(Error::InvalidPattern { .. })));
    }

    #[test]
    fn renders_theme_and_capture_templates() {
        let result = site()
            .generate_tokens(["p-4", "sm:p-1", "p-9"], &bare())
            .expect("generate");
        assert_eq!(
            result.get_layer("default"),
            Some(
                ".p-4 {\n  padding: 1rem;\n}\n@media (min-width: 640px) {\n  .sm\\:p-1 {\n    padding: 0.25rem;\n  }\n}"
            )
        );
        assert!(!result.matched.contains("p-9"));
    }

    #[test]
    fn applies_color_opacity() {
        let generator = site();
        let utils = generator
            .parse_token("bg-red-500/50", None)
            .expect("parse")
            .expect("compiled");
        assert_eq!(utils[0].declarations()[0].1, "rgb(239 68 68 / 0.5)");
        let solid = generator
            .parse_token("bg-red-500", None)
            .expect("parse")
            .expect("compiled");
        assert_eq!(solid[0].declarations()[0].1, "#ef4444");
    }

    #[test]
    fn declares_layers_shortcuts_and_preflights() {
        let result = site()
            .generate_tokens(["card", "btn", "stack-4"], &GenerateOptions::default())
            .expect("generate");
        assert_eq!(
            result.layers(),
            vec!["preflights", "shortcuts", "components", "default"]
        );
        assert_eq!(
            result.get_layer("preflights"),
            Some("html { line-height: 1.5; }")
        );
        assert_eq!(
            result.get_layer("shortcuts"),
            Some(".btn {\n  padding: 0.25rem;\n  background-color: #ef4444;\n}")
        );
        let components = result.get_layer("components").unwrap_or_default();
        assert!(components.contains(".stack-4 {\n  display: flex;\n  padding: 1rem;\n}"));
        assert!(components.contains(".card {\n  border-radius: 0.5rem;"));
        assert_eq!(result.get_layer("default"), Some(".flex {\n  display: flex;\n}"));
    }

    #[test]
    fn builds_relational_variants_and_blocklist() {
        let generator = site();
        let utils = generator
            .parse_token("peer-checked:p-1", None)
            .expect("parse")
            .expect("compiled");
        assert_eq!(utils[0].selector, r".peer:checked ~ .peer-checked\:p-1");

        let blocked = generator.get_blocked("float-left").expect("blocked");
        assert_eq!(
            blocked.message.as_deref(),
            Some("use flex instead of float-left")
        );
    }

    #[test]
    fn keeps_raw_css_ahead_of_declarations() {
        let result = site()
            .generate_tokens(["animate-ping"], &bare())
            .expect("generate");
        assert_eq!(
            result.get_layer("default"),
            Some(
                "@keyframes ping { 75%, 100% { transform: scale(2); opacity: 0; } }\n.animate-ping {\n  animation: ping 1s infinite;\n}"
            )
        );
    }
}
