use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

/// Lazily computed theme value. Receives the fully merged theme.
pub type ThemeFn = Arc<dyn Fn(&Theme) -> Option<String> + Send + Sync>;

/// Key used by a nested map to provide the value of the map itself.
pub const DEFAULT_KEY: &str = "DEFAULT";

#[derive(Clone)]
pub enum ThemeValue {
    Str(String),
    Map(IndexMap<String, ThemeValue>),
    List(Vec<ThemeValue>),
    Resolver(ThemeFn),
}

impl fmt::Debug for ThemeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThemeValue::Str(value) => f.debug_tuple("Str").field(value).finish(),
            ThemeValue::Map(map) => f.debug_tuple("Map").field(map).finish(),
            ThemeValue::List(list) => f.debug_tuple("List").field(list).finish(),
            ThemeValue::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

impl From<&str> for ThemeValue {
    fn from(value: &str) -> Self {
        ThemeValue::Str(value.to_string())
    }
}

impl From<String> for ThemeValue {
    fn from(value: String) -> Self {
        ThemeValue::Str(value)
    }
}

impl From<toml::Value> for ThemeValue {
    fn from(value: toml::Value) -> Self {
        match value {
            toml::Value::String(value) => ThemeValue::Str(value),
            toml::Value::Integer(value) => ThemeValue::Str(value.to_string()),
            toml::Value::Float(value) => ThemeValue::Str(value.to_string()),
            toml::Value::Boolean(value) => ThemeValue::Str(value.to_string()),
            toml::Value::Datetime(value) => ThemeValue::Str(value.to_string()),
            toml::Value::Array(items) => {
                ThemeValue::List(items.into_iter().map(ThemeValue::from).collect())
            }
            toml::Value::Table(table) => ThemeValue::Map(
                table
                    .into_iter()
                    .map(|(key, value)| (key, ThemeValue::from(value)))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Theme {
    root: IndexMap<String, ThemeValue>,
}

impl Theme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml(table: toml::Table) -> Self {
        Self {
            root: table
                .into_iter()
                .map(|(key, value)| (key, ThemeValue::from(value)))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ThemeValue>) -> &mut Self {
        self.root.insert(key.into(), value.into());
        self
    }

    /// Inserts a value at a dotted path, creating intermediate maps.
    pub fn set(&mut self, path: &str, value: impl Into<ThemeValue>) -> &mut Self {
        let segments = path.split('.').collect::<Vec<_>>();
        insert_path(&mut self.root, &segments, value.into());
        self
    }

    /// Looks up a dotted path. Keys that themselves contain dots (`0.5`) are
    /// matched greedily, longest key first.
    pub fn get(&self, path: &str) -> Option<&ThemeValue> {
        if path.is_empty() {
            return None;
        }
        let segments = path.split('.').collect::<Vec<_>>();
        lookup_segments(&self.root, &segments)
    }

    /// Resolves a dotted path to a string. Maps resolve through their
    /// `DEFAULT` key, lists join with `, `, resolvers run against this theme.
    pub fn resolve(&self, path: &str) -> Option<String> {
        self.value_to_string(self.get(path)?)
    }

    /// Resolves a dash-separated key below `namespace`, so `red-500` under
    /// `colors` finds `colors.red.500`, `colors.red-500`, or the `DEFAULT` of
    /// `colors.red` for `red`.
    pub fn resolve_dashed(&self, namespace: &str, key: &str) -> Option<String> {
        let ThemeValue::Map(map) = self.get(namespace)? else {
            return None;
        };
        if key.is_empty() {
            return None;
        }
        let parts = key.split('-').collect::<Vec<_>>();
        lookup_dashed(map, &parts).and_then(|value| self.value_to_string(value))
    }

    /// Deep-merges `other` into this theme. Maps merge key by key, lists
    /// concatenate, and every other value is replaced. A list stored under a
    /// `DEFAULT` key is replaced rather than concatenated.
    pub fn merge(&mut self, other: &Theme) {
        merge_maps(&mut self.root, &other.root);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.root.keys().map(String::as_str)
    }

    fn value_to_string(&self, value: &ThemeValue) -> Option<String> {
        match value {
            ThemeValue::Str(value) => Some(value.clone()),
            ThemeValue::Map(map) => map
                .get(DEFAULT_KEY)
                .and_then(|value| self.value_to_string(value)),
            ThemeValue::List(items) => {
                let parts = items
                    .iter()
                    .map(|item| self.value_to_string(item))
                    .collect::<Option<Vec<_>>>()?;
                Some(parts.join(", "))
            }
            ThemeValue::Resolver(resolve) => resolve(self),
        }
    }
}

fn insert_path(map: &mut IndexMap<String, ThemeValue>, segments: &[&str], value: ThemeValue) {
    match segments {
        [] => {}
        [last] => {
            map.insert(last.to_string(), value);
        }
        [first, rest @ ..] => {
            let entry = map
                .entry(first.to_string())
                .or_insert_with(|| ThemeValue::Map(IndexMap::new()));
            if !matches!(entry, ThemeValue::Map(_)) {
                *entry = ThemeValue::Map(IndexMap::new());
            }
            if let ThemeValue::Map(child) = entry {
                insert_path(child, rest, value);
            }
        }
    }
}

fn lookup_segments<'a>(
    map: &'a IndexMap<String, ThemeValue>,
    segments: &[&str],
) -> Option<&'a ThemeValue> {
    for take in (1..=segments.len()).rev() {
        let key = segments[..take].join(".");
        let Some(value) = map.get(&key) else {
            continue;
        };
        if take == segments.len() {
            return Some(value);
        }
        if let ThemeValue::Map(child) = value {
            if let Some(found) = lookup_segments(child, &segments[take..]) {
                return Some(found);
            }
        }
    }
    None
}

fn lookup_dashed<'a>(
    map: &'a IndexMap<String, ThemeValue>,
    parts: &[&str],
) -> Option<&'a ThemeValue> {
    for take in (1..=parts.len()).rev() {
        let key = parts[..take].join("-");
        let Some(value) = map.get(&key) else {
            continue;
        };
        if take == parts.len() {
            return Some(value);
        }
        if let ThemeValue::Map(child) = value {
            if let Some(found) = lookup_dashed(child, &parts[take..]) {
                return Some(found);
            }
        }
    }
    None
}

fn merge_maps(base: &mut IndexMap<String, ThemeValue>, other: &IndexMap<String, ThemeValue>) {
    for (key, incoming) in other {
        match (base.get_mut(key), incoming) {
            (Some(ThemeValue::Map(existing)), ThemeValue::Map(incoming)) => {
                merge_maps(existing, incoming);
            }
            (Some(ThemeValue::List(existing)), ThemeValue::List(incoming))
                if key != DEFAULT_KEY =>
            {
                existing.extend(incoming.iter().cloned());
            }
            _ => {
                base.insert(key.clone(), incoming.clone());
            }
        }
    }
}
