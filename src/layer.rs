use std::collections::BTreeSet;
use std::future::Future;
use std::sync::OnceLock;

use crate::preprocess::Blocked;
use crate::stringify::{indent_css_block, minify_raw, render_rule, wrap_parents};
use crate::types::{CompiledUtil, UtilBody};

/// One layer's content, rendered lazily.
#[derive(Debug)]
pub struct Layer {
    pub name: String,
    pub priority: i32,
    preflights: Vec<String>,
    utils: Vec<CompiledUtil>,
    minify: bool,
    rendered: OnceLock<String>,
}

impl Layer {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            preflights: Vec::new(),
            utils: Vec::new(),
            minify: false,
            rendered: OnceLock::new(),
        }
    }

    pub fn push_preflight(&mut self, css: String) {
        self.preflights.push(css);
        self.rendered = OnceLock::new();
    }

    /// Replaces the utils, which must already be sorted and merged.
    pub fn set_utils(&mut self, utils: Vec<CompiledUtil>) {
        self.utils = utils;
        self.rendered = OnceLock::new();
    }

    pub fn utils(&self) -> &[CompiledUtil] {
        &self.utils
    }

    pub fn is_empty(&self) -> bool {
        self.css().is_empty()
    }

    fn css(&self) -> &str {
        self.rendered
            .get_or_init(|| render_layer(&self.preflights, &self.utils, self.minify))
    }
}

fn render_layer(preflights: &[String], utils: &[CompiledUtil], minify: bool) -> String {
    let mut blocks = preflights
        .iter()
        .map(|css| if minify { minify_raw(css) } else { css.trim().to_string() })
        .filter(|css| !css.is_empty())
        .collect::<Vec<_>>();

    // Consecutive utils sharing a parent render inside one wrapper.
    let mut idx = 0;
    while idx < utils.len() {
        let util = &utils[idx];
        match (&util.body, &util.parent) {
            (UtilBody::Raw(css), _) => {
                blocks.push(if minify { minify_raw(css) } else { css.trim().to_string() });
                idx += 1;
            }
            (UtilBody::Declarations(_), None) => {
                blocks.push(render_rule(&util.selector, util.declarations(), None, minify));
                idx += 1;
            }
            (UtilBody::Declarations(_), Some(parent)) => {
                let mut inner = Vec::new();
                while idx < utils.len()
                    && utils[idx].parent.as_ref() == Some(parent)
                    && !utils[idx].is_raw()
                {
                    let member = &utils[idx];
                    inner.push(render_rule(&member.selector, member.declarations(), None, minify));
                    idx += 1;
                }
                let joined = inner.join(if minify { "" } else { "\n" });
                blocks.push(wrap_parents(&joined, Some(parent), minify));
            }
        }
    }

    blocks.join(if minify { "" } else { "\n" })
}

/// Output of one `generate` call.
#[derive(Debug)]
pub struct GenerateResult {
    layers: Vec<Layer>,
    minify: bool,
    /// Tokens that produced CSS.
    pub matched: BTreeSet<String>,
    /// Tokens suppressed by the blocklist.
    pub blocked: Vec<Blocked>,
    combined: OnceLock<String>,
}

impl GenerateResult {
    /// `layers` must already be in priority order.
    pub fn new(
        mut layers: Vec<Layer>,
        minify: bool,
        matched: BTreeSet<String>,
        blocked: Vec<Blocked>,
    ) -> Self {
        for layer in &mut layers {
            layer.minify = minify;
            layer.rendered = OnceLock::new();
        }
        Self {
            layers,
            minify,
            matched,
            blocked,
            combined: OnceLock::new(),
        }
    }

    /// Every non-empty layer, in priority order.
    pub fn css(&self) -> &str {
        self.combined.get_or_init(|| self.get_layers(None, &[]))
    }

    pub fn layers(&self) -> Vec<&str> {
        self.layers
            .iter()
            .filter(|layer| !layer.is_empty())
            .map(|layer| layer.name.as_str())
            .collect()
    }

    pub fn get_layer(&self, name: &str) -> Option<&str> {
        self.layers
            .iter()
            .find(|layer| layer.name == name)
            .map(Layer::css)
            .filter(|css| !css.is_empty())
    }

    /// Renders `include` (all layers when `None`) in the given order,
    /// leaving out `exclude`.
    pub fn get_layers(&self, include: Option<&[&str]>, exclude: &[&str]) -> String {
        let selected: Vec<&Layer> = match include {
            Some(names) => names
                .iter()
                .filter_map(|name| self.layers.iter().find(|layer| layer.name == *name))
                .collect(),
            None => self.layers.iter().collect(),
        };

        selected
            .into_iter()
            .filter(|layer| !exclude.contains(&layer.name.as_str()))
            .filter_map(|layer| {
                let css = layer.css();
                if css.is_empty() {
                    None
                } else if self.minify {
                    Some(css.to_string())
                } else {
                    Some(format!("/* layer: {} */\n{}", layer.name, css))
                }
            })
            .collect::<Vec<_>>()
            .join(if self.minify { "" } else { "\n" })
    }

    /// Rewrites one layer's text, e.g. to run it through another CSS pass.
    /// Returns `false` when the layer does not exist.
    pub async fn set_layer<F, Fut>(&mut self, name: &str, transform: F) -> bool
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = String>,
    {
        let Some(layer) = self.layers.iter_mut().find(|layer| layer.name == name) else {
            return false;
        };
        let current = layer.css().to_string();
        let next = transform(current).await;
        layer.rendered = OnceLock::from(next);
        self.combined = OnceLock::new();
        true
    }

    /// Indents the combined output, for embedding into another stylesheet.
    pub fn indented(&self, spaces: usize) -> String {
        indent_css_block(self.css(), spaces)
    }
}

#[cfg(test)]
mod tests {
    use super::{GenerateResult, Layer};
    use crate::types::{CompiledUtil, UtilBody, entries};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn util(token: &str, parent: Option<&str>) -> CompiledUtil {
        CompiledUtil {
            token: token.to_string(),
            order: 0,
            sub_order: 0,
            sort: 0,
            selector: format!(".{}", token),
            body: UtilBody::Declarations(entries([("color", "red")])),
            parent: parent.map(str::to_string),
            parent_order: 0,
            layer: "default".to_string(),
            no_merge: false,
        }
    }

    fn result(minify: bool) -> GenerateResult {
        let mut preflights = Layer::new("preflights", -100);
        preflights.push_preflight("*, ::before { box-sizing: border-box; }".to_string());
        let mut default = Layer::new("default", 0);
        default.set_utils(vec![
            util("a", None),
            util("b", Some("@media print")),
            util("c", Some("@media print")),
        ]);
        let empty = Layer::new("shortcuts", -10);
        GenerateResult::new(vec![preflights, empty, default], minify, BTreeSet::new(), Vec::new())
    }

    #[test]
    fn renders_layers_in_order_with_comments() {
        let result = result(false);
        assert_eq!(result.layers(), vec!["preflights", "default"]);
        assert_eq!(
            result.css(),
            "/* layer: preflights */\n*, ::before { box-sizing: border-box; }\n/* layer: default */\n.a {\n  color: red;\n}\n@media print {\n  .b {\n    color: red;\n  }\n  .c {\n    color: red;\n  }\n}"
        );
    }

    #[test]
    fn minifies_without_comments() {
        let result = result(true);
        assert_eq!(
            result.css(),
            "*,::before{box-sizing:border-box;}.a{color:red}@media print{.b{color:red}.c{color:red}}"
        );
    }

    #[test]
    fn selects_and_excludes_layers() {
        let result = result(true);
        assert_eq!(result.get_layer("shortcuts"), None);
        assert_eq!(result.get_layer("missing"), None);
        assert_eq!(
            result.get_layers(Some(&["default", "preflights"]), &[]),
            ".a{color:red}@media print{.b{color:red}.c{color:red}}*,::before{box-sizing:border-box;}"
        );
        assert_eq!(
            result.get_layers(None, &["preflights"]),
            ".a{color:red}@media print{.b{color:red}.c{color:red}}"
        );
    }

    #[tokio::test]
    async fn transforms_a_layer_in_place() {
        let mut result = result(true);
        let before = result.css().to_string();
        assert!(result
            .set_layer("default", |css| async move { css.replace("red", "blue") })
            .await);
        assert!(!result.set_layer("missing", |css| async move { css }).await);
        assert_ne!(result.css(), before);
        assert_eq!(
            result.get_layer("default"),
            Some(".a{color:blue}@media print{.b{color:blue}.c{color:blue}}")
        );
        assert!(result.css().starts_with("*,::before"));
    }
}
