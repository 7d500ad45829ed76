use crate::bracket::{arbitrary_value, get_string_components};

/// Color functions serialized with their own name rather than `color(...)`.
pub const CSS_COLOR_FUNCTIONS: [&str; 9] = [
    "hsl", "hsla", "hwb", "lab", "lch", "oklab", "oklch", "rgb", "rgba",
];

const COMPONENT_LIMIT: usize = 8;

/// A parsed color: the color function (or color space), its channel
/// components as written, and the optional alpha.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssColor {
    pub kind: String,
    pub components: Vec<String>,
    pub alpha: Option<String>,
}

impl CssColor {
    pub fn with_alpha(&self, alpha: impl Into<String>) -> Self {
        Self {
            kind: self.kind.clone(),
            components: self.components.clone(),
            alpha: Some(alpha.into()),
        }
    }

    pub fn to_css(&self) -> String {
        color_to_string(self, None)
    }
}

pub fn parse_css_color(input: &str) -> Option<CssColor> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let color = parse_hex_color(input)
        .or_else(|| parse_color_keyword(input))
        .or_else(|| parse_comma_color_function(input))
        .or_else(|| parse_space_color_function(input))
        .or_else(|| parse_generic_color_function(input))?;

    if color.components.is_empty() {
        return None;
    }
    if matches!(color.kind.as_str(), "rgba" | "hsla") && color.alpha.is_none() {
        return None;
    }
    if CSS_COLOR_FUNCTIONS.contains(&color.kind.as_str())
        && !matches!(color.components.len(), 1 | 3)
    {
        return None;
    }
    Some(color)
}

/// Serializes a color, replacing its alpha when `alpha_override` is given.
pub fn color_to_string(color: &CssColor, alpha_override: Option<&str>) -> String {
    let alpha = alpha_override.or(color.alpha.as_deref());
    let kind = color.kind.to_ascii_lowercase();

    if matches!(kind.as_str(), "rgba" | "hsla") {
        let mut out = format!("{}({}", kind, color.components.join(", "));
        if let Some(alpha) = alpha {
            out.push_str(", ");
            out.push_str(alpha);
        }
        out.push(')');
        return out;
    }

    let alpha = alpha.map(|alpha| format!(" / {}", alpha)).unwrap_or_default();
    if CSS_COLOR_FUNCTIONS.contains(&kind.as_str()) {
        return format!("{}({}{})", kind, color.components.join(" "), alpha);
    }
    format!("color({} {}{})", kind, color.components.join(" "), alpha)
}

/// Converts an opacity modifier (`50`, `[0.35]`, `[35%]`) into an alpha value.
pub fn opacity_to_alpha(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with('[') {
        let value = arbitrary_value(raw)?;
        return Some(value.value);
    }
    let percent = raw.parse::<f64>().ok()?;
    if !(0.0..=100.0).contains(&percent) {
        return None;
    }
    Some(format_number(percent / 100.0))
}

fn parse_hex_color(input: &str) -> Option<CssColor> {
    let hex = input.strip_prefix('#')?;
    if !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }

    let channels: Vec<u8> = match hex.len() {
        3 | 4 => hex
            .chars()
            .map(|ch| {
                let digit = ch.to_digit(16).unwrap_or(0) as u8;
                digit * 17
            })
            .collect(),
        6 | 8 => (0..hex.len())
            .step_by(2)
            .map(|idx| u8::from_str_radix(&hex[idx..idx + 2], 16).ok())
            .collect::<Option<Vec<_>>>()?,
        _ => return None,
    };

    let components = channels[..3].iter().map(|c| c.to_string()).collect();
    let alpha = channels
        .get(3)
        .map(|alpha| format_number(f64::from(*alpha) / 255.0));
    Some(CssColor {
        kind: "rgb".to_string(),
        components,
        alpha,
    })
}

fn parse_color_keyword(input: &str) -> Option<CssColor> {
    if input.eq_ignore_ascii_case("transparent") {
        return Some(CssColor {
            kind: "rgb".to_string(),
            components: vec!["0".to_string(); 3],
            alpha: Some("0".to_string()),
        });
    }
    None
}

fn split_function(input: &str) -> Option<(String, &str)> {
    let open = input.find('(')?;
    let body = input[open + 1..].strip_suffix(')')?;
    let name = &input[..open];
    if name.is_empty()
        || !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
    {
        return None;
    }
    Some((name.to_ascii_lowercase(), body))
}

fn parse_comma_color_function(input: &str) -> Option<CssColor> {
    let (kind, body) = split_function(input)?;
    if !matches!(kind.as_str(), "rgb" | "rgba" | "hsl" | "hsla") {
        return None;
    }
    let mut components: Vec<String> = get_string_components(body, &[","], COMPONENT_LIMIT)?
        .into_iter()
        .map(|component| component.trim().to_string())
        .collect();
    if components.len() < 2 || components.iter().any(|c| c.is_empty()) {
        return None;
    }
    let alpha = match components.len() {
        3 => None,
        4 => components.pop(),
        _ => return None,
    };
    Some(CssColor {
        kind,
        components,
        alpha,
    })
}

fn parse_space_color_function(input: &str) -> Option<CssColor> {
    let (kind, body) = split_function(input)?;
    if !CSS_COLOR_FUNCTIONS.contains(&kind.as_str()) {
        return None;
    }
    let (components, alpha) = split_space_components(body)?;
    Some(CssColor {
        kind,
        components,
        alpha,
    })
}

fn parse_generic_color_function(input: &str) -> Option<CssColor> {
    let (kind, body) = split_function(input)?;
    if kind != "color" {
        return None;
    }
    let (mut components, alpha) = split_space_components(body)?;
    if components.len() < 2 {
        return None;
    }
    let space = components.remove(0).to_ascii_lowercase();
    Some(CssColor {
        kind: space,
        components,
        alpha,
    })
}

fn split_space_components(body: &str) -> Option<(Vec<String>, Option<String>)> {
    let normalized = body.split_whitespace().collect::<Vec<_>>().join(" ");
    let normalized = normalized.replace(" / ", "/");
    let parts = get_string_components(&normalized, &["/"], 2)?;
    let (main, alpha) = match parts.as_slice() {
        [main] => (*main, None),
        [main, alpha] => (*main, Some(alpha.trim().to_string())),
        _ => return None,
    };
    let components = get_string_components(main.trim(), &[" "], COMPONENT_LIMIT)?
        .into_iter()
        .map(str::to_string)
        .collect();
    Some((components, alpha))
}

/// Formats a float with at most three decimals and no trailing zeros.
pub fn format_number(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    let mut out = format!("{:.3}", rounded);
    while out.contains('.') && (out.ends_with('0') || out.ends_with('.')) {
        out.pop();
    }
    if out == "-0" {
        out = "0".to_string();
    }
    out
}
