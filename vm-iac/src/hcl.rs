//! HCL value rendering for generated `.tf`, `.tfvars` and `terragrunt.hcl` files.

use serde_json::{Number, Value};

/// Render a JSON value as an HCL expression.
///
/// Integral numbers render without a decimal point, non-integral numbers with
/// one, strings are quoted and escaped, booleans render literally.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => render_number(n),
        Value::String(s) => quote(s),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(render_value).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Object(map) => {
            if map.is_empty() {
                return "{}".to_string();
            }
            let rendered: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{} = {}", object_key(k), render_value(v)))
                .collect();
            format!("{{ {} }}", rendered.join(", "))
        }
    }
}

pub fn render_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    render_float(n.as_f64().unwrap_or_default())
}

pub fn render_float(f: f64) -> String {
    // Whole floats up to 2^53 are exact, so they can drop the fraction.
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
        format!("{f:.0}")
    } else {
        format!("{f}")
    }
}

/// Quote a string as an HCL template literal.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Flatten text for a `#` comment line: control characters become spaces.
pub fn comment_text(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

fn object_key(key: &str) -> String {
    let bare = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !key.starts_with(|c: char| c.is_ascii_digit());
    if bare {
        key.to_string()
    } else {
        quote(key)
    }
}

/// Ordered `name = value` assignments, the body of a `.tfvars` file or a
/// Terragrunt `inputs` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignments {
    entries: Vec<(String, Value)>,
}

impl Assignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value; a later set of the same name replaces the earlier one in place.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(k, v)| format!("{} = {}", k, render_value(v)))
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in self.lines() {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numbers() {
        assert_eq!(render_value(&json!(2)), "2");
        assert_eq!(render_value(&json!(-3)), "-3");
        assert_eq!(render_value(&json!(4096.0)), "4096");
        assert_eq!(render_value(&json!(20.5)), "20.5");
        assert_eq!(render_float(0.25), "0.25");
    }

    #[test]
    fn test_strings_are_escaped() {
        assert_eq!(quote("db1"), "\"db1\"");
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote("line\nnext"), "\"line\\nnext\"");
        assert_eq!(quote("${var.x}"), "\"$${var.x}\"");
        assert_eq!(quote("100%"), "\"100%\"");
    }

    #[test]
    fn test_comment_text_stays_on_one_line() {
        assert_eq!(comment_text("dev"), "dev");
        assert_eq!(comment_text("dev\n}\r\nx"), "dev }  x");
    }

    #[test]
    fn test_collections() {
        assert_eq!(render_value(&json!(true)), "true");
        assert_eq!(render_value(&json!(["a", 1])), "[\"a\", 1]");
        assert_eq!(
            render_value(&json!({"env": "dev", "team name": "ops"})),
            "{ env = \"dev\", \"team name\" = \"ops\" }"
        );
    }

    #[test]
    fn test_assignments_replace_in_place() {
        let mut vars = Assignments::new();
        vars.set("vm_name", "db1");
        vars.set("cpu", 2);
        vars.set("vm_name", "db2");
        assert_eq!(vars.render(), "vm_name = \"db2\"\ncpu = 2\n");
        assert!(vars.contains("cpu"));
    }
}
