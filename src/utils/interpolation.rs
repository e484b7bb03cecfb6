use serde_json::Value;
use std::collections::HashMap;

/// Column bindings visible to placeholders: column name -> rendered cell text.
pub type Bindings = HashMap<String, String>;

/// Interpolate a template string by replacing `{{column}}` tokens with values from `vars`.
///
/// Grammar: `{{identifier}}` only, no expressions. Whitespace around the identifier is
/// ignored (`{{  name  }}` == `{{name}}`).
///
/// Unknown tokens are left intact and their names are pushed onto `unresolved`, so callers
/// can log them.
pub fn interpolate_string(template: &str, vars: &Bindings, unresolved: &mut Vec<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut idx = 0;
    let bytes = template.as_bytes();

    while let Some(start) = find_subslice(bytes, b"{{", idx) {
        out.push_str(&template[idx..start]);

        let content_start = start + 2;
        if let Some(end) = find_subslice(bytes, b"}}", content_start) {
            let token = template[content_start..end].trim();

            if token.is_empty() || token.contains('{') {
                // Not an identifier: copy the opening braces and rescan after them.
                out.push_str("{{");
                idx = content_start;
                continue;
            }

            match vars.get(token) {
                Some(value) => out.push_str(value),
                None => {
                    unresolved.push(token.to_string());
                    out.push_str(&template[start..end + 2]);
                }
            }
            idx = end + 2;
        } else {
            // No matching end, push rest and stop
            out.push_str(&template[start..]);
            idx = template.len();
            break;
        }
    }

    if idx < template.len() {
        out.push_str(&template[idx..]);
    }

    out
}

/// Interpolates all string values in a JSON structure (recursively).
///
/// Object keys are left as they are; only values are rewritten.
pub fn interpolate_json(value: &Value, vars: &Bindings, unresolved: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate_string(s, vars, unresolved)),
        Value::Array(arr) => Value::Array(
            arr.iter()
                .map(|v| interpolate_json(v, vars, unresolved))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_json(v, vars, unresolved));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}

/// Whether `s` contains at least one `{{...}}` token.
pub fn has_placeholders(s: &str) -> bool {
    s.find("{{")
        .map(|start| s[start + 2..].contains("}}"))
        .unwrap_or(false)
}

/// Render a cell value for substitution:
/// - Strings are returned as-is.
/// - Null becomes the empty string.
/// - Numbers/bools are rendered via to_string().
/// - Arrays/objects are serialized as compact JSON.
pub fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Find the first occurrence of `needle` in `haystack` starting at `from`.
fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_interpolate_basic_vars() {
        let vars = vars(&[("name", "Zied"), ("greet", "Hello")]);
        let mut missing = Vec::new();
        assert_eq!(
            interpolate_string("{{greet}}, {{ name }}!", &vars, &mut missing),
            "Hello, Zied!"
        );
        assert!(missing.is_empty());
    }

    #[test]
    fn test_unknown_tokens_are_preserved_and_reported() {
        let vars = vars(&[("name", "Zied")]);
        let mut missing = Vec::new();
        assert_eq!(
            interpolate_string("Hi {{name}} at {{email}}", &vars, &mut missing),
            "Hi Zied at {{email}}"
        );
        assert_eq!(missing, vec!["email".to_string()]);
    }

    #[test]
    fn test_unicode_column_names_and_unclosed_token() {
        let vars = vars(&[("이름", "홍길동")]);
        let mut missing = Vec::new();
        assert_eq!(
            interpolate_string("{{이름}} {{open", &vars, &mut missing),
            "홍길동 {{open"
        );
    }

    #[test]
    fn test_nested_braces_are_not_identifiers() {
        let vars = vars(&[("a", "1")]);
        let mut missing = Vec::new();
        assert_eq!(interpolate_string("{{{{a}}", &vars, &mut missing), "{{1");
        assert_eq!(interpolate_string("{{ }}", &vars, &mut missing), "{{ }}");
        assert!(missing.is_empty());
    }

    #[test]
    fn test_interpolate_json_recursive() {
        let vars = vars(&[("user", "Alice")]);
        let mut missing = Vec::new();
        let v = json!({
            "msg": "Hi {{user}}",
            "nested": { "arr": ["{{user}}", 1, true] }
        });

        let out = interpolate_json(&v, &vars, &mut missing);
        assert_eq!(
            out,
            json!({
                "msg": "Hi Alice",
                "nested": { "arr": ["Alice", 1, true] }
            })
        );
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&json!("x")), "x");
        assert_eq!(value_to_text(&json!(42)), "42");
        assert_eq!(value_to_text(&json!(null)), "");
        assert!(has_placeholders("a {{b}} c"));
        assert!(!has_placeholders("a {{b c"));
    }
}
