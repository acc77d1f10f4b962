use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Placeholder values keyed by name, `{name}` in the template.
pub type Vars = BTreeMap<&'static str, String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("invalid placeholder name {0:?}")]
    InvalidKey(String),
    #[error("unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Substitutes every `{key}` of `template` in one pass.
///
/// Braces that do not enclose a well-formed key (`{}`, `{ a: 1 }`, ...) are
/// copied verbatim so YAML/JSON bodies survive rendering, while a well-formed
/// key missing from `vars` is an error rather than being left in place.
pub fn render(template: &str, vars: &Vars) -> Result<String, TemplateError> {
    if let Some(bad) = vars.keys().find(|key| !is_valid_key(key)) {
        return Err(TemplateError::InvalidKey(bad.to_string()));
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) if is_valid_key(&after_open[..close]) => {
                let key = &after_open[..close];
                let value = vars
                    .get(key)
                    .ok_or_else(|| TemplateError::UnknownPlaceholder(key.to_string()))?;
                out.push_str(value);
                rest = &after_open[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after_open;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolves a configured path template against `{data-dir}` and `{node-role}`.
pub fn resolve_path(template: &str, data_dir: &str, node_role: &str) -> Result<PathBuf, TemplateError> {
    let vars = Vars::from([
        ("data-dir", data_dir.to_string()),
        ("node-role", node_role.to_string()),
    ]);
    render(template, &vars).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Vars {
        Vars::from([
            ("data-dir", "/var/lib/firesui".to_string()),
            ("node-role", "reader".to_string()),
        ])
    }

    #[test]
    fn test_render_substitutes_all_occurrences() {
        let out = render("{data-dir}/{node-role}/data:{node-role}", &vars()).unwrap();
        assert_eq!(out, "/var/lib/firesui/reader/data:reader");
    }

    #[test]
    fn test_render_keeps_non_placeholder_braces() {
        let template = "db-config: {}\nmetrics: { address: 0.0.0.0 }\npath: {data-dir}\n{";
        let out = render(template, &vars()).unwrap();
        assert_eq!(
            out,
            "db-config: {}\nmetrics: { address: 0.0.0.0 }\npath: /var/lib/firesui\n{"
        );
    }

    #[test]
    fn test_render_unknown_placeholder() {
        assert_eq!(
            render("{genesis-file}", &vars()),
            Err(TemplateError::UnknownPlaceholder("genesis-file".to_string()))
        );
    }

    #[test]
    fn test_render_rejects_invalid_keys() {
        let vars = Vars::from([("Data Dir", "x".to_string())]);
        assert_eq!(
            render("plain", &vars),
            Err(TemplateError::InvalidKey("Data Dir".to_string()))
        );
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let vars = Vars::from([("a", "{b}".to_string()), ("b", "x".to_string())]);
        assert_eq!(render("{a}{b}", &vars).unwrap(), "{b}x");
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(
            resolve_path("{data-dir}/{node-role}/data", "/var/sf", "reader").unwrap(),
            PathBuf::from("/var/sf/reader/data")
        );
        assert_eq!(
            resolve_path("{data-dir}/{oops}", "/var/sf", "reader"),
            Err(TemplateError::UnknownPlaceholder("oops".to_string()))
        );
    }
}
