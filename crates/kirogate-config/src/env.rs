use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Expand `{{ env.VAR }}` and `{{ env.VAR | default("x") }}` placeholders
///
/// Operates on raw TOML text before deserialization. Comment lines are
/// left untouched so commented-out secrets never have to be set.
pub fn expand_env(input: &str) -> Result<String, String> {
    fn placeholder() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(r#"\{\{\s*([A-Za-z0-9_.]+)\s*(?:\|\s*default\("([^"]*)"\))?\s*\}\}"#)
                .expect("must be valid regex")
        })
    }

    let mut lines = Vec::new();

    for line in input.split('\n') {
        if line.trim_start().starts_with('#') {
            lines.push(line.to_string());
            continue;
        }

        let mut failure = None;
        let expanded = placeholder().replace_all(line, |caps: &Captures<'_>| {
            resolve(&caps[1], caps.get(2).map(|m| m.as_str())).unwrap_or_else(|e| {
                failure.get_or_insert(e);
                String::new()
            })
        });

        if let Some(e) = failure {
            return Err(e);
        }

        lines.push(expanded.into_owned());
    }

    Ok(lines.join("\n"))
}

/// Resolve one placeholder key against the process environment
fn resolve(key: &str, default: Option<&str>) -> Result<String, String> {
    let Some(var_name) = key.strip_prefix("env.").filter(|name| !name.contains('.')) else {
        return Err(format!("only variables scoped with 'env.' are supported: `{key}`"));
    };

    match (std::env::var(var_name), default) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(fallback)) => Ok(fallback.to_string()),
        (Err(_), None) => Err(format!("environment variable not found: `{var_name}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let input = "[upstream]\nregion = \"us-east-1\"\n";
        assert_eq!(expand_env(input).unwrap(), input);
    }

    #[test]
    fn substitutes_refresh_token() {
        temp_env::with_var("KIRO_REFRESH", Some("rt-123"), || {
            let result = expand_env("refresh_token = \"{{ env.KIRO_REFRESH }}\"").unwrap();
            assert_eq!(result, "refresh_token = \"rt-123\"");
        });
    }

    #[test]
    fn substitutes_several_on_one_line() {
        temp_env::with_vars([("A_VAR", Some("a")), ("B_VAR", Some("b"))], || {
            let result = expand_env("pair = \"{{ env.A_VAR }}:{{env.B_VAR}}\"").unwrap();
            assert_eq!(result, "pair = \"a:b\"");
        });
    }

    #[test]
    fn missing_variable_is_an_error() {
        temp_env::with_var_unset("KIRO_MISSING", || {
            let err = expand_env("api_key = \"{{ env.KIRO_MISSING }}\"").unwrap_err();
            assert!(err.contains("KIRO_MISSING"));
        });
    }

    #[test]
    fn default_applies_only_when_unset() {
        temp_env::with_var_unset("KIRO_REGION", || {
            let result = expand_env("region = \"{{ env.KIRO_REGION | default(\"eu-west-1\") }}\"").unwrap();
            assert_eq!(result, "region = \"eu-west-1\"");
        });

        temp_env::with_var("KIRO_REGION", Some("us-west-2"), || {
            let result = expand_env("region = \"{{ env.KIRO_REGION | default(\"eu-west-1\") }}\"").unwrap();
            assert_eq!(result, "region = \"us-west-2\"");
        });
    }

    #[test]
    fn non_env_scope_is_rejected() {
        let err = expand_env("key = \"{{ secrets.TOKEN }}\"").unwrap_err();
        assert!(err.contains("only variables scoped with 'env.'"));
    }

    #[test]
    fn comment_lines_are_not_expanded() {
        temp_env::with_var_unset("KIRO_MISSING", || {
            let input = "  # api_key = \"{{ env.KIRO_MISSING }}\"\nregion = \"us-east-1\"";
            assert_eq!(expand_env(input).unwrap(), input);
        });
    }
}
