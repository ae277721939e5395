//! Environment variable substitution for script arguments.

use std::collections::HashMap;

/// Substitute variables in a string.
///
/// Supports `$VAR` and `${VAR}`. `$VAR` takes the longest run of ASCII
/// alphanumerics and underscores; `${...}` takes everything up to the closing
/// brace, which lets reserved names such as `${/}` or `${@cwd}` through.
/// Unset variables substitute to the empty string. A `$` that starts neither
/// form, and an unclosed `${`, are kept literally.
///
/// # Examples
///
/// ```
/// let value = |name: &str| (name == "WHO").then(|| "world".to_string());
/// assert_eq!(scriptest::env::expand("hello $WHO", value), "hello world");
/// assert_eq!(scriptest::env::expand("${WHO}ly", value), "worldly");
/// assert_eq!(scriptest::env::expand("[$MISSING]", value), "[]");
/// ```
pub fn expand<F>(s: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => {
                    let name = &braced[..end];
                    if let Some(value) = lookup(name) {
                        result.push_str(&value);
                    }
                    rest = &braced[end + 1..];
                }
                None => {
                    result.push('$');
                    rest = after;
                }
            }
            continue;
        }

        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if len == 0 {
            result.push('$');
        } else if let Some(value) = lookup(&after[..len]) {
            result.push_str(&value);
        }
        rest = &after[len..];
    }

    result.push_str(rest);
    result
}

/// Substitute variables from a map. Unset variables become empty.
pub fn expand_with(s: &str, env: &HashMap<String, String>) -> String {
    expand(s, |name| env.get(name).cloned())
}

/// Parse a `KEY=VALUE` assignment. Returns `None` when there is no `=` or the
/// key is empty.
pub fn split_assignment(s: &str) -> Option<(&str, &str)> {
    let (key, value) = s.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> HashMap<String, String> {
        HashMap::from([
            ("NAME".to_string(), "value".to_string()),
            ("A_1".to_string(), "x".to_string()),
        ])
    }

    #[test]
    fn test_expand_plain_and_braced() {
        let env = env();
        assert_eq!(expand_with("$NAME", &env), "value");
        assert_eq!(expand_with("${NAME}", &env), "value");
        assert_eq!(expand_with("pre_${NAME}_post", &env), "pre_value_post");
        assert_eq!(expand_with("$A_1/$NAME", &env), "x/value");
        assert_eq!(expand_with("no vars here", &env), "no vars here");
        assert_eq!(expand_with("", &env), "");
    }

    #[test]
    fn test_expand_unset_is_empty() {
        let env = env();
        assert_eq!(expand_with("a${NOPE}b", &env), "ab");
        assert_eq!(expand_with("a $NOPE b", &env), "a  b");
    }

    #[test]
    fn test_expand_literal_dollar() {
        let env = env();
        assert_eq!(expand_with("cost: $", &env), "cost: $");
        assert_eq!(expand_with("$ 5", &env), "$ 5");
        assert_eq!(expand_with("${UNCLOSED", &env), "${UNCLOSED");
    }

    #[test]
    fn test_expand_reserved_names() {
        let got = expand("${/}${@cwd}", |name| match name {
            "/" => Some("/".to_string()),
            "@cwd" => Some("here".to_string()),
            _ => None,
        });
        assert_eq!(got, "/here");
    }

    #[test]
    fn test_split_assignment() {
        assert_eq!(split_assignment("K=V"), Some(("K", "V")));
        assert_eq!(split_assignment("K="), Some(("K", "")));
        assert_eq!(split_assignment("K=a=b"), Some(("K", "a=b")));
        assert_eq!(split_assignment("=V"), None);
        assert_eq!(split_assignment("K"), None);
    }
}
