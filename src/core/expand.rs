//! Shell-style placeholder substitution for runtime env and label values.
//!
//! Recognises `$NAME`, `${NAME}` and `${NAME:-default}`. References to
//! names missing from the parameter map are left as written so the build
//! engine can still expand them; `\$` escapes a literal dollar.

use std::collections::BTreeMap;
use thiserror::Error;

/// Malformed placeholder syntax.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
    #[error("unclosed placeholder at position {position}")]
    Unclosed { position: usize },

    #[error("invalid placeholder name '{name}'")]
    InvalidName { name: String },
}

/// Substitute placeholders in `template` from `params`.
pub fn expand(template: &str, params: &BTreeMap<String, String>) -> Result<String, ExpandError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(pos) = rest.find(['$', '\\']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        // escaped dollar
        if tail.starts_with("\\$") {
            out.push_str("\\$");
            advance(&mut rest, &mut offset, pos + 2);
            continue;
        }
        if tail.starts_with('\\') {
            out.push('\\');
            advance(&mut rest, &mut offset, pos + 1);
            continue;
        }

        if let Some(braced) = tail.strip_prefix("${") {
            let close = braced.find('}').ok_or(ExpandError::Unclosed {
                position: offset + pos,
            })?;
            let body = &braced[..close];
            let (name, default) = match body.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (body, None),
            };
            if !is_name(name) {
                return Err(ExpandError::InvalidName {
                    name: name.to_string(),
                });
            }
            match (params.get(name), default) {
                (Some(value), _) => out.push_str(value),
                (None, Some(default)) => out.push_str(default),
                (None, None) => out.push_str(&tail[..close + 3]),
            }
            advance(&mut rest, &mut offset, pos + close + 3);
            continue;
        }

        let name_len = name_prefix_len(&tail[1..]);
        if name_len == 0 {
            out.push('$');
            advance(&mut rest, &mut offset, pos + 1);
            continue;
        }
        let name = &tail[1..1 + name_len];
        match params.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&tail[..1 + name_len]),
        }
        advance(&mut rest, &mut offset, pos + 1 + name_len);
    }

    out.push_str(rest);
    Ok(out)
}

fn advance(rest: &mut &str, offset: &mut usize, by: usize) {
    *rest = &rest[by..];
    *offset += by;
}

fn name_prefix_len(text: &str) -> usize {
    let mut len = 0;
    for (i, c) in text.char_indices() {
        let ok = c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit());
        if !ok {
            break;
        }
        len = i + c.len_utf8();
    }
    len
}

fn is_name(text: &str) -> bool {
    !text.is_empty() && name_prefix_len(text) == text.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("VERSION".to_string(), "1.4.2".to_string()),
            ("GIT_SHA".to_string(), "abc123".to_string()),
        ])
    }

    #[test]
    fn test_expand_simple_and_braced() {
        let out = expand("v$VERSION-${GIT_SHA}", &params()).unwrap();
        assert_eq!(out, "v1.4.2-abc123");
    }

    #[test]
    fn test_expand_default() {
        let out = expand("${CHANNEL:-stable}/${VERSION:-0}", &params()).unwrap();
        assert_eq!(out, "stable/1.4.2");
    }

    #[test]
    fn test_expand_unknown_left_untouched() {
        let out = expand("$HOME and ${PATH}", &params()).unwrap();
        assert_eq!(out, "$HOME and ${PATH}");
    }

    #[test]
    fn test_expand_literal_dollars() {
        assert_eq!(expand("cost: 5$", &params()).unwrap(), "cost: 5$");
        assert_eq!(expand("$1 $-", &params()).unwrap(), "$1 $-");
        assert_eq!(expand("\\$VERSION", &params()).unwrap(), "\\$VERSION");
        assert_eq!(expand("a\\b", &params()).unwrap(), "a\\b");
    }

    #[test]
    fn test_expand_name_boundary() {
        assert_eq!(expand("$VERSION.txt", &params()).unwrap(), "1.4.2.txt");
        assert_eq!(expand("$VERSIONS", &params()).unwrap(), "$VERSIONS");
    }

    #[test]
    fn test_expand_unclosed() {
        let err = expand("x ${VERSION", &params()).unwrap_err();
        assert_eq!(err, ExpandError::Unclosed { position: 2 });
    }

    #[test]
    fn test_expand_invalid_name() {
        let err = expand("${not-a-name}", &params()).unwrap_err();
        assert!(matches!(err, ExpandError::InvalidName { .. }));
    }

    #[test]
    fn test_expand_no_placeholders() {
        assert_eq!(expand("plain text", &params()).unwrap(), "plain text");
        assert_eq!(expand("", &params()).unwrap(), "");
    }
}
