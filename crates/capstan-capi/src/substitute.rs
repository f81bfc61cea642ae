//! `${VAR}` substitution for provider components and cluster templates
//!
//! Supported patterns (matching clusterctl behavior):
//! - `${VAR}`: value of `VAR`, left as-is and reported missing if unset
//! - `${VAR:=default}` / `${VAR:-default}`: value of `VAR`, or `default`
//! - `${VAR="default"}`: value of `VAR`, or the unquoted `default`
//! - `${VAR/#prefix/replacement}`: value of `VAR` with a leading `prefix`
//!   replaced, or empty if unset

use std::collections::BTreeSet;

/// Output of a substitution pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Substituted {
    /// Text with every resolvable expression replaced
    pub text: String,
    /// Plain `${VAR}` references that had no value, sorted and deduplicated
    pub missing: BTreeSet<String>,
}

/// Substitute variable expressions in `text` using `lookup`
pub fn substitute<F>(text: &str, lookup: F) -> Substituted
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = Substituted {
        text: String::with_capacity(text.len()),
        missing: BTreeSet::new(),
    };
    let mut remaining = text;

    while let Some(start) = remaining.find("${") {
        out.text.push_str(&remaining[..start]);
        let after_start = &remaining[start + 2..];

        match after_start.find('}') {
            Some(end) => {
                let expr = &after_start[..end];
                match resolve_expr(expr, &lookup) {
                    Some(value) => out.text.push_str(&value),
                    None => {
                        out.missing.insert(expr.to_string());
                        out.text.push_str(&format!("${{{}}}", expr));
                    }
                }
                remaining = &after_start[end + 1..];
            }
            None => {
                // unterminated: emit literally
                out.text.push_str("${");
                remaining = after_start;
            }
        }
    }
    out.text.push_str(remaining);
    out
}

/// Resolve the content between `${` and `}`; `None` means a plain unset variable
fn resolve_expr<F>(expr: &str, lookup: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(pos) = expr.find("/#") {
        let name = &expr[..pos];
        let rule = &expr[pos + 2..];
        let (prefix, replacement) = rule.split_once('/').unwrap_or((rule, ""));
        let value = lookup(name).unwrap_or_default();
        return Some(match value.strip_prefix(prefix) {
            Some(rest) if !value.is_empty() => format!("{}{}", replacement, rest),
            _ => value,
        });
    }

    if let Some(pos) = expr.find(":=").or_else(|| expr.find(":-")) {
        let name = &expr[..pos];
        let default = &expr[pos + 2..];
        return Some(
            lookup(name)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string()),
        );
    }

    if let Some(pos) = expr.find('=') {
        let name = &expr[..pos];
        let default = expr[pos + 1..].trim_matches('"');
        return Some(lookup(name).unwrap_or_else(|| default.to_string()));
    }

    lookup(expr)
}
