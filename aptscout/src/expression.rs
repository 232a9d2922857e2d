//! Classification of argument texts into string literals and references

use crate::syntax::is_identifier;
use std::fmt;

/// A handle or name candidate taken from a call argument
///
/// A fragment whose quoted string matched is always a [`Expression::Literal`];
/// everything else is a [`Expression::Reference`] to a variable, parameter or
/// more complex expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expression {
    /// Contents of a C string literal, e.g. `kernel32.dll` for `"kernel32.dll"`
    Literal(String),
    /// Name of the referenced variable, or the whole fragment when no name could be isolated
    Reference(String),
}

impl Expression {
    /// Classifies one argument text.
    ///
    /// Leading dereferences and casts are ignored (`*(char **)"x"`, `(LPCSTR)local_10`).
    /// Never fails: unrecognised fragments become a reference named after the whole
    /// trimmed fragment.
    ///
    /// # Example
    /// ```
    /// use aptscout::Expression;
    ///
    /// assert_eq!(Expression::classify("L\"user32.dll\""), Expression::Literal("user32.dll".into()));
    /// assert_eq!(Expression::classify("(LPCSTR)local_10"), Expression::Reference("local_10".into()));
    /// ```
    pub fn classify(fragment: &str) -> Self {
        let fragment = fragment.trim();
        let candidates = prefix_candidates(fragment);

        if let Some(value) = candidates.iter().find_map(|rest| literal_at(rest)) {
            return Expression::Literal(value.to_string());
        }

        if let Some(name) = candidates.iter().find_map(|rest| identifier_at(rest)) {
            return Expression::Reference(name.to_string());
        }

        Expression::Reference(fragment.to_string())
    }

    /// Returns true for a string literal
    #[inline]
    pub fn is_literal(&self) -> bool {
        matches!(self, Expression::Literal(_))
    }

    /// Returns the literal contents, if this is a literal
    pub fn literal(&self) -> Option<&str> {
        match self {
            Expression::Literal(value) => Some(value),
            Expression::Reference(_) => None,
        }
    }

    /// Returns the referenced name, if this is a reference
    pub fn reference(&self) -> Option<&str> {
        match self {
            Expression::Literal(_) => None,
            Expression::Reference(name) => Some(name),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(value) => write!(f, "\"{}\"", value),
            Expression::Reference(name) => f.write_str(name),
        }
    }
}

/// Remainders of `fragment` after the optional `*` and optional `( ... )` cast, in the
/// order a backtracking matcher would try them: longest prefix first, then shorter.
fn prefix_candidates(fragment: &str) -> Vec<&str> {
    let mut starts = Vec::new();
    if let Some(rest) = fragment.strip_prefix('*') {
        starts.push(skip_blank(rest));
    }
    starts.push(fragment);

    let mut candidates = Vec::new();
    for start in starts {
        if start.starts_with('(') {
            for (pos, _) in start.match_indices(')').filter(|(pos, _)| *pos > 1) {
                candidates.push(skip_blank(&start[pos + 1..]));
            }
        }
        candidates.push(start);
    }
    candidates
}

fn skip_blank(s: &str) -> &str {
    s.strip_prefix([' ', '\t']).unwrap_or(s)
}

fn literal_at(s: &str) -> Option<&str> {
    let body = s.strip_prefix('L').unwrap_or(s).strip_prefix('"')?;
    let mut escaped = false;
    for (pos, c) in body.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '"' if !escaped && pos > 0 => return Some(&body[..pos]),
            _ => escaped = false,
        }
    }
    None
}

fn identifier_at(s: &str) -> Option<&str> {
    let end = s
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map_or(s.len(), |(pos, _)| pos);
    let name = &s[..end];
    is_identifier(name).then_some(name)
}
