//! Tokenizer and pattern helpers for decompiled pseudo-C
//!
//! Decompiler output is C-like but not always valid C, so nothing here builds a
//! syntax tree. The text is split into span-preserving tokens and a handful of
//! shapes are recognised on top of them: call sites with their argument lists,
//! assignment statements, and leading casts.

/// Kind of a lexical token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Identifier or keyword
    Ident,
    /// String literal, narrow or wide (`L"..."`)
    Str,
    /// Character literal
    Char,
    /// Numeric literal
    Number,
    /// Operator or punctuation
    Punct,
}

/// A token, stored as a byte span into the scanned text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    /// Token kind
    pub kind: TokenKind,
    /// Byte offset of the first character
    pub start: usize,
    /// Byte offset one past the last character
    pub end: usize,
}

impl Token {
    /// Returns the token text within `src`.
    #[inline]
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.start..self.end]
    }
}

const PUNCT2: [&str; 20] = [
    "==", "!=", "<=", ">=", "->", "&&", "||", "+=", "-=", "*=", "/=", "%=", "|=", "&=", "^=", "<<",
    ">>", "++", "--", "::",
];

const KEYWORDS: [&str; 9] = [
    "if", "while", "for", "switch", "return", "sizeof", "do", "else", "case",
];

/// Splits `src` into tokens, skipping whitespace and comments.
pub fn tokenize(src: &str) -> Vec<Token> {
    let bytes = src.as_bytes();
    let len = bytes.len();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < len {
        let c = bytes[i];

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if c == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < len && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i = src[i + 2..].find("*/").map_or(len, |pos| i + 2 + pos + 2);
            continue;
        }

        let start = i;
        let kind = if c == b'"' || (c == b'L' && bytes.get(i + 1) == Some(&b'"')) {
            let open = if c == b'L' { i + 1 } else { i };
            i = scan_quoted(bytes, open, b'"');
            TokenKind::Str
        } else if c == b'\'' {
            i = scan_quoted(bytes, i, b'\'');
            TokenKind::Char
        } else if c.is_ascii_alphabetic() || c == b'_' {
            while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            TokenKind::Ident
        } else if c.is_ascii_digit() {
            while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                i += 1;
            }
            TokenKind::Number
        } else if !c.is_ascii() {
            i += src[i..].chars().next().map_or(1, char::len_utf8);
            TokenKind::Punct
        } else {
            let wide = PUNCT2.iter().any(|p| bytes[i..].starts_with(p.as_bytes()));
            i += if wide { 2 } else { 1 };
            TokenKind::Punct
        };

        tokens.push(Token {
            kind,
            start,
            end: i,
        });
    }

    tokens
}

fn scan_quoted(bytes: &[u8], open: usize, quote: u8) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Returns the raw contents of a string literal token text (`"abc"` or `L"abc"`).
pub fn string_contents(literal: &str) -> Option<&str> {
    let body = literal.strip_prefix('L').unwrap_or(literal);
    let body = body.strip_prefix('"')?;
    Some(body.strip_suffix('"').unwrap_or(body))
}

/// Returns true if `name` is a C keyword that can be followed by a parenthesis.
pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

/// Returns true for `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Removes every whitespace character.
pub fn compact(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Returns true if `expr` contains `name` as a whole identifier.
pub fn contains_identifier(expr: &str, name: &str) -> bool {
    tokenize(expr)
        .iter()
        .any(|t| t.kind == TokenKind::Ident && t.text(expr) == name)
}

/// Returns the text following the first occurrence of identifier `name` in `expr`.
pub fn text_after_identifier<'a>(expr: &'a str, name: &str) -> Option<&'a str> {
    tokenize(expr)
        .iter()
        .find(|t| t.kind == TokenKind::Ident && t.text(expr) == name)
        .map(|t| &expr[t.end..])
}

/// Strips leading type casts such as `(HMODULE)` or `(char *)`.
///
/// Only parenthesised groups made of identifiers and `*` count as casts, and a
/// cast is only stripped when something follows it.
pub fn strip_casts(expr: &str) -> &str {
    let mut rest = expr.trim();
    loop {
        let tokens = tokenize(rest);
        if tokens.first().map(|t| t.text(rest)) != Some("(") {
            return rest;
        }

        let close = tokens.iter().skip(1).position(|t| {
            let text = t.text(rest);
            !(t.kind == TokenKind::Ident || text == "*")
        });
        let Some(close) = close.map(|pos| pos + 1) else {
            return rest;
        };

        if close < 2 || tokens[close].text(rest) != ")" || close + 1 >= tokens.len() {
            return rest;
        }

        rest = rest[tokens[close].end..].trim_start();
    }
}

/// Returns the variables an expression reads.
///
/// Type names inside casts, callees and keywords are skipped, so
/// `*(HMODULE *)((int)this + 0x1c)` yields `this` and `&local_8` yields `local_8`.
pub fn operand_names(expr: &str) -> Vec<&str> {
    let tokens = tokenize(expr);
    let at = |i: usize| tokens.get(i).map_or("", |t| t.text(expr));
    let mut names = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        if at(i) == "(" {
            let close = (i + 1..tokens.len())
                .find(|&j| !(tokens[j].kind == TokenKind::Ident || at(j) == "*"));
            if let Some(close) = close
                && close > i + 1
                && at(close) == ")"
                && close + 1 < tokens.len()
            {
                i = close + 1;
                continue;
            }
        }

        let token = &tokens[i];
        if token.kind == TokenKind::Ident && at(i + 1) != "(" && !is_keyword(token.text(expr)) {
            names.push(token.text(expr));
        }
        i += 1;
    }
    names
}

/// A call expression found in pseudocode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Name of the called function
    pub callee: String,
    /// Actual argument texts, trimmed
    pub args: Vec<String>,
    /// Byte offset of the callee name
    pub start: usize,
    /// Byte offset one past the closing parenthesis
    pub end: usize,
    /// True when the parenthesis is followed by a body, i.e. this is the function signature
    pub definition: bool,
}

/// An assignment statement `lhs = rhs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Assigned expression
    pub lhs: String,
    /// Assigned value
    pub rhs: String,
    /// Byte offset where the left-hand side starts
    pub start: usize,
    /// Byte offset one past the right-hand side
    pub end: usize,
}

/// Pattern matcher over a token stream
pub struct Scanner<'a> {
    src: &'a str,
    tokens: &'a [Token],
}

impl<'a> Scanner<'a> {
    /// Creates a scanner over already tokenized text.
    pub fn new(src: &'a str, tokens: &'a [Token]) -> Self {
        Scanner { src, tokens }
    }

    fn text(&self, index: usize) -> &'a str {
        self.tokens.get(index).map_or("", |t| t.text(self.src))
    }

    fn matching_close(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;
        for (index, token) in self.tokens.iter().enumerate().skip(open) {
            match token.text(self.src) {
                "(" => depth += 1,
                ")" => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(index);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn span(&self, first: usize, last_exclusive: usize) -> &'a str {
        if first >= last_exclusive {
            return "";
        }
        &self.src[self.tokens[first].start..self.tokens[last_exclusive - 1].end]
    }

    /// Returns every call site in source order, nested calls included.
    pub fn calls(&self) -> Vec<CallSite> {
        let mut calls = Vec::new();

        for (index, token) in self.tokens.iter().enumerate() {
            if token.kind != TokenKind::Ident || is_keyword(token.text(self.src)) {
                continue;
            }

            let mut callee = token.text(self.src).to_string();
            let mut open = index + 1;
            if self.text(open) == "<" && self.text(open + 1) == ">" {
                callee.push_str("<>");
                open += 2;
            }
            if self.text(open) != "(" {
                continue;
            }
            let Some(close) = self.matching_close(open) else {
                continue;
            };

            let mut args = Vec::new();
            let mut depth = 0usize;
            let mut arg_start = open + 1;
            for inner in open + 1..close {
                match self.text(inner) {
                    "(" | "[" => depth += 1,
                    ")" | "]" => depth = depth.saturating_sub(1),
                    "," if depth == 0 => {
                        args.push(self.span(arg_start, inner).trim().to_string());
                        arg_start = inner + 1;
                    }
                    _ => {}
                }
            }
            if arg_start < close || !args.is_empty() {
                args.push(self.span(arg_start, close).trim().to_string());
            }

            calls.push(CallSite {
                callee,
                args,
                start: token.start,
                end: self.tokens[close].end,
                definition: self.text(close + 1) == "{",
            });
        }

        calls
    }

    /// Returns every assignment in source order.
    ///
    /// Compound assignments (`+=`, `|=`, ...) and comparisons are not assignments.
    pub fn assignments(&self) -> Vec<Assignment> {
        let mut assignments = Vec::new();

        for (eq, token) in self.tokens.iter().enumerate() {
            if token.kind != TokenKind::Punct || token.text(self.src) != "=" {
                continue;
            }

            let mut first = eq;
            let mut depth = 0usize;
            while first > 0 {
                let text = self.text(first - 1);
                match text {
                    ")" | "]" => depth += 1,
                    "(" | "[" => {
                        if depth == 0 {
                            break;
                        }
                        depth -= 1;
                    }
                    ";" | "{" | "}" | "," | ":" | "?" | "=" | "&&" | "||" | "==" | "!="
                    | "return" | "else" | "do"
                        if depth == 0 =>
                    {
                        break;
                    }
                    _ => {}
                }
                first -= 1;
            }

            let mut last = eq + 1;
            depth = 0;
            while last < self.tokens.len() {
                match self.text(last) {
                    "(" | "[" => depth += 1,
                    ")" | "]" => {
                        if depth == 0 {
                            break;
                        }
                        depth -= 1;
                    }
                    ";" | "," | "{" | "}" if depth == 0 => break,
                    _ => {}
                }
                last += 1;
            }

            if first == eq || last == eq + 1 {
                continue;
            }

            assignments.push(Assignment {
                lhs: self.span(first, eq).to_string(),
                rhs: self.span(eq + 1, last).to_string(),
                start: self.tokens[first].start,
                end: self.tokens[last - 1].end,
            });
        }

        assignments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calls(src: &str) -> Vec<CallSite> {
        let tokens = tokenize(src);
        Scanner::new(src, &tokens).calls()
    }

    fn assignments(src: &str) -> Vec<Assignment> {
        let tokens = tokenize(src);
        Scanner::new(src, &tokens).assignments()
    }

    #[test]
    fn test_tokenize_strings_and_comments() {
        let src = "/* hdr */ h = LoadLibraryW(L\"user32.dll\"); // tail\nx = 'a';";
        let tokens = tokenize(src);
        let texts: Vec<_> = tokens.iter().map(|t| t.text(src)).collect();
        assert_eq!(
            texts,
            vec!["h", "=", "LoadLibraryW", "(", "L\"user32.dll\"", ")", ";", "x", "=", "'a'", ";"]
        );
        assert_eq!(tokens[4].kind, TokenKind::Str);
        assert_eq!(string_contents(tokens[4].text(src)), Some("user32.dll"));
    }

    #[test]
    fn test_tokenize_escaped_quote() {
        let src = r#"s = "a\"b";"#;
        let tokens = tokenize(src);
        assert_eq!(tokens[2].text(src), r#""a\"b""#);
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn test_calls_balanced_arguments() {
        let found = calls("p = GetProcAddress(*(HMODULE *)((int)this + 0x1c),(LPCSTR)name);");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].callee, "GetProcAddress");
        assert_eq!(
            found[0].args,
            vec!["*(HMODULE *)((int)this + 0x1c)", "(LPCSTR)name"]
        );
        assert!(!found[0].definition);
    }

    #[test]
    fn test_calls_definition_and_empty_args() {
        let found = calls("void FUN_00401000(int param_1)\n{\n  FUN_00401100();\n  return;\n}");
        assert_eq!(found.len(), 2);
        assert!(found[0].definition);
        assert_eq!(found[0].args, vec!["int param_1"]);
        assert_eq!(found[1].callee, "FUN_00401100");
        assert!(found[1].args.is_empty());
    }

    #[test]
    fn test_calls_template_callee() {
        let found = calls("basic_string<>(local_28,\"MessageBoxA\");");
        assert_eq!(found[0].callee, "basic_string<>");
        assert_eq!(found[0].args.len(), 2);
    }

    #[test]
    fn test_assignments() {
        let found = assignments("pHVar1 = LoadLibraryA(\"a.dll\");\n*param_1 = pHVar1;\nx += 1;");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].lhs, "pHVar1");
        assert_eq!(found[0].rhs, "LoadLibraryA(\"a.dll\")");
        assert_eq!(found[1].lhs, "*param_1");
        assert_eq!(found[1].rhs, "pHVar1");
    }

    #[test]
    fn test_assignment_inside_condition() {
        let found = assignments("if ((h = LoadLibraryA(\"b.dll\")) != 0) { f(); }");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].lhs, "h");
        assert_eq!(found[0].rhs, "LoadLibraryA(\"b.dll\")");
    }

    #[test]
    fn test_strip_casts() {
        assert_eq!(strip_casts("(HMODULE)LoadLibraryA(x)"), "LoadLibraryA(x)");
        assert_eq!(strip_casts("(char *)(LPCSTR)local_10"), "local_10");
        assert_eq!(strip_casts("(local_10 + 4)"), "(local_10 + 4)");
        assert_eq!(strip_casts("(HMODULE)"), "(HMODULE)");
    }

    #[test]
    fn test_operand_names() {
        assert_eq!(operand_names("*(HMODULE *)((int)this + 0x1c)"), vec!["this"]);
        assert_eq!(operand_names("&local_8"), vec!["local_8"]);
        assert_eq!(operand_names("(HMODULE)FUN_00401000(param_1)"), vec!["param_1"]);
        assert!(operand_names("\"kernel32.dll\"").is_empty());
    }

    #[test]
    fn test_identifier_helpers() {
        assert!(contains_identifier("(int)this + 0x1c", "this"));
        assert!(!contains_identifier("param_10", "param_1"));
        assert_eq!(text_after_identifier("(int)this + 0x1c)", "this"), Some(" + 0x1c)"));
        assert!(is_identifier("local_8"));
        assert!(!is_identifier("&local_8"));
        assert_eq!(compact(" + 0x1c "), "+0x1c");
    }
}
