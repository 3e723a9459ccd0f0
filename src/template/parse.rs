//! Tokenizes a template body into literal text, `{{ path }}` variable
//! references, and `{{ xnovu_render('key', { ... }) }}` recursive-load
//! calls (§4.5 Interpolator / Recursive loader).
//!
//! This is not a general expression parser: paths follow the fixed grammar
//! `IDENT ( '.' IDENT | '[' INT ']' )*`, and the `xnovu_render` argument
//! literal is parsed by a small recursive-descent object-literal parser
//! (`parse_object_literal`) that accepts double, single, and backtick
//! quoting on keys and string values — not a general JS/JSON parser (§9).

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Literal(String),
    /// A `{{ path }}` reference; `raw` is the original `path` text
    /// (untrimmed whitespace included) so a miss can be rendered back as
    /// literal `"{{ path }}"` verbatim (§4.5 "missing paths are left as-is").
    Var { path: String, raw: String },
    Render { template_key: String, args: Map<String, Value> },
    /// A `{{ ... }}` span that is neither a valid path nor a well-formed
    /// `xnovu_render` call (e.g. malformed JSON argument). Left as-is,
    /// like a missing path, but reported as a validation error upstream.
    Malformed(String),
}

use regex::Regex;
use std::sync::OnceLock;

fn path_grammar() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*|\[[0-9]+\])*$")
            .expect("static regex is valid")
    })
}

fn is_path(candidate: &str) -> bool {
    path_grammar().is_match(candidate)
}

/// Scans `template` into a flat token stream. Unbalanced `{{` (no matching
/// `}}` found before end of input) is reported by appending the remainder
/// as a trailing `Malformed` token rather than panicking or truncating
/// silently — the Validator (§4.5) surfaces this as an "unbalanced
/// {{/}}" error.
pub fn tokenize(template: &str) -> Vec<Token> {
    let chars: Vec<char> = template.chars().collect();
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut i = 0usize;

    while i < chars.len() {
        if chars[i] == '{' && i + 1 < chars.len() && chars[i + 1] == '{' {
            let content_start = i + 2;
            match find_close(&chars, content_start) {
                Some(close_at) => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    let raw: String = chars[content_start..close_at].iter().collect();
                    tokens.push(classify(&raw));
                    i = close_at + 2;
                }
                None => {
                    // Unbalanced `{{`: the rest of the template is malformed.
                    let rest: String = chars[i..].iter().collect();
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Malformed(rest));
                    return tokens;
                }
            }
        } else {
            literal.push(chars[i]);
            i += 1;
        }
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}

/// Finds the index of the first `}` of the terminating `}}`, tracking
/// unmatched `(`/`{` depth and quoted-string spans so that an
/// `xnovu_render('key', { nested: { ... } })` call's internal braces don't
/// prematurely terminate the scan.
fn find_close(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start;
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == '\\' && i + 1 < chars.len() {
                i += 2;
                continue;
            }
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                i += 1;
            }
            '(' | '{' => {
                depth += 1;
                i += 1;
            }
            ')' => {
                depth -= 1;
                i += 1;
            }
            '}' if depth == 0 => {
                if i + 1 < chars.len() && chars[i + 1] == '}' {
                    return Some(i);
                }
                i += 1;
            }
            '}' => {
                depth -= 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    None
}

fn classify(raw: &str) -> Token {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Token::Malformed(raw.to_string());
    }

    if let Some(rest) = trimmed.strip_prefix("xnovu_render") {
        let rest = rest.trim_start();
        if let Some(inner) = rest.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
            return match parse_render_call(inner) {
                Some((key, args)) => Token::Render { template_key: key, args },
                None => Token::Malformed(raw.to_string()),
            };
        }
        return Token::Malformed(raw.to_string());
    }

    if is_path(trimmed) {
        Token::Var {
            path: trimmed.to_string(),
            raw: raw.to_string(),
        }
    } else {
        Token::Malformed(raw.to_string())
    }
}

/// Parses the inner argument list of `xnovu_render(<key>, <object>)`:
/// a quoted template key, a comma, and an object literal. The object
/// literal argument is optional; its absence yields an empty variable bag.
fn parse_render_call(inner: &str) -> Option<(String, Map<String, Value>)> {
    let mut p = LiteralParser::new(inner);
    p.skip_ws();
    let key = p.parse_quoted_string()?;
    p.skip_ws();
    if p.peek() == Some(',') {
        p.advance();
        p.skip_ws();
        if p.at_end() {
            return Some((key, Map::new()));
        }
        let value = p.parse_value()?;
        p.skip_ws();
        let args = match value {
            Value::Object(map) => map,
            _ => return None,
        };
        Some((key, args))
    } else {
        Some((key, Map::new()))
    }
}

/// Recursive-descent parser for the small object-literal grammar
/// `xnovu_render`'s second argument uses: double/single/backtick quoted
/// keys and string values, nested objects, arrays, numbers, booleans,
/// and `null`. Unquoted identifier keys (`{ name: "x" }`) are accepted,
/// matching the loose object-literal syntax the call site actually uses.
struct LiteralParser {
    chars: Vec<char>,
    pos: usize,
}

impl LiteralParser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_value(&mut self) -> Option<Value> {
        self.skip_ws();
        match self.peek()? {
            '{' => self.parse_object().map(Value::Object),
            '[' => self.parse_array(),
            '"' | '\'' | '`' => self.parse_quoted_string().map(Value::String),
            _ => self.parse_bare_token(),
        }
    }

    fn parse_object(&mut self) -> Option<Map<String, Value>> {
        if self.advance() != Some('{') {
            return None;
        }
        let mut map = Map::new();
        self.skip_ws();
        if self.peek() == Some('}') {
            self.advance();
            return Some(map);
        }
        loop {
            self.skip_ws();
            let key = if matches!(self.peek(), Some('"') | Some('\'') | Some('`')) {
                self.parse_quoted_string()?
            } else {
                self.parse_bare_identifier()?
            };
            self.skip_ws();
            if self.advance() != Some(':') {
                return None;
            }
            let value = self.parse_value()?;
            map.insert(key, value);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.advance();
                    self.skip_ws();
                    if self.peek() == Some('}') {
                        self.advance();
                        return Some(map);
                    }
                }
                Some('}') => {
                    self.advance();
                    return Some(map);
                }
                _ => return None,
            }
        }
    }

    fn parse_array(&mut self) -> Option<Value> {
        if self.advance() != Some('[') {
            return None;
        }
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(']') {
            self.advance();
            return Some(Value::Array(items));
        }
        loop {
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.advance();
                    self.skip_ws();
                }
                Some(']') => {
                    self.advance();
                    return Some(Value::Array(items));
                }
                _ => return None,
            }
        }
    }

    fn parse_quoted_string(&mut self) -> Option<String> {
        let quote = self.advance()?;
        if quote != '"' && quote != '\'' && quote != '`' {
            return None;
        }
        let mut out = String::new();
        loop {
            let c = self.advance()?;
            if c == '\\' {
                out.push(self.advance()?);
            } else if c == quote {
                return Some(out);
            } else {
                out.push(c);
            }
        }
    }

    fn parse_bare_identifier(&mut self) -> Option<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_' || c == '$') {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        Some(self.chars[start..self.pos].iter().collect())
    }

    fn parse_bare_token(&mut self) -> Option<Value> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if !c.is_whitespace() && c != ',' && c != '}' && c != ']') {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        let token: String = self.chars[start..self.pos].iter().collect();
        match token.as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            "null" => Some(Value::Null),
            _ => token
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .or(Some(Value::String(token))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_literal_and_var() {
        let tokens = tokenize("Hi {{ userName }}!");
        assert_eq!(
            tokens,
            vec![
                Token::Literal("Hi ".to_string()),
                Token::Var { path: "userName".to_string(), raw: " userName ".to_string() },
                Token::Literal("!".to_string()),
            ]
        );
    }

    #[test]
    fn tokenizes_nested_path() {
        let tokens = tokenize("{{ user.items[0].name }}");
        assert_eq!(
            tokens,
            vec![Token::Var {
                path: "user.items[0].name".to_string(),
                raw: " user.items[0].name ".to_string()
            }]
        );
    }

    #[test]
    fn tokenizes_render_call_with_nested_object() {
        let tokens = tokenize("{{ xnovu_render('footer', { year: 2026, nested: { a: 'b' } }) }}");
        match &tokens[0] {
            Token::Render { template_key, args } => {
                assert_eq!(template_key, "footer");
                assert_eq!(args.get("year"), Some(&Value::from(2026.0)));
                assert!(args.get("nested").unwrap().is_object());
            }
            other => panic!("expected Render token, got {other:?}"),
        }
    }

    #[test]
    fn render_call_without_args_yields_empty_map() {
        let tokens = tokenize("{{ xnovu_render('footer') }}");
        match &tokens[0] {
            Token::Render { template_key, args } => {
                assert_eq!(template_key, "footer");
                assert!(args.is_empty());
            }
            other => panic!("expected Render token, got {other:?}"),
        }
    }

    #[test]
    fn unbalanced_braces_become_malformed() {
        let tokens = tokenize("Hi {{ userName");
        assert!(matches!(tokens.last(), Some(Token::Malformed(_))));
    }

    #[test]
    fn empty_braces_are_malformed() {
        let tokens = tokenize("{{ }}");
        assert!(matches!(tokens[0], Token::Malformed(_)));
    }

    #[test]
    fn quotes_accept_all_three_styles() {
        for call in [
            "{{ xnovu_render(\"k\", { a: \"x\" }) }}",
            "{{ xnovu_render('k', { a: 'x' }) }}",
            "{{ xnovu_render(`k`, { a: `x` }) }}",
        ] {
            let tokens = tokenize(call);
            match &tokens[0] {
                Token::Render { template_key, args } => {
                    assert_eq!(template_key, "k");
                    assert_eq!(args.get("a"), Some(&Value::String("x".to_string())));
                }
                other => panic!("expected Render token, got {other:?}"),
            }
        }
    }
}
