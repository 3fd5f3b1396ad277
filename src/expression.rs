//! Sandboxed evaluation of flow conditions and `${var}` interpolation over
//! a JSON context. Grammar: comparison operators, boolean `and/or/not`,
//! numeric arithmetic, string literals, `${path}` resolution, and calls to
//! a fixed safe function set (`len`, `sum`, `all`, `any`). No arbitrary code
//! execution — a hand-rolled recursive-descent parser, the idiom the
//! teacher reaches for with `compiler/parser.rs`'s small imperative state
//! machine rather than pulling in a parser-combinator crate for a grammar
//! this size.

use crate::error::EngineError;
use serde_json::Value as Json;
use std::fmt;

/// Evaluates conditions and interpolates templates against a `Context`.
/// Stateless — every call takes the context it needs.
#[derive(Default, Clone, Copy)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// `Evaluate(expr, ctx) -> bool`. Failing evaluation returns `false` and
    /// the caller is expected to emit `expression.error` (the `Engine`/
    /// `GatewayEvaluator` do this, since only they hold the event stream).
    pub fn evaluate(&self, expr: &str, ctx: &Json) -> Result<bool, EngineError> {
        let tokens = tokenize(expr).map_err(EngineError::Expression)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.parse_expr().map_err(EngineError::Expression)?;
        parser.expect_end().map_err(EngineError::Expression)?;
        let value = eval(&ast, ctx).map_err(EngineError::Expression)?;
        Ok(truthy(&value))
    }

    /// `Interpolate(tmpl, ctx) -> String`, replacing `${path}` with the value
    /// at the dotted path. Missing variables interpolate to empty string.
    pub fn interpolate(&self, tmpl: &str, ctx: &Json) -> String {
        let mut out = String::with_capacity(tmpl.len());
        let bytes = tmpl.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
                if let Some(end) = tmpl[i + 2..].find('}') {
                    let path = &tmpl[i + 2..i + 2 + end];
                    let value = resolve_path(ctx, path);
                    out.push_str(&value.map(json_to_display).unwrap_or_default());
                    i = i + 2 + end + 1;
                    continue;
                }
            }
            out.push(tmpl[i..].chars().next().unwrap());
            i += tmpl[i..].chars().next().unwrap().len_utf8();
        }
        out
    }
}

fn json_to_display(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

/// Evaluate an expression to its raw JSON value rather than coercing to
/// bool — used by the Script Task executor, which binds context as its only
/// namespace and returns the last expression's value (spec §4.6).
pub fn eval_to_json(expr: &str, ctx: &Json) -> Result<Json, String> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr()?;
    parser.expect_end()?;
    eval(&ast, ctx)
}

/// Resolve a dotted path (`a.b.c`) against a JSON object/array tree.
pub fn resolve_path<'a>(ctx: &'a Json, path: &str) -> Option<&'a Json> {
    let mut current = ctx;
    for part in path.split('.') {
        match current {
            Json::Object(map) => current = map.get(part)?,
            Json::Array(arr) => current = arr.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(current)
}

fn truthy(v: &Json) -> bool {
    match v {
        Json::Bool(b) => *b,
        Json::Null => false,
        Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Json::String(s) => !s.is_empty(),
        Json::Array(a) => !a.is_empty(),
        Json::Object(o) => !o.is_empty(),
    }
}

// ─── Tokenizer ──────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Var(String),
    Num(f64),
    Str(String),
    Ident(String),
    Op(String),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Tok>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut toks = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '$' && chars.get(i + 1) == Some(&'{') {
            let start = i + 2;
            let end = chars[start..]
                .iter()
                .position(|&c| c == '}')
                .ok_or_else(|| "unterminated ${...}".to_string())?;
            let path: String = chars[start..start + end].iter().collect();
            toks.push(Tok::Var(path));
            i = start + end + 1;
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            let start = i + 1;
            let mut j = start;
            while j < chars.len() && chars[j] != quote {
                j += 1;
            }
            if j >= chars.len() {
                return Err("unterminated string literal".to_string());
            }
            toks.push(Tok::Str(chars[start..j].iter().collect()));
            i = j + 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()))
        {
            let start = i;
            let mut j = i + 1;
            while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                j += 1;
            }
            let s: String = chars[start..j].iter().collect();
            let n: f64 = s.parse().map_err(|_| format!("bad number literal: {s}"))?;
            toks.push(Tok::Num(n));
            i = j;
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            let mut j = i + 1;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            toks.push(Tok::Ident(chars[start..j].iter().collect()));
            i = j;
            continue;
        }
        // Two-char operators first.
        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        if ["==", "!=", "<=", ">="].contains(&two.as_str()) {
            toks.push(Tok::Op(two));
            i += 2;
            continue;
        }
        match c {
            '<' | '>' | '+' | '-' | '*' | '/' => {
                toks.push(Tok::Op(c.to_string()));
                i += 1;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(toks)
}

// ─── AST ────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
enum Ast {
    Var(String),
    Num(f64),
    Str(String),
    Bool(bool),
    Not(Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Cmp(String, Box<Ast>, Box<Ast>),
    Arith(String, Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

impl fmt::Display for Ast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

type PResult<T> = Result<T, String>;

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect_end(&self) -> PResult<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(format!("unexpected trailing tokens at {}", self.pos))
        }
    }

    // expr := or_expr
    fn parse_expr(&mut self) -> PResult<Ast> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> PResult<Ast> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Tok::Ident(i)) if i == "or") {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Ast::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Ast> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Tok::Ident(i)) if i == "and") {
            self.bump();
            let rhs = self.parse_not()?;
            lhs = Ast::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> PResult<Ast> {
        if matches!(self.peek(), Some(Tok::Ident(i)) if i == "not") {
            self.bump();
            return Ok(Ast::Not(Box::new(self.parse_not()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> PResult<Ast> {
        let lhs = self.parse_add()?;
        if let Some(Tok::Op(op)) = self.peek().cloned() {
            if ["==", "!=", "<", "<=", ">", ">="].contains(&op.as_str()) {
                self.bump();
                let rhs = self.parse_add()?;
                return Ok(Ast::Cmp(op, Box::new(lhs), Box::new(rhs)));
            }
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> PResult<Ast> {
        let mut lhs = self.parse_mul()?;
        loop {
            match self.peek().cloned() {
                Some(Tok::Op(op)) if op == "+" || op == "-" => {
                    self.bump();
                    let rhs = self.parse_mul()?;
                    lhs = Ast::Arith(op, Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> PResult<Ast> {
        let mut lhs = self.parse_unary()?;
        loop {
            match self.peek().cloned() {
                Some(Tok::Op(op)) if op == "*" || op == "/" => {
                    self.bump();
                    let rhs = self.parse_unary()?;
                    lhs = Ast::Arith(op, Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Ast> {
        if matches!(self.peek(), Some(Tok::Op(op)) if op == "-") {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Ast::Arith(
                "-".to_string(),
                Box::new(Ast::Num(0.0)),
                Box::new(inner),
            ));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> PResult<Ast> {
        match self.bump() {
            Some(Tok::Var(p)) => Ok(Ast::Var(p)),
            Some(Tok::Num(n)) => Ok(Ast::Num(n)),
            Some(Tok::Str(s)) => Ok(Ast::Str(s)),
            Some(Tok::Ident(i)) if i == "true" => Ok(Ast::Bool(true)),
            Some(Tok::Ident(i)) if i == "false" => Ok(Ast::Bool(false)),
            Some(Tok::Ident(name)) if matches!(self.peek(), Some(Tok::LParen)) => {
                self.bump(); // '('
                let mut args = Vec::new();
                if !matches!(self.peek(), Some(Tok::RParen)) {
                    args.push(self.parse_expr()?);
                    while matches!(self.peek(), Some(Tok::Comma)) {
                        self.bump();
                        args.push(self.parse_expr()?);
                    }
                }
                match self.bump() {
                    Some(Tok::RParen) => {}
                    _ => return Err("expected ')'".to_string()),
                }
                if !["len", "sum", "all", "any"].contains(&name.as_str()) {
                    return Err(format!("unknown function '{name}'"));
                }
                Ok(Ast::Call(name, args))
            }
            Some(Tok::LParen) => {
                let inner = self.parse_expr()?;
                match self.bump() {
                    Some(Tok::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            other => Err(format!("unexpected token: {other:?}")),
        }
    }
}

fn eval(ast: &Ast, ctx: &Json) -> Result<Json, String> {
    match ast {
        Ast::Var(path) => Ok(resolve_path(ctx, path).cloned().unwrap_or(Json::Null)),
        Ast::Num(n) => Ok(serde_json::json!(n)),
        Ast::Str(s) => Ok(Json::String(s.clone())),
        Ast::Bool(b) => Ok(Json::Bool(*b)),
        Ast::Not(inner) => Ok(Json::Bool(!truthy(&eval(inner, ctx)?))),
        Ast::And(a, b) => {
            let lv = eval(a, ctx)?;
            if !truthy(&lv) {
                return Ok(Json::Bool(false));
            }
            Ok(Json::Bool(truthy(&eval(b, ctx)?)))
        }
        Ast::Or(a, b) => {
            let lv = eval(a, ctx)?;
            if truthy(&lv) {
                return Ok(Json::Bool(true));
            }
            Ok(Json::Bool(truthy(&eval(b, ctx)?)))
        }
        Ast::Cmp(op, a, b) => {
            let lv = eval(a, ctx)?;
            let rv = eval(b, ctx)?;
            Ok(Json::Bool(compare(op, &lv, &rv)?))
        }
        Ast::Arith(op, a, b) => {
            let lv = as_number(&eval(a, ctx)?)?;
            let rv = as_number(&eval(b, ctx)?)?;
            let result = match op.as_str() {
                "+" => lv + rv,
                "-" => lv - rv,
                "*" => lv * rv,
                "/" => {
                    if rv == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    lv / rv
                }
                other => return Err(format!("unknown operator '{other}'")),
            };
            Ok(serde_json::json!(result))
        }
        Ast::Call(name, args) => {
            let values: Vec<Json> = args.iter().map(|a| eval(a, ctx)).collect::<Result<_, _>>()?;
            call_fn(name, &values)
        }
    }
}

fn as_number(v: &Json) -> Result<f64, String> {
    v.as_f64().ok_or_else(|| format!("expected number, got {v}"))
}

fn compare(op: &str, a: &Json, b: &Json) -> Result<bool, String> {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return Ok(match op {
            "==" => a == b,
            "!=" => a != b,
            "<" => a < b,
            "<=" => a <= b,
            ">" => a > b,
            ">=" => a >= b,
            other => return Err(format!("unknown operator '{other}'")),
        });
    }
    match op {
        "==" => Ok(a == b),
        "!=" => Ok(a != b),
        other => Err(format!("operator '{other}' requires numeric operands")),
    }
}

fn call_fn(name: &str, args: &[Json]) -> Result<Json, String> {
    let collection = args
        .first()
        .ok_or_else(|| format!("{name}() requires one argument"))?;
    let items: &Vec<Json> = match collection {
        Json::Array(items) => items,
        other => return Err(format!("{name}() expects an array, got {other}")),
    };
    match name {
        "len" => Ok(serde_json::json!(items.len() as f64)),
        "sum" => {
            let total: f64 = items.iter().filter_map(|v| v.as_f64()).sum();
            Ok(serde_json::json!(total))
        }
        "all" => Ok(Json::Bool(items.iter().all(truthy))),
        "any" => Ok(Json::Bool(items.iter().any(truthy))),
        other => Err(format!("unknown function '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparison() {
        let eval = ExpressionEvaluator::new();
        let ctx = json!({"sum": 12});
        assert!(eval.evaluate("${sum} > 10", &ctx).unwrap());
        assert!(!eval.evaluate("${sum} > 100", &ctx).unwrap());
    }

    #[test]
    fn boolean_combinators() {
        let eval = ExpressionEvaluator::new();
        let ctx = json!({"a": true, "b": false});
        assert!(eval.evaluate("${a} and not ${b}", &ctx).unwrap());
        assert!(eval.evaluate("${a} or ${b}", &ctx).unwrap());
        assert!(!eval.evaluate("${b} and ${a}", &ctx).unwrap());
    }

    #[test]
    fn functions_over_collections() {
        let eval = ExpressionEvaluator::new();
        let ctx = json!({"items": [1, 2, 3]});
        assert!(eval.evaluate("len(${items}) == 3", &ctx).unwrap());
        assert!(eval.evaluate("sum(${items}) == 6", &ctx).unwrap());
    }

    #[test]
    fn failing_evaluation_is_false_not_error() {
        let eval = ExpressionEvaluator::new();
        let ctx = json!({});
        // Unknown identifier used as a bare token is a parse error -> caller treats as false.
        assert!(eval.evaluate("${missing} > 1", &ctx).is_err() == false);
        assert!(!eval.evaluate("${missing} > 1", &ctx).unwrap());
    }

    #[test]
    fn interpolation_missing_var_is_empty() {
        let eval = ExpressionEvaluator::new();
        let ctx = json!({"name": "Ada"});
        assert_eq!(eval.interpolate("hi ${name}", &ctx), "hi Ada");
        assert_eq!(eval.interpolate("hi ${missing}", &ctx), "hi ");
    }
}
