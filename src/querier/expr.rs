//! Query expressions
//!
//! A small subset of PromQL: vector selectors, number literals and
//! `sum|count|min|max|avg [by (labels)] (expr)` aggregations.

use crate::model::{MatchOp, Matcher, METRIC_NAME};
use crate::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

impl AggregateOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "sum" => Ok(Self::Sum),
            "count" => Ok(Self::Count),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "avg" => Ok(Self::Avg),
            other => Err(Error::Query(format!("unknown aggregation {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Selector(Vec<Matcher>),
    Aggregate {
        op: AggregateOp,
        grouping: Vec<String>,
        expr: Box<Expr>,
    },
}

impl Expr {
    /// Matcher lists of every selector, in evaluation order
    pub fn selectors(&self) -> Vec<&[Matcher]> {
        match self {
            Expr::Number(_) => Vec::new(),
            Expr::Selector(matchers) => vec![matchers.as_slice()],
            Expr::Aggregate { expr, .. } => expr.selectors(),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Selector(matchers) => {
                write!(f, "{{")?;
                for (i, m) in matchers.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", m)?;
                }
                write!(f, "}}")
            }
            Expr::Aggregate { op, grouping, expr } => {
                write!(f, "{}", op.as_str())?;
                if !grouping.is_empty() {
                    write!(f, " by ({})", grouping.join(", "))?;
                }
                write!(f, " ({})", expr)
            }
        }
    }
}

type CachedRegex = OnceLock<std::result::Result<Regex, regex::Error>>;

fn cached(cell: &'static CachedRegex, pattern: &str) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| Error::Internal(format!("invalid built-in pattern: {}", e)))
}

fn number_re() -> Result<&'static Regex> {
    static RE: CachedRegex = OnceLock::new();
    cached(&RE, r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$")
}

fn aggregate_prefix_re() -> Result<&'static Regex> {
    static RE: CachedRegex = OnceLock::new();
    cached(
        &RE,
        r"^(sum|count|min|max|avg)\s*(?:by\s*\(([^)]*)\))?\s*\((.+)\)$",
    )
}

fn aggregate_suffix_re() -> Result<&'static Regex> {
    static RE: CachedRegex = OnceLock::new();
    cached(
        &RE,
        r"^(sum|count|min|max|avg)\s*\((.+)\)\s*by\s*\(([^)]*)\)$",
    )
}

fn selector_re() -> Result<&'static Regex> {
    static RE: CachedRegex = OnceLock::new();
    cached(&RE, r"^([a-zA-Z_:][a-zA-Z0-9_:]*)?\s*(?:\{(.*)\})?$")
}

fn matcher_re() -> Result<&'static Regex> {
    static RE: CachedRegex = OnceLock::new();
    cached(
        &RE,
        r#"^\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*(=~|!~|!=|=)\s*(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)')\s*(?:,|$)"#,
    )
}

/// Parse a query expression.
pub fn parse(query: &str) -> Result<Expr> {
    let query = query.trim();
    if query.is_empty() {
        return Err(Error::Query("empty query".to_string()));
    }

    if let Some(inner) = strip_outer_parens(query) {
        return parse(inner);
    }

    if number_re()?.is_match(query) {
        return query
            .parse::<f64>()
            .map(Expr::Number)
            .map_err(|e| Error::Query(format!("invalid number {:?}: {}", query, e)));
    }

    let aggregate = aggregate_suffix_re()?
        .captures(query)
        .map(|c| (c.get(1), c.get(3), c.get(2)))
        .or_else(|| {
            aggregate_prefix_re()
                .ok()?
                .captures(query)
                .map(|c| (c.get(1), c.get(2), c.get(3)))
        });
    if let Some((Some(op), grouping, Some(inner))) = aggregate {
        let expr = parse(inner.as_str())?;
        if matches!(expr, Expr::Number(_)) {
            return Err(Error::Query(format!(
                "expected vector argument to {}, got scalar",
                op.as_str()
            )));
        }
        return Ok(Expr::Aggregate {
            op: AggregateOp::parse(op.as_str())?,
            grouping: grouping.map(|g| parse_grouping(g.as_str())).unwrap_or_default(),
            expr: Box::new(expr),
        });
    }

    parse_selector(query).map(Expr::Selector)
}

/// Parse a vector selector such as `up{job="api"}` into matchers.
pub fn parse_selector(selector: &str) -> Result<Vec<Matcher>> {
    let selector = selector.trim();
    let caps = selector_re()?
        .captures(selector)
        .ok_or_else(|| Error::Query(format!("unsupported expression {:?}", selector)))?;

    let mut matchers = Vec::new();
    if let Some(name) = caps.get(1) {
        matchers.push(Matcher::equal(METRIC_NAME, name.as_str()));
    }
    if let Some(body) = caps.get(2) {
        matchers.extend(parse_matchers(body.as_str())?);
    }
    if matchers.is_empty() {
        return Err(Error::Query(format!("unsupported expression {:?}", selector)));
    }
    if matchers.iter().all(|m| m.matches("")) {
        return Err(Error::Query(format!(
            "vector selector {:?} must contain at least one non-empty matcher",
            selector
        )));
    }
    Ok(matchers)
}

fn parse_matchers(mut body: &str) -> Result<Vec<Matcher>> {
    let re = matcher_re()?;
    let mut matchers = Vec::new();
    while !body.trim().is_empty() {
        let caps = re
            .captures(body)
            .ok_or_else(|| Error::Query(format!("invalid label matchers {:?}", body)))?;
        let (Some(whole), Some(name), Some(op)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            return Err(Error::Query(format!("invalid label matchers {:?}", body)));
        };
        let raw = caps.get(3).or_else(|| caps.get(4)).map_or("", |m| m.as_str());
        let op = match op.as_str() {
            "=" => MatchOp::Equal,
            "!=" => MatchOp::NotEqual,
            "=~" => MatchOp::Regex,
            _ => MatchOp::NotRegex,
        };
        matchers.push(Matcher::new(op, name.as_str(), unescape(raw))?);
        body = &body[whole.end()..];
    }
    Ok(matchers)
}

fn parse_grouping(s: &str) -> Vec<String> {
    s.split(',')
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// `(expr)` -> `expr` when the outer parentheses enclose everything.
fn strip_outer_parens(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('(')?.strip_suffix(')')?;
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    (depth == 0).then_some(inner)
}
