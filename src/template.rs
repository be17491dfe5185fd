//! Template execution for `.tmpl` entries, manifests and pattern files.
//!
//! The engine is a collaborator behind the [`TemplateEngine`] trait. The
//! built-in [`BuiltinTemplateEngine`] understands a small subset of the
//! familiar double-brace syntax:
//!
//! - `{{ .a.b }}` looks up a key path in the data; `{{ . }}` renders the data itself
//! - `{{ if .x }}...{{ else }}...{{ end }}` renders a branch on truthiness
//! - `{{ template "name" . }}` includes a named template with the given data
//! - `{{-` and `-}}` trim whitespace before and after the action
//! - `{{/* comment */}}` renders nothing
//!
//! Looking up a key that does not exist is an error.
use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use serde_json::Value;

use crate::error::SourceError;

/// Data and named templates available to every execution.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// Template data, a JSON object.
    pub data: Value,
    /// Named templates, from the templates directory.
    pub templates: BTreeMap<String, String>,
}

/// Executes templates.
pub trait TemplateEngine: Send + Sync + fmt::Debug {
    /// Render `source` (named `name` in errors) against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Template`] if the template cannot be parsed or
    /// references missing data.
    fn execute(&self, name: &str, source: &[u8], ctx: &TemplateContext) -> Result<Vec<u8>>;
}

/// The built-in double-brace engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTemplateEngine;

impl TemplateEngine for BuiltinTemplateEngine {
    fn execute(&self, name: &str, source: &[u8], ctx: &TemplateContext) -> Result<Vec<u8>> {
        let source = String::from_utf8_lossy(source);
        let nodes = parse(name, &source)?;
        let mut out = String::new();
        Renderer { name, ctx, depth: 0 }.render(&nodes, &ctx.data, &mut out)?;
        Ok(out.into_bytes())
    }
}

const MAX_INCLUDE_DEPTH: usize = 32;

fn template_error(name: &str, reason: impl Into<String>) -> anyhow::Error {
    SourceError::Template {
        name: name.to_string(),
        reason: reason.into(),
    }
    .into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    /// `.` or `.a.b`.
    Path(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Value(Expr),
    Include { template: String, data: Expr },
    If { cond: Expr, then: Vec<Self>, otherwise: Vec<Self> },
}

#[derive(Debug)]
enum Token {
    Text(String),
    Action(String),
}

fn lex(name: &str, source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = source;
    let mut trim_next = false;
    while !rest.is_empty() {
        let Some(open) = rest.find("{{") else {
            let text = if trim_next { rest.trim_start() } else { rest };
            tokens.push(Token::Text(text.to_string()));
            break;
        };
        let (text, after) = rest.split_at(open);
        let mut text = if trim_next { text.trim_start() } else { text };
        let mut inner = after.get(2..).unwrap_or_default();
        if let Some(stripped) = inner.strip_prefix('-')
            && stripped.starts_with(char::is_whitespace)
        {
            text = text.trim_end();
            inner = stripped;
        }
        if !text.is_empty() {
            tokens.push(Token::Text(text.to_string()));
        }
        let close = inner
            .find("}}")
            .ok_or_else(|| template_error(name, "unclosed action"))?;
        let (mut action, after) = inner.split_at(close);
        trim_next = false;
        if let Some(stripped) = action.strip_suffix('-')
            && stripped.ends_with(char::is_whitespace)
        {
            action = stripped;
            trim_next = true;
        }
        tokens.push(Token::Action(action.trim().to_string()));
        rest = after.get(2..).unwrap_or_default();
    }
    Ok(tokens)
}

fn parse_expr(name: &str, s: &str) -> Result<Expr> {
    let s = s.trim();
    if s == "." {
        return Ok(Expr::Path(Vec::new()));
    }
    let Some(path) = s.strip_prefix('.') else {
        return Err(template_error(name, format!("unsupported expression {s:?}")));
    };
    let keys: Vec<String> = path.split('.').map(str::to_string).collect();
    if keys.iter().any(|k| {
        k.is_empty() || !k.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    }) {
        return Err(template_error(name, format!("unsupported expression {s:?}")));
    }
    Ok(Expr::Path(keys))
}

fn parse_include(name: &str, args: &str) -> Result<Node> {
    let args = args.trim();
    let quoted = args
        .strip_prefix('"')
        .and_then(|s| s.split_once('"'))
        .ok_or_else(|| template_error(name, "template name must be a quoted string"))?;
    let (template, data) = quoted;
    let data = if data.trim().is_empty() {
        Expr::Path(Vec::new())
    } else {
        parse_expr(name, data)?
    };
    Ok(Node::Include {
        template: template.to_string(),
        data,
    })
}

/// Parse tokens until `{{ end }}`/`{{ else }}` or the end of input.
fn parse_nodes(
    name: &str,
    tokens: &mut std::vec::IntoIter<Token>,
    nested: bool,
) -> Result<(Vec<Node>, Option<&'static str>)> {
    let mut nodes = Vec::new();
    while let Some(token) = tokens.next() {
        let action = match token {
            Token::Text(text) => {
                nodes.push(Node::Text(text));
                continue;
            }
            Token::Action(action) => action,
        };
        if action.starts_with("/*") && action.ends_with("*/") {
            continue;
        }
        match action.as_str() {
            "end" if nested => return Ok((nodes, Some("end"))),
            "else" if nested => return Ok((nodes, Some("else"))),
            "end" | "else" => return Err(template_error(name, format!("unexpected {{{{{action}}}}}"))),
            _ => {}
        }
        if let Some(cond) = action.strip_prefix("if ") {
            let cond = parse_expr(name, cond)?;
            let (then, closer) = parse_nodes(name, tokens, true)?;
            let otherwise = match closer {
                Some("else") => match parse_nodes(name, tokens, true)? {
                    (nodes, Some("end")) => nodes,
                    _ => return Err(template_error(name, "expected {{end}}")),
                },
                Some(_) => Vec::new(),
                None => return Err(template_error(name, "unclosed {{if}}")),
            };
            nodes.push(Node::If {
                cond,
                then,
                otherwise,
            });
        } else if let Some(args) = action.strip_prefix("template ") {
            nodes.push(parse_include(name, args)?);
        } else {
            nodes.push(Node::Value(parse_expr(name, &action)?));
        }
    }
    Ok((nodes, None))
}

fn parse(name: &str, source: &str) -> Result<Vec<Node>> {
    let mut tokens = lex(name, source)?.into_iter();
    let (nodes, _) = parse_nodes(name, &mut tokens, false)?;
    Ok(nodes)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f.abs() > 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

struct Renderer<'a> {
    name: &'a str,
    ctx: &'a TemplateContext,
    depth: usize,
}

impl Renderer<'_> {
    fn lookup<'v>(&self, dot: &'v Value, expr: &Expr) -> Result<&'v Value> {
        let Expr::Path(keys) = expr;
        let mut value = dot;
        for (i, key) in keys.iter().enumerate() {
            value = value.get(key).ok_or_else(|| {
                let path: Vec<&str> = keys.iter().take(i + 1).map(String::as_str).collect();
                template_error(self.name, format!("map has no entry for key .{}", path.join(".")))
            })?;
        }
        Ok(value)
    }

    fn render(&self, nodes: &[Node], dot: &Value, out: &mut String) -> Result<()> {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Value(expr) => match self.lookup(dot, expr)? {
                    Value::String(s) => out.push_str(s),
                    Value::Null => out.push_str("<no value>"),
                    other => out.push_str(&other.to_string()),
                },
                Node::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    let branch = if truthy(self.lookup(dot, cond)?) {
                        then
                    } else {
                        otherwise
                    };
                    self.render(branch, dot, out)?;
                }
                Node::Include { template, data } => {
                    if self.depth >= MAX_INCLUDE_DEPTH {
                        return Err(template_error(self.name, "template inclusion too deep"));
                    }
                    let source = self.ctx.templates.get(template).ok_or_else(|| {
                        template_error(self.name, format!("no such template {template:?}"))
                    })?;
                    let nodes = parse(template, source)?;
                    let data = self.lookup(dot, data)?;
                    Renderer {
                        name: template,
                        ctx: self.ctx,
                        depth: self.depth + 1,
                    }
                    .render(&nodes, data, out)?;
                }
            }
        }
        Ok(())
    }
}

/// Recursively merge `src` into `dst`: objects merge key by key, anything
/// else in `src` replaces the value in `dst`.
pub fn merge_data(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, value) in src {
                match dst.get_mut(&key) {
                    Some(existing) => merge_data(existing, value),
                    None => {
                        dst.insert(key, value);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}
