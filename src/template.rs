//! A compact text template engine for table-name expressions.
//!
//! The accepted syntax is a subset of Go's `text/template`, so existing
//! table-name expressions such as `events_{{._timestamp.Format "2006_01"}}`
//! keep working:
//!
//! - actions `{{ pipeline }}` with `{{-`/`-}}` whitespace trimming and
//!   `{{/* comments */}}`
//! - `if` / `else if` / `else` / `end` and `with` / `else` / `end`
//! - operands: `.`, field chains (`.a.b`), string, number and boolean
//!   literals, parenthesized pipelines, and `|` pipelines
//! - functions: `eq ne lt le gt ge and or not len print lower upper replace`
//! - timestamp methods: `Format Year Month Day Hour Minute Second YearDay
//!   Weekday Unix`
//!
//! Field chains evaluated against the root record also match flattened keys,
//! so `.eventn_ctx.event_type` resolves `eventn_ctx_event_type`.

use std::cmp::Ordering;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::data::{Record, TIMESTAMP_KEY, parse_timestamp};

/// Text rendered for values that could not be resolved.
pub const NO_VALUE: &str = "<no value>";

const FUNCTIONS: &[&str] = &[
    "eq", "ne", "lt", "le", "gt", "ge", "and", "or", "not", "len", "print", "lower", "upper",
    "replace",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template: {0}")]
    Parse(String),
    #[error("template: {0}")]
    Execute(String),
}

fn parse_err(message: impl Into<String>) -> TemplateError {
    TemplateError::Parse(message.into())
}

fn exec_err(message: impl Into<String>) -> TemplateError {
    TemplateError::Execute(message.into())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(Vec<String>),
    Dot,
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    Pipe,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Dot,
    Field(Vec<String>),
    Function(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Sub(Pipeline),
}

#[derive(Debug, Clone, PartialEq)]
struct Command {
    operands: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
struct Pipeline {
    commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Action(Pipeline),
    If {
        branches: Vec<(Pipeline, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
    With {
        pipeline: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

enum Item {
    Text(String),
    Action(Vec<Token>),
}

enum Terminator {
    End,
    Else,
    ElseIf(Pipeline),
}

/// A compiled template. Compilation happens once; rendering is read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    nodes: Vec<Node>,
}

impl Template {
    pub fn compile(source: &str) -> Result<Self, TemplateError> {
        let items = lex(source)?;
        let mut parser = Parser { items, pos: 0 };
        let (nodes, terminator) = parser.parse_list()?;
        if terminator.is_some() {
            return Err(parse_err("unexpected end or else outside a block"));
        }
        Ok(Template {
            source: source.to_string(),
            nodes,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, scope: &Scope<'_>) -> Result<String, TemplateError> {
        let mut out = String::new();
        let dot = Datum::Scope(scope);
        render_nodes(&self.nodes, &dot, &mut out)?;
        Ok(out)
    }
}

/// Root variable context: a record plus timestamp-typed overrides of some of
/// its fields. Overrides shadow the record without modifying it.
pub struct Scope<'a> {
    record: &'a Record,
    times: Vec<(&'a str, DateTime<Utc>)>,
}

impl<'a> Scope<'a> {
    pub fn new(record: &'a Record) -> Self {
        Scope {
            record,
            times: Vec::new(),
        }
    }

    pub fn with_time(mut self, key: &'a str, value: DateTime<Utc>) -> Self {
        self.times.push((key, value));
        self
    }

    fn lookup<'s>(&'s self, key: &str) -> Option<Datum<'s>> {
        if let Some((_, time)) = self.times.iter().find(|(name, _)| *name == key) {
            return Some(Datum::Time(*time));
        }
        self.record.get(key).map(Datum::Json)
    }
}

#[derive(Debug, Clone)]
enum Datum<'a> {
    Missing,
    Scope(&'a Scope<'a>),
    Json(&'a JsonValue),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Time(DateTime<Utc>),
}

impl std::fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("fields", &self.record.len())
            .field("times", &self.times)
            .finish()
    }
}

fn lex(source: &str) -> Result<Vec<Item>, TemplateError> {
    let mut items = Vec::new();
    let mut rest = source;
    let mut trim_next = false;
    while !rest.is_empty() {
        let Some(open) = rest.find("{{") else {
            push_text(&mut items, rest, trim_next);
            break;
        };
        let mut text = &rest[..open];
        let mut body_start = open + 2;
        let after_open = &rest[body_start..];
        if after_open.starts_with("- ")
            || after_open.starts_with("-\t")
            || after_open.starts_with("-\n")
        {
            text = text.trim_end();
            body_start += 1;
        }
        push_text(&mut items, text, trim_next);

        let body_and_rest = &rest[body_start..];
        let close = body_and_rest
            .find("}}")
            .ok_or_else(|| parse_err("unclosed action"))?;
        let mut body = &body_and_rest[..close];
        trim_next = false;
        if body.ends_with(" -") || body.ends_with("\t-") || body.ends_with("\n-") {
            body = &body[..body.len() - 1];
            trim_next = true;
        }
        rest = &body_and_rest[close + 2..];

        let trimmed = body.trim();
        if trimmed.starts_with("/*") {
            if !trimmed.ends_with("*/") {
                return Err(parse_err("unclosed comment"));
            }
            continue;
        }
        items.push(Item::Action(tokenize(trimmed)?));
    }
    Ok(items)
}

fn push_text(items: &mut Vec<Item>, text: &str, trim_start: bool) {
    let text = if trim_start { text.trim_start() } else { text };
    if !text.is_empty() {
        items.push(Item::Text(text.to_string()));
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize(action: &str) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = action.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(parse_err("unterminated quoted string"));
                    };
                    i += 1;
                    match ch {
                        '"' => break,
                        '\\' => {
                            let escaped = chars
                                .get(i)
                                .ok_or_else(|| parse_err("unterminated quoted string"))?;
                            i += 1;
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                        }
                        other => value.push(other),
                    }
                }
                tokens.push(Token::Str(value));
            }
            '`' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|ch| *ch == '`')
                    .ok_or_else(|| parse_err("unterminated raw quoted string"))?;
                tokens.push(Token::Str(chars[start..start + end].iter().collect()));
                i = start + end + 1;
            }
            '.' => {
                let mut segments = Vec::new();
                while chars.get(i) == Some(&'.') {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && is_ident_char(chars[end]) {
                        end += 1;
                    }
                    if end == start {
                        break;
                    }
                    segments.push(chars[start..end].iter().collect());
                    i = end;
                }
                if segments.is_empty() {
                    tokens.push(Token::Dot);
                    i += 1;
                } else {
                    tokens.push(Token::Field(segments));
                }
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                if literal.contains('.') {
                    let parsed = literal
                        .parse()
                        .map_err(|_| parse_err(format!("bad number syntax: {literal}")))?;
                    tokens.push(Token::Float(parsed));
                } else {
                    let parsed = literal
                        .parse()
                        .map_err(|_| parse_err(format!("bad number syntax: {literal}")))?;
                    tokens.push(Token::Int(parsed));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(parse_err(format!("unexpected {other:?} in action")));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    items: Vec<Item>,
    pos: usize,
}

impl Parser {
    fn parse_list(&mut self) -> Result<(Vec<Node>, Option<Terminator>), TemplateError> {
        let mut nodes = Vec::new();
        while self.pos < self.items.len() {
            let index = self.pos;
            self.pos += 1;
            let tokens = match &self.items[index] {
                Item::Text(text) => {
                    nodes.push(Node::Text(text.clone()));
                    continue;
                }
                Item::Action(tokens) => tokens.clone(),
            };
            match tokens.first() {
                None => return Err(parse_err("missing value for command")),
                Some(Token::Ident(keyword)) if keyword == "end" => {
                    expect_no_args(&tokens, "end")?;
                    return Ok((nodes, Some(Terminator::End)));
                }
                Some(Token::Ident(keyword)) if keyword == "else" => {
                    return match tokens.get(1) {
                        None => Ok((nodes, Some(Terminator::Else))),
                        Some(Token::Ident(next)) if next == "if" => Ok((
                            nodes,
                            Some(Terminator::ElseIf(parse_pipeline(&tokens[2..])?)),
                        )),
                        Some(_) => Err(parse_err("unexpected token after else")),
                    };
                }
                Some(Token::Ident(keyword)) if keyword == "if" => {
                    nodes.push(self.parse_if(parse_pipeline(&tokens[1..])?)?);
                }
                Some(Token::Ident(keyword)) if keyword == "with" => {
                    nodes.push(self.parse_with(parse_pipeline(&tokens[1..])?)?);
                }
                Some(Token::Ident(keyword))
                    if matches!(
                        keyword.as_str(),
                        "range" | "define" | "template" | "block" | "break" | "continue"
                    ) =>
                {
                    return Err(parse_err(format!("unsupported action {{{{{keyword}}}}}")));
                }
                Some(_) => nodes.push(Node::Action(parse_pipeline(&tokens)?)),
            }
        }
        Ok((nodes, None))
    }

    fn parse_if(&mut self, first: Pipeline) -> Result<Node, TemplateError> {
        let mut branches = Vec::new();
        let mut condition = first;
        loop {
            let (body, terminator) = self.parse_list()?;
            branches.push((condition, body));
            match terminator {
                Some(Terminator::End) => {
                    return Ok(Node::If {
                        branches,
                        otherwise: Vec::new(),
                    });
                }
                Some(Terminator::Else) => {
                    let otherwise = self.parse_else_body()?;
                    return Ok(Node::If {
                        branches,
                        otherwise,
                    });
                }
                Some(Terminator::ElseIf(next)) => condition = next,
                None => return Err(parse_err("unexpected EOF in if")),
            }
        }
    }

    fn parse_with(&mut self, pipeline: Pipeline) -> Result<Node, TemplateError> {
        let (body, terminator) = self.parse_list()?;
        let otherwise = match terminator {
            Some(Terminator::End) => Vec::new(),
            Some(Terminator::Else) => self.parse_else_body()?,
            Some(Terminator::ElseIf(_)) => {
                return Err(parse_err("else if is not allowed in with"));
            }
            None => return Err(parse_err("unexpected EOF in with")),
        };
        Ok(Node::With {
            pipeline,
            body,
            otherwise,
        })
    }

    fn parse_else_body(&mut self) -> Result<Vec<Node>, TemplateError> {
        match self.parse_list()? {
            (nodes, Some(Terminator::End)) => Ok(nodes),
            (_, None) => Err(parse_err("unexpected EOF in else")),
            (_, Some(_)) => Err(parse_err("expected end after else")),
        }
    }
}

fn expect_no_args(tokens: &[Token], keyword: &str) -> Result<(), TemplateError> {
    if tokens.len() > 1 {
        return Err(parse_err(format!("unexpected arguments to {keyword}")));
    }
    Ok(())
}

fn parse_pipeline(tokens: &[Token]) -> Result<Pipeline, TemplateError> {
    let (pipeline, consumed) = parse_pipeline_until(tokens, false)?;
    if consumed != tokens.len() {
        return Err(parse_err("unexpected right paren"));
    }
    Ok(pipeline)
}

fn parse_pipeline_until(
    tokens: &[Token],
    nested: bool,
) -> Result<(Pipeline, usize), TemplateError> {
    let mut commands = Vec::new();
    let mut operands = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            Token::RParen if nested => {
                i += 1;
                finish_command(&mut commands, &mut operands)?;
                return Ok((Pipeline { commands }, i));
            }
            Token::RParen => return Err(parse_err("unexpected right paren")),
            Token::Pipe => {
                finish_command(&mut commands, &mut operands)?;
                i += 1;
            }
            Token::LParen => {
                let (sub, consumed) = parse_pipeline_until(&tokens[i + 1..], true)?;
                operands.push(Operand::Sub(sub));
                i += consumed + 1;
            }
            token => {
                operands.push(operand_from(token)?);
                i += 1;
            }
        }
    }
    if nested {
        return Err(parse_err("unclosed left paren"));
    }
    finish_command(&mut commands, &mut operands)?;
    Ok((Pipeline { commands }, i))
}

fn finish_command(
    commands: &mut Vec<Command>,
    operands: &mut Vec<Operand>,
) -> Result<(), TemplateError> {
    if operands.is_empty() {
        return Err(parse_err("missing value for command"));
    }
    commands.push(Command {
        operands: std::mem::take(operands),
    });
    Ok(())
}

fn operand_from(token: &Token) -> Result<Operand, TemplateError> {
    Ok(match token {
        Token::Dot => Operand::Dot,
        Token::Field(segments) => Operand::Field(segments.clone()),
        Token::Str(value) => Operand::Str(value.clone()),
        Token::Int(value) => Operand::Int(*value),
        Token::Float(value) => Operand::Float(*value),
        Token::Ident(name) => match name.as_str() {
            "true" => Operand::Bool(true),
            "false" => Operand::Bool(false),
            name if FUNCTIONS.contains(&name) => Operand::Function(name.to_string()),
            other => return Err(parse_err(format!("function \"{other}\" not defined"))),
        },
        Token::LParen | Token::RParen | Token::Pipe => {
            return Err(parse_err("unexpected token in operand"));
        }
    })
}

fn render_nodes(nodes: &[Node], dot: &Datum<'_>, out: &mut String) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Action(pipeline) => {
                let value = eval_pipeline(pipeline, dot)?;
                out.push_str(&print_datum(&value));
            }
            Node::If {
                branches,
                otherwise,
            } => {
                let mut taken = false;
                for (condition, body) in branches {
                    if truthy(&eval_pipeline(condition, dot)?) {
                        render_nodes(body, dot, out)?;
                        taken = true;
                        break;
                    }
                }
                if !taken {
                    render_nodes(otherwise, dot, out)?;
                }
            }
            Node::With {
                pipeline,
                body,
                otherwise,
            } => {
                let value = eval_pipeline(pipeline, dot)?;
                if truthy(&value) {
                    render_nodes(body, &value, out)?;
                } else {
                    render_nodes(otherwise, dot, out)?;
                }
            }
        }
    }
    Ok(())
}

fn eval_pipeline<'a>(pipeline: &Pipeline, dot: &Datum<'a>) -> Result<Datum<'a>, TemplateError> {
    let mut previous: Option<Datum<'a>> = None;
    for command in &pipeline.commands {
        previous = Some(eval_command(command, dot, previous.take())?);
    }
    Ok(previous.unwrap_or(Datum::Missing))
}

fn eval_command<'a>(
    command: &Command,
    dot: &Datum<'a>,
    piped: Option<Datum<'a>>,
) -> Result<Datum<'a>, TemplateError> {
    let (head, rest) = command
        .operands
        .split_first()
        .ok_or_else(|| exec_err("empty command"))?;
    match head {
        Operand::Function(name) => {
            let mut args = rest
                .iter()
                .map(|operand| eval_operand(operand, dot))
                .collect::<Result<Vec<_>, _>>()?;
            args.extend(piped);
            call_function(name, args)
        }
        Operand::Field(segments) => {
            let mut args = rest
                .iter()
                .map(|operand| eval_operand(operand, dot))
                .collect::<Result<Vec<_>, _>>()?;
            args.extend(piped);
            eval_field_chain(dot, segments, args)
        }
        other => {
            if !rest.is_empty() || piped.is_some() {
                return Err(exec_err("can't give argument to non-function"));
            }
            eval_operand(other, dot)
        }
    }
}

fn eval_operand<'a>(operand: &Operand, dot: &Datum<'a>) -> Result<Datum<'a>, TemplateError> {
    Ok(match operand {
        Operand::Dot => dot.clone(),
        Operand::Field(segments) => eval_field_chain(dot, segments, Vec::new())?,
        Operand::Function(name) => call_function(name, Vec::new())?,
        Operand::Str(value) => Datum::Str(value.clone()),
        Operand::Int(value) => Datum::Int(*value),
        Operand::Float(value) => Datum::Float(*value),
        Operand::Bool(value) => Datum::Bool(*value),
        Operand::Sub(pipeline) => eval_pipeline(pipeline, dot)?,
    })
}

fn eval_field_chain<'a>(
    dot: &Datum<'a>,
    segments: &[String],
    args: Vec<Datum<'a>>,
) -> Result<Datum<'a>, TemplateError> {
    let (mut current, consumed) = match dot {
        Datum::Scope(scope) => resolve_root(*scope, segments),
        other => (other.clone(), 0),
    };
    if consumed == segments.len() {
        if !args.is_empty() {
            return Err(exec_err(format!(
                "can't give argument to non-function .{}",
                segments.join(".")
            )));
        }
        return Ok(current);
    }
    let remaining = &segments[consumed..];
    let mut args = Some(args);
    for (index, segment) in remaining.iter().enumerate() {
        let call_args = if index + 1 == remaining.len() {
            args.take().unwrap_or_default()
        } else {
            Vec::new()
        };
        current = field_of(current, segment, call_args)?;
    }
    Ok(current)
}

/// Resolves the shortest prefix of `segments` that names a root key, joining
/// segments with `_` to reach flattened keys. Returns the value and how many
/// segments it consumed.
fn resolve_root<'a>(scope: &'a Scope<'a>, segments: &[String]) -> (Datum<'a>, usize) {
    for take in 1..=segments.len() {
        let key = segments[..take].join("_");
        if let Some(found) = scope.lookup(&key) {
            return (found, take);
        }
    }
    (Datum::Missing, segments.len())
}

fn field_of<'a>(
    receiver: Datum<'a>,
    name: &str,
    args: Vec<Datum<'a>>,
) -> Result<Datum<'a>, TemplateError> {
    if let Datum::Time(time) = receiver {
        return time_method(&time, name, args);
    }
    if !args.is_empty() {
        return Err(exec_err(format!("can't give argument to non-function {name}")));
    }
    match receiver {
        Datum::Missing | Datum::Json(JsonValue::Null) => Ok(Datum::Missing),
        Datum::Scope(scope) => Ok(scope.lookup(name).unwrap_or(Datum::Missing)),
        Datum::Json(JsonValue::Object(map)) => {
            Ok(map.get(name).map(Datum::Json).unwrap_or(Datum::Missing))
        }
        other => Err(exec_err(format!(
            "can't evaluate field {name} in type {}",
            kind_name(&other)
        ))),
    }
}

fn time_method<'a>(
    time: &DateTime<Utc>,
    name: &str,
    args: Vec<Datum<'a>>,
) -> Result<Datum<'a>, TemplateError> {
    let expect_arity = |count: usize| {
        if args.len() != count {
            Err(exec_err(format!(
                "wrong number of args for {name}: want {count} got {}",
                args.len()
            )))
        } else {
            Ok(())
        }
    };
    match name {
        "Format" => {
            expect_arity(1)?;
            let Datum::Str(layout) = &args[0] else {
                return Err(exec_err("Format expects a string layout"));
            };
            Ok(Datum::Str(time.format(&go_layout_to_chrono(layout)).to_string()))
        }
        "Year" => expect_arity(0).map(|_| Datum::Int(i64::from(time.year()))),
        "Month" => expect_arity(0).map(|_| Datum::Str(time.format("%B").to_string())),
        "Day" => expect_arity(0).map(|_| Datum::Int(i64::from(time.day()))),
        "Hour" => expect_arity(0).map(|_| Datum::Int(i64::from(time.hour()))),
        "Minute" => expect_arity(0).map(|_| Datum::Int(i64::from(time.minute()))),
        "Second" => expect_arity(0).map(|_| Datum::Int(i64::from(time.second()))),
        "YearDay" => expect_arity(0).map(|_| Datum::Int(i64::from(time.ordinal()))),
        "Weekday" => expect_arity(0).map(|_| Datum::Str(time.format("%A").to_string())),
        "Unix" => expect_arity(0).map(|_| Datum::Int(time.timestamp())),
        "UTC" => expect_arity(0).map(|_| Datum::Time(*time)),
        other => Err(exec_err(format!(
            "can't evaluate field {other} in type time.Time"
        ))),
    }
}

/// Translates a Go reference layout (`2006-01-02 15:04:05`) to chrono syntax.
pub fn go_layout_to_chrono(layout: &str) -> String {
    const TOKENS: &[(&str, &str)] = &[
        (".000000000", "%.9f"),
        ("January", "%B"),
        (".000000", "%.6f"),
        ("Monday", "%A"),
        ("Z07:00", "Z"),
        ("-07:00", "%:z"),
        ("Z0700", "Z"),
        ("-0700", "%z"),
        ("2006", "%Y"),
        (".000", "%.3f"),
        ("Jan", "%b"),
        ("Mon", "%a"),
        ("MST", "%Z"),
        ("002", "%j"),
        ("01", "%m"),
        ("02", "%d"),
        ("_2", "%e"),
        ("15", "%H"),
        ("03", "%I"),
        ("04", "%M"),
        ("05", "%S"),
        ("06", "%y"),
        ("PM", "%p"),
        ("pm", "%P"),
        ("1", "%-m"),
        ("2", "%-d"),
        ("3", "%-I"),
        ("4", "%-M"),
        ("5", "%-S"),
    ];
    let mut out = String::with_capacity(layout.len() * 2);
    let mut rest = layout;
    'outer: while let Some(c) = rest.chars().next() {
        for (go, chrono) in TOKENS {
            if let Some(tail) = rest.strip_prefix(go) {
                out.push_str(chrono);
                rest = tail;
                continue 'outer;
            }
        }
        if c == '%' {
            out.push_str("%%");
        } else {
            out.push(c);
        }
        rest = &rest[c.len_utf8()..];
    }
    out
}

fn call_function<'a>(name: &str, args: Vec<Datum<'a>>) -> Result<Datum<'a>, TemplateError> {
    let need = |count: usize| {
        if args.len() < count {
            Err(exec_err(format!(
                "wrong number of args for {name}: want at least {count} got {}",
                args.len()
            )))
        } else {
            Ok(())
        }
    };
    match name {
        "eq" => {
            need(2)?;
            Ok(Datum::Bool(
                args[1..]
                    .iter()
                    .any(|other| compare(&args[0], other) == Some(Ordering::Equal)),
            ))
        }
        "ne" => {
            need(2)?;
            Ok(Datum::Bool(compare(&args[0], &args[1]) != Some(Ordering::Equal)))
        }
        "lt" | "le" | "gt" | "ge" => {
            need(2)?;
            let ordering = compare(&args[0], &args[1]).ok_or_else(|| {
                exec_err(format!(
                    "incompatible types for comparison: {} and {}",
                    kind_name(&args[0]),
                    kind_name(&args[1])
                ))
            })?;
            Ok(Datum::Bool(match name {
                "lt" => ordering == Ordering::Less,
                "le" => ordering != Ordering::Greater,
                "gt" => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        "and" => {
            need(1)?;
            let mut args = args.into_iter();
            let mut last = Datum::Missing;
            for arg in args.by_ref() {
                if !truthy(&arg) {
                    return Ok(arg);
                }
                last = arg;
            }
            Ok(last)
        }
        "or" => {
            need(1)?;
            let mut last = Datum::Missing;
            for arg in args {
                if truthy(&arg) {
                    return Ok(arg);
                }
                last = arg;
            }
            Ok(last)
        }
        "not" => {
            need(1)?;
            Ok(Datum::Bool(!truthy(&args[0])))
        }
        "len" => {
            need(1)?;
            let length = match &args[0] {
                Datum::Str(s) => s.chars().count(),
                Datum::Json(JsonValue::String(s)) => s.chars().count(),
                Datum::Json(JsonValue::Array(items)) => items.len(),
                Datum::Json(JsonValue::Object(map)) => map.len(),
                other => {
                    return Err(exec_err(format!("len of type {}", kind_name(other))));
                }
            };
            Ok(Datum::Int(length as i64))
        }
        "print" => {
            let mut out = String::new();
            for (index, arg) in args.iter().enumerate() {
                if index > 0 && !is_string(&args[index - 1]) && !is_string(arg) {
                    out.push(' ');
                }
                out.push_str(&print_datum(arg));
            }
            Ok(Datum::Str(out))
        }
        "lower" => {
            need(1)?;
            Ok(Datum::Str(print_datum(&args[0]).to_lowercase()))
        }
        "upper" => {
            need(1)?;
            Ok(Datum::Str(print_datum(&args[0]).to_uppercase()))
        }
        "replace" => {
            need(3)?;
            let value = print_datum(&args[0]);
            Ok(Datum::Str(
                value.replace(&print_datum(&args[1]), &print_datum(&args[2])),
            ))
        }
        other => Err(exec_err(format!("function \"{other}\" not defined"))),
    }
}

enum Scalar<'s> {
    Str(&'s str),
    Num(f64),
    Bool(bool),
    Time(DateTime<Utc>),
    Missing,
    Other,
}

fn scalar<'s>(datum: &'s Datum<'_>) -> Scalar<'s> {
    match datum {
        Datum::Missing | Datum::Json(JsonValue::Null) => Scalar::Missing,
        Datum::Str(s) => Scalar::Str(s),
        Datum::Json(JsonValue::String(s)) => Scalar::Str(s),
        Datum::Int(i) => Scalar::Num(*i as f64),
        Datum::Float(f) => Scalar::Num(*f),
        Datum::Json(JsonValue::Number(n)) => n.as_f64().map(Scalar::Num).unwrap_or(Scalar::Other),
        Datum::Bool(b) | Datum::Json(JsonValue::Bool(b)) => Scalar::Bool(*b),
        Datum::Time(t) => Scalar::Time(*t),
        Datum::Scope(_) | Datum::Json(_) => Scalar::Other,
    }
}

fn compare(left: &Datum<'_>, right: &Datum<'_>) -> Option<Ordering> {
    match (scalar(left), scalar(right)) {
        (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
        (Scalar::Num(a), Scalar::Num(b)) => a.partial_cmp(&b),
        (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(&b)),
        (Scalar::Time(a), Scalar::Time(b)) => Some(a.cmp(&b)),
        (Scalar::Missing, Scalar::Missing) => Some(Ordering::Equal),
        _ => None,
    }
}

fn truthy(datum: &Datum<'_>) -> bool {
    match datum {
        Datum::Missing => false,
        Datum::Scope(_) | Datum::Time(_) => true,
        Datum::Str(s) => !s.is_empty(),
        Datum::Int(i) => *i != 0,
        Datum::Float(f) => *f != 0.0,
        Datum::Bool(b) => *b,
        Datum::Json(value) => match value {
            JsonValue::Null => false,
            JsonValue::Bool(b) => *b,
            JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            JsonValue::String(s) => !s.is_empty(),
            JsonValue::Array(items) => !items.is_empty(),
            JsonValue::Object(map) => !map.is_empty(),
        },
    }
}

fn is_string(datum: &Datum<'_>) -> bool {
    matches!(datum, Datum::Str(_) | Datum::Json(JsonValue::String(_)))
}

fn kind_name(datum: &Datum<'_>) -> &'static str {
    match datum {
        Datum::Missing => "nil",
        Datum::Scope(_) => "map",
        Datum::Str(_) | Datum::Json(JsonValue::String(_)) => "string",
        Datum::Int(_) => "int",
        Datum::Float(_) | Datum::Json(JsonValue::Number(_)) => "float64",
        Datum::Bool(_) | Datum::Json(JsonValue::Bool(_)) => "bool",
        Datum::Time(_) => "time.Time",
        Datum::Json(JsonValue::Null) => "nil",
        Datum::Json(JsonValue::Array(_)) => "slice",
        Datum::Json(JsonValue::Object(_)) => "map",
    }
}

fn print_datum(datum: &Datum<'_>) -> String {
    match datum {
        Datum::Missing | Datum::Json(JsonValue::Null) => NO_VALUE.to_string(),
        Datum::Scope(scope) => JsonValue::Object(scope.record.clone()).to_string(),
        Datum::Str(s) => s.clone(),
        Datum::Int(i) => i.to_string(),
        Datum::Float(f) => f.to_string(),
        Datum::Bool(b) => b.to_string(),
        Datum::Time(t) => t.format("%Y-%m-%d %H:%M:%S%.f +0000 UTC").to_string(),
        Datum::Json(JsonValue::String(s)) => s.clone(),
        Datum::Json(other) => other.to_string(),
    }
}

/// Derives destination table names from flattened records.
#[derive(Debug, Clone)]
pub struct TableNameExtractor {
    template: Template,
}

impl TableNameExtractor {
    pub fn new(expression: &str) -> Result<Self, TemplateError> {
        Ok(TableNameExtractor {
            template: Template::compile(expression)?,
        })
    }

    pub fn expression(&self) -> &str {
        self.template.source()
    }

    /// Renders the table name for `object`.
    ///
    /// `_timestamp` is exposed to the template as a timestamp rather than its
    /// string form; `object` itself is only read. Unresolved references become
    /// `null`, spaces become underscores, and the result is lowercased. An
    /// empty result is returned as-is for the caller to reject.
    pub fn extract(&self, object: &Record) -> anyhow::Result<String> {
        let raw = match object.get(TIMESTAMP_KEY) {
            Some(JsonValue::String(raw)) => raw,
            Some(other) => {
                anyhow::bail!("malformed {TIMESTAMP_KEY} field: expected a string, got {other}")
            }
            None => anyhow::bail!("{TIMESTAMP_KEY} field doesn't exist"),
        };
        let timestamp = parse_timestamp(raw)
            .map_err(|err| anyhow::anyhow!("malformed {TIMESTAMP_KEY} field: {err}"))?;
        let scope = Scope::new(object).with_time(TIMESTAMP_KEY, timestamp);
        let rendered = self.template.render(&scope)?;
        Ok(rendered
            .replace(NO_VALUE, "null")
            .replace(' ', "_")
            .to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: JsonValue) -> Record {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    fn render(source: &str, value: JsonValue) -> Result<String, TemplateError> {
        let record = record(value);
        Template::compile(source)?.render(&Scope::new(&record))
    }

    #[test]
    fn renders_plain_fields() {
        assert_eq!(render("events_{{.a}}", json!({"a": 1})).unwrap(), "events_1");
        assert_eq!(
            render("{{ .name }}-{{.n}}", json!({"name": "x", "n": 2.5})).unwrap(),
            "x-2.5"
        );
    }

    #[test]
    fn missing_fields_render_placeholder() {
        assert_eq!(
            render("events_{{.absent}}", json!({})).unwrap(),
            "events_<no value>"
        );
        assert_eq!(
            render("{{.a.b.c}}", json!({"a": {"x": 1}})).unwrap(),
            NO_VALUE
        );
    }

    #[test]
    fn field_chains_match_flattened_keys() {
        let rendered = render(
            "events_{{.eventn_ctx.event_type}}",
            json!({"eventn_ctx_event_type": "click"}),
        )
        .unwrap();
        assert_eq!(rendered, "events_click");
    }

    #[test]
    fn field_chains_prefer_the_shortest_matching_key() {
        let record = json!({"a": {"b": "nested"}, "a_b": "flat", "x_y": {"z": "deep"}});
        assert_eq!(render("{{.a.b}}", record.clone()).unwrap(), "nested");
        assert_eq!(render("{{.x.y.z}}", record).unwrap(), "deep");
    }

    #[test]
    fn conditionals_and_comparisons() {
        let source = r#"{{if eq .kind "page"}}pages{{else if .kind}}{{.kind}}s{{else}}other{{end}}"#;
        assert_eq!(render(source, json!({"kind": "page"})).unwrap(), "pages");
        assert_eq!(render(source, json!({"kind": "click"})).unwrap(), "clicks");
        assert_eq!(render(source, json!({})).unwrap(), "other");
    }

    #[test]
    fn with_rebinds_dot() {
        let source = "{{with .app}}{{.}}{{else}}none{{end}}";
        assert_eq!(render(source, json!({"app": "shop"})).unwrap(), "shop");
        assert_eq!(render(source, json!({"app": ""})).unwrap(), "none");
    }

    #[test]
    fn pipelines_and_functions() {
        assert_eq!(
            render("{{.name | upper}}", json!({"name": "ab"})).unwrap(),
            "AB"
        );
        assert_eq!(
            render(r#"{{replace .name "-" "_"}}"#, json!({"name": "a-b"})).unwrap(),
            "a_b"
        );
        assert_eq!(
            render("{{if and .a (gt .n 3)}}big{{end}}", json!({"a": true, "n": 5})).unwrap(),
            "big"
        );
    }

    #[test]
    fn trim_markers_and_comments() {
        assert_eq!(
            render("a  {{- .x -}}  b{{/* note */}}", json!({"x": 1})).unwrap(),
            "a1b"
        );
    }

    #[test]
    fn timestamp_methods_format_dates() {
        let record = record(json!({"_timestamp": "2020-05-01T10:00:00Z"}));
        let ts = parse_timestamp("2020-05-01T10:00:00Z").unwrap();
        let scope = Scope::new(&record).with_time("_timestamp", ts);
        let template =
            Template::compile(r#"t_{{._timestamp.Format "2006_01"}}_{{._timestamp.Year}}_{{._timestamp.Month}}"#)
                .unwrap();
        assert_eq!(template.render(&scope).unwrap(), "t_2020_05_2020_May");
    }

    #[test]
    fn go_layouts_translate_to_chrono() {
        assert_eq!(go_layout_to_chrono("2006-01-02"), "%Y-%m-%d");
        assert_eq!(go_layout_to_chrono("200601"), "%Y%m");
        assert_eq!(go_layout_to_chrono("Jan 2 15:04"), "%b %-d %H:%M");
        assert_eq!(go_layout_to_chrono("100%"), "%-m00%%");
    }

    #[test]
    fn compile_errors_are_reported() {
        assert!(Template::compile("{{.a").is_err());
        assert!(Template::compile("{{if .a}}x").is_err());
        assert!(Template::compile("{{end}}").is_err());
        assert!(Template::compile("{{unknown .a}}").is_err());
        assert!(Template::compile("{{range .a}}{{end}}").is_err());
    }

    #[test]
    fn method_on_non_timestamp_fails_at_render() {
        let err = render(r#"{{.a.Format "2006"}}"#, json!({"a": "str"})).unwrap_err();
        assert!(matches!(err, TemplateError::Execute(_)));
    }
}
