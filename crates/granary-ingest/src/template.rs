//! URL path templates
//!
//! Collection and file rules carry templates such as
//! `{cmrMetadata.Granule.Collection.ShortName}/{extractYear(cmrMetadata.Granule.Temporal.RangeDateTime.BeginningDateTime)}`.
//! Placeholders are dotted paths into a JSON context, optionally wrapped in
//! one of the functions below:
//!
//! | function | result |
//! |---|---|
//! | `extractYear(x)` | four-digit year of a date |
//! | `extractMonth(x)` | month number of a date, unpadded |
//! | `extractDate(x)` | day of month of a date, unpadded |
//! | `dateFormat(x, FMT)` | date rendered with a strftime format |
//! | `substring(x, start, end)` | characters `start..end` of a string |
//! | `extractPath(x)` | directory part of a path |

use crate::error::{IngestError, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use regex::{Captures, Regex};
use serde_json::Value;
use std::fmt::Write;

/// Render every placeholder of `template` against `context`
pub fn render(template: &str, context: &Value) -> Result<String> {
    let placeholder = Regex::new(r"\{([^{}]+)\}")?;
    let call = Regex::new(r"^\s*(\w+)\((.*)\)\s*$")?;

    let mut error = None;
    let rendered = placeholder.replace_all(template, |caps: &Captures<'_>| {
        match evaluate(&call, &caps[1], context) {
            Ok(value) => value,
            Err(e) => {
                error.get_or_insert(e);
                String::new()
            },
        }
    });

    match error {
        Some(e) => Err(e),
        None => Ok(rendered.into_owned()),
    }
}

fn evaluate(call_pattern: &Regex, expr: &str, context: &Value) -> Result<String> {
    let Some(call) = call_pattern.captures(expr) else {
        return lookup(expr.trim(), context);
    };

    let function = &call[1];
    let args: Vec<&str> = call[2].split(',').map(str::trim).collect();
    let subject = lookup(args[0], context)?;

    match (function, args.len()) {
        ("extractYear", 1) => Ok(parse_date(&subject)?.year().to_string()),
        ("extractMonth", 1) => Ok(parse_date(&subject)?.month().to_string()),
        ("extractDate", 1) => Ok(parse_date(&subject)?.day().to_string()),
        ("dateFormat", 2) => {
            let mut out = String::new();
            write!(out, "{}", parse_date(&subject)?.format(unquote(args[1])))
                .map_err(|_| IngestError::Metadata(format!("Invalid date format: {}", args[1])))?;
            Ok(out)
        },
        ("extractPath", 1) => Ok(subject
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default()),
        ("substring", 2 | 3) => {
            let start = parse_index(args[1])?;
            let end = args.get(2).map(|a| parse_index(a)).transpose()?;
            let chars = subject.chars().skip(start);
            Ok(match end {
                Some(end) => chars.take(end.saturating_sub(start)).collect(),
                None => chars.collect(),
            })
        },
        _ => Err(IngestError::Metadata(format!(
            "Unsupported template function: {}",
            expr
        ))),
    }
}

fn lookup(path: &str, context: &Value) -> Result<String> {
    let value = path
        .split('.')
        .try_fold(context, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
        .ok_or_else(|| IngestError::Metadata(format!("Template field not found: {}", path)))?;

    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(IngestError::Metadata(format!(
            "Template field is not a scalar: {}",
            path
        ))),
    }
}

fn unquote(arg: &str) -> &str {
    arg.trim_matches(|c| c == '"' || c == '\'')
}

fn parse_index(arg: &str) -> Result<usize> {
    arg.parse()
        .map_err(|_| IngestError::Metadata(format!("Invalid substring index: {}", arg)))
}

fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| IngestError::Metadata(format!("Not a date: {}", value)))
}
