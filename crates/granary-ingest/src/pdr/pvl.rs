//! PVL/ODL reader
//!
//! Statements are `KEY = VALUE;`. `OBJECT = NAME;` / `END_OBJECT = NAME;` (and
//! the GROUP equivalents) nest. `/* */` comments are ignored and values may be
//! double- or single-quoted. An optional `END;` statement stops parsing.

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PvlValue {
    Scalar(String),
    Object(PvlObject),
}

/// One OBJECT/GROUP block, or the document root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PvlObject {
    pub name: String,
    pub entries: Vec<(String, PvlValue)>,
}

impl PvlObject {
    /// First scalar stored under `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|(k, v)| match v {
            PvlValue::Scalar(s) if k.eq_ignore_ascii_case(key) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Child objects named `name`, in document order
    pub fn objects<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PvlObject> + 'a {
        self.entries.iter().filter_map(move |(_, v)| match v {
            PvlValue::Object(o) if o.name.eq_ignore_ascii_case(name) => Some(o),
            _ => None,
        })
    }
}

fn strip_comments(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        let end = rest[start + 2..]
            .find("*/")
            .ok_or_else(|| IngestError::InvalidPdr("unterminated comment".to_string()))?;
        rest = &rest[start + 2 + end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Split on `;` outside quotes
fn statements(text: &str) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match (quote, c) {
            (None, '"' | '\'') => {
                quote = Some(c);
                current.push(c);
            },
            (Some(q), _) if c == q => {
                quote = None;
                current.push(c);
            },
            (None, ';') => statements.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }

    if quote.is_some() {
        return Err(IngestError::InvalidPdr("unterminated quoted value".to_string()));
    }
    if !current.trim().is_empty() && !current.trim().eq_ignore_ascii_case("END") {
        return Err(IngestError::InvalidPdr(format!(
            "statement not terminated by ';': {}",
            current.trim()
        )));
    }
    Ok(statements)
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    let quoted = value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')));
    if quoted {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

/// Parse a PVL document into its root object
pub fn parse(text: &str) -> Result<PvlObject> {
    let text = strip_comments(text)?;
    let mut stack = vec![PvlObject::default()];

    for statement in statements(&text)? {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        if statement.eq_ignore_ascii_case("END") {
            break;
        }

        let (key, value) = statement
            .split_once('=')
            .ok_or_else(|| IngestError::InvalidPdr(format!("expected KEY = VALUE, got: {}", statement)))?;
        let key = key.trim().to_ascii_uppercase();
        let value = unquote(value);

        match key.as_str() {
            "OBJECT" | "GROUP" | "BEGIN_OBJECT" | "BEGIN_GROUP" => stack.push(PvlObject {
                name: value,
                entries: Vec::new(),
            }),
            "END_OBJECT" | "END_GROUP" => {
                if stack.len() < 2 {
                    return Err(IngestError::InvalidPdr(format!("unexpected {} = {}", key, value)));
                }
                let object = stack.pop().unwrap_or_default();
                if !value.is_empty() && !value.eq_ignore_ascii_case(&object.name) {
                    return Err(IngestError::InvalidPdr(format!(
                        "{} = {} closes {}",
                        key, value, object.name
                    )));
                }
                if let Some(parent) = stack.last_mut() {
                    parent.entries.push((object.name.clone(), PvlValue::Object(object)));
                }
            },
            _ => {
                if let Some(current) = stack.last_mut() {
                    current.entries.push((key, PvlValue::Scalar(value)));
                }
            },
        }
    }

    if stack.len() != 1 {
        let open = stack.last().map(|o| o.name.clone()).unwrap_or_default();
        return Err(IngestError::InvalidPdr(format!("unclosed object {}", open)));
    }
    Ok(stack.pop().unwrap_or_default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_objects_and_comments() {
        let doc = parse(
            r#"
            ORIGINATING_SYSTEM = GSFC; /* a comment; with a semicolon */
            OBJECT = FILE_GROUP;
              DATA_TYPE = "MOD09GQ";
              OBJECT = FILE_SPEC;
                FILE_ID = 'a b.hdf';
              END_OBJECT = FILE_SPEC;
            END_OBJECT = FILE_GROUP;
            END;
            "#,
        )
        .unwrap();

        assert_eq!(doc.get("ORIGINATING_SYSTEM"), Some("GSFC"));
        let group = doc.objects("FILE_GROUP").next().unwrap();
        assert_eq!(group.get("DATA_TYPE"), Some("MOD09GQ"));
        let spec = group.objects("FILE_SPEC").next().unwrap();
        assert_eq!(spec.get("FILE_ID"), Some("a b.hdf"));
    }

    #[test]
    fn test_group_keyword() {
        let doc = parse("GROUP = G; K = V; END_GROUP = G;").unwrap();
        assert_eq!(doc.objects("G").next().unwrap().get("K"), Some("V"));
    }

    #[test]
    fn test_mismatched_end_rejected() {
        assert!(parse("OBJECT = A; END_OBJECT = B;").is_err());
        assert!(parse("OBJECT = A;").is_err());
        assert!(parse("END_OBJECT = A;").is_err());
    }

    #[test]
    fn test_malformed_statements_rejected() {
        assert!(parse("NOT A STATEMENT;").is_err());
        assert!(parse("KEY = \"open;").is_err());
        assert!(parse("KEY = V").is_err());
        assert!(parse("/* never closed").is_err());
    }
}
