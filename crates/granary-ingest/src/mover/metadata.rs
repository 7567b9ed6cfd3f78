//! Descriptive metadata rewriting
//!
//! Moved files get new access URLs in the granule's metadata document: ECHO10
//! XML (`OnlineAccessURLs`) or UMM-G JSON (`RelatedUrls`). Existing URLs that
//! point at other files are kept.

use crate::error::{IngestError, Result};
use crate::models::{BucketType, Buckets, File};
use quick_xml::events::{BytesEnd, BytesRef, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

const DOWNLOAD_DESCRIPTION: &str = "File to download";

/// Elements that follow `OnlineAccessURLs` inside an ECHO10 `Granule`
const ECHO10_AFTER_ACCESS_URLS: &[&[u8]] = &[
    b"OnlineResources",
    b"Orderable",
    b"DataFormat",
    b"Visible",
    b"CloudCover",
    b"MetadataStandardName",
    b"MetadataStandardVersion",
    b"AssociatedBrowseImages",
    b"AssociatedBrowseImageUrls",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFormat {
    Echo10,
    UmmG,
}

impl MetadataFormat {
    /// Format of a metadata document, judged by file name
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(".cmr.xml") {
            Some(MetadataFormat::Echo10)
        } else if name.ends_with(".cmr.json") {
            Some(MetadataFormat::UmmG)
        } else {
            None
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            MetadataFormat::Echo10 => "application/echo10+xml",
            MetadataFormat::UmmG => "application/vnd.nasa.cmr.umm+json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUrl {
    pub url: String,
    pub description: Option<String>,
}

/// Public URL of a file, or `None` for private and internal buckets
pub fn access_url(file: &File, buckets: &Buckets, distribution_endpoint: &str) -> Option<String> {
    match buckets.type_of(&file.bucket)? {
        BucketType::Protected => Some(format!(
            "{}/{}/{}",
            distribution_endpoint.trim_end_matches('/'),
            file.bucket,
            file.filepath
        )),
        BucketType::Public => Some(format!("https://{}.s3.amazonaws.com/{}", file.bucket, file.filepath)),
        BucketType::Private | BucketType::Internal => None,
    }
}

fn basename(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

/// Existing URLs not naming one of `files`, followed by the new URLs
fn merge_urls(existing: Vec<AccessUrl>, files: &[File], buckets: &Buckets, distribution_endpoint: &str) -> Vec<AccessUrl> {
    let names: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();
    let fresh: Vec<String> = files
        .iter()
        .filter_map(|f| access_url(f, buckets, distribution_endpoint))
        .collect();

    let mut merged: Vec<AccessUrl> = existing
        .into_iter()
        .filter(|u| !names.contains(basename(&u.url)) && !fresh.contains(&u.url))
        .collect();
    merged.extend(fresh.into_iter().map(|url| AccessUrl {
        url,
        description: Some(DOWNLOAD_DESCRIPTION.to_string()),
    }));
    merged
}

fn xml_err(e: impl std::fmt::Display) -> IngestError {
    IngestError::Metadata(format!("ECHO10 document: {}", e))
}

fn text_of(t: &BytesText<'_>) -> Result<String> {
    let raw = std::str::from_utf8(t).map_err(xml_err)?;
    Ok(quick_xml::escape::unescape(raw).map_err(xml_err)?.into_owned())
}

/// Replacement text of `&name;` or `&#N;`
fn reference_of(r: &BytesRef<'_>) -> Result<String> {
    if let Some(ch) = r.resolve_char_ref().map_err(xml_err)? {
        return Ok(ch.to_string());
    }
    let name = r.decode().map_err(xml_err)?;
    quick_xml::escape::resolve_predefined_entity(&name)
        .map(str::to_string)
        .ok_or_else(|| xml_err(format!("unknown entity &{};", name)))
}

fn name_of(e: &BytesStart<'_>) -> Result<String> {
    std::str::from_utf8(e.name().as_ref())
        .map(str::to_string)
        .map_err(xml_err)
}

/// Add `value` under `name`, turning repeated elements into an array
fn insert_child(parent: &mut Map<String, Value>, name: String, value: Value) {
    match parent.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        },
        None => {
            parent.insert(name, value);
        },
    }
}

/// ECHO10 document as JSON: leaf elements become strings, repeated siblings
/// become arrays, attributes are dropped. The root element is kept, so
/// templates address `Granule.Collection.ShortName`.
pub fn echo10_to_json(xml: &str) -> Result<Value> {
    let mut reader = Reader::from_str(xml);
    let mut root = Map::new();
    let mut stack: Vec<(String, Map<String, Value>, String)> = Vec::new();

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Eof => break,
            Event::Start(e) => stack.push((name_of(&e)?, Map::new(), String::new())),
            Event::Empty(e) => {
                let parent = stack.last_mut().map_or(&mut root, |(_, children, _)| children);
                insert_child(parent, name_of(&e)?, Value::String(String::new()));
            },
            Event::Text(t) => {
                if let Some((_, _, text)) = stack.last_mut() {
                    text.push_str(&text_of(&t)?);
                }
            },
            Event::GeneralRef(r) => {
                if let Some((_, _, text)) = stack.last_mut() {
                    text.push_str(&reference_of(&r)?);
                }
            },
            Event::CData(c) => {
                if let Some((_, _, text)) = stack.last_mut() {
                    text.push_str(std::str::from_utf8(&c).map_err(xml_err)?);
                }
            },
            Event::End(_) => {
                let (name, children, text) = stack.pop().ok_or_else(|| xml_err("unbalanced end tag"))?;
                let value = if children.is_empty() {
                    Value::String(text.trim().to_string())
                } else {
                    Value::Object(children)
                };
                let parent = stack.last_mut().map_or(&mut root, |(_, children, _)| children);
                insert_child(parent, name, value);
            },
            _ => {},
        }
    }
    Ok(Value::Object(root))
}

/// Parsed metadata document, as exposed to url path templates
pub fn to_json(format: MetadataFormat, body: &str) -> Result<Value> {
    match format {
        MetadataFormat::Echo10 => echo10_to_json(body),
        MetadataFormat::UmmG => Ok(serde_json::from_str(body)?),
    }
}

/// `OnlineAccessURL` entries of an ECHO10 document
pub fn echo10_access_urls(xml: &str) -> Result<Vec<AccessUrl>> {
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut urls = Vec::new();
    let mut current: Option<AccessUrl> = None;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Eof => break,
            Event::Start(e) => {
                if e.name().as_ref() == b"OnlineAccessURL" {
                    current = Some(AccessUrl {
                        url: String::new(),
                        description: None,
                    });
                }
                path.push(e.name().as_ref().to_vec());
            },
            Event::End(e) => {
                path.pop();
                if e.name().as_ref() == b"OnlineAccessURL" {
                    urls.extend(current.take().map(|u| AccessUrl {
                        url: u.url.trim().to_string(),
                        description: u.description.map(|d| d.trim().to_string()),
                    }));
                }
            },
            event @ (Event::Text(_) | Event::GeneralRef(_)) => {
                let (Some(entry), Some(leaf)) = (current.as_mut(), path.last()) else {
                    continue;
                };
                let target = match leaf.as_slice() {
                    b"URL" => &mut entry.url,
                    b"URLDescription" => entry.description.get_or_insert_with(String::new),
                    _ => continue,
                };
                match event {
                    Event::Text(t) => target.push_str(&text_of(&t)?),
                    Event::GeneralRef(r) => target.push_str(&reference_of(&r)?),
                    _ => {},
                }
            },
            _ => {},
        }
    }
    Ok(urls)
}

fn write_access_urls(writer: &mut Writer<Vec<u8>>, urls: &[AccessUrl]) -> Result<()> {
    if urls.is_empty() {
        return Ok(());
    }

    let element = |writer: &mut Writer<Vec<u8>>, name: &str, text: &str| -> Result<()> {
        writer.write_event(Event::Start(BytesStart::new(name))).map_err(xml_err)?;
        writer.write_event(Event::Text(BytesText::new(text))).map_err(xml_err)?;
        writer.write_event(Event::End(BytesEnd::new(name))).map_err(xml_err)?;
        Ok(())
    };

    writer
        .write_event(Event::Start(BytesStart::new("OnlineAccessURLs")))
        .map_err(xml_err)?;
    for url in urls {
        writer
            .write_event(Event::Start(BytesStart::new("OnlineAccessURL")))
            .map_err(xml_err)?;
        element(writer, "URL", &url.url)?;
        if let Some(description) = &url.description {
            element(writer, "URLDescription", description)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("OnlineAccessURL")))
            .map_err(xml_err)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("OnlineAccessURLs")))
        .map_err(xml_err)?;
    Ok(())
}

/// Replace the `OnlineAccessURLs` of an ECHO10 granule document
pub fn rewrite_echo10(xml: &str, files: &[File], buckets: &Buckets, distribution_endpoint: &str) -> Result<String> {
    let urls = merge_urls(echo10_access_urls(xml)?, files, buckets, distribution_endpoint);

    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut depth = 0usize;
    let mut skipping: Option<usize> = None;
    let mut written = false;

    loop {
        let event = reader.read_event().map_err(xml_err)?;

        if let Some(level) = skipping {
            match event {
                Event::Start(_) => depth += 1,
                Event::End(_) => {
                    depth -= 1;
                    if depth == level {
                        skipping = None;
                    }
                },
                Event::Eof => return Err(xml_err("unterminated OnlineAccessURLs")),
                _ => {},
            }
            continue;
        }

        match &event {
            Event::Eof => break,
            Event::Start(e) if depth == 1 && e.name().as_ref() == b"OnlineAccessURLs" => {
                write_access_urls(&mut writer, &urls)?;
                written = true;
                skipping = Some(depth);
                depth += 1;
                continue;
            },
            Event::Empty(e) if depth == 1 && e.name().as_ref() == b"OnlineAccessURLs" => {
                write_access_urls(&mut writer, &urls)?;
                written = true;
                continue;
            },
            Event::Start(e) | Event::Empty(e)
                if depth == 1 && !written && ECHO10_AFTER_ACCESS_URLS.contains(&e.name().as_ref()) =>
            {
                write_access_urls(&mut writer, &urls)?;
                written = true;
            },
            Event::End(_) if depth == 1 && !written => {
                write_access_urls(&mut writer, &urls)?;
                written = true;
            },
            _ => {},
        }

        match &event {
            Event::Start(_) => depth += 1,
            Event::End(_) => depth = depth.saturating_sub(1),
            _ => {},
        }
        writer.write_event(event).map_err(xml_err)?;
    }

    String::from_utf8(writer.into_inner()).map_err(xml_err)
}

/// Replace the download entries of a UMM-G document's `RelatedUrls`
pub fn rewrite_umm_g(json_text: &str, files: &[File], buckets: &Buckets, distribution_endpoint: &str) -> Result<String> {
    let mut document: Value = serde_json::from_str(json_text)?;
    let object = document
        .as_object_mut()
        .ok_or_else(|| IngestError::Metadata("UMM-G document is not an object".to_string()))?;

    let existing: Vec<Value> = object
        .get("RelatedUrls")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let as_access = |v: &Value| AccessUrl {
        url: v.get("URL").and_then(Value::as_str).unwrap_or_default().to_string(),
        description: v.get("Description").and_then(Value::as_str).map(str::to_string),
    };
    let merged = merge_urls(existing.iter().map(as_access).collect(), files, buckets, distribution_endpoint);

    let related: Vec<Value> = merged
        .into_iter()
        .map(|u| match existing.iter().find(|v| as_access(v).url == u.url) {
            // Untouched entries keep fields we do not model
            Some(original) => original.clone(),
            None => json!({
                "URL": u.url,
                "Type": "GET DATA",
                "Description": u.description.unwrap_or_default(),
            }),
        })
        .collect();

    object.insert("RelatedUrls".to_string(), Value::Array(related));
    Ok(serde_json::to_string_pretty(&document)?)
}

/// Rewrite a document of either format
pub fn rewrite(format: MetadataFormat, body: &str, files: &[File], buckets: &Buckets, distribution_endpoint: &str) -> Result<String> {
    match format {
        MetadataFormat::Echo10 => rewrite_echo10(body, files, buckets, distribution_endpoint),
        MetadataFormat::UmmG => rewrite_umm_g(body, files, buckets, distribution_endpoint),
    }
}
