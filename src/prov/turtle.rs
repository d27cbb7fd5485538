//! PROV-O serialization as Turtle.
//!
//! Records become subjects typed with their PROV-O class; a `prov:type`
//! holding a qualified name becomes an extra `rdf:type`. Relations map to
//! the PROV-O starting-point properties.

use std::fs;
use std::path::Path;

use super::json::format_time;
use super::{AttrValue, Document, Element, ElementKind, QualifiedName, RelationKind};
use crate::error::Result;

pub fn to_string(doc: &Document) -> String {
    let mut out = String::new();
    out.push_str(&format!("@prefix prov: <{}> .\n", super::PROV_NS));
    out.push_str(&format!("@prefix xsd: <{}> .\n", super::XSD_NS));
    for (prefix, uri) in doc.namespaces() {
        out.push_str(&format!("@prefix {prefix}: <{}> .\n", escape_iri(uri)));
    }
    out.push('\n');

    for element in doc.elements() {
        write_element(&mut out, doc, element);
    }

    for kind in RelationKind::ALL {
        let predicate = format!("prov:{}", kind.as_str());
        for relation in doc.relations_of(kind) {
            out.push_str(&format!(
                "{} {} {} .\n",
                term(doc, &relation.subject),
                predicate,
                term(doc, &relation.object),
            ));
        }
    }
    out
}

fn write_element(out: &mut String, doc: &Document, element: &Element) {
    let class = match element.kind {
        ElementKind::Entity => "prov:Entity",
        ElementKind::Activity => "prov:Activity",
        ElementKind::Agent => "prov:Agent",
    };

    let mut types = vec![class.to_string()];
    let mut predicates = Vec::new();

    if let Some(start) = element.start_time {
        predicates.push(format!(
            "prov:startedAtTime \"{}\"^^xsd:dateTime",
            format_time(&start)
        ));
    }
    if let Some(end) = element.end_time {
        predicates.push(format!(
            "prov:endedAtTime \"{}\"^^xsd:dateTime",
            format_time(&end)
        ));
    }
    for (key, value) in &element.attributes {
        match (key.prefix(), key.local(), value) {
            (Some("prov"), "type", AttrValue::QualifiedName(q)) => types.push(term(doc, q)),
            _ => predicates.push(format!("{} {}", term(doc, key), literal(doc, value))),
        }
    }

    out.push_str(&format!("{} a {}", term(doc, &element.id), types.join(", ")));
    for predicate in predicates {
        out.push_str(&format!(" ;\n    {predicate}"));
    }
    out.push_str(" .\n\n");
}

/// A prefixed name when the local part is safe to abbreviate, otherwise a
/// full IRI.
fn term(doc: &Document, name: &QualifiedName) -> String {
    match name.prefix() {
        Some(prefix) if doc.namespace_uri(prefix).is_some() && is_safe_local(name.local()) => {
            name.to_string()
        }
        _ => format!("<{}>", escape_iri(&doc.expand(name))),
    }
}

fn is_safe_local(local: &str) -> bool {
    !local.is_empty()
        && !local.ends_with('.')
        && !local.starts_with(['.', '-'])
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn literal(doc: &Document, value: &AttrValue) -> String {
    match value {
        AttrValue::String(s) => format!("\"{}\"", escape_string(s)),
        AttrValue::QualifiedName(q) => term(doc, q),
        AttrValue::Int(i) => format!("\"{i}\"^^xsd:int"),
        AttrValue::Double(d) => format!("\"{d:?}\"^^xsd:double"),
    }
}

fn escape_string(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn escape_iri(iri: &str) -> String {
    let mut escaped = String::with_capacity(iri.len());
    for c in iri.chars() {
        match c {
            '<' | '>' | '"' | '{' | '}' | '|' | '^' | '`' | '\\' | ' ' => {
                escaped.push_str(&format!("\\u{:04X}", c as u32));
            }
            c if c.is_control() => {
                escaped.push_str(&format!("\\u{:04X}", c as u32));
            }
            c => escaped.push(c),
        }
    }
    escaped
}

pub fn write(doc: &Document, path: &Path) -> Result<()> {
    fs::write(path, to_string(doc))?;
    Ok(())
}
