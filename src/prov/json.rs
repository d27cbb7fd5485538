//! PROV-JSON serialization.
//!
//! Layout follows the W3C PROV-JSON submission: a `prefix` map, one object
//! per record kind keyed by identifier, and one object per relation kind keyed
//! by generated blank-node identifiers.

use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Number, Value};

use super::{AttrValue, Document, Element, ElementKind, QualifiedName, RelationKind};
use crate::error::{Error, Result};

const QUALIFIED_NAME_TYPE: &str = "prov:QUALIFIED_NAME";
const ELEMENT_KINDS: [ElementKind; 3] = [ElementKind::Entity, ElementKind::Activity, ElementKind::Agent];

pub fn to_value(doc: &Document) -> Value {
    let mut root = Map::new();

    let mut prefixes = Map::new();
    for (prefix, uri) in doc.namespaces() {
        prefixes.insert(prefix.clone(), Value::String(uri.clone()));
    }
    if let Some(default) = doc.default_namespace() {
        prefixes.insert("default".to_string(), Value::String(default.to_string()));
    }
    if !prefixes.is_empty() {
        root.insert("prefix".to_string(), Value::Object(prefixes));
    }

    for kind in ELEMENT_KINDS {
        let mut records = Map::new();
        for element in doc.elements_of(kind) {
            records.insert(element.id.to_string(), Value::Object(element_body(element)));
        }
        if !records.is_empty() {
            root.insert(kind.as_str().to_string(), Value::Object(records));
        }
    }

    let mut blank_id = 0usize;
    for kind in RelationKind::ALL {
        let (subject_role, object_role) = kind.roles();
        let mut records = Map::new();
        for relation in doc.relations_of(kind) {
            blank_id += 1;
            let mut body = Map::new();
            body.insert(
                format!("prov:{subject_role}"),
                Value::String(relation.subject.to_string()),
            );
            body.insert(
                format!("prov:{object_role}"),
                Value::String(relation.object.to_string()),
            );
            records.insert(format!("_:id{blank_id}"), Value::Object(body));
        }
        if !records.is_empty() {
            root.insert(kind.as_str().to_string(), Value::Object(records));
        }
    }

    Value::Object(root)
}

fn element_body(element: &Element) -> Map<String, Value> {
    let mut body = Map::new();
    if let Some(start) = element.start_time {
        body.insert("prov:startTime".to_string(), Value::String(format_time(&start)));
    }
    if let Some(end) = element.end_time {
        body.insert("prov:endTime".to_string(), Value::String(format_time(&end)));
    }

    for (key, value) in &element.attributes {
        let key = key.to_string();
        let encoded = encode_value(value);
        match body.get_mut(&key) {
            Some(Value::Array(values)) => values.push(encoded),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, encoded]);
            }
            None => {
                body.insert(key, encoded);
            }
        }
    }
    body
}

pub(crate) fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode_value(value: &AttrValue) -> Value {
    match value {
        AttrValue::String(s) => Value::String(s.clone()),
        AttrValue::QualifiedName(q) => json!({ "$": q.to_string(), "type": QUALIFIED_NAME_TYPE }),
        AttrValue::Int(i) => Value::Number((*i).into()),
        AttrValue::Double(d) => match Number::from_f64(*d) {
            Some(n) => Value::Number(n),
            None => json!({ "$": d.to_string(), "type": "xsd:double" }),
        },
    }
}

pub fn to_string_pretty(doc: &Document) -> Result<String> {
    Ok(serde_json::to_string_pretty(&to_value(doc))?)
}

pub fn write(doc: &Document, path: &Path) -> Result<()> {
    fs::write(path, to_string_pretty(doc)?)?;
    Ok(())
}

pub fn read(path: &Path) -> Result<Document> {
    let content = fs::read_to_string(path)?;
    from_str(&content)
}

pub fn from_str(content: &str) -> Result<Document> {
    let value: Value = serde_json::from_str(content)?;
    from_value(&value)
}

pub fn from_value(value: &Value) -> Result<Document> {
    let root = value
        .as_object()
        .ok_or_else(|| malformed("document is not a JSON object"))?;
    let mut doc = Document::new();

    if let Some(prefixes) = root.get("prefix") {
        let prefixes = prefixes
            .as_object()
            .ok_or_else(|| malformed("'prefix' is not an object"))?;
        for (prefix, uri) in prefixes {
            let uri = uri
                .as_str()
                .ok_or_else(|| malformed(format!("namespace '{prefix}' is not a string")))?;
            if prefix == "default" {
                doc.set_default_namespace(uri);
            } else {
                doc.add_namespace(prefix.as_str(), uri);
            }
        }
    }

    for kind in ELEMENT_KINDS {
        let Some(records) = root.get(kind.as_str()) else {
            continue;
        };
        let records = records
            .as_object()
            .ok_or_else(|| malformed(format!("'{}' is not an object", kind.as_str())))?;
        for (id, body) in records {
            doc.upsert(decode_element(kind, id, body)?);
        }
    }

    for kind in RelationKind::ALL {
        let Some(records) = root.get(kind.as_str()) else {
            continue;
        };
        let records = records
            .as_object()
            .ok_or_else(|| malformed(format!("'{}' is not an object", kind.as_str())))?;
        let (subject_role, object_role) = kind.roles();
        for (blank_id, body) in records {
            let subject = role(body, subject_role)
                .ok_or_else(|| malformed(format!("{blank_id} has no prov:{subject_role}")))?;
            let object = role(body, object_role)
                .ok_or_else(|| malformed(format!("{blank_id} has no prov:{object_role}")))?;
            doc.relate(kind, &subject, &object);
        }
    }

    Ok(doc)
}

fn role(body: &Value, role: &str) -> Option<QualifiedName> {
    body.get(format!("prov:{role}"))
        .and_then(Value::as_str)
        .map(QualifiedName::parse)
}

fn decode_element(kind: ElementKind, id: &str, body: &Value) -> Result<Element> {
    let mut element = Element::new(kind, id);
    let body = match body {
        Value::Object(body) => body,
        // A record without attributes may be written as an empty list.
        Value::Array(items) if items.is_empty() => return Ok(element),
        _ => return Err(malformed(format!("record '{id}' is not an object"))),
    };

    for (key, value) in body {
        match (kind, key.as_str()) {
            (ElementKind::Activity, "prov:startTime") => {
                element.start_time = Some(parse_time(value)?);
            }
            (ElementKind::Activity, "prov:endTime") => {
                element.end_time = Some(parse_time(value)?);
            }
            _ => {
                let key = QualifiedName::parse(key);
                match value {
                    Value::Array(values) => {
                        for v in values {
                            element.attributes.push((key.clone(), decode_value(v)?));
                        }
                    }
                    v => element.attributes.push((key, decode_value(v)?)),
                }
            }
        }
    }
    Ok(element)
}

fn decode_value(value: &Value) -> Result<AttrValue> {
    match value {
        Value::String(s) => Ok(AttrValue::String(s.clone())),
        Value::Bool(b) => Ok(AttrValue::String(b.to_string())),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(AttrValue::Int(i)),
            None => n
                .as_f64()
                .map(AttrValue::Double)
                .ok_or_else(|| malformed(format!("unrepresentable number {n}"))),
        },
        Value::Object(typed) => {
            let literal = match typed.get("$") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => return Err(malformed("typed literal without '$'")),
            };
            let datatype = typed.get("type").and_then(Value::as_str).unwrap_or("xsd:string");
            Ok(match datatype {
                QUALIFIED_NAME_TYPE | "xsd:QName" => {
                    AttrValue::QualifiedName(QualifiedName::parse(&literal))
                }
                "xsd:int" | "xsd:integer" | "xsd:long" | "xsd:short" => literal
                    .parse()
                    .map(AttrValue::Int)
                    .map_err(|_| malformed(format!("'{literal}' is not an integer")))?,
                "xsd:double" | "xsd:float" | "xsd:decimal" => literal
                    .parse()
                    .map(AttrValue::Double)
                    .map_err(|_| malformed(format!("'{literal}' is not a number")))?,
                _ => AttrValue::String(literal),
            })
        }
        Value::Null | Value::Array(_) => Err(malformed(format!("unsupported attribute value {value}"))),
    }
}

fn parse_time(value: &Value) -> Result<DateTime<Utc>> {
    let text = value
        .as_str()
        .ok_or_else(|| malformed(format!("timestamp {value} is not a string")))?;
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Ok(time.with_timezone(&Utc));
    }
    // Timestamps without an offset are taken as UTC.
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| malformed(format!("invalid timestamp '{text}': {e}")))
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::Serialization(format!("malformed PROV-JSON: {}", reason.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Document {
        let mut doc = Document::with_geo_namespaces();
        let saga = doc.agent(
            "saga_cmd",
            vec![
                ("prov:type".into(), QualifiedName::prov("SoftwareAgent").into()),
                ("cit:edition".into(), "SAGA Version: 7.3.0".into()),
            ],
        );
        let mask = doc.entity(
            "mask.gpkg",
            vec![
                ("prov:type".into(), "Polygon".into()),
                ("gex:EX_GeographicBoundingBox".into(), "[0, 0, 10, 10]".into()),
            ],
        );
        let cell = doc.entity(
            "msr:resolution",
            vec![
                ("prov:type".into(), "metre".into()),
                ("prov:value".into(), AttrValue::Double(100.0)),
                ("prov:label".into(), AttrValue::Int(3)),
            ],
        );
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 3).unwrap();
        let act = doc.activity("grid_gridding_0_1714564800.000000", start, end);
        let grid = doc.entity_ref("grid.tif");
        let csv = doc.entity_ref("grid.csv");
        let xyz = doc.entity_ref("grid.xyz");
        doc.used(&act, &mask);
        doc.used(&act, &cell);
        doc.was_generated_by(&grid, &act);
        doc.was_associated_with(&act, &saga);
        doc.was_derived_from(&csv, &xyz);
        doc
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let doc = sample();
        let text = to_string_pretty(&doc).unwrap();
        let loaded = from_str(&text).unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn test_layout_follows_prov_json() {
        let value = to_value(&sample());

        assert_eq!(value["prefix"]["default"], "");
        assert_eq!(
            value["prefix"]["cat"],
            "https://schemas.isotc211.org/19139/-/cat/1.2"
        );
        assert_eq!(
            value["agent"]["saga_cmd"]["prov:type"],
            json!({"$": "prov:SoftwareAgent", "type": "prov:QUALIFIED_NAME"})
        );
        assert_eq!(value["entity"]["msr:resolution"]["prov:value"], json!(100.0));
        assert_eq!(
            value["activity"]["grid_gridding_0_1714564800.000000"]["prov:startTime"],
            "2024-05-01T12:00:00.000000Z"
        );
        assert_eq!(value["used"].as_object().unwrap().len(), 2);
        let derived = value["wasDerivedFrom"].as_object().unwrap();
        let (_, record) = derived.iter().next().unwrap();
        assert_eq!(record["prov:generatedEntity"], "grid.csv");
        assert_eq!(record["prov:usedEntity"], "grid.xyz");
    }

    #[test]
    fn test_repeated_attributes_become_arrays() {
        let mut doc = Document::new();
        doc.entity(
            "a",
            vec![("prov:label".into(), "x".into()), ("prov:label".into(), "y".into())],
        );
        let value = to_value(&doc);
        assert_eq!(value["entity"]["a"]["prov:label"], json!(["x", "y"]));
        assert_eq!(from_value(&value).unwrap(), doc);
    }

    #[test]
    fn test_reads_naive_timestamps_and_typed_literals() {
        let text = r#"{
            "prefix": {"default": ""},
            "activity": {"a1": {"prov:startTime": "2023-10-16T09:30:00.250000"}},
            "entity": {"e1": {"prov:value": {"$": "42", "type": "xsd:int"}}}
        }"#;
        let doc = from_str(text).unwrap();

        let a1 = doc.get("a1").unwrap();
        assert_eq!(
            a1.start_time.unwrap(),
            Utc.with_ymd_and_hms(2023, 10, 16, 9, 30, 0).unwrap()
                + chrono::Duration::milliseconds(250)
        );
        assert_eq!(
            doc.get("e1").unwrap().attribute("prov:value"),
            Some(&AttrValue::Int(42))
        );
    }

    #[test]
    fn test_rejects_relation_without_roles() {
        let text = r#"{"used": {"_:id1": {"prov:activity": "a"}}}"#;
        assert!(matches!(from_str(text), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_rejects_non_object_document() {
        assert!(from_str("[1, 2]").is_err());
    }
}
