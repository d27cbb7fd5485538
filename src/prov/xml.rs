//! PROV-XML serialization.

use std::fs;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use super::json::format_time;
use super::{AttrValue, Document, Element, ElementKind, RelationKind, PROV_NS, XSD_NS};
use crate::error::Result;

const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";

pub fn to_bytes(doc: &Document) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("prov:document");
    root.push_attribute(("xmlns:prov", PROV_NS));
    root.push_attribute(("xmlns:xsd", XSD_NS));
    root.push_attribute(("xmlns:xsi", XSI_NS));
    for (prefix, uri) in doc.namespaces() {
        root.push_attribute((format!("xmlns:{prefix}").as_str(), uri.as_str()));
    }
    if let Some(default) = doc.default_namespace().filter(|ns| !ns.is_empty()) {
        root.push_attribute(("xmlns", default));
    }
    writer.write_event(Event::Start(root))?;

    for kind in [ElementKind::Entity, ElementKind::Activity, ElementKind::Agent] {
        for element in doc.elements_of(kind) {
            write_element(&mut writer, element)?;
        }
    }

    for kind in RelationKind::ALL {
        let (subject_role, object_role) = kind.roles();
        let tag = format!("prov:{}", kind.as_str());
        for relation in doc.relations_of(kind) {
            writer.write_event(Event::Start(BytesStart::new(tag.as_str())))?;
            write_ref(&mut writer, subject_role, &relation.subject.to_string())?;
            write_ref(&mut writer, object_role, &relation.object.to_string())?;
            writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new("prov:document")))?;
    Ok(writer.into_inner())
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<()> {
    let tag = format!("prov:{}", element.kind.as_str());
    let id = element.id.to_string();
    let mut start = BytesStart::new(tag.as_str());
    start.push_attribute(("prov:id", id.as_str()));

    let has_children = element.start_time.is_some()
        || element.end_time.is_some()
        || !element.attributes.is_empty();
    if !has_children {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;

    if let Some(start_time) = element.start_time {
        write_text(writer, BytesStart::new("prov:startTime"), &format_time(&start_time))?;
    }
    if let Some(end_time) = element.end_time {
        write_text(writer, BytesStart::new("prov:endTime"), &format_time(&end_time))?;
    }
    for (key, value) in &element.attributes {
        let key = key.to_string();
        let mut start = BytesStart::new(key.as_str());
        start.push_attribute(("xsi:type", xsd_type(value)));
        write_text(writer, start, &value.to_string())?;
    }

    writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
    Ok(())
}

fn write_text(writer: &mut Writer<Vec<u8>>, start: BytesStart<'_>, text: &str) -> Result<()> {
    let end = start.to_end().into_owned();
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(end))?;
    Ok(())
}

fn write_ref(writer: &mut Writer<Vec<u8>>, role: &str, target: &str) -> Result<()> {
    let tag = format!("prov:{role}");
    let mut empty = BytesStart::new(tag.as_str());
    empty.push_attribute(("prov:ref", target));
    writer.write_event(Event::Empty(empty))?;
    Ok(())
}

fn xsd_type(value: &AttrValue) -> &'static str {
    match value {
        AttrValue::String(_) => "xsd:string",
        AttrValue::QualifiedName(_) => "xsd:QName",
        AttrValue::Int(_) => "xsd:int",
        AttrValue::Double(_) => "xsd:double",
    }
}

pub fn write(doc: &Document, path: &Path) -> Result<()> {
    fs::write(path, to_bytes(doc)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prov::QualifiedName;
    use chrono::{TimeZone, Utc};
    use quick_xml::Reader;

    fn sample() -> Document {
        let mut doc = Document::with_geo_namespaces();
        let gdal = doc.agent(
            "gdal",
            vec![
                ("prov:type".into(), QualifiedName::prov("SoftwareAgent").into()),
                ("cit:edition".into(), "GDAL 3.8.4, released 2024/02/08".into()),
            ],
        );
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let act = doc.activity("gdal_translate_1714564800.000000", start, start);
        let tif = doc.entity("forest_cov.tif", vec![("msr:resolution".into(), 100.0.into())]);
        let xyz = doc.entity_ref("forest_cov.xyz");
        doc.used(&act, &tif);
        doc.was_generated_by(&xyz, &act);
        doc.was_associated_with(&act, &gdal);
        doc
    }

    fn records(xml: &str) -> Vec<(String, Option<String>)> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut found = Vec::new();
        loop {
            match reader.read_event().unwrap() {
                Event::Start(e) | Event::Empty(e) => {
                    let name = String::from_utf8(e.name().as_ref().to_vec()).unwrap();
                    let id = e
                        .try_get_attribute("prov:id")
                        .unwrap()
                        .map(|a| String::from_utf8(a.value.to_vec()).unwrap());
                    found.push((name, id));
                }
                Event::Eof => break,
                _ => {}
            }
        }
        found
    }

    #[test]
    fn test_writes_records_and_relations() {
        let xml = String::from_utf8(to_bytes(&sample()).unwrap()).unwrap();
        let found = records(&xml);

        assert_eq!(found[0].0, "prov:document");
        assert!(found.contains(&("prov:agent".to_string(), Some("gdal".to_string()))));
        assert!(found.contains(&(
            "prov:entity".to_string(),
            Some("forest_cov.xyz".to_string())
        )));
        let used = found.iter().filter(|(name, _)| name == "prov:used").count();
        assert_eq!(used, 1);
        assert!(xml.contains("xmlns:gex=\"https://schemas.isotc211.org/19115/-1/gex/1.3\""));
        assert!(xml.contains("<prov:startTime>2024-05-01T12:00:00.000000Z</prov:startTime>"));
        assert!(xml.contains("<prov:type xsi:type=\"xsd:QName\">prov:SoftwareAgent</prov:type>"));
        assert!(xml.contains("<prov:activity prov:ref=\"gdal_translate_1714564800.000000\"/>"));
    }

    #[test]
    fn test_escapes_text() {
        let mut doc = Document::new();
        doc.entity("a", vec![("cat:CT_CRS".into(), "+proj=longlat <odd> & more".into())]);
        let xml = String::from_utf8(to_bytes(&doc).unwrap()).unwrap();
        assert!(xml.contains("+proj=longlat &lt;odd&gt; &amp; more"));
    }
}
