//! W3C PROV document model.
//!
//! A [`Document`] is a key-value store of agents, entities and activities
//! keyed by [`QualifiedName`], plus a set of relations between them. Writes
//! go through [`Document::upsert`]: a record with an existing identifier
//! replaces the earlier one wholesale. Merging stage documents into a base
//! document ([`merge`]) is the same upsert applied record by record, so the
//! last writer wins and re-merging unchanged content changes nothing.

pub mod dot;
pub mod json;
pub mod turtle;
pub mod xml;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};

pub const PROV_NS: &str = "http://www.w3.org/ns/prov#";
pub const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema#";

/// ISO 19139/19115 namespaces used for geospatial attributes.
pub const GEO_NAMESPACES: [(&str, &str); 4] = [
    ("cat", "https://schemas.isotc211.org/19139/-/cat/1.2"),
    ("gex", "https://schemas.isotc211.org/19115/-1/gex/1.3"),
    ("msr", "https://schemas.isotc211.org/19115/-1/msr/1.3/"),
    ("cit", "https://schemas.isotc211.org/19115/-1/cit/1.3"),
];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    prefix: Option<String>,
    local: String,
}

impl QualifiedName {
    pub fn new(prefix: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            local: local.into(),
        }
    }

    /// A name in the document's default namespace.
    pub fn unprefixed(local: impl Into<String>) -> Self {
        Self {
            prefix: None,
            local: local.into(),
        }
    }

    pub fn prov(local: impl Into<String>) -> Self {
        Self::new("prov", local)
    }

    /// Parses `prefix:local`; anything without a valid prefix lives in the
    /// default namespace.
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((prefix, local)) if is_prefix(prefix) && !local.starts_with("//") => {
                Self::new(prefix, local)
            }
            _ => Self::unprefixed(s),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn local(&self) -> &str {
        &self.local
    }
}

fn is_prefix(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{}:{}", prefix, self.local),
            None => f.write_str(&self.local),
        }
    }
}

impl From<&str> for QualifiedName {
    fn from(s: &str) -> Self {
        QualifiedName::parse(s)
    }
}

impl From<String> for QualifiedName {
    fn from(s: String) -> Self {
        QualifiedName::parse(&s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    String(String),
    QualifiedName(QualifiedName),
    Int(i64),
    Double(f64),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::String(s) => f.write_str(s),
            AttrValue::QualifiedName(q) => write!(f, "{q}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Double(d) => write!(f, "{d:?}"),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<f64> for AttrValue {
    fn from(d: f64) -> Self {
        AttrValue::Double(d)
    }
}

impl From<QualifiedName> for AttrValue {
    fn from(q: QualifiedName) -> Self {
        AttrValue::QualifiedName(q)
    }
}

pub type Attributes = Vec<(QualifiedName, AttrValue)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ElementKind {
    Entity,
    Activity,
    Agent,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Entity => "entity",
            ElementKind::Activity => "activity",
            ElementKind::Agent => "agent",
        }
    }
}

/// An agent, entity or activity record.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub kind: ElementKind,
    pub id: QualifiedName,
    pub attributes: Attributes,
    /// Activities only.
    pub start_time: Option<DateTime<Utc>>,
    /// Activities only.
    pub end_time: Option<DateTime<Utc>>,
}

impl Element {
    pub fn new(kind: ElementKind, id: impl Into<QualifiedName>) -> Self {
        Self {
            kind,
            id: id.into(),
            attributes: Vec::new(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<QualifiedName>, value: impl Into<AttrValue>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&AttrValue> {
        let key = QualifiedName::parse(key);
        self.attributes
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RelationKind {
    Used,
    WasGeneratedBy,
    WasAssociatedWith,
    WasDerivedFrom,
}

impl RelationKind {
    pub const ALL: [RelationKind; 4] = [
        RelationKind::Used,
        RelationKind::WasGeneratedBy,
        RelationKind::WasAssociatedWith,
        RelationKind::WasDerivedFrom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Used => "used",
            RelationKind::WasGeneratedBy => "wasGeneratedBy",
            RelationKind::WasAssociatedWith => "wasAssociatedWith",
            RelationKind::WasDerivedFrom => "wasDerivedFrom",
        }
    }

    /// PROV role names of the subject and the object.
    pub fn roles(&self) -> (&'static str, &'static str) {
        match self {
            RelationKind::Used => ("activity", "entity"),
            RelationKind::WasGeneratedBy => ("entity", "activity"),
            RelationKind::WasAssociatedWith => ("activity", "agent"),
            RelationKind::WasDerivedFrom => ("generatedEntity", "usedEntity"),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        RelationKind::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Relation {
    pub kind: RelationKind,
    pub subject: QualifiedName,
    pub object: QualifiedName,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    namespaces: BTreeMap<String, String>,
    default_namespace: Option<String>,
    elements: BTreeMap<QualifiedName, Element>,
    relations: BTreeSet<Relation>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// A document with the geospatial namespace bindings and an empty
    /// default namespace, as every stage document starts out.
    pub fn with_geo_namespaces() -> Self {
        let mut doc = Self::new();
        for (prefix, uri) in GEO_NAMESPACES {
            doc.add_namespace(prefix, uri);
        }
        doc.set_default_namespace("");
        doc
    }

    pub fn add_namespace(&mut self, prefix: impl Into<String>, uri: impl Into<String>) {
        self.namespaces.insert(prefix.into(), uri.into());
    }

    pub fn set_default_namespace(&mut self, uri: impl Into<String>) {
        self.default_namespace = Some(uri.into());
    }

    pub fn namespaces(&self) -> &BTreeMap<String, String> {
        &self.namespaces
    }

    pub fn default_namespace(&self) -> Option<&str> {
        self.default_namespace.as_deref()
    }

    /// Resolves a prefix, including the built-in `prov` and `xsd`.
    pub fn namespace_uri(&self, prefix: &str) -> Option<&str> {
        match prefix {
            "prov" => Some(PROV_NS),
            "xsd" => Some(XSD_NS),
            _ => self.namespaces.get(prefix).map(String::as_str),
        }
    }

    /// Full IRI of a qualified name. Unknown prefixes are kept verbatim.
    pub fn expand(&self, name: &QualifiedName) -> String {
        match name.prefix() {
            Some(prefix) => match self.namespace_uri(prefix) {
                Some(uri) => format!("{uri}{}", name.local()),
                None => name.to_string(),
            },
            None => format!("{}{}", self.default_namespace().unwrap_or(""), name.local()),
        }
    }

    /// Inserts or replaces a record, returning the record it replaced.
    /// Attributes are kept ordered by key; repeated keys keep their order.
    pub fn upsert(&mut self, mut element: Element) -> Option<Element> {
        element.attributes.sort_by(|a, b| a.0.cmp(&b.0));
        self.elements.insert(element.id.clone(), element)
    }

    pub fn agent(&mut self, id: impl Into<QualifiedName>, attributes: Attributes) -> QualifiedName {
        self.insert_element(ElementKind::Agent, id.into(), attributes)
    }

    pub fn entity(&mut self, id: impl Into<QualifiedName>, attributes: Attributes) -> QualifiedName {
        self.insert_element(ElementKind::Entity, id.into(), attributes)
    }

    /// Refers to an entity by name, creating a bare record only when the
    /// document has none yet.
    pub fn entity_ref(&mut self, id: impl Into<QualifiedName>) -> QualifiedName {
        let id = id.into();
        if !self.elements.contains_key(&id) {
            self.upsert(Element::new(ElementKind::Entity, id.clone()));
        }
        id
    }

    pub fn activity(
        &mut self,
        id: impl Into<QualifiedName>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> QualifiedName {
        let id = id.into();
        let mut element = Element::new(ElementKind::Activity, id.clone());
        element.start_time = Some(start_time);
        element.end_time = Some(end_time);
        self.upsert(element);
        id
    }

    fn insert_element(
        &mut self,
        kind: ElementKind,
        id: QualifiedName,
        attributes: Attributes,
    ) -> QualifiedName {
        let mut element = Element::new(kind, id.clone());
        element.attributes = attributes;
        self.upsert(element);
        id
    }

    /// Adds a relation; returns `false` when it was already present.
    pub fn relate(
        &mut self,
        kind: RelationKind,
        subject: &QualifiedName,
        object: &QualifiedName,
    ) -> bool {
        self.relations.insert(Relation {
            kind,
            subject: subject.clone(),
            object: object.clone(),
        })
    }

    pub fn used(&mut self, activity: &QualifiedName, entity: &QualifiedName) -> bool {
        self.relate(RelationKind::Used, activity, entity)
    }

    pub fn was_generated_by(&mut self, entity: &QualifiedName, activity: &QualifiedName) -> bool {
        self.relate(RelationKind::WasGeneratedBy, entity, activity)
    }

    pub fn was_associated_with(&mut self, activity: &QualifiedName, agent: &QualifiedName) -> bool {
        self.relate(RelationKind::WasAssociatedWith, activity, agent)
    }

    pub fn was_derived_from(&mut self, generated: &QualifiedName, used: &QualifiedName) -> bool {
        self.relate(RelationKind::WasDerivedFrom, generated, used)
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.get(&QualifiedName::parse(id))
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    pub fn elements_of(&self, kind: ElementKind) -> impl Iterator<Item = &Element> {
        self.elements.values().filter(move |e| e.kind == kind)
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.iter()
    }

    pub fn relations_of(&self, kind: RelationKind) -> impl Iterator<Item = &Relation> {
        self.relations.iter().filter(move |r| r.kind == kind)
    }

    pub fn has_relation(&self, kind: RelationKind, subject: &str, object: &str) -> bool {
        self.relations.contains(&Relation {
            kind,
            subject: QualifiedName::parse(subject),
            object: QualifiedName::parse(object),
        })
    }

    /// Upserts every namespace, record and relation of `other`.
    pub fn update(&mut self, other: Document) {
        self.namespaces.extend(other.namespaces);
        if self.default_namespace.is_none() {
            self.default_namespace = other.default_namespace;
        }
        for (_, element) in other.elements {
            self.upsert(element);
        }
        self.relations.extend(other.relations);
    }
}

/// Folds stage documents into `base` in iteration order.
pub fn merge(mut base: Document, stage_documents: impl IntoIterator<Item = Document>) -> Document {
    for doc in stage_documents {
        base.update(doc);
    }
    base
}
