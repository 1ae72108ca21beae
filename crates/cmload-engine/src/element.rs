//! Element-type classification, computed once per distinct tag and cached.

use crate::schema::{FieldInfo, SessionSchema};
use ahash::AHashMap;
use cmload_schema::{BasicType, ClassId, MetadataService};

/// Fixed-name value elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicTag {
    Boolean,
    Integer,
    Numeric,
    Float,
    Time,
    Guid,
    GenDate,
    Binary,
    Uni,
    AUni,
    Str,
    AStr,
    Run,
    Prop,
    Link,
}

impl BasicTag {
    pub fn from_name(name: &str) -> Option<Self> {
        let tag = match name {
            "Boolean" => BasicTag::Boolean,
            "Integer" => BasicTag::Integer,
            "Numeric" => BasicTag::Numeric,
            "Float" => BasicTag::Float,
            "Time" => BasicTag::Time,
            "Guid" => BasicTag::Guid,
            "GenDate" => BasicTag::GenDate,
            "Binary" => BasicTag::Binary,
            "Uni" => BasicTag::Uni,
            "AUni" => BasicTag::AUni,
            "Str" => BasicTag::Str,
            "AStr" => BasicTag::AStr,
            "Run" => BasicTag::Run,
            "Prop" => BasicTag::Prop,
            "Link" => BasicTag::Link,
            _ => return None,
        };
        Some(tag)
    }

    /// The field type this value element fills, for the value tags.
    pub fn basic_type(self) -> Option<BasicType> {
        let t = match self {
            BasicTag::Boolean => BasicType::Boolean,
            BasicTag::Integer => BasicType::Integer,
            BasicTag::Numeric => BasicType::Numeric,
            BasicTag::Float => BasicType::Float,
            BasicTag::Time => BasicType::Time,
            BasicTag::Guid => BasicType::Guid,
            BasicTag::GenDate => BasicType::GenDate,
            BasicTag::Binary => BasicType::Binary,
            BasicTag::Uni => BasicType::Unicode,
            BasicTag::AUni => BasicType::MultiUnicode,
            BasicTag::Str => BasicType::String,
            BasicTag::AStr => BasicType::MultiString,
            BasicTag::Run | BasicTag::Prop | BasicTag::Link => return None,
        };
        Some(t)
    }

    /// Value carried in a `val` attribute rather than in text.
    pub fn is_attribute_valued(self) -> bool {
        matches!(
            self,
            BasicTag::Boolean
                | BasicTag::Integer
                | BasicTag::Numeric
                | BasicTag::Float
                | BasicTag::Time
                | BasicTag::Guid
                | BasicTag::GenDate
        )
    }
}

/// Back-reference fields that only exist in the XML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtualField {
    LexEntryReferences,
    LexSenseReferences,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    Merge,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementTypeInfo {
    Class(ClassId),
    Field(FieldInfo),
    Basic(BasicTag),
    Virtual(VirtualField),
    /// `Custom`, `CustomStr`, `CustomLink`, `CustomObj`: field named by attribute.
    Custom,
    Directive(Directive),
    /// `AdditionalFields` wrapper.
    CustomFieldList,
    /// `CustomField` declaration.
    CustomFieldDecl,
    Malformed,
}

#[derive(Debug, Default)]
pub struct ElementCache {
    cache: AHashMap<String, ElementTypeInfo>,
}

impl ElementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, tag: &str, schema: &SessionSchema<'_>) -> ElementTypeInfo {
        if let Some(info) = self.cache.get(tag) {
            return *info;
        }
        let info = classify_uncached(tag, schema);
        self.cache.insert(tag.to_string(), info);
        info
    }

    /// Drop cached field entries after custom fields were declared.
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn classify_uncached(tag: &str, schema: &SessionSchema<'_>) -> ElementTypeInfo {
    if let Some(basic) = BasicTag::from_name(tag) {
        return ElementTypeInfo::Basic(basic);
    }
    match tag {
        "LexEntryReferences" => return ElementTypeInfo::Virtual(VirtualField::LexEntryReferences),
        "LexSenseReferences" => return ElementTypeInfo::Virtual(VirtualField::LexSenseReferences),
        "Custom" | "CustomStr" | "CustomLink" | "CustomObj" => return ElementTypeInfo::Custom,
        "Merge" => return ElementTypeInfo::Directive(Directive::Merge),
        "Delete" => return ElementTypeInfo::Directive(Directive::Delete),
        "AdditionalFields" => return ElementTypeInfo::CustomFieldList,
        "CustomField" => return ElementTypeInfo::CustomFieldDecl,
        _ => {}
    }
    if let Some(class) = schema.class_id_for_name(tag) {
        return ElementTypeInfo::Class(class);
    }
    if let Some(field) = schema.field_for_tag(tag) {
        return ElementTypeInfo::Field(FieldInfo::of(field));
    }
    ElementTypeInfo::Malformed
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmload_schema::{core_catalog, FieldId};

    #[test]
    fn tags_classify_by_kind() {
        let catalog = core_catalog().unwrap();
        let schema = SessionSchema::new(&catalog);
        let mut cache = ElementCache::new();

        assert!(matches!(
            cache.classify("LexEntry", &schema),
            ElementTypeInfo::Class(c) if c.raw() == 5002
        ));
        assert!(matches!(
            cache.classify("Senses5002", &schema),
            ElementTypeInfo::Field(f) if f.id == FieldId::new(5002004)
        ));
        assert_eq!(
            cache.classify("AUni", &schema),
            ElementTypeInfo::Basic(BasicTag::AUni)
        );
        assert_eq!(
            cache.classify("LexSenseReferences", &schema),
            ElementTypeInfo::Virtual(VirtualField::LexSenseReferences)
        );
        assert_eq!(cache.classify("Bogus", &schema), ElementTypeInfo::Malformed);
        assert_eq!(cache.len(), 5);
    }
}
