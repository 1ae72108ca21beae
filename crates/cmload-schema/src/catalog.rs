//! Class and field descriptors, the `MetadataService` seam and the in-memory
//! `SchemaCatalog`.

use crate::dsl::{parse_schema, FieldKindDecl, SchemaParseError};
use crate::ids::{ClassId, FieldId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

// ============================================================================
// Field kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    Atomic,
    Collection,
    Sequence,
}

impl Cardinality {
    pub fn keyword(self) -> &'static str {
        match self {
            Cardinality::Atomic => "atomic",
            Cardinality::Collection => "collection",
            Cardinality::Sequence => "sequence",
        }
    }

    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "atomic" => Some(Cardinality::Atomic),
            "collection" => Some(Cardinality::Collection),
            "sequence" => Some(Cardinality::Sequence),
            _ => None,
        }
    }
}

/// Scalar and string-valued field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BasicType {
    Boolean,
    Integer,
    Numeric,
    Float,
    Time,
    Guid,
    Binary,
    GenDate,
    String,
    MultiString,
    Unicode,
    MultiUnicode,
}

impl BasicType {
    pub const ALL: [BasicType; 12] = [
        BasicType::Boolean,
        BasicType::Integer,
        BasicType::Numeric,
        BasicType::Float,
        BasicType::Time,
        BasicType::Guid,
        BasicType::Binary,
        BasicType::GenDate,
        BasicType::String,
        BasicType::MultiString,
        BasicType::Unicode,
        BasicType::MultiUnicode,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            BasicType::Boolean => "boolean",
            BasicType::Integer => "integer",
            BasicType::Numeric => "numeric",
            BasicType::Float => "float",
            BasicType::Time => "time",
            BasicType::Guid => "guid",
            BasicType::Binary => "binary",
            BasicType::GenDate => "gendate",
            BasicType::String => "string",
            BasicType::MultiString => "multistring",
            BasicType::Unicode => "unicode",
            BasicType::MultiUnicode => "multiunicode",
        }
    }

    pub fn from_keyword(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.keyword() == s)
    }

    /// Values are keyed by writing system.
    pub fn is_multilingual(self) -> bool {
        matches!(self, BasicType::MultiString | BasicType::MultiUnicode)
    }

    /// Plain-text columns that the store indexes and therefore length-limits.
    pub fn is_indexable(self) -> bool {
        matches!(self, BasicType::Unicode | BasicType::MultiUnicode)
    }

    /// Formatted (run-structured) strings.
    pub fn is_formatted(self) -> bool {
        matches!(self, BasicType::String | BasicType::MultiString)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Basic(BasicType),
    Owning(Cardinality),
    Reference(Cardinality),
}

impl FieldKind {
    pub fn basic(self) -> Option<BasicType> {
        match self {
            FieldKind::Basic(t) => Some(t),
            _ => None,
        }
    }

    pub fn cardinality(self) -> Option<Cardinality> {
        match self {
            FieldKind::Owning(c) | FieldKind::Reference(c) => Some(c),
            FieldKind::Basic(_) => None,
        }
    }

    pub fn is_owning(self) -> bool {
        matches!(self, FieldKind::Owning(_))
    }

    pub fn is_reference(self) -> bool {
        matches!(self, FieldKind::Reference(_))
    }

    pub fn is_multilingual(self) -> bool {
        self.basic().is_some_and(BasicType::is_multilingual)
    }

    pub fn is_sequence(self) -> bool {
        self.cardinality() == Some(Cardinality::Sequence)
    }
}

// ============================================================================
// Descriptors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDescriptor {
    pub id: ClassId,
    pub name: String,
    pub base: Option<ClassId>,
    pub is_abstract: bool,
}

/// `OwnerClass.Field` path naming the atomic owning field that holds the
/// possibility list a reference field draws its items from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListRootPath {
    pub owner_class: String,
    pub field: String,
}

impl ListRootPath {
    pub fn parse(path: &str) -> Option<Self> {
        let (owner_class, field) = path.split_once('.')?;
        if owner_class.is_empty() || field.is_empty() {
            return None;
        }
        Some(Self {
            owner_class: owner_class.to_string(),
            field: field.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub id: FieldId,
    pub name: String,
    pub owner_class: ClassId,
    pub kind: FieldKind,
    pub target_class: Option<ClassId>,
    pub list_root: Option<ListRootPath>,
    pub custom: bool,
}

impl FieldDescriptor {
    /// Element name used for this field in import XML.
    pub fn xml_tag(&self) -> String {
        format!("{}{}", self.name, self.owner_class.raw())
    }
}

// ============================================================================
// Metadata service
// ============================================================================

/// Read-only schema lookups used by the import engine.
pub trait MetadataService {
    fn class_id_for_name(&self, name: &str) -> Option<ClassId>;

    fn class(&self, id: ClassId) -> Option<&ClassDescriptor>;

    fn field(&self, id: FieldId) -> Option<&FieldDescriptor>;

    /// Resolve an element name (`Senses5002`, or a unique plain name).
    fn field_for_tag(&self, tag: &str) -> Option<&FieldDescriptor>;

    /// Resolve a field by name on `class` or any of its superclasses.
    fn field_by_name(&self, class: ClassId, name: &str) -> Option<&FieldDescriptor>;

    /// Every field of `class`, inherited fields included.
    fn fields_of_class(&self, class: ClassId) -> Vec<&FieldDescriptor>;

    /// `class` and every class deriving from it.
    fn subclasses_of(&self, class: ClassId) -> Vec<ClassId>;

    fn is_subclass(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.class(c).and_then(|d| d.base);
        }
        false
    }

    fn class_name(&self, id: ClassId) -> String {
        self.class(id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn field_name(&self, id: FieldId) -> String {
        match self.field(id) {
            Some(f) => format!("{}.{}", self.class_name(f.owner_class), f.name),
            None => id.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error(transparent)]
    Parse(#[from] SchemaParseError),
    #[error("duplicate class `{0}`")]
    DuplicateClass(String),
    #[error("duplicate field `{class}.{field}`")]
    DuplicateField { class: String, field: String },
    #[error("unknown class `{0}`")]
    UnknownClass(String),
    #[error("field `{field}` needs a target class")]
    MissingTarget { field: String },
}

/// In-memory schema catalog.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    classes: BTreeMap<ClassId, ClassDescriptor>,
    class_by_name: HashMap<String, ClassId>,
    fields: BTreeMap<FieldId, FieldDescriptor>,
    field_by_tag: HashMap<String, FieldId>,
    plain_names: HashMap<String, Vec<FieldId>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `.cms` text into a catalog. Class names used as bases or field
    /// targets may be declared later in the text.
    pub fn from_dsl(text: &str) -> Result<Self, SchemaError> {
        let doc = parse_schema(text)?;
        let mut catalog = Self::new();

        for class in &doc.classes {
            catalog.add_class(ClassDescriptor {
                id: ClassId::new(class.id),
                name: class.name.clone(),
                base: None,
                is_abstract: class.is_abstract,
            })?;
        }
        for class in &doc.classes {
            if let Some(base) = &class.base {
                let base_id = catalog
                    .class_id_for_name(base)
                    .ok_or_else(|| SchemaError::UnknownClass(base.clone()))?;
                if let Some(desc) = catalog.classes.get_mut(&ClassId::new(class.id)) {
                    desc.base = Some(base_id);
                }
            }
        }

        for class in &doc.classes {
            for field in &class.fields {
                let (kind, target) = match &field.kind {
                    FieldKindDecl::Basic(t) => (FieldKind::Basic(*t), None),
                    FieldKindDecl::Owning(c, target) => (FieldKind::Owning(*c), Some(target)),
                    FieldKindDecl::Reference(c, target) => {
                        (FieldKind::Reference(*c), Some(target))
                    }
                };
                let target_class = match target {
                    Some(name) => Some(
                        catalog
                            .class_id_for_name(name)
                            .ok_or_else(|| SchemaError::UnknownClass(name.clone()))?,
                    ),
                    None => None,
                };
                catalog.add_field(FieldDescriptor {
                    id: FieldId::new(field.id),
                    name: field.name.clone(),
                    owner_class: ClassId::new(class.id),
                    kind,
                    target_class,
                    list_root: field.list_root.clone(),
                    custom: false,
                })?;
            }
        }

        Ok(catalog)
    }

    pub fn add_class(&mut self, class: ClassDescriptor) -> Result<(), SchemaError> {
        if self.classes.contains_key(&class.id) || self.class_by_name.contains_key(&class.name) {
            return Err(SchemaError::DuplicateClass(class.name));
        }
        self.class_by_name.insert(class.name.clone(), class.id);
        self.classes.insert(class.id, class);
        Ok(())
    }

    pub fn add_field(&mut self, field: FieldDescriptor) -> Result<(), SchemaError> {
        let class_name = self
            .classes
            .get(&field.owner_class)
            .map(|c| c.name.clone())
            .ok_or_else(|| SchemaError::UnknownClass(field.owner_class.to_string()))?;
        if field.kind.basic().is_none() && field.target_class.is_none() {
            return Err(SchemaError::MissingTarget {
                field: format!("{class_name}.{}", field.name),
            });
        }
        let duplicate_name = self
            .fields
            .values()
            .any(|f| f.owner_class == field.owner_class && f.name == field.name);
        if self.fields.contains_key(&field.id) || duplicate_name {
            return Err(SchemaError::DuplicateField {
                class: class_name,
                field: field.name,
            });
        }
        self.field_by_tag.insert(field.xml_tag(), field.id);
        self.plain_names
            .entry(field.name.clone())
            .or_default()
            .push(field.id);
        self.fields.insert(field.id, field);
        Ok(())
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.classes.values()
    }
}

impl MetadataService for SchemaCatalog {
    fn class_id_for_name(&self, name: &str) -> Option<ClassId> {
        self.class_by_name.get(name).copied()
    }

    fn class(&self, id: ClassId) -> Option<&ClassDescriptor> {
        self.classes.get(&id)
    }

    fn field(&self, id: FieldId) -> Option<&FieldDescriptor> {
        self.fields.get(&id)
    }

    fn field_for_tag(&self, tag: &str) -> Option<&FieldDescriptor> {
        if let Some(id) = self.field_by_tag.get(tag) {
            return self.fields.get(id);
        }
        match self.plain_names.get(tag).map(Vec::as_slice) {
            Some([only]) => self.fields.get(only),
            _ => None,
        }
    }

    fn field_by_name(&self, class: ClassId, name: &str) -> Option<&FieldDescriptor> {
        let mut current = Some(class);
        while let Some(c) = current {
            let found = self
                .plain_names
                .get(name)
                .into_iter()
                .flatten()
                .filter_map(|id| self.fields.get(id))
                .find(|f| f.owner_class == c);
            if found.is_some() {
                return found;
            }
            current = self.classes.get(&c).and_then(|d| d.base);
        }
        None
    }

    fn fields_of_class(&self, class: ClassId) -> Vec<&FieldDescriptor> {
        let mut out = Vec::new();
        let mut current = Some(class);
        while let Some(c) = current {
            out.extend(self.fields.values().filter(|f| f.owner_class == c));
            current = self.classes.get(&c).and_then(|d| d.base);
        }
        out
    }

    fn subclasses_of(&self, class: ClassId) -> Vec<ClassId> {
        self.classes
            .keys()
            .copied()
            .filter(|c| self.is_subclass(*c, class))
            .collect()
    }
}
