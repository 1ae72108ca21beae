//! Session view of the schema: the base metadata service plus the custom
//! fields a document declares in `<AdditionalFields>`.

use crate::error::{LoadError, LoadResult};
use ahash::AHashMap;
use cmload_schema::{
    BasicType, Cardinality, ClassDescriptor, ClassId, FieldDescriptor, FieldId, FieldKind,
    ListRootPath, MetadataService,
};
use std::collections::BTreeMap;

/// Copyable summary of a field descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldInfo {
    pub id: FieldId,
    pub owner_class: ClassId,
    pub kind: FieldKind,
    pub target_class: Option<ClassId>,
    pub custom: bool,
}

impl FieldInfo {
    pub fn of(desc: &FieldDescriptor) -> Self {
        Self {
            id: desc.id,
            owner_class: desc.owner_class,
            kind: desc.kind,
            target_class: desc.target_class,
            custom: desc.custom,
        }
    }

    pub fn basic(&self) -> Option<BasicType> {
        self.kind.basic()
    }

    pub fn cardinality(&self) -> Option<Cardinality> {
        self.kind.cardinality()
    }

    pub fn is_owning(&self) -> bool {
        self.kind.is_owning()
    }

    pub fn is_reference(&self) -> bool {
        self.kind.is_reference()
    }

    pub fn is_sequence(&self) -> bool {
        self.kind.is_sequence()
    }
}

pub struct SessionSchema<'a> {
    base: &'a dyn MetadataService,
    custom: BTreeMap<FieldId, FieldDescriptor>,
    custom_by_tag: AHashMap<String, FieldId>,
}

impl<'a> SessionSchema<'a> {
    pub fn new(base: &'a dyn MetadataService) -> Self {
        Self {
            base,
            custom: BTreeMap::new(),
            custom_by_tag: AHashMap::new(),
        }
    }

    pub fn info(&self, id: FieldId) -> Option<FieldInfo> {
        self.field(id).map(FieldInfo::of)
    }

    pub fn custom_count(&self) -> usize {
        self.custom.len()
    }

    /// Declare a custom field on `class`. Re-declaring the same name returns
    /// the existing field when its kind matches.
    pub fn declare_custom(
        &mut self,
        class: ClassId,
        name: &str,
        kind: FieldKind,
        target_class: Option<ClassId>,
        list_root: Option<ListRootPath>,
    ) -> LoadResult<FieldInfo> {
        if self.base.class(class).is_none() {
            return Err(LoadError::InvalidTarget(format!(
                "custom field {name} declared on unknown {class}"
            )));
        }
        if let Some(existing) = self.custom_field(class, name) {
            if existing.kind == kind {
                return Ok(existing);
            }
            return Err(LoadError::InvalidValue {
                what: format!("redeclaration of custom field {name}"),
                value: format!("{kind:?}"),
            });
        }
        if self.base.field_by_name(class, name).is_some() {
            return Err(LoadError::InvalidValue {
                what: "custom field name".to_string(),
                value: format!("{}.{name} already exists", self.class_name(class)),
            });
        }
        if kind.basic().is_none() && target_class.is_none() {
            return Err(LoadError::InvalidValue {
                what: format!("custom field {name}"),
                value: "object fields need a target class".to_string(),
            });
        }

        let mut raw = class.raw() * 1000 + 500;
        loop {
            raw += 1;
            let id = FieldId::new(raw);
            if self.field(id).is_none() {
                break;
            }
        }
        let desc = FieldDescriptor {
            id: FieldId::new(raw),
            name: name.to_string(),
            owner_class: class,
            kind,
            target_class,
            list_root,
            custom: true,
        };
        let info = FieldInfo::of(&desc);
        self.custom_by_tag.insert(desc.xml_tag(), desc.id);
        self.custom.insert(desc.id, desc);
        tracing::debug!(field = %self.field_name(info.id), "declared custom field");
        Ok(info)
    }

    /// Custom field `name` visible on `class` (declared on it or a base class).
    pub fn custom_field(&self, class: ClassId, name: &str) -> Option<FieldInfo> {
        let mut current = Some(class);
        while let Some(c) = current {
            let found = self
                .custom
                .values()
                .find(|f| f.owner_class == c && f.name == name);
            if let Some(f) = found {
                return Some(FieldInfo::of(f));
            }
            current = self.base.class(c).and_then(|d| d.base);
        }
        None
    }

    pub fn require_class(&self, name: &str) -> LoadResult<ClassId> {
        self.class_id_for_name(name)
            .ok_or_else(|| LoadError::MissingSchema(format!("class {name}")))
    }

    pub fn require_field(&self, class: &str, field: &str) -> LoadResult<FieldInfo> {
        let class_id = self.require_class(class)?;
        self.field_by_name(class_id, field)
            .map(FieldInfo::of)
            .ok_or_else(|| LoadError::MissingSchema(format!("field {class}.{field}")))
    }

    /// `Class.Field` lookup that tolerates schemas without the class.
    pub fn field_named(&self, class: &str, field: &str) -> Option<FieldInfo> {
        let class_id = self.class_id_for_name(class)?;
        self.field_by_name(class_id, field).map(FieldInfo::of)
    }

    /// `class` is `ancestor` or derives from the class named `ancestor`.
    pub fn is_a(&self, class: ClassId, ancestor: &str) -> bool {
        self.class_id_for_name(ancestor)
            .is_some_and(|a| self.is_subclass(class, a))
    }

    pub fn is_abstract(&self, class: ClassId) -> bool {
        self.class(class).is_some_and(|c| c.is_abstract)
    }
}

impl MetadataService for SessionSchema<'_> {
    fn class_id_for_name(&self, name: &str) -> Option<ClassId> {
        self.base.class_id_for_name(name)
    }

    fn class(&self, id: ClassId) -> Option<&ClassDescriptor> {
        self.base.class(id)
    }

    fn field(&self, id: FieldId) -> Option<&FieldDescriptor> {
        self.custom.get(&id).or_else(|| self.base.field(id))
    }

    fn field_for_tag(&self, tag: &str) -> Option<&FieldDescriptor> {
        match self.custom_by_tag.get(tag) {
            Some(id) => self.custom.get(id),
            None => self.base.field_for_tag(tag),
        }
    }

    fn field_by_name(&self, class: ClassId, name: &str) -> Option<&FieldDescriptor> {
        if let Some(found) = self.base.field_by_name(class, name) {
            return Some(found);
        }
        let mut current = Some(class);
        while let Some(c) = current {
            if let Some(f) = self
                .custom
                .values()
                .find(|f| f.owner_class == c && f.name == name)
            {
                return Some(f);
            }
            current = self.base.class(c).and_then(|d| d.base);
        }
        None
    }

    fn fields_of_class(&self, class: ClassId) -> Vec<&FieldDescriptor> {
        let mut out = self.base.fields_of_class(class);
        out.extend(
            self.custom
                .values()
                .filter(|f| self.base.is_subclass(class, f.owner_class)),
        );
        out
    }

    fn subclasses_of(&self, class: ClassId) -> Vec<ClassId> {
        self.base.subclasses_of(class)
    }
}
