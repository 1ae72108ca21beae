//! Pass 1: identity and ownership discovery.
//!
//! Walks the document once without writing anything to the store. Every
//! object element gets an id and GUID, its owner and owning field are
//! recorded, and sequence positions are checked and ranked. Custom field
//! declarations and update directives are collected on the way.

use crate::element::{BasicTag, Directive, ElementTypeInfo};
use crate::error::{LoadError, LoadResult};
use crate::identity::{parse_object_id, ParsedId};
use crate::policy::{Disposition, ImportPolicy, ObjectRequest};
use crate::schema::FieldInfo;
use crate::session::ImportSession;
use crate::tokens::{self, Attributes, TokenSink, XmlSource};
use ahash::AHashMap;
use cmload_schema::{
    BasicType, Cardinality, ClassId, FieldId, FieldKind, ListRootPath, MetadataService, ObjectId,
};
use uuid::Uuid;

// ============================================================================
// Parsed document
// ============================================================================

/// Where top-level elements of the document attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseContext {
    /// Top-level objects are unowned roots.
    Roots,
    /// Top-level objects are children of `owner.field`.
    Field { owner: ObjectId, field: FieldInfo },
    /// Top-level elements are fields of `owner`.
    Object { owner: ObjectId, class: ClassId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub owner: ObjectId,
    pub field: FieldInfo,
    /// Final position for sequence fields.
    pub ord: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedObject {
    pub id: ObjectId,
    pub guid: Uuid,
    pub class: ClassId,
    pub owner: Option<Placement>,
    pub is_new: bool,
    pub replaces: Option<ObjectId>,
    pub disposition: Disposition,
    pub top_level: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeDirective {
    pub from: Uuid,
    pub to: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    /// Object elements in document order; pass 2 walks them by position.
    pub objects: Vec<ParsedObject>,
    pub merges: Vec<MergeDirective>,
    pub deletes: Vec<Uuid>,
    pub elements: usize,
}

impl ParsedDocument {
    pub fn find_guid(&self, guid: &Uuid) -> Option<&ParsedObject> {
        self.objects.iter().find(|o| o.guid == *guid)
    }

    pub fn guid_index(&self) -> AHashMap<Uuid, usize> {
        self.objects
            .iter()
            .enumerate()
            .map(|(i, o)| (o.guid, i))
            .collect()
    }

    pub fn count(&self, disposition: Disposition) -> usize {
        self.objects
            .iter()
            .filter(|o| o.disposition == disposition)
            .count()
    }
}

// ============================================================================
// Walker
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct SeqChild {
    index: usize,
    explicit: Option<u32>,
}

enum Frame {
    Wrapper,
    Object {
        index: usize,
    },
    Field {
        owner: ObjectId,
        field: FieldInfo,
        children: Vec<SeqChild>,
    },
    /// `<Uni>` of a writing system's `ICULocale`.
    Locale {
        object: ObjectId,
        text: String,
    },
    CustomDecls,
    Skip,
}

pub fn run(
    session: &mut ImportSession<'_>,
    policy: &dyn ImportPolicy,
    source: &XmlSource,
) -> LoadResult<ParsedDocument> {
    let locale_field = session
        .schema
        .field_named("LgWritingSystem", "ICULocale")
        .map(|f| f.id);
    let mut pass = Pass1 {
        session,
        policy,
        doc: ParsedDocument::default(),
        stack: Vec::new(),
        base_children: Vec::new(),
        locale_field,
    };
    tokens::drive(source, &mut pass)?;
    pass.finish()
}

struct Pass1<'p, 's> {
    session: &'p mut ImportSession<'s>,
    policy: &'p dyn ImportPolicy,
    doc: ParsedDocument,
    stack: Vec<Frame>,
    /// Children of the base field (`BaseContext::Field`).
    base_children: Vec<SeqChild>,
    locale_field: Option<FieldId>,
}

impl Pass1<'_, '_> {
    fn finish(mut self) -> LoadResult<ParsedDocument> {
        if let BaseContext::Field { owner, field } = self.policy.base_context() {
            let children = std::mem::take(&mut self.base_children);
            self.finalize_children(owner, field, children)?;
        }
        tracing::info!(
            elements = self.doc.elements,
            objects = self.doc.objects.len(),
            new = self.doc.objects.iter().filter(|o| o.is_new).count(),
            merges = self.doc.merges.len(),
            deletes = self.doc.deletes.len(),
            "pass 1 complete"
        );
        Ok(self.doc)
    }

    fn field_label(&self, field: FieldInfo) -> String {
        self.session.schema.field_name(field.id)
    }

    // ------------------------------------------------------------------
    // Top level
    // ------------------------------------------------------------------

    fn start_top_level(
        &mut self,
        name: &str,
        attrs: &Attributes,
        info: ElementTypeInfo,
    ) -> LoadResult<Frame> {
        let base = self.policy.base_context();
        match info {
            ElementTypeInfo::Directive(directive) => {
                self.record_directive(directive, attrs)?;
                Ok(Frame::Skip)
            }
            ElementTypeInfo::CustomFieldList => Ok(Frame::CustomDecls),
            ElementTypeInfo::Class(class) => match base {
                BaseContext::Roots => {
                    let index = self.start_object(class, None, attrs, true)?;
                    Ok(Frame::Object { index })
                }
                BaseContext::Field { owner, field } => {
                    let index = self.start_object(class, Some((owner, field)), attrs, true)?;
                    self.base_children.push(SeqChild {
                        index,
                        explicit: explicit_ord(attrs)?,
                    });
                    Ok(Frame::Object { index })
                }
                BaseContext::Object { .. } => Err(LoadError::UnexpectedNesting(format!(
                    "<{name}> where fields of the target object were expected"
                ))),
            },
            ElementTypeInfo::Field(field) => match base {
                BaseContext::Field { field: base_field, .. } if base_field.id == field.id => {
                    Ok(Frame::Wrapper)
                }
                BaseContext::Object { owner, class } => {
                    self.check_field_on_class(field, class)?;
                    Ok(Frame::Field {
                        owner,
                        field,
                        children: Vec::new(),
                    })
                }
                _ => Err(LoadError::UnexpectedNesting(format!(
                    "field <{name}> outside of any object"
                ))),
            },
            ElementTypeInfo::Custom => match base {
                BaseContext::Object { owner, class } => {
                    Ok(self.custom_field_frame(name, owner, class, attrs))
                }
                _ => Err(LoadError::UnexpectedNesting(format!(
                    "<{name}> outside of any object"
                ))),
            },
            ElementTypeInfo::Malformed => Err(LoadError::UnknownElement(name.to_string())),
            ElementTypeInfo::Basic(_)
            | ElementTypeInfo::Virtual(_)
            | ElementTypeInfo::CustomFieldDecl => Err(LoadError::UnexpectedNesting(format!(
                "<{name}> outside of any object"
            ))),
        }
    }

    fn record_directive(&mut self, directive: Directive, attrs: &Attributes) -> LoadResult<()> {
        match directive {
            Directive::Merge => {
                let from = guid_attr(attrs, "from")?;
                let to = guid_attr(attrs, "to")?;
                self.doc.merges.push(MergeDirective { from, to });
            }
            Directive::Delete => {
                let guid = match attrs.non_empty("guid") {
                    Some(_) => guid_attr(attrs, "guid")?,
                    None => guid_attr(attrs, "id")?,
                };
                self.doc.deletes.push(guid);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    fn start_object(
        &mut self,
        class: ClassId,
        parent: Option<(ObjectId, FieldInfo)>,
        attrs: &Attributes,
        top_level: bool,
    ) -> LoadResult<usize> {
        if self.session.schema.is_abstract(class) {
            return Err(LoadError::InvalidValue {
                what: "object class".to_string(),
                value: format!("{} is abstract", self.session.schema.class_name(class)),
            });
        }
        if let Some((field, target)) = parent.and_then(|(_, f)| f.target_class.map(|t| (f, t))) {
            if !self.session.schema.is_subclass(class, target) {
                let message = format!(
                    "{} placed in {}, which holds {}",
                    self.session.schema.class_name(class),
                    self.field_label(field),
                    self.session.schema.class_name(target)
                );
                self.session.diag.data_quality("owner-class-mismatch", message);
            }
        }

        let request = ObjectRequest {
            raw_id: attrs.non_empty("id"),
            class,
            placement: parent,
            top_level,
        };
        let resolution = self.policy.resolve_object_identity(self.session, &request)?;
        let mut object = ParsedObject {
            id: resolution.id,
            guid: resolution.guid,
            class,
            owner: parent.map(|(owner, field)| Placement {
                owner,
                field,
                ord: None,
            }),
            is_new: resolution.is_new,
            replaces: resolution.replaces,
            disposition: Disposition::Create,
            top_level,
        };
        object.disposition = self.policy.should_create_or_merge(&object);
        let index = self.doc.objects.len();
        self.doc.objects.push(object);
        Ok(index)
    }

    fn check_field_on_class(&self, field: FieldInfo, class: ClassId) -> LoadResult<()> {
        if self.session.schema.is_subclass(class, field.owner_class) {
            Ok(())
        } else {
            Err(LoadError::FieldNotOnClass {
                field: self.field_label(field),
                class: self.session.schema.class_name(class),
            })
        }
    }

    fn custom_field_frame(
        &mut self,
        tag: &str,
        owner: ObjectId,
        class: ClassId,
        attrs: &Attributes,
    ) -> Frame {
        let name = attrs.non_empty("name").unwrap_or_default();
        let field = self.session.schema.custom_field(class, name).or_else(|| {
            self.session
                .schema
                .field_by_name(class, name)
                .map(FieldInfo::of)
        });
        match field {
            Some(field) => Frame::Field {
                owner,
                field,
                children: Vec::new(),
            },
            None => {
                let message = format!(
                    "<{tag} name=\"{name}\"> is not a field of {}; skipped",
                    self.session.schema.class_name(class)
                );
                self.session.diag.data_quality("unknown-custom-field", message);
                Frame::Skip
            }
        }
    }

    fn start_in_object(
        &mut self,
        name: &str,
        attrs: &Attributes,
        info: ElementTypeInfo,
        index: usize,
    ) -> LoadResult<Frame> {
        let object = self.doc.objects[index];
        match info {
            ElementTypeInfo::Field(field) => {
                self.check_field_on_class(field, object.class)?;
                Ok(Frame::Field {
                    owner: object.id,
                    field,
                    children: Vec::new(),
                })
            }
            ElementTypeInfo::Custom => {
                Ok(self.custom_field_frame(name, object.id, object.class, attrs))
            }
            ElementTypeInfo::Virtual(_) => Ok(Frame::Skip),
            ElementTypeInfo::Malformed => Err(LoadError::UnknownElement(name.to_string())),
            _ => Err(LoadError::UnexpectedNesting(format!(
                "<{name}> directly inside {}",
                self.session.schema.class_name(object.class)
            ))),
        }
    }

    fn start_in_field(
        &mut self,
        name: &str,
        attrs: &Attributes,
        info: ElementTypeInfo,
        owner: ObjectId,
        field: FieldInfo,
    ) -> LoadResult<Frame> {
        match info {
            ElementTypeInfo::Class(class) if field.is_owning() => {
                let index = self.start_object(class, Some((owner, field)), attrs, false)?;
                let explicit = explicit_ord(attrs)?;
                if let Some(Frame::Field { children, .. }) = self.stack.last_mut() {
                    children.push(SeqChild { index, explicit });
                }
                Ok(Frame::Object { index })
            }
            ElementTypeInfo::Class(_) => Err(LoadError::UnexpectedNesting(format!(
                "object <{name}> inside non-owning field {}",
                self.field_label(field)
            ))),
            ElementTypeInfo::Basic(BasicTag::Uni)
                if Some(field.id) == self.locale_field =>
            {
                Ok(Frame::Locale {
                    object: owner,
                    text: String::new(),
                })
            }
            ElementTypeInfo::Basic(_) => Ok(Frame::Skip),
            ElementTypeInfo::Malformed => Err(LoadError::UnknownElement(name.to_string())),
            _ => Err(LoadError::UnexpectedNesting(format!(
                "<{name}> inside field {}",
                self.field_label(field)
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Sequence ranking
    // ------------------------------------------------------------------

    /// Check one field's children and assign final sequence positions.
    fn finalize_children(
        &mut self,
        owner: ObjectId,
        field: FieldInfo,
        children: Vec<SeqChild>,
    ) -> LoadResult<()> {
        if children.is_empty() {
            return Ok(());
        }
        if field.cardinality() == Some(Cardinality::Atomic) && children.len() > 1 {
            return Err(LoadError::UnexpectedNesting(format!(
                "atomic field {} holds {} objects",
                self.field_label(field),
                children.len()
            )));
        }
        if !field.is_sequence() {
            return Ok(());
        }

        let ordered = order_children(&children).map_err(|e| match e {
            OrderError::Mixed => LoadError::MixedSequenceOrder {
                field: self.field_label(field),
            },
            OrderError::Duplicate(ord) => LoadError::DuplicateOrder {
                field: self.field_label(field),
                ord,
            },
        })?;

        let appending = self.policy.appends_to_existing();
        let mut next = if appending && self.session.is_preexisting(owner) {
            self.session.max_child_ord(owner, field.id)
        } else {
            0
        };
        for index in ordered {
            let object = &mut self.doc.objects[index];
            if appending && object.disposition != Disposition::Create {
                continue;
            }
            next += 1;
            if let Some(placement) = object.owner.as_mut() {
                placement.ord = Some(next);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Custom field declarations
    // ------------------------------------------------------------------

    fn declare_custom_field(&mut self, attrs: &Attributes) -> LoadResult<()> {
        let name = required(attrs, "name")?;
        let class = self.session.schema.require_class(required(attrs, "class")?)?;
        let type_name = required(attrs, "type")?.to_ascii_lowercase();
        let card = match attrs.non_empty("card") {
            Some(card) => Cardinality::from_keyword(&card.to_ascii_lowercase()).ok_or_else(|| {
                LoadError::InvalidValue {
                    what: "custom field cardinality".to_string(),
                    value: card.to_string(),
                }
            })?,
            None => Cardinality::Atomic,
        };
        let kind = match type_name.as_str() {
            "owning" => FieldKind::Owning(card),
            "reference" => FieldKind::Reference(card),
            other => FieldKind::Basic(BasicType::from_keyword(other).ok_or_else(|| {
                LoadError::InvalidValue {
                    what: "custom field type".to_string(),
                    value: other.to_string(),
                }
            })?),
        };
        let target = match attrs.non_empty("target") {
            Some(target) => Some(self.session.schema.require_class(target)?),
            None => None,
        };
        let list_root = attrs.non_empty("list").and_then(ListRootPath::parse);
        self.session
            .schema
            .declare_custom(class, name, kind, target, list_root)?;
        self.session.elements.invalidate();
        Ok(())
    }
}

impl TokenSink for Pass1<'_, '_> {
    fn start_element(&mut self, name: &str, attrs: &Attributes) -> LoadResult<()> {
        self.doc.elements += 1;
        let info = self.session.classify(name);

        let frame = match self.stack.last() {
            None => match info {
                ElementTypeInfo::Class(_) | ElementTypeInfo::Field(_) => {
                    self.start_top_level(name, attrs, info)?
                }
                ElementTypeInfo::Malformed => Frame::Wrapper,
                _ => self.start_top_level(name, attrs, info)?,
            },
            Some(Frame::Wrapper) => self.start_top_level(name, attrs, info)?,
            Some(Frame::Object { index }) => {
                let index = *index;
                self.start_in_object(name, attrs, info, index)?
            }
            Some(Frame::Field { owner, field, .. }) => {
                let (owner, field) = (*owner, *field);
                self.start_in_field(name, attrs, info, owner, field)?
            }
            Some(Frame::CustomDecls) => {
                if info == ElementTypeInfo::CustomFieldDecl {
                    self.declare_custom_field(attrs)?;
                }
                Frame::Skip
            }
            Some(Frame::Locale { .. }) | Some(Frame::Skip) => Frame::Skip,
        };
        self.stack.push(frame);
        Ok(())
    }

    fn end_element(&mut self, name: &str) -> LoadResult<()> {
        let Some(frame) = self.stack.pop() else {
            return Err(LoadError::UnbalancedTag {
                expected: String::new(),
                found: name.to_string(),
            });
        };
        match frame {
            Frame::Field {
                owner,
                field,
                children,
            } => self.finalize_children(owner, field, children)?,
            Frame::Locale { object, text } => {
                let code = text.trim();
                if !code.is_empty() {
                    self.session.ws.learn(code, object);
                }
            }
            Frame::Wrapper | Frame::Object { .. } | Frame::CustomDecls | Frame::Skip => {}
        }
        Ok(())
    }

    fn character_data(&mut self, text: &str) -> LoadResult<()> {
        if let Some(Frame::Locale { text: buf, .. }) = self.stack.last_mut() {
            buf.push_str(text);
        }
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrderError {
    Mixed,
    Duplicate(u32),
}

/// Document-order indices of `children` in final sequence order.
///
/// Either every child carries an explicit ord (order by ord) or none does
/// (declaration order).
fn order_children(children: &[SeqChild]) -> Result<Vec<usize>, OrderError> {
    let explicit: Vec<Option<u32>> = children.iter().map(|c| c.explicit).collect();
    let ranks = rank_explicit(&explicit)?;
    let mut ordered: Vec<(usize, usize)> = children
        .iter()
        .zip(ranks)
        .map(|(c, rank)| (rank, c.index))
        .collect();
    ordered.sort();
    Ok(ordered.into_iter().map(|(_, index)| index).collect())
}

/// Zero-based final rank of each position given optional explicit ords.
pub(crate) fn rank_explicit(ords: &[Option<u32>]) -> Result<Vec<usize>, OrderError> {
    let given = ords.iter().filter(|o| o.is_some()).count();
    if given == 0 {
        return Ok((0..ords.len()).collect());
    }
    if given != ords.len() {
        return Err(OrderError::Mixed);
    }
    let mut by_ord: Vec<(u32, usize)> = ords
        .iter()
        .enumerate()
        .map(|(pos, ord)| (ord.unwrap_or_default(), pos))
        .collect();
    by_ord.sort();
    for pair in by_ord.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(OrderError::Duplicate(pair[0].0));
        }
    }
    let mut ranks = vec![0; ords.len()];
    for (rank, (_, pos)) in by_ord.into_iter().enumerate() {
        ranks[pos] = rank;
    }
    Ok(ranks)
}

pub(crate) fn explicit_ord(attrs: &Attributes) -> LoadResult<Option<u32>> {
    match attrs.non_empty("ord") {
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| LoadError::InvalidValue {
                what: "ord".to_string(),
                value: raw.to_string(),
            }),
        None => Ok(None),
    }
}

fn required<'x>(attrs: &'x Attributes, key: &str) -> LoadResult<&'x str> {
    attrs.non_empty(key).ok_or_else(|| LoadError::InvalidValue {
        what: format!("missing `{key}` attribute"),
        value: String::new(),
    })
}

fn guid_attr(attrs: &Attributes, key: &str) -> LoadResult<Uuid> {
    let raw = required(attrs, key)?;
    match parse_object_id(raw) {
        ParsedId::Guid(guid) => Ok(guid),
        ParsedId::Name(_) => Err(LoadError::InvalidValue {
            what: format!("`{key}` GUID"),
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn explicit_ords_rank_by_value() {
        let ranks = rank_explicit(&[Some(30), Some(10), Some(20)]).unwrap();
        assert_eq!(ranks, vec![2, 0, 1]);
        assert_eq!(rank_explicit(&[None, None]).unwrap(), vec![0, 1]);
    }

    #[test]
    fn mixing_and_duplicates_are_rejected() {
        assert_eq!(rank_explicit(&[Some(1), None]), Err(OrderError::Mixed));
        assert_eq!(
            rank_explicit(&[Some(2), Some(1), Some(2)]),
            Err(OrderError::Duplicate(2))
        );
    }

    proptest! {
        /// Ranks are a permutation of 0..n consistent with the explicit ords,
        /// and any mix of given and missing ords is refused.
        #[test]
        fn ranks_form_a_contiguous_order(
            ords in proptest::collection::vec(proptest::option::of(0u32..50), 1..20)
        ) {
            match rank_explicit(&ords) {
                Ok(ranks) => {
                    let mut sorted = ranks.clone();
                    sorted.sort();
                    prop_assert_eq!(sorted, (0..ords.len()).collect::<Vec<_>>());
                    for i in 0..ords.len() {
                        for j in 0..ords.len() {
                            if let (Some(a), Some(b)) = (ords[i], ords[j]) {
                                if a < b {
                                    prop_assert!(ranks[i] < ranks[j]);
                                }
                            }
                        }
                    }
                }
                Err(OrderError::Mixed) => {
                    let given = ords.iter().filter(|o| o.is_some()).count();
                    prop_assert!(given > 0 && given < ords.len());
                }
                Err(OrderError::Duplicate(d)) => {
                    prop_assert!(ords.iter().filter(|o| **o == Some(d)).count() > 1);
                }
            }
        }
    }
}
