//! Pass 2: field and reference population.
//!
//! Replays the document after every object of pass 1 exists in the store.
//! Object elements are matched to pass-1 records by position, value elements
//! are converted and buffered, and `<Link>` elements are resolved directly,
//! through the implicit-reference rules, or deferred to the end of the pass.

use crate::element::{BasicTag, ElementTypeInfo, VirtualField};
use crate::error::{LoadError, LoadResult};
use crate::fmt::{encode_runs, Run};
use crate::identity::{parse_object_id, ParsedId};
use crate::implicit::{self, lexrel, LinkSite, LinkTarget};
use crate::pass1::{explicit_ord, rank_explicit, BaseContext, OrderError, ParsedDocument};
use crate::policy::ImportPolicy;
use crate::schema::FieldInfo;
use crate::session::ImportSession;
use crate::tokens::{self, Attributes, TokenSink, XmlSource};
use chrono::NaiveDateTime;
use cmload_schema::{BasicType, ClassId, MetadataService, ObjectId, WsId};
use cmload_store::ScalarValue;

struct PendingLink {
    target: LinkTarget,
    explicit: Option<u32>,
}

struct ValueFrame {
    tag: BasicTag,
    owner: ObjectId,
    field: FieldInfo,
    live: bool,
    ws: Option<WsId>,
    val: Option<String>,
    text: String,
    runs: Vec<Run>,
}

enum Frame {
    Wrapper,
    Object {
        id: ObjectId,
        class: ClassId,
        live: bool,
    },
    Field {
        owner: ObjectId,
        owner_class: ClassId,
        field: FieldInfo,
        live: bool,
        links: Vec<PendingLink>,
    },
    Value(Box<ValueFrame>),
    Run(Run),
    Virtual {
        owner: ObjectId,
        kind: VirtualField,
        live: bool,
    },
    Skip,
}

pub fn run(
    session: &mut ImportSession<'_>,
    policy: &dyn ImportPolicy,
    doc: &ParsedDocument,
    source: &XmlSource,
) -> LoadResult<()> {
    let mut pass = Pass2 {
        session,
        base: policy.base_context(),
        doc,
        next: 0,
        stack: Vec::new(),
    };
    tokens::drive(source, &mut pass)?;
    if pass.next != doc.objects.len() {
        pass.session.diag.integrity(
            "object-count-mismatch",
            format!(
                "pass 2 saw {} object elements, pass 1 recorded {}",
                pass.next,
                doc.objects.len()
            ),
        );
    }
    pass.session.flush_fields()?;
    implicit::finish_pass(pass.session)
}

struct Pass2<'p, 's> {
    session: &'p mut ImportSession<'s>,
    base: BaseContext,
    doc: &'p ParsedDocument,
    next: usize,
    stack: Vec<Frame>,
}

impl Pass2<'_, '_> {
    /// Bind the next object element to its pass-1 record.
    fn next_object(&mut self, class: ClassId, name: &str) -> LoadResult<Frame> {
        let Some(object) = self.doc.objects.get(self.next).copied() else {
            return Err(LoadError::UnexpectedNesting(format!(
                "object <{name}> was not seen by pass 1"
            )));
        };
        self.next += 1;
        if object.class != class {
            return Err(LoadError::UnexpectedNesting(format!(
                "object <{name}> does not match pass 1 ({})",
                self.session.schema.class_name(object.class)
            )));
        }
        let live = self.session.exists(object.id);
        if !live {
            self.session.diag.integrity(
                "missing-object",
                format!(
                    "fields of {} ({}, guid {}) skipped: the object was never created",
                    object.id, name, object.guid
                ),
            );
        }
        Ok(Frame::Object {
            id: object.id,
            class,
            live,
        })
    }

    fn field_frame(owner: ObjectId, owner_class: ClassId, field: FieldInfo, live: bool) -> Frame {
        Frame::Field {
            owner,
            owner_class,
            field,
            live,
            links: Vec::new(),
        }
    }

    fn custom_field(&self, class: ClassId, attrs: &Attributes) -> Option<FieldInfo> {
        let name = attrs.non_empty("name")?;
        self.session.schema.custom_field(class, name).or_else(|| {
            self.session
                .schema
                .field_by_name(class, name)
                .map(FieldInfo::of)
        })
    }

    fn start_top_level(
        &mut self,
        name: &str,
        attrs: &Attributes,
        info: ElementTypeInfo,
    ) -> LoadResult<Frame> {
        match (info, self.base) {
            (ElementTypeInfo::Class(class), BaseContext::Roots | BaseContext::Field { .. }) => {
                self.next_object(class, name)
            }
            (ElementTypeInfo::Field(field), BaseContext::Field { field: base, .. })
                if base.id == field.id =>
            {
                Ok(Frame::Wrapper)
            }
            (ElementTypeInfo::Field(field), BaseContext::Object { owner, class }) => {
                Ok(Self::field_frame(owner, class, field, true))
            }
            (ElementTypeInfo::Custom, BaseContext::Object { owner, class }) => {
                Ok(match self.custom_field(class, attrs) {
                    Some(field) => Self::field_frame(owner, class, field, true),
                    None => Frame::Skip,
                })
            }
            _ => Ok(Frame::Skip),
        }
    }

    fn start_in_field(
        &mut self,
        name: &str,
        attrs: &Attributes,
        info: ElementTypeInfo,
    ) -> LoadResult<Frame> {
        let Some(Frame::Field {
            owner,
            owner_class,
            field,
            live,
            ..
        }) = self.stack.last()
        else {
            return Ok(Frame::Skip);
        };
        let (owner, owner_class, field, live) = (*owner, *owner_class, *field, *live);

        match info {
            ElementTypeInfo::Class(class) if field.is_owning() => self.next_object(class, name),
            ElementTypeInfo::Basic(BasicTag::Link) => {
                if !field.is_reference() {
                    self.session.diag.data_quality(
                        "link-outside-reference",
                        format!(
                            "<Link> in {} of {owner}, which is not a reference field",
                            self.session.schema.field_name(field.id)
                        ),
                    );
                    return Ok(Frame::Skip);
                }
                let explicit = explicit_ord(attrs)?;
                let target = if live {
                    self.resolve_link(LinkSite {
                        owner,
                        owner_class,
                        field,
                    }, attrs)?
                } else {
                    LinkTarget::Unresolved
                };
                if let Some(Frame::Field { links, .. }) = self.stack.last_mut() {
                    links.push(PendingLink { target, explicit });
                }
                Ok(Frame::Skip)
            }
            ElementTypeInfo::Basic(tag) => match tag.basic_type() {
                Some(basic) if field.basic() == Some(basic) => {
                    let ws = match (tag, attrs.non_empty("ws")) {
                        (BasicTag::AUni | BasicTag::AStr, Some(code)) if live => {
                            Some(self.session.ws_id(code)?)
                        }
                        _ => None,
                    };
                    Ok(Frame::Value(Box::new(ValueFrame {
                        tag,
                        owner,
                        field,
                        live,
                        ws,
                        val: attrs.get("val").map(str::to_string),
                        text: String::new(),
                        runs: Vec::new(),
                    })))
                }
                Some(basic) => {
                    self.session.diag.data_quality(
                        "value-type-mismatch",
                        format!(
                            "<{name}> ({}) in {} of {owner}, which holds {}; skipped",
                            basic.keyword(),
                            self.session.schema.field_name(field.id),
                            field
                                .basic()
                                .map(BasicType::keyword)
                                .unwrap_or("objects")
                        ),
                    );
                    Ok(Frame::Skip)
                }
                None => Ok(Frame::Skip),
            },
            _ => Ok(Frame::Skip),
        }
    }

    fn resolve_link(&mut self, site: LinkSite, attrs: &Attributes) -> LoadResult<LinkTarget> {
        match attrs.non_empty("target") {
            Some(raw) => match self.session.identity.lookup_target(raw, &*self.session.store) {
                Some(id) => Ok(LinkTarget::Resolved(id)),
                None => {
                    self.session.diag.unresolved(
                        "missing-target",
                        format!(
                            "<Link target=\"{raw}\"> in {} of {}: no such object",
                            self.session.schema.field_name(site.field.id),
                            site.owner
                        ),
                    );
                    Ok(LinkTarget::Unresolved)
                }
            },
            None => implicit::resolve_link(self.session, site, attrs),
        }
    }

    /// Write the collected links of a reference field with their final ords.
    fn finish_links(
        &mut self,
        owner: ObjectId,
        field: FieldInfo,
        links: Vec<PendingLink>,
    ) -> LoadResult<()> {
        if links.is_empty() {
            return Ok(());
        }
        let field_label = || self.session.schema.field_name(field.id);
        let explicit: Vec<Option<u32>> = links.iter().map(|l| l.explicit).collect();
        let ranks = rank_explicit(&explicit).map_err(|e| match e {
            OrderError::Mixed => LoadError::MixedSequenceOrder {
                field: field_label(),
            },
            OrderError::Duplicate(ord) => LoadError::DuplicateOrder {
                field: field_label(),
                ord,
            },
        })?;

        let offset = if field.is_sequence()
            && self.session.is_preexisting(owner)
            && !self.session.update_mode
        {
            self.session
                .store
                .references(owner, field.id)
                .iter()
                .filter_map(|r| r.ord)
                .max()
                .unwrap_or(0)
        } else {
            0
        };

        let mut ordered: Vec<(usize, LinkTarget)> = ranks
            .into_iter()
            .zip(links)
            .map(|(rank, link)| (rank, link.target))
            .collect();
        ordered.sort_by_key(|(rank, _)| *rank);

        for (rank, target) in ordered {
            let ord = field.is_sequence().then(|| offset + rank as u32 + 1);
            match target {
                LinkTarget::Resolved(id) => self.session.put_reference(field, owner, id, ord)?,
                LinkTarget::Deferred(index) => {
                    if let Some(deferred) = self.session.implicit.deferred.get_mut(index) {
                        deferred.ord = ord;
                    }
                }
                LinkTarget::Unresolved => {}
            }
        }
        Ok(())
    }

    fn finish_value(&mut self, value: ValueFrame) -> LoadResult<()> {
        if !value.live {
            return Ok(());
        }
        let ValueFrame {
            tag,
            owner,
            field,
            ws,
            val,
            text,
            mut runs,
            ..
        } = value;
        let site = || format!("{} of {owner}", self.session.schema.field_name(field.id));

        if tag.is_attribute_valued() {
            let raw = val.unwrap_or_else(|| text.trim().to_string());
            return match parse_scalar(tag, &raw) {
                Some(scalar) => self.session.put_scalar(owner, field, scalar),
                None => {
                    let message = format!("invalid <{tag:?} val=\"{raw}\"> in {}; skipped", site());
                    self.session.diag.data_quality("invalid-value", message);
                    Ok(())
                }
            };
        }

        match tag {
            BasicTag::Binary => match decode_hex(&text) {
                Some(bytes) => self.session.put_scalar(owner, field, ScalarValue::Binary(bytes)),
                None => {
                    let message = format!("invalid hex in <Binary> of {}; skipped", site());
                    self.session.diag.data_quality("invalid-value", message);
                    Ok(())
                }
            },
            BasicTag::Uni => self.session.put_scalar(owner, field, ScalarValue::Text(text)),
            BasicTag::Str => {
                if runs.is_empty() && !text.trim().is_empty() {
                    runs.push(Run::plain(None, text));
                }
                let (text, fmt) = encode_runs(&runs)?;
                self.session
                    .put_scalar(owner, field, ScalarValue::Formatted { text, fmt })
            }
            BasicTag::AUni => {
                let ws = self.value_ws(ws, None, &site())?;
                self.session.put_multi(owner, field, ws, text, None)
            }
            BasicTag::AStr => {
                if runs.is_empty() && !text.trim().is_empty() {
                    runs.push(Run::plain(ws, text));
                }
                let ws = self.value_ws(ws, runs.iter().find_map(|r| r.ws), &site())?;
                let (text, fmt) = encode_runs(&runs)?;
                self.session.put_multi(owner, field, ws, text, Some(fmt))
            }
            _ => Ok(()),
        }
    }

    /// Writing system of a multilingual value: the `ws` attribute, the first
    /// run's writing system, or the default analysis one.
    fn value_ws(
        &mut self,
        ws: Option<WsId>,
        from_runs: Option<WsId>,
        site: &str,
    ) -> LoadResult<WsId> {
        if let Some(ws) = ws.or(from_runs) {
            return Ok(ws);
        }
        self.session.diag.data_quality(
            "missing-ws",
            format!(
                "multilingual value in {site} has no writing system; using `{}`",
                self.session.config.default_analysis_ws
            ),
        );
        self.session.default_analysis_ws()
    }
}

impl TokenSink for Pass2<'_, '_> {
    fn start_element(&mut self, name: &str, attrs: &Attributes) -> LoadResult<()> {
        let info = self.session.classify(name);
        let frame = match self.stack.last() {
            None => match info {
                ElementTypeInfo::Malformed => Frame::Wrapper,
                _ => self.start_top_level(name, attrs, info)?,
            },
            Some(Frame::Wrapper) => self.start_top_level(name, attrs, info)?,
            Some(Frame::Object { id, class, live }) => {
                let (id, class, live) = (*id, *class, *live);
                match info {
                    ElementTypeInfo::Field(field) => Self::field_frame(id, class, field, live),
                    ElementTypeInfo::Custom => match self.custom_field(class, attrs) {
                        Some(field) => Self::field_frame(id, class, field, live),
                        None => Frame::Skip,
                    },
                    ElementTypeInfo::Virtual(kind) => Frame::Virtual {
                        owner: id,
                        kind,
                        live,
                    },
                    _ => Frame::Skip,
                }
            }
            Some(Frame::Field { .. }) => self.start_in_field(name, attrs, info)?,
            Some(Frame::Value(value)) => {
                let live = value.live;
                match info {
                    ElementTypeInfo::Basic(BasicTag::Run) => {
                        let ws = match attrs.non_empty("ws") {
                            Some(code) if live => Some(self.session.ws_id(code)?),
                            _ => None,
                        };
                        let props = attrs
                            .iter()
                            .filter(|(k, _)| *k != "ws")
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect();
                        Frame::Run(Run {
                            ws,
                            text: String::new(),
                            props,
                        })
                    }
                    _ => Frame::Skip,
                }
            }
            Some(Frame::Virtual { owner, kind, live }) => {
                let (owner, kind, live) = (*owner, *kind, *live);
                if info == ElementTypeInfo::Basic(BasicTag::Link) && live {
                    lexrel::record_relation(self.session, owner, kind, attrs)?;
                }
                Frame::Skip
            }
            Some(Frame::Run(_)) | Some(Frame::Skip) => Frame::Skip,
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
                owner, field, links, ..
            } => self.finish_links(owner, field, links)?,
            Frame::Value(value) => self.finish_value(*value)?,
            Frame::Run(run) => {
                if let Some(Frame::Value(value)) = self.stack.last_mut() {
                    value.runs.push(run);
                }
            }
            Frame::Wrapper | Frame::Object { .. } | Frame::Virtual { .. } | Frame::Skip => {}
        }
        Ok(())
    }

    fn character_data(&mut self, text: &str) -> LoadResult<()> {
        match self.stack.last_mut() {
            Some(Frame::Value(value)) => value.text.push_str(text),
            Some(Frame::Run(run)) => run.text.push_str(text),
            _ => {}
        }
        Ok(())
    }
}

// ============================================================================
// Value conversion
// ============================================================================

fn parse_scalar(tag: BasicTag, raw: &str) -> Option<ScalarValue> {
    let raw = raw.trim();
    match tag {
        BasicTag::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(ScalarValue::Boolean(true)),
            "false" | "0" | "no" => Some(ScalarValue::Boolean(false)),
            _ => None,
        },
        BasicTag::Integer => raw.parse().ok().map(ScalarValue::Integer),
        BasicTag::GenDate => raw.parse().ok().map(ScalarValue::GenDate),
        BasicTag::Float => raw.parse().ok().map(ScalarValue::Float),
        BasicTag::Numeric => raw
            .parse::<f64>()
            .ok()
            .map(|_| ScalarValue::Numeric(raw.to_string())),
        BasicTag::Time => parse_time(raw).map(ScalarValue::Time),
        BasicTag::Guid => match parse_object_id(raw) {
            ParsedId::Guid(guid) => Some(ScalarValue::Guid(guid)),
            ParsedId::Name(_) => None,
        },
        _ => None,
    }
}

/// `YYYY-MM-DD HH:MM:SS[.fff]`, also with a `T` separator.
pub(crate) fn parse_time(raw: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|pattern| NaiveDateTime::parse_from_str(raw, pattern).ok())
}

pub(crate) fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}
