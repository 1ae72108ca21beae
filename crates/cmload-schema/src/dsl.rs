//! `.cms` schema dialect
//!
//! A small line-oriented syntax for class/field tables:
//!
//! ```text
//! # comment
//! class LexEntry = 5002 : CmObject
//!   field CitationForm = 5002001 multiunicode
//!   field Senses = 5002004 owning sequence LexSense
//!   field PartOfSpeech = 5002010 reference atomic PartOfSpeech list LangProject.PartsOfSpeech
//! ```
//!
//! Every `field` line belongs to the closest preceding `class` line. Class
//! names are resolved by the catalog after the whole text is read.

use crate::catalog::{BasicType, Cardinality, ListRootPath};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char as pchar, digit1, multispace0, multispace1},
    combinator::{all_consuming, map_opt, map_res, opt, recognize},
    sequence::{pair, preceded, tuple},
    IResult,
};
use thiserror::Error;

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaDoc {
    pub classes: Vec<ClassDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDecl {
    pub name: String,
    pub id: u32,
    pub base: Option<String>,
    pub is_abstract: bool,
    pub fields: Vec<FieldDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    pub name: String,
    pub id: u32,
    pub kind: FieldKindDecl,
    pub list_root: Option<ListRootPath>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKindDecl {
    Basic(BasicType),
    Owning(Cardinality, String),
    Reference(Cardinality, String),
}

// ============================================================================
// Parser
// ============================================================================

#[derive(Debug, Error)]
pub enum SchemaParseError {
    #[error("parse error on line {line}: {message}")]
    Line { line: usize, message: String },
}

pub fn parse_schema(text: &str) -> Result<SchemaDoc, SchemaParseError> {
    let mut doc = SchemaDoc::default();

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("class ") {
            let (_, class) = all_consuming(class_line)(line).map_err(|e| {
                SchemaParseError::Line {
                    line: line_no,
                    message: format!("malformed class declaration `{line}`: {e}"),
                }
            })?;
            doc.classes.push(class);
            continue;
        }

        if line.starts_with("field ") {
            let (_, field) = all_consuming(field_line)(line).map_err(|e| {
                SchemaParseError::Line {
                    line: line_no,
                    message: format!("malformed field declaration `{line}`: {e}"),
                }
            })?;
            let Some(class) = doc.classes.last_mut() else {
                return Err(SchemaParseError::Line {
                    line: line_no,
                    message: "field declared before any class".to_string(),
                });
            };
            class.fields.push(field);
            continue;
        }

        return Err(SchemaParseError::Line {
            line: line_no,
            message: format!("unrecognized schema line: {line}"),
        });
    }

    Ok(doc)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    }
}

fn ident(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn number(input: &str) -> IResult<&str, u32> {
    map_res(digit1, str::parse::<u32>)(input)
}

fn equals(input: &str) -> IResult<&str, char> {
    preceded(multispace0, pchar('='))(input)
}

fn class_line(input: &str) -> IResult<&str, ClassDecl> {
    let (input, _) = tag("class")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, name) = ident(input)?;
    let (input, _) = equals(input)?;
    let (input, _) = multispace0(input)?;
    let (input, id) = number(input)?;
    let (input, base) = opt(preceded(
        tuple((multispace0, pchar(':'), multispace0)),
        ident,
    ))(input)?;
    let (input, is_abstract) = opt(preceded(multispace1, tag("abstract")))(input)?;
    let (input, _) = multispace0(input)?;
    Ok((
        input,
        ClassDecl {
            name: name.to_string(),
            id,
            base: base.map(str::to_string),
            is_abstract: is_abstract.is_some(),
            fields: vec![],
        },
    ))
}

fn cardinality(input: &str) -> IResult<&str, Cardinality> {
    map_opt(ident, Cardinality::from_keyword)(input)
}

fn object_kind(input: &str) -> IResult<&str, FieldKindDecl> {
    let (input, role) = alt((tag("owning"), tag("reference")))(input)?;
    let (input, _) = multispace1(input)?;
    let (input, card) = cardinality(input)?;
    let (input, _) = multispace1(input)?;
    let (input, target) = ident(input)?;
    let kind = if role == "owning" {
        FieldKindDecl::Owning(card, target.to_string())
    } else {
        FieldKindDecl::Reference(card, target.to_string())
    };
    Ok((input, kind))
}

fn basic_kind(input: &str) -> IResult<&str, FieldKindDecl> {
    map_opt(ident, |word| BasicType::from_keyword(word).map(FieldKindDecl::Basic))(input)
}

fn list_root(input: &str) -> IResult<&str, ListRootPath> {
    let (input, _) = multispace1(input)?;
    let (input, _) = tag("list")(input)?;
    let (input, _) = multispace1(input)?;
    map_opt(recognize(tuple((ident, pchar('.'), ident))), ListRootPath::parse)(input)
}

fn field_line(input: &str) -> IResult<&str, FieldDecl> {
    let (input, _) = tag("field")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, name) = ident(input)?;
    let (input, _) = equals(input)?;
    let (input, _) = multispace0(input)?;
    let (input, id) = number(input)?;
    let (input, _) = multispace1(input)?;
    let (input, kind) = alt((object_kind, basic_kind))(input)?;
    let (input, list_root) = opt(list_root)(input)?;
    let (input, _) = multispace0(input)?;
    Ok((
        input,
        FieldDecl {
            name: name.to_string(),
            id,
            kind,
            list_root,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_classes_and_fields() {
        let doc = parse_schema(
            r#"
            # widgets
            class CmObject = 0 abstract
            class Widget = 100 : CmObject   # trailing comment
              field Count = 100001 integer
              field Parts = 100002 owning sequence Part
              field Kind = 100003 reference atomic CmPossibility list LangProject.WidgetKinds
            "#,
        )
        .unwrap();

        assert_eq!(doc.classes.len(), 2);
        assert!(doc.classes[0].is_abstract);
        let widget = &doc.classes[1];
        assert_eq!(widget.base.as_deref(), Some("CmObject"));
        assert_eq!(widget.fields.len(), 3);
        assert_eq!(widget.fields[0].kind, FieldKindDecl::Basic(BasicType::Integer));
        assert_eq!(
            widget.fields[1].kind,
            FieldKindDecl::Owning(Cardinality::Sequence, "Part".to_string())
        );
        assert_eq!(
            widget.fields[2].list_root,
            Some(ListRootPath {
                owner_class: "LangProject".to_string(),
                field: "WidgetKinds".to_string()
            })
        );
    }

    #[test]
    fn reports_line_numbers() {
        let err = parse_schema("class A = 1\n  field X = 2 sometype\n").unwrap_err();
        let SchemaParseError::Line { line, .. } = err;
        assert_eq!(line, 2);
    }

    #[test]
    fn rejects_orphan_fields() {
        assert!(parse_schema("field X = 2 integer").is_err());
    }
}
