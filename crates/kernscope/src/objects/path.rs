//! Field paths used by layouts to name data inside nested structures.
//!
//! - `a.b` walks into the embedded member `a`, then reads `b`
//! - `a->b` reads pointer `a`, then reads `b` in the pointed-to object
//! - `a->(T)b` does the same but reads the target as type `T`
//!
//! Dereferences are always spelled out; nothing is followed implicitly.

use crate::objects::error::{ObjectError, ObjectResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A field of the current object.
    Member(String),
    /// Dereference the previous step's pointer, optionally recast, then
    /// take `field` of the target.
    Deref { cast: Option<String>, field: String },
}

impl Step {
    pub fn field(&self) -> &str {
        match self {
            Step::Member(f) => f,
            Step::Deref { field, .. } => field,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    raw: String,
    steps: Vec<Step>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> ObjectResult<Self> {
        let invalid = |msg: &str| ObjectError::InvalidPath {
            path: raw.to_string(),
            msg: msg.to_string(),
        };

        let mut steps = Vec::new();
        let mut rest = raw.trim();
        let mut deref = false;

        loop {
            let mut cast = None;
            if deref && rest.starts_with('(') {
                let close = rest.find(')').ok_or_else(|| invalid("unclosed cast"))?;
                let type_name = rest[1..close].trim();
                if type_name.is_empty() {
                    return Err(invalid("empty cast"));
                }
                cast = Some(type_name.to_string());
                rest = &rest[close + 1..];
            }

            let end = rest
                .find(|c: char| c == '.' || c == '-')
                .unwrap_or(rest.len());
            let name = &rest[..end];
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(invalid("expected a field name"));
            }
            steps.push(if deref {
                Step::Deref {
                    cast,
                    field: name.to_string(),
                }
            } else {
                Step::Member(name.to_string())
            });

            let tail = &rest[end..];
            if tail.is_empty() {
                break;
            } else if let Some(next) = tail.strip_prefix("->") {
                deref = true;
                rest = next;
            } else if let Some(next) = tail.strip_prefix('.') {
                deref = false;
                rest = next;
            } else {
                return Err(invalid("expected '.' or '->'"));
            }
        }

        Ok(FieldPath {
            raw: raw.trim().to_string(),
            steps,
        })
    }

    /// A single-member path.
    pub fn member(field: &str) -> Self {
        FieldPath {
            raw: field.to_string(),
            steps: vec![Step::Member(field.to_string())],
        }
    }

    /// Extend with `.field`.
    pub fn then(mut self, field: &str) -> Self {
        self.raw = format!("{}.{}", self.raw, field);
        self.steps.push(Step::Member(field.to_string()));
        self
    }

    /// Extend with `->field` or `->(cast)field`.
    pub fn then_deref(mut self, cast: Option<&str>, field: &str) -> Self {
        self.raw = match cast {
            Some(t) => format!("{}->({}){}", self.raw, t, field),
            None => format!("{}->{}", self.raw, field),
        };
        self.steps.push(Step::Deref {
            cast: cast.map(str::to_string),
            field: field.to_string(),
        });
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True for a single member with no nesting.
    pub fn is_simple(&self) -> bool {
        self.steps.len() == 1
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for FieldPath {
    type Err = ObjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldPath::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = ObjectError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        FieldPath::parse(&s)
    }
}

impl From<FieldPath> for String {
    fn from(p: FieldPath) -> String {
        p.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let p = FieldPath::parse("UniqueProcessId").unwrap();
        assert!(p.is_simple());

        let p = FieldPath::parse("Pcb.DirectoryTableBase").unwrap();
        assert_eq!(
            p.steps(),
            &[
                Step::Member("Pcb".into()),
                Step::Member("DirectoryTableBase".into())
            ]
        );

        let p = FieldPath::parse("Session->(_MM_SESSION_SPACE)SessionId").unwrap();
        assert_eq!(
            p.steps(),
            &[
                Step::Member("Session".into()),
                Step::Deref {
                    cast: Some("_MM_SESSION_SPACE".into()),
                    field: "SessionId".into()
                }
            ]
        );

        let p = FieldPath::parse("vm_file->f_path.dentry->d_name.name").unwrap();
        assert_eq!(p.steps().len(), 5);
        assert_eq!(p.steps()[4], Step::Member("name".into()));
        assert_eq!(p.to_string(), "vm_file->f_path.dentry->d_name.name");
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "a.", "a->", "->a", "a->(T", "a->()b", "a-b", "a..b", "a b"] {
            assert!(
                matches!(FieldPath::parse(bad), Err(ObjectError::InvalidPath { .. })),
                "accepted {:?}",
                bad
            );
        }
        // Casts are only allowed right after a dereference.
        assert!(FieldPath::parse("(T)a").is_err());
    }

    #[test]
    fn test_builder_matches_parser() {
        let built = FieldPath::member("vm_file")
            .then("f_path")
            .then_deref(None, "dentry")
            .then_deref(Some("dentry"), "d_name");
        let parsed = FieldPath::parse("vm_file.f_path->dentry->(dentry)d_name").unwrap();
        assert_eq!(built, parsed);
    }

    #[test]
    fn test_serde_as_string() {
        let p: FieldPath = serde_json::from_str("\"mm->pgd\"").unwrap();
        assert_eq!(p.steps().len(), 2);
        assert_eq!(serde_json::to_string(&p).unwrap(), "\"mm->pgd\"");
        assert!(serde_json::from_str::<FieldPath>("\"mm->\"").is_err());
    }
}
