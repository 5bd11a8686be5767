//! Resource names.
//!
//! A [`Urn`] has the shape
//!
//! ```text
//! urn:converge:<stack>::<project>::<qualified type>::<name>
//! ```
//!
//! where the qualified type is the chain of parent types followed by the
//! resource's own type, joined by `$`.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

const PREFIX: &str = "urn:converge:";
const SEPARATOR: &str = "::";
const TYPE_DELIMITER: char = '$';
const TYPE_DELIMITER_STR: &str = "$";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrnError {
    #[error("URN must start with `urn:converge:`: {0}")]
    MissingPrefix(String),
    #[error("URN must have exactly four `::`-separated parts: {0}")]
    WrongShape(String),
    #[error("URN component must not be empty: {0}")]
    EmptyComponent(String),
    #[error("resource {0} must not be empty")]
    EmptyPart(&'static str),
    #[error("resource {part} {value:?} must not contain `{reserved}`")]
    ReservedText {
        part: &'static str,
        value: String,
        reserved: &'static str,
    },
}

fn check_part(part: &'static str, value: &str, reserved: &[&'static str]) -> Result<(), UrnError> {
    if value.is_empty() {
        return Err(UrnError::EmptyPart(part));
    }
    match reserved.iter().copied().find(|r| value.contains(r)) {
        Some(reserved) => Err(UrnError::ReservedText {
            part,
            value: value.to_string(),
            reserved,
        }),
        None => Ok(()),
    }
}

/// The stack and project a deployment belongs to. Together they scope every
/// URN in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StackRef {
    pub project: String,
    pub stack: String,
}
impl StackRef {
    pub fn new(project: impl Into<String>, stack: impl Into<String>) -> Self {
        StackRef {
            project: project.into(),
            stack: stack.into(),
        }
    }
}
impl Display for StackRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project, self.stack)
    }
}

/// Globally unique, hierarchical resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn(String);

impl Urn {
    /// Derive the URN of a resource. Deterministic in all arguments.
    pub fn new(stack: &StackRef, parent: Option<&Urn>, type_: &str, name: &str) -> Urn {
        let qualified_type = match parent {
            Some(parent) => format!("{}{}{}", parent.qualified_type(), TYPE_DELIMITER, type_),
            None => type_.to_string(),
        };
        Urn(format!(
            "{PREFIX}{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            stack.stack, stack.project, qualified_type, name
        ))
    }

    /// Like [`Urn::new`], but rejects components that would not parse back
    /// into the same parts.
    pub fn try_new(
        stack: &StackRef,
        parent: Option<&Urn>,
        type_: &str,
        name: &str,
    ) -> Result<Urn, UrnError> {
        check_part("stack", &stack.stack, &[SEPARATOR])?;
        check_part("project", &stack.project, &[SEPARATOR])?;
        check_part("type", type_, &[SEPARATOR, TYPE_DELIMITER_STR])?;
        check_part("name", name, &[])?;
        let urn = Urn::new(stack, parent, type_, name);
        urn.as_str().parse()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> Vec<&str> {
        // Validated on construction
        self.0[PREFIX.len()..].splitn(4, SEPARATOR).collect()
    }

    pub fn stack(&self) -> &str {
        self.parts()[0]
    }

    pub fn project(&self) -> &str {
        self.parts()[1]
    }

    /// The parent type chain and the resource type, joined by `$`.
    pub fn qualified_type(&self) -> &str {
        self.parts()[2]
    }

    /// The resource type, without the parent chain.
    pub fn type_(&self) -> &str {
        let qualified = self.qualified_type();
        match qualified.rfind(TYPE_DELIMITER) {
            Some(i) => &qualified[i + 1..],
            None => qualified,
        }
    }

    /// The logical name.
    pub fn name(&self) -> &str {
        self.parts()[3]
    }

    pub fn is_urn(s: &str) -> bool {
        Urn::from_str(s).is_ok()
    }
}

impl FromStr for Urn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| UrnError::MissingPrefix(s.to_string()))?;
        let parts: Vec<&str> = rest.splitn(4, SEPARATOR).collect();
        if parts.len() != 4 {
            return Err(UrnError::WrongShape(s.to_string()));
        }
        // The name may contain `::`, the other components may not
        if parts[..3].iter().any(|p| p.is_empty()) || parts[3].is_empty() {
            return Err(UrnError::EmptyComponent(s.to_string()));
        }
        Ok(Urn(s.to_string()))
    }
}

impl TryFrom<String> for Urn {
    type Error = UrnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Urn> for String {
    fn from(value: Urn) -> Self {
        value.0
    }
}

impl Display for Urn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
