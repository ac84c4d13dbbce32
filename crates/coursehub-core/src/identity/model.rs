//! Subject identity domain model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Course role of a subject.
///
/// Roles are per course, so the same user may be an instructor in one course
/// and a learner in another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Instructor,
    Learner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instructor => "Instructor",
            Self::Learner => "Learner",
        }
    }

    /// Derives the role from an LMS role list such as `"Instructor,Learner"`.
    ///
    /// A subject is an instructor only when the list names `Instructor` and
    /// does not also name `Learner`.
    pub fn from_lms_roles(roles: &str) -> Self {
        let mut instructor = false;
        let mut learner = false;
        for role in roles.split(',').map(str::trim) {
            match role {
                "Instructor" => instructor = true,
                "Learner" => learner = true,
                _ => {}
            }
        }

        if instructor && !learner {
            Self::Instructor
        } else {
            Self::Learner
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "instructor" | "teacher" => Ok(Self::Instructor),
            "learner" | "student" => Ok(Self::Learner),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// A user identity as resolved against the directory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub username: String,
    /// `None` when the directory record carries no usable numeric id.
    pub numeric_id: Option<u32>,
    /// Group id derived from the role the subject was last resolved with.
    pub group_id: Option<u32>,
    pub role: Role,
    pub home_directory: PathBuf,
}

impl Subject {
    /// Numeric id usable as a file owner: resolved and greater than zero.
    pub fn owner_id(&self) -> Option<u32> {
        self.numeric_id.filter(|id| *id > 0)
    }
}

/// Raw directory-service entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub dn: String,
    #[serde(default)]
    pub object_classes: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// First value of an attribute, if any.
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.attributes
            .get(attribute)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// First value of an attribute parsed as an integer.
    pub fn first_int(&self, attribute: &str) -> Option<i64> {
        self.first(attribute).and_then(|v| v.trim().parse().ok())
    }
}

/// A single change in a directory `modify` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeChange {
    Replace { attribute: String, values: Vec<String> },
    Delete { attribute: String },
}

impl AttributeChange {
    pub fn replace(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Replace {
            attribute: attribute.into(),
            values: vec![value.into()],
        }
    }
}
