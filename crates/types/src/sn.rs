use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use utoipa::ToSchema;

use crate::{ClassId, GradeId, SubjectId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnParseError {
    #[error("SN `{0}` must have exactly three `_`-separated parts")]
    Shape(String),
    #[error("SN `{input}` has non-integer part `{part}`")]
    Integer { input: String, part: String },
}

/// The (subject, grade, class) identifier of one teaching unit.
/// Canonical string form is `subject_grade_class`, e.g. `3_5_2`.
#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, ToSchema, JsonSchema, Eq, PartialEq, Hash,
    PartialOrd, Ord,
)]
#[serde(try_from = "String", into = "String")]
pub struct ClassSn {
    pub subject: SubjectId,
    pub grade: GradeId,
    pub class: ClassId,
}

impl ClassSn {
    pub fn new(subject: SubjectId, grade: GradeId, class: ClassId) -> Self {
        Self {
            subject,
            grade,
            class,
        }
    }

    pub fn class_key(&self) -> (GradeId, ClassId) {
        (self.grade, self.class)
    }
}

impl fmt::Display for ClassSn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.subject.0, self.grade.0, self.class.0)
    }
}

impl FromStr for ClassSn {
    type Err = SnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() != 3 {
            return Err(SnParseError::Shape(s.to_string()));
        }
        let mut nums = [0u16; 3];
        for (i, p) in parts.iter().enumerate() {
            nums[i] = p.parse::<u16>().map_err(|_| SnParseError::Integer {
                input: s.to_string(),
                part: p.to_string(),
            })?;
        }
        Ok(ClassSn {
            subject: SubjectId(nums[0]),
            grade: GradeId(nums[1]),
            class: ClassId(nums[2]),
        })
    }
}

impl TryFrom<String> for ClassSn {
    type Error = SnParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ClassSn> for String {
    fn from(sn: ClassSn) -> String {
        sn.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_canonical() {
        let sn: ClassSn = "3_5_2".parse().unwrap();
        assert_eq!(sn, ClassSn::new(SubjectId(3), GradeId(5), ClassId(2)));
        assert_eq!(sn.to_string(), "3_5_2");
    }

    #[test]
    fn rejects_wrong_shape() {
        assert!(matches!(
            "3_5".parse::<ClassSn>(),
            Err(SnParseError::Shape(_))
        ));
        assert!(matches!(
            "3_5_2_1".parse::<ClassSn>(),
            Err(SnParseError::Shape(_))
        ));
        assert!(matches!("".parse::<ClassSn>(), Err(SnParseError::Shape(_))));
    }

    #[test]
    fn rejects_non_integer_parts() {
        assert!(matches!(
            "a_5_2".parse::<ClassSn>(),
            Err(SnParseError::Integer { .. })
        ));
        assert!(matches!(
            "3_5_x".parse::<ClassSn>(),
            Err(SnParseError::Integer { .. })
        ));
        assert!(matches!(
            "3_-5_2".parse::<ClassSn>(),
            Err(SnParseError::Integer { .. })
        ));
    }

    proptest! {
        #[test]
        fn roundtrip(subject in 0u16..=u16::MAX, grade in 0u16..=u16::MAX, class in 0u16..=u16::MAX) {
            let sn = ClassSn::new(SubjectId(subject), GradeId(grade), ClassId(class));
            let parsed: ClassSn = sn.to_string().parse().unwrap();
            prop_assert_eq!(parsed, sn);
        }
    }

    #[test]
    fn serde_uses_canonical_string() {
        let sn = ClassSn::new(SubjectId(1), GradeId(2), ClassId(3));
        let json = serde_json::to_string(&sn).unwrap();
        assert_eq!(json, "\"1_2_3\"");
        let back: ClassSn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sn);
    }
}
