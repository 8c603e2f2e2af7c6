use crate::error::IdeError;

/// Identity of one IDE session, derived per request and recovered from
/// container names during listing. Never persisted anywhere else.
///
/// A present `teacher_id` marks a read-only teacher view of the student's
/// workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    pub lab_id: u64,
    pub student_id: u64,
    pub teacher_id: Option<u64>,
}

impl SessionIdentity {
    pub fn for_student(lab_id: u64, student_id: u64) -> Self {
        SessionIdentity {
            lab_id,
            student_id,
            teacher_id: None,
        }
    }

    pub fn for_teacher(lab_id: u64, student_id: u64, teacher_id: u64) -> Self {
        SessionIdentity {
            lab_id,
            student_id,
            teacher_id: Some(teacher_id),
        }
    }

    pub fn is_teacher_view(&self) -> bool {
        self.teacher_id.is_some()
    }

    /// Encodes the identity into the container name the runtime knows it by:
    /// `<prefix>-<lab>-<student>` or `<prefix>-<lab>-<student>-<teacher>`.
    pub fn container_name(&self, prefix: &str) -> String {
        match self.teacher_id {
            None => format!("{prefix}-{}-{}", self.lab_id, self.student_id),
            Some(teacher_id) => {
                format!("{prefix}-{}-{}-{}", self.lab_id, self.student_id, teacher_id)
            }
        }
    }

    /// Exact inverse of [`container_name`](Self::container_name). Exactly 2
    /// or 3 numeric segments may follow the prefix; any other shape fails.
    pub fn from_container_name(prefix: &str, name: &str) -> Result<Self, IdeError> {
        let rest = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .ok_or_else(|| IdeError::InvalidName(name.to_string()))?;

        let segments: Vec<&str> = rest.split('-').collect();
        let ids = segments
            .iter()
            .map(|segment| segment.parse::<u64>())
            .collect::<Result<Vec<u64>, _>>()
            .map_err(|_| IdeError::InvalidName(name.to_string()))?;

        match ids[..] {
            [lab_id, student_id] => Ok(SessionIdentity::for_student(lab_id, student_id)),
            [lab_id, student_id, teacher_id] => {
                Ok(SessionIdentity::for_teacher(lab_id, student_id, teacher_id))
            }
            _ => Err(IdeError::InvalidName(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "mytheia";

    #[test]
    fn encodes_student_name() {
        let identity = SessionIdentity::for_student(5, 9);
        assert_eq!(identity.container_name(PREFIX), "mytheia-5-9");
    }

    #[test]
    fn decodes_student_name() {
        let identity = SessionIdentity::from_container_name(PREFIX, "mytheia-5-9").unwrap();
        assert_eq!(identity, SessionIdentity::for_student(5, 9));
        assert!(!identity.is_teacher_view());
    }

    #[test]
    fn round_trips_all_shapes() {
        let identities = [
            SessionIdentity::for_student(1, 2),
            SessionIdentity::for_student(u64::MAX, 0),
            SessionIdentity::for_teacher(3, 4, 5),
            SessionIdentity::for_teacher(0, u64::MAX, 1),
        ];
        for identity in identities {
            let name = identity.container_name(PREFIX);
            assert_eq!(
                SessionIdentity::from_container_name(PREFIX, &name).unwrap(),
                identity
            );
        }
    }

    #[test]
    fn rejects_wrong_segment_counts() {
        for name in [
            "mytheia",
            "mytheia-",
            "mytheia-1",
            "mytheia-1-2-3-4",
            "mytheia-1-2-3-4-5",
        ] {
            assert!(matches!(
                SessionIdentity::from_container_name(PREFIX, name),
                Err(IdeError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn rejects_non_numeric_segments() {
        for name in ["mytheia-a-2", "mytheia-1-b", "mytheia-1-2-c", "mytheia--2"] {
            assert!(matches!(
                SessionIdentity::from_container_name(PREFIX, name),
                Err(IdeError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn rejects_foreign_prefix() {
        for name in ["nginx", "theia-1-2", "mytheia1-2"] {
            assert!(matches!(
                SessionIdentity::from_container_name(PREFIX, name),
                Err(IdeError::InvalidName(_))
            ));
        }
    }
}
