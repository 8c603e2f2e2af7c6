use prost::Message;

use crate::error::IdeError;
use crate::models::session_models::SessionIdentity;

/// Key prefix for student heartbeat records (`hbs:<lab>:<student>`).
pub const STUDENT_KEY_PREFIX: &str = "hbs:";
/// Key prefix for teacher presence keys (`hbt:<lab>:<student>:<teacher>`).
pub const TEACHER_KEY_PREFIX: &str = "hbt:";

/// Body stored for teacher presence keys. Carries no information; the key's
/// TTL is the whole record.
pub const TEACHER_PRESENCE_BODY: &[u8] = b"0";

/// Binary heartbeat record for a student session. No TTL; the sweeper owns
/// its lifetime based on `last_visited_at` age.
#[derive(Clone, PartialEq, Message)]
pub struct HeartbeatStat {
    #[prost(int64, tag = "1")]
    pub created_at: i64,
    #[prost(int64, tag = "2")]
    pub last_visited_at: i64,
}

impl HeartbeatStat {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdeError> {
        HeartbeatStat::decode(bytes)
            .map_err(|err| IdeError::Internal(format!("decode heartbeat record failed: {err}")))
    }
}

pub fn store_key(identity: &SessionIdentity) -> String {
    match identity.teacher_id {
        None => format!(
            "{STUDENT_KEY_PREFIX}{}:{}",
            identity.lab_id, identity.student_id
        ),
        Some(teacher_id) => format!(
            "{TEACHER_KEY_PREFIX}{}:{}:{}",
            identity.lab_id, identity.student_id, teacher_id
        ),
    }
}
