//! TaskCodec - TaskEnvelope と保存用バイト列の相互変換
//!
//! store はタスク本体をこの形式で保持する（in-memory 実装も同じ経路を通る）。
//! 形式は JSON:
//!
//! ```json
//! {"id":"01H...","created_at":1700000000000,"attempts":0,"max_attempts":5,
//!  "payload":{"app_token":"...","table_id":"...","record_id":"...",
//!             "user_id":"...","like_flag":"resolved","action":"add"}}
//! ```

use crate::domain::TaskEnvelope;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode task: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode task: {0}")]
    Decode(#[source] serde_json::Error),
}

pub struct TaskCodec;

impl TaskCodec {
    pub fn encode(task: &TaskEnvelope) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(task).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<TaskEnvelope, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LikeAction, LikeFlag, LikePayload, TableRef, TaskId};
    use ulid::Ulid;

    fn sample() -> TaskEnvelope {
        TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            1_700_000_000_000,
            5,
            LikePayload {
                table: TableRef::new("bascnApp", "tblLikes"),
                record_id: "recA".into(),
                user_id: "ou_1".into(),
                like_flag: LikeFlag::Unresolved,
                action: LikeAction::Remove,
            },
        )
    }

    #[test]
    fn wire_form_is_flat_json() {
        let task = sample();
        let bytes = TaskCodec::encode(&task).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["id"], task.id.to_key());
        assert_eq!(value["created_at"], 1_700_000_000_000_i64);
        assert_eq!(value["attempts"], 0);
        assert_eq!(value["max_attempts"], 5);
        assert_eq!(value["payload"]["app_token"], "bascnApp");
        assert_eq!(value["payload"]["table_id"], "tblLikes");
        assert_eq!(value["payload"]["like_flag"], "unresolved");
        assert_eq!(value["payload"]["action"], "remove");

        assert_eq!(TaskCodec::decode(&bytes).unwrap(), task);
    }

    #[test]
    fn decode_rejects_malformed_bodies() {
        assert!(matches!(
            TaskCodec::decode(b"{not json"),
            Err(CodecError::Decode(_))
        ));

        let unknown_flag = br#"{"id":"01HZZZZZZZZZZZZZZZZZZZZZZZ","created_at":0,"attempts":0,
            "max_attempts":5,"payload":{"app_token":"a","table_id":"t","record_id":"r",
            "user_id":"u","like_flag":"meh","action":"add"}}"#;
        assert!(TaskCodec::decode(unknown_flag).is_err());
    }
}
