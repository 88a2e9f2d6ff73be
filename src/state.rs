use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DialogError;

/// Schema version written into every state handed to the caller.
pub const STATE_VERSION: u32 = 1;

/// Pipeline stage reported in results and dialog states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Asking,
    Final,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Asking => "asking",
            Stage::Final => "final",
        }
    }
}

/// A clarifying question with a per-position id (`q1`, `q2`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub text: String,
}

/// Reads `null` the same as a missing field.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl Question {
    /// Numbers `texts` as `q1..qN`, keeping at most `limit` of them.
    pub fn numbered<I, S>(texts: I, limit: usize) -> Vec<Question>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        texts
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, text)| Question {
                id: format!("q{}", i + 1),
                text: text.into(),
            })
            .collect()
    }

    fn is_complete(&self) -> bool {
        !self.id.is_empty() && !self.text.is_empty()
    }
}

/// A remembered question paired with the caller's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

/// State the caller stores between the two calls and sends back unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum DialogState {
    Asking(AskingState),
    Final {
        #[serde(default = "current_version")]
        version: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskingState {
    #[serde(default = "current_version")]
    pub version: u32,
    pub image_description: String,
    #[serde(default)]
    pub questions: Vec<Question>,
}

/// Caller-supplied state as received; `stage` and `version` may be omitted.
#[derive(Deserialize)]
struct IncomingAskingState {
    stage: Option<Stage>,
    #[serde(default = "current_version")]
    version: u32,
    image_description: String,
    #[serde(default)]
    questions: Vec<Question>,
}

fn current_version() -> u32 {
    STATE_VERSION
}

impl DialogState {
    pub fn asking(image_description: impl Into<String>, questions: Vec<Question>) -> Self {
        DialogState::Asking(AskingState {
            version: STATE_VERSION,
            image_description: image_description.into(),
            questions,
        })
    }

    pub fn finished() -> Self {
        DialogState::Final {
            version: STATE_VERSION,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            DialogState::Asking(_) => Stage::Asking,
            DialogState::Final { .. } => Stage::Final,
        }
    }
}

impl AskingState {
    /// Parses the serialized state sent back for `action=answer`.
    ///
    /// Blobs from a stage other than `asking`, or with an unknown version, are rejected.
    pub fn from_json(raw: &str) -> Result<Self, DialogError> {
        let incoming: IncomingAskingState = serde_json::from_str(raw)
            .map_err(|e| DialogError::invalid(format!("dialog_state is not a valid asking state: {e}")))?;

        if let Some(stage) = incoming.stage {
            if stage != Stage::Asking {
                return Err(DialogError::invalid(format!(
                    "dialog_state is in stage `{}`, expected `asking`",
                    stage.as_str()
                )));
            }
        }
        if incoming.version != STATE_VERSION {
            return Err(DialogError::invalid(format!(
                "unsupported dialog_state version {}",
                incoming.version
            )));
        }

        Ok(AskingState {
            version: incoming.version,
            image_description: incoming.image_description,
            questions: incoming.questions,
        })
    }

    /// Pairs each remembered question with its answer, in the original order.
    ///
    /// Missing answers become empty strings; questions without an id or text are dropped.
    pub fn qa_pairs<F>(&self, mut answer_for: F) -> Vec<QaPair>
    where
        F: FnMut(&str) -> Option<String>,
    {
        self.questions
            .iter()
            .filter(|q| q.is_complete())
            .map(|q| QaPair {
                question: q.text.clone(),
                answer: answer_for(&q.id).unwrap_or_default(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbered_questions_are_capped() {
        let questions = Question::numbered(["a?", "b?", "c?", "d?"], 3);
        let ids: Vec<_> = questions.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["q1", "q2", "q3"]);
        assert_eq!(questions[2].text, "c?");
    }

    #[test]
    fn asking_state_serializes_with_stage_tag() {
        let state = DialogState::asking("d", Question::numbered(["Is it red?"], 3));
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({
                "stage": "asking",
                "version": 1,
                "image_description": "d",
                "questions": [{ "id": "q1", "text": "Is it red?" }]
            })
        );
        assert_eq!(
            serde_json::to_value(DialogState::finished()).unwrap(),
            json!({ "stage": "final", "version": 1 })
        );
        assert_eq!(state.stage(), Stage::Asking);
        assert_eq!(DialogState::finished().stage().as_str(), "final");
    }

    #[test]
    fn round_tripped_state_is_accepted() {
        let state = DialogState::asking("desc", Question::numbered(["Why?"], 3));
        let raw = serde_json::to_string(&state).unwrap();
        let parsed = AskingState::from_json(&raw).unwrap();
        assert_eq!(DialogState::Asking(parsed), state);
    }

    #[test]
    fn untagged_state_is_accepted() {
        let raw = r#"{"image_description":"d","questions":[{"id":"q1","text":"Is it red?"}]}"#;
        let state = AskingState::from_json(raw).unwrap();
        assert_eq!(state.image_description, "d");
        assert_eq!(state.questions.len(), 1);
    }

    #[test]
    fn final_stage_state_is_rejected() {
        let err = AskingState::from_json(r#"{"stage":"final","image_description":"d"}"#).unwrap_err();
        assert!(matches!(err, DialogError::InvalidRequest(msg) if msg.contains("expected `asking`")));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = AskingState::from_json(r#"{"version":7,"image_description":"d"}"#).unwrap_err();
        assert!(matches!(err, DialogError::InvalidRequest(_)));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(AskingState::from_json("{not json").is_err());
        assert!(AskingState::from_json(r#"{"questions":[]}"#).is_err());
    }

    #[test]
    fn qa_pairs_follow_question_order_and_default_answers() {
        let state = AskingState::from_json(
            r#"{"image_description":"d","questions":[
                {"id":"q1","text":"Is it red?"},
                {"id":"q2"},
                {"text":"orphan?"},
                {"id":"q3","text":"Is it big?"}
            ]}"#,
        )
        .unwrap();

        let pairs = state.qa_pairs(|id| (id == "q1").then(|| "yes".to_string()));
        assert_eq!(
            pairs,
            vec![
                QaPair { question: "Is it red?".into(), answer: "yes".into() },
                QaPair { question: "Is it big?".into(), answer: String::new() },
            ]
        );
    }

    #[test]
    fn null_question_fields_count_as_missing() {
        let state = AskingState::from_json(
            r#"{"image_description":"d","questions":[
                {"id":null,"text":"x?"},
                {"id":"q2","text":null},
                {"id":"q3","text":"Is it wet?"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(state.questions[0].id, "");
        let pairs = state.qa_pairs(|_| Some("no".to_string()));
        assert_eq!(
            pairs,
            vec![QaPair { question: "Is it wet?".into(), answer: "no".into() }]
        );
    }
}
