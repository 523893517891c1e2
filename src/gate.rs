use futures::StreamExt;

use crate::error::AppError;
use crate::llm::{ChatMessage, FragmentStream, ModelClient};

pub const UNSURE_MARKER: &str = "<unsure>";

pub const GATE_SYSTEM_PROMPT: &str = r#"You are a helpful AI assistant. For each question:
1. FIRST decide if you can answer confidently
2. Then IMMEDIATELY respond in ONE of these formats:
   - "<confident>Your complete answer here</confident>"
   - "<unsure>I need to search for accurate information about this topic</unsure>"

DO NOT:
- Use any other tags or formats
- Mix different formats together
- Include thinking process or explanations outside the tags

Example correct responses:
"<confident>The speed of light is approximately 299,792,458 meters per second.</confident>"
"<unsure>I need to search for accurate information about this topic</unsure>"

Example incorrect responses:
"Let me think... <confident>Answer</confident>"
"**Confident** <confident>Answer</confident>"
"<think>Thinking...</think> <confident>Answer</confident>"

Give your complete answer within a single tag pair."#;

pub fn gate_messages(query: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(GATE_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Question: {query}\n\nPlease assess and answer this question."
        )),
    ]
}

/// Outcome of the first model pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The transcript, delimiters included, is the answer to forward.
    Confident(String),
    Unsure(String),
}

impl Verdict {
    /// Any occurrence of `<unsure>` wins, well-formed or not.
    pub fn from_transcript(transcript: String) -> Verdict {
        if transcript.contains(UNSURE_MARKER) {
            Verdict::Unsure(transcript)
        } else {
            Verdict::Confident(transcript)
        }
    }

    pub fn is_unsure(&self) -> bool {
        matches!(self, Verdict::Unsure(_))
    }

    pub fn transcript(&self) -> &str {
        match self {
            Verdict::Confident(t) | Verdict::Unsure(t) => t,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfidenceGate {
    model: ModelClient,
}

impl ConfidenceGate {
    pub fn new(model: ModelClient) -> Self {
        Self { model }
    }

    pub async fn open(&self, query: &str) -> Result<FragmentStream, AppError> {
        self.model.open_chat(&gate_messages(query)).await
    }

    /// Consumes the whole stream. A mid-stream failure discards what was read.
    pub async fn drain(mut fragments: FragmentStream) -> Result<Verdict, AppError> {
        let mut transcript = String::new();
        while let Some(fragment) = fragments.next().await {
            transcript.push_str(&fragment?);
        }
        log::info!("confidence gate transcript: {} bytes", transcript.len());
        Ok(Verdict::from_transcript(transcript))
    }

    pub async fn assess(&self, query: &str) -> Result<Verdict, AppError> {
        let fragments = self.open(query).await?;
        Self::drain(fragments).await
    }
}

#[test]
fn test_verdict_from_transcript() {
    let cases = [
        ("<unsure>I need to search</unsure>", true),
        ("<unsure>never closed", true),
        ("prefix text <unsure>", true),
        ("<confident>Paris</confident> but also <unsure>", true),
        ("<confident>Paris is the capital of France.</confident>", false),
        ("no tags at all", false),
        ("<UNSURE>shouting</UNSURE>", false),
        ("", false),
    ];
    for (transcript, unsure) in cases {
        let verdict = Verdict::from_transcript(transcript.to_string());
        assert_eq!(verdict.is_unsure(), unsure, "transcript: {transcript:?}");
        assert_eq!(verdict.transcript(), transcript);
    }
}

#[test]
fn test_gate_messages_carry_the_query() {
    let messages = gate_messages("What is the capital of France?");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "system");
    assert!(messages[0].content.contains("<confident>"));
    assert!(messages[0].content.contains("<unsure>"));
    assert_eq!(messages[1].role, "user");
    assert_eq!(
        messages[1].content,
        "Question: What is the capital of France?\n\nPlease assess and answer this question."
    );
}
