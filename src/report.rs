use futures::StreamExt;
use tokio::sync::mpsc;

use crate::data_models::StreamEvent;
use crate::error::AppError;
use crate::llm::{ChatMessage, FragmentStream, ModelClient};

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

// recognized in every state: an open inside thinking restarts the segment,
// a stray close outside thinking is dropped
const MARKERS: [&str; 2] = [THINK_OPEN, THINK_CLOSE];

pub const REPORT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Analyze the provided web search results and create well-structured, informative reports.
Your reports should:
1. Start with a clear introduction
2. Include relevant information from multiple sources
3. Organize content into logical sections
4. Use bullet points or numbered lists when appropriate
5. End with a brief conclusion
6. Cite sources using [Source Title] format

Keep your tone professional and ensure the information is accurate.";

pub fn report_messages(query: &str, context: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(REPORT_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Web search results:\n\n{context}\n\nQuestion: {query}\n\nPlease provide a detailed, well-structured report based on these search results."
        )),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Nothing seen yet. Emits like `Answering`.
    AwaitingFirst,
    Thinking,
    Answering,
}

/// Splits a streamed report into thinking and answer segments.
///
/// Markers may arrive split across fragments: a trailing piece of text that
/// could still become a marker is held back until the next fragment decides
/// it. Answer events carry the whole answer so far. Thinking events carry the
/// whole current segment and are only produced when the segment closes.
#[derive(Debug)]
pub struct ThinkParser {
    state: ParserState,
    pending: String,
    thinking: String,
    answer: String,
    emitted_answer_len: usize,
    freeze_answer: bool,
    seen_close: bool,
    frozen: bool,
}

impl ThinkParser {
    pub fn new(freeze_answer: bool) -> Self {
        Self {
            state: ParserState::AwaitingFirst,
            pending: String::new(),
            thinking: String::new(),
            answer: String::new(),
            emitted_answer_len: 0,
            freeze_answer,
            seen_close: false,
            frozen: false,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn push(&mut self, fragment: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut buf = std::mem::take(&mut self.pending);
        buf.push_str(fragment);

        loop {
            match self.next_marker(&buf) {
                Some((idx, marker)) => {
                    self.absorb(&buf[..idx]);
                    self.flush_answer(&mut events);
                    buf.drain(..idx + marker.len());
                    self.on_marker(marker, &mut events);
                }
                None => {
                    let keep = self.held_back_len(&buf);
                    let split = buf.len() - keep;
                    self.absorb(&buf[..split]);
                    self.pending = buf.split_off(split);
                    break;
                }
            }
        }

        self.flush_answer(&mut events);
        events
    }

    /// Ends parsing. An unclosed thinking segment is dropped; a held-back
    /// partial marker outside thinking turns out to be answer text.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let pending = std::mem::take(&mut self.pending);
        if self.state != ParserState::Thinking {
            self.absorb(&pending);
            self.flush_answer(&mut events);
        } else if !self.thinking.is_empty() {
            log::debug!(
                "discarding {} bytes of unclosed thinking",
                self.thinking.len() + pending.len()
            );
        }
        self.thinking.clear();
        events
    }

    fn next_marker(&self, buf: &str) -> Option<(usize, &'static str)> {
        MARKERS
            .iter()
            .filter_map(|m| buf.find(m).map(|idx| (idx, *m)))
            .min_by_key(|(idx, _)| *idx)
    }

    /// Length of the longest suffix of `buf` that is a proper prefix of a marker.
    fn held_back_len(&self, buf: &str) -> usize {
        let bytes = buf.as_bytes();
        MARKERS
            .iter()
            .flat_map(|m| (1..m.len()).rev().map(move |k| &m.as_bytes()[..k]))
            .filter(|prefix| bytes.ends_with(prefix))
            .map(<[u8]>::len)
            .max()
            .unwrap_or(0)
    }

    fn absorb(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.state {
            ParserState::Thinking => self.thinking.push_str(text),
            ParserState::AwaitingFirst | ParserState::Answering => {
                self.state = ParserState::Answering;
                self.answer.push_str(text);
            }
        }
    }

    fn on_marker(&mut self, marker: &str, events: &mut Vec<StreamEvent>) {
        match (self.state, marker) {
            (ParserState::Thinking, THINK_CLOSE) => {
                self.state = ParserState::Answering;
                self.seen_close = true;
                if !self.thinking.trim().is_empty() {
                    events.push(StreamEvent::thinking(self.thinking.clone()));
                }
            }
            (_, THINK_OPEN) => {
                self.state = ParserState::Thinking;
                self.thinking.clear();
            }
            _ => {}
        }
    }

    fn flush_answer(&mut self, events: &mut Vec<StreamEvent>) {
        if self.frozen || self.answer.len() == self.emitted_answer_len {
            return;
        }
        if self.answer.trim().is_empty() {
            return;
        }
        events.push(StreamEvent::answer(self.answer.clone()));
        self.emitted_answer_len = self.answer.len();
        if self.freeze_answer && self.seen_close {
            self.frozen = true;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportStreamer {
    model: ModelClient,
    freeze_answer: bool,
}

impl ReportStreamer {
    pub fn new(model: ModelClient, freeze_answer: bool) -> Self {
        Self {
            model,
            freeze_answer,
        }
    }

    pub async fn open(&self, query: &str, context: &str) -> Result<FragmentStream, AppError> {
        self.model.open_chat(&report_messages(query, context)).await
    }

    /// Parses `fragments` and sends every resulting event to `tx` as soon as
    /// it is ready.
    pub async fn forward(
        &self,
        mut fragments: FragmentStream,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<(), AppError> {
        let mut parser = ThinkParser::new(self.freeze_answer);

        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            for event in parser.push(&fragment) {
                tx.send(event)
                    .await
                    .map_err(|_| AppError::ClientDisconnected)?;
            }
        }

        for event in parser.finish() {
            tx.send(event)
                .await
                .map_err(|_| AppError::ClientDisconnected)?;
        }
        Ok(())
    }
}
