use serde::{Deserialize, Serialize};

/// A normalized search hit, as forwarded to the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub content: String,
    pub url: String,
    pub domain: String,
    #[serde(rename = "favicon")]
    pub favicon_url: String,
}

impl SearchResult {
    pub fn new(title: String, content: String, url: String, domain: String) -> SearchResult {
        let favicon_url = favicon_for(&domain);
        SearchResult {
            title,
            content,
            url,
            domain,
            favicon_url,
        }
    }
}

pub fn favicon_for(domain: &str) -> String {
    format!("https://www.google.com/s2/favicons?domain={domain}")
}

/// One line of the `/chat` response stream.
///
/// Payloads are cumulative: a later `thinking` or `answer` event replaces the
/// client's view of that field rather than appending to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Initial {
        content: String,
        #[serde(rename = "searchResults")]
        search_results: Vec<SearchResult>,
    },
    Thinking {
        content: String,
    },
    Answer {
        content: String,
    },
}

impl StreamEvent {
    pub fn answer(content: impl Into<String>) -> StreamEvent {
        StreamEvent::Answer {
            content: content.into(),
        }
    }

    pub fn thinking(content: impl Into<String>) -> StreamEvent {
        StreamEvent::Thinking {
            content: content.into(),
        }
    }

    /// Encodes the event as a single newline-terminated JSON line.
    pub fn to_ndjson_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[test]
fn test_stream_event_wire_shape() {
    let initial = StreamEvent::Initial {
        content: "Latest AI news".into(),
        search_results: vec![SearchResult::new(
            "Title".into(),
            "Body".into(),
            "https://example.com/a".into(),
            "example.com".into(),
        )],
    };
    let line = initial.to_ndjson_line().unwrap();
    assert!(line.ends_with('\n'));
    assert_eq!(line.matches('\n').count(), 1);

    let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(value["type"], "initial");
    assert_eq!(value["content"], "Latest AI news");
    assert_eq!(value["searchResults"][0]["domain"], "example.com");
    assert_eq!(
        value["searchResults"][0]["favicon"],
        "https://www.google.com/s2/favicons?domain=example.com"
    );

    let answer = StreamEvent::answer("multi\nline").to_ndjson_line().unwrap();
    assert_eq!(answer, "{\"type\":\"answer\",\"content\":\"multi\\nline\"}\n");
}
