//! `text/event-stream` decoding.
//!
//! [`lines`] turns a response body into lines with a buffered reader, which
//! handles `\n` and `\r\n` endings and lines split across chunks.
//! [`SseDecoder`] then produces an item for every comment line and for
//! every blank-line terminated event.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;

/// One dispatched event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    /// A `:` comment line, such as a heartbeat.
    Comment(String),
    Event(SseEvent),
}

/// Split a byte stream into lines.
pub fn lines<S, E>(body: S) -> impl Stream<Item = std::io::Result<String>>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let reader = StreamReader::new(body.map(|chunk| chunk.map_err(std::io::Error::other)));
    LinesStream::new(BufReader::new(reader).lines())
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: SseEvent,
    data_lines: Vec<String>,
    has_fields: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line without its terminator.
    pub fn push_line(&mut self, line: &str) -> Option<SseItem> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(comment) = line.strip_prefix(':') {
            return Some(SseItem::Comment(strip_space(comment).to_string()));
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, strip_space(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.pending.event = Some(value.to_string()),
            "id" => self.pending.id = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            // retry and unknown fields
            _ => return None,
        }
        self.has_fields = true;
        None
    }

    fn dispatch(&mut self) -> Option<SseItem> {
        if !self.has_fields {
            return None;
        }
        let mut event = std::mem::take(&mut self.pending);
        event.data = std::mem::take(&mut self.data_lines).join("\n");
        self.has_fields = false;
        Some(SseItem::Event(event))
    }
}

fn strip_space(value: &str) -> &str {
    value.strip_prefix(' ').unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(chunks: &[&'static [u8]]) -> Vec<SseItem> {
        let body = futures::stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok::<_, std::io::Error>(Bytes::from_static(chunk)))
                .collect::<Vec<_>>(),
        );
        let mut decoder = SseDecoder::new();
        lines(body)
            .map(|line| line.unwrap())
            .filter_map(|line| futures::future::ready(decoder.push_line(&line)))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_comments_and_events() {
        let items = decode(&[
            b": connected\n\nevent: next\ndata: {\"id\":\"a\",\"payload\":1}\n\n: ping\n\n",
        ])
        .await;
        assert_eq!(
            items,
            vec![
                SseItem::Comment("connected".into()),
                SseItem::Event(SseEvent {
                    event: Some("next".into()),
                    id: None,
                    data: r#"{"id":"a","payload":1}"#.into(),
                }),
                SseItem::Comment("ping".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_event_split_across_chunks() {
        let items = decode(&[b"event: comp", b"lete\r\nid: op", b"-1\r\ndata: \r", b"\n\r\n"]).await;
        assert_eq!(
            items,
            vec![SseItem::Event(SseEvent {
                event: Some("complete".into()),
                id: Some("op-1".into()),
                data: String::new(),
            })]
        );
    }

    #[test]
    fn test_multiline_data_and_unknown_fields() {
        let mut decoder = SseDecoder::new();
        for line in ["retry: 10", "data:one", "data: two"] {
            assert_eq!(decoder.push_line(line), None);
        }
        assert_eq!(
            decoder.push_line(""),
            Some(SseItem::Event(SseEvent {
                event: None,
                id: None,
                data: "one\ntwo".into(),
            }))
        );
        assert_eq!(decoder.push_line(""), None);
    }

    #[tokio::test]
    async fn test_body_errors_surface_as_io_errors() {
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b": connected\n")),
            Err(std::io::Error::other("reset")),
        ]);
        let results: Vec<std::io::Result<String>> = lines(body).collect().await;
        assert_eq!(results[0].as_deref().unwrap(), ": connected");
        assert!(results[1].is_err());
    }
}
