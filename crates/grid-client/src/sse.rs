//! Minimal server-sent events framing for the result stream.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental decoder; chunks may split frames (and UTF-8 sequences) anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(event) = parse_frame(&String::from_utf8_lossy(&frame[..end])) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in frame.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_across_chunks() {
        let mut dec = SseDecoder::default();
        assert!(dec.push(b"event: task\nda").is_empty());
        let events = dec.push(b"ta: {\"a\":1}\n\nevent: task\ndata: 2\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "task".into(),
                    data: "{\"a\":1}".into()
                },
                SseEvent {
                    event: "task".into(),
                    data: "2".into()
                },
            ]
        );
    }

    #[test]
    fn keep_alive_comments_are_skipped() {
        let mut dec = SseDecoder::default();
        assert!(dec.push(b":\n\n: ping\n\n").is_empty());
        let events = dec.push(b"data: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut dec = SseDecoder::default();
        let events = dec.push(b"event: task\ndata: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }
}
