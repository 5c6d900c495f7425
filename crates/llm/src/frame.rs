/// One decoded push-stream frame, before payload interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Incremental output; the payload is passed through untouched.
    Data(String),
    /// Terminal signal: no further data frames follow.
    Done,
    /// Backend-reported abnormal termination.
    Error(String),
}

impl Frame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }
}

pub const DONE_SENTINEL: &str = "[DONE]";

/// Incremental Server-Sent Events decoder.
///
/// Lines are fed one at a time; a frame is produced when a blank line closes an event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) -> Option<Frame> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.dispatch();
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // `id` and `retry` only matter for automatic reconnects, which are not performed.
            _ => {}
        }

        None
    }

    /// Flushes an event left open when the byte stream ends without a trailing blank line.
    pub fn finish(&mut self) -> Option<Frame> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<Frame> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }

        let data = std::mem::take(&mut self.data).join("\n");
        match event.as_deref() {
            None | Some("") | Some("output") | Some("message") | Some("delta") => {
                if data == DONE_SENTINEL {
                    Some(Frame::Done)
                } else if data.is_empty() {
                    None
                } else {
                    Some(Frame::Data(data))
                }
            }
            Some("done") | Some("end") => Some(Frame::Done),
            Some("error") => Some(Frame::Error(data)),
            Some(other) => {
                tracing::debug!(event = %other, "ignoring unknown push-stream event");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(lines: &[&str]) -> Vec<Frame> {
        let mut decoder = SseDecoder::new();
        let mut frames = lines
            .iter()
            .filter_map(|line| decoder.push_line(line))
            .collect::<Vec<_>>();
        frames.extend(decoder.finish());
        frames
    }

    #[test]
    fn named_events_map_to_frame_kinds() {
        let frames = decode(&[
            "event: output",
            "data: He",
            "",
            "event: output",
            "data: llo",
            "",
            "event: done",
            "data: {}",
            "",
        ]);

        assert_eq!(
            frames,
            vec![
                Frame::Data("He".to_string()),
                Frame::Data("llo".to_string()),
                Frame::Done,
            ]
        );
    }

    #[test]
    fn only_one_leading_space_is_stripped() {
        let frames = decode(&["data:  world", ""]);
        assert_eq!(frames, vec![Frame::Data(" world".to_string())]);
    }

    #[test]
    fn multi_line_data_is_joined_with_newlines() {
        let frames = decode(&["data: first", "data: second", ""]);
        assert_eq!(frames, vec![Frame::Data("first\nsecond".to_string())]);
    }

    #[test]
    fn comments_ids_and_unknown_events_are_skipped() {
        let frames = decode(&[
            ": keep-alive",
            "id: 42",
            "retry: 1000",
            "event: metrics",
            "data: {\"tokens\":3}",
            "",
            "data: [DONE]",
            "",
        ]);
        assert_eq!(frames, vec![Frame::Done]);
    }

    #[test]
    fn error_events_carry_their_payload() {
        let frames = decode(&["event: error", "data: {\"detail\":\"boom\"}", "\r"]);
        assert_eq!(
            frames,
            vec![Frame::Error("{\"detail\":\"boom\"}".to_string())]
        );
        assert!(frames[0].is_terminal());
    }

    #[test]
    fn unterminated_event_is_flushed_on_finish() {
        let frames = decode(&["event: output", "data: tail"]);
        assert_eq!(frames, vec![Frame::Data("tail".to_string())]);
    }
}
