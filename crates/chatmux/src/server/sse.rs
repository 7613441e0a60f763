//! Server-sent event encoding for `/chat-stream`

use bytes::Bytes;

use super::framer::FrameEvent;

pub const START_SENTINEL: &str = "[START]";
pub const DONE_SENTINEL: &str = "[DONE]";
pub const KEEPALIVE_SENTINEL: &str = "[KEEP]";

/// One event on the wire. Clients key off the payload; the event name is
/// always `event`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSentEvent {
    pub data: String,
    pub event: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl ServerSentEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            event: "event".to_string(),
            id: None,
            retry: None,
        }
    }

    /// A `{"message": ...}` payload
    pub fn message(text: &str) -> Self {
        Self::new(serde_json::json!({ "message": text }).to_string())
    }

    pub fn encode(&self) -> Bytes {
        let mut out = format!("data: {}\nevent: {}", self.data, self.event);
        if let Some(id) = &self.id {
            out.push_str(&format!("\nid: {id}"));
        }
        if let Some(retry) = self.retry {
            out.push_str(&format!("\nretry: {retry}"));
        }
        out.push_str("\r\n\r\n");
        Bytes::from(out)
    }
}

impl From<FrameEvent> for ServerSentEvent {
    fn from(event: FrameEvent) -> Self {
        match event {
            FrameEvent::Start => Self::new(START_SENTINEL),
            FrameEvent::Message(text) => Self::message(&text),
            FrameEvent::KeepAlive => Self::new(KEEPALIVE_SENTINEL),
            FrameEvent::Done => Self::new(DONE_SENTINEL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_are_raw() {
        let start = ServerSentEvent::from(FrameEvent::Start).encode();
        assert_eq!(&start[..], b"data: [START]\nevent: event\r\n\r\n");

        let done = ServerSentEvent::from(FrameEvent::Done).encode();
        assert_eq!(&done[..], b"data: [DONE]\nevent: event\r\n\r\n");

        let keep = ServerSentEvent::from(FrameEvent::KeepAlive).encode();
        assert_eq!(&keep[..], b"data: [KEEP]\nevent: event\r\n\r\n");
    }

    #[test]
    fn test_message_is_json_escaped() {
        let event = ServerSentEvent::from(FrameEvent::Message("say \"hi\"\n".to_string()));
        let encoded = String::from_utf8(event.encode().to_vec()).unwrap();

        assert_eq!(
            encoded,
            "data: {\"message\":\"say \\\"hi\\\"\\n\"}\nevent: event\r\n\r\n"
        );
    }

    #[test]
    fn test_optional_fields() {
        let mut event = ServerSentEvent::new("x");
        event.id = Some("7".to_string());
        event.retry = Some(3000);

        assert_eq!(
            &event.encode()[..],
            b"data: x\nevent: event\nid: 7\nretry: 3000\r\n\r\n"
        );
    }
}
