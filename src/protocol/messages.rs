use chrono::Utc;
use serde::{Deserialize, Serialize};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Text {
        text: String,
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
    },
    Control {
        action: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SentenceEvent {
    SentenceEnd,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ServerEvent {
    Stt {
        timestamp: i64,
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
    },
    LlmToken {
        timestamp: i64,
        token: String,
        accumulated: String,
        finished: bool,
    },
    Sentence {
        timestamp: i64,
        #[serde(rename = "eventType")]
        event_type: SentenceEvent,
        text: String,
        index: usize,
    },
    Error {
        timestamp: i64,
        message: String,
    },
}

impl ServerEvent {
    pub fn stt(text: String, is_final: bool) -> Self {
        ServerEvent::Stt {
            timestamp: now_ms(),
            text,
            is_final,
        }
    }

    pub fn llm_token(token: String, accumulated: String, finished: bool) -> Self {
        ServerEvent::LlmToken {
            timestamp: now_ms(),
            token,
            accumulated,
            finished,
        }
    }

    pub fn sentence_end(text: String, index: usize) -> Self {
        ServerEvent::Sentence {
            timestamp: now_ms(),
            event_type: SentenceEvent::SentenceEnd,
            text,
            index,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            timestamp: now_ms(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Serialize failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn client_text_message_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"text","text":"你好","sessionId":"abc"}"#).unwrap();
        match msg {
            ClientMessage::Text { text, session_id } => {
                assert_eq!(text, "你好");
                assert_eq!(session_id.as_deref(), Some("abc"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn client_abort_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"control","action":"abort"}"#).unwrap();
        match msg {
            ClientMessage::Control { action } => assert_eq!(action, "abort"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn stt_event_shape() {
        let v: Value = serde_json::from_str(&ServerEvent::stt("hi".into(), true).to_json()).unwrap();
        assert_eq!(v["type"], "stt");
        assert_eq!(v["text"], "hi");
        assert_eq!(v["final"], true);
        assert!(v["timestamp"].as_i64().is_some());
    }

    #[test]
    fn sentence_event_shape() {
        let v: Value =
            serde_json::from_str(&ServerEvent::sentence_end("你好。".into(), 0).to_json()).unwrap();
        assert_eq!(v["type"], "sentence");
        assert_eq!(v["eventType"], "sentence_end");
        assert_eq!(v["index"], 0);
    }

    #[test]
    fn llm_token_event_shape() {
        let v: Value = serde_json::from_str(
            &ServerEvent::llm_token("天气".into(), "今天天气".into(), false).to_json(),
        )
        .unwrap();
        assert_eq!(v["type"], "llm_token");
        assert_eq!(v["token"], "天气");
        assert_eq!(v["accumulated"], "今天天气");
        assert_eq!(v["finished"], false);
    }
}
