//! Server-sent event stream from the hub. Events only wake the settings
//! poller; the settings themselves always come from a regular fetch.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::client::ClientError;
use crate::session::Session;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// The hub sends keep-alive comments every 15 s.
const IDLE_LIMIT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder. Chunks may split lines anywhere.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: String,
    data: String,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<PushEvent> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(ev) = self.dispatch() {
                    out.push(ev);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = value.to_string(),
                "data" => {
                    if !self.data.is_empty() {
                        self.data.push('\n');
                    }
                    self.data.push_str(value);
                }
                _ => {}
            }
        }
        out
    }

    fn dispatch(&mut self) -> Option<PushEvent> {
        if self.event.is_empty() && self.data.is_empty() {
            return None;
        }
        let event = match std::mem::take(&mut self.event) {
            e if e.is_empty() => "message".to_string(),
            e => e,
        };
        Some(PushEvent {
            event,
            data: std::mem::take(&mut self.data),
        })
    }
}

/// Holds the stream open for the life of the process and pokes `wake` on
/// every `settings` event. Reconnects after errors, idle links and 401s.
pub async fn listen(session: Arc<Session>, wake: Arc<Notify>) {
    loop {
        let key = session.api_key().await;
        match session.client().open_stream(&key).await {
            Ok(mut resp) => {
                info!("push stream connected");
                let mut parser = SseParser::default();
                loop {
                    match timeout(IDLE_LIMIT, resp.chunk()).await {
                        Ok(Ok(Some(chunk))) => {
                            for ev in parser.feed(&chunk) {
                                if ev.event == "settings" {
                                    debug!(data = %ev.data, "settings changed on hub");
                                    wake.notify_one();
                                }
                            }
                        }
                        Ok(Ok(None)) => {
                            info!("push stream closed by hub");
                            break;
                        }
                        Ok(Err(e)) => {
                            warn!("push stream error: {e}");
                            break;
                        }
                        Err(_) => {
                            warn!("push stream idle for {}s; reconnecting", IDLE_LIMIT.as_secs());
                            break;
                        }
                    }
                }
            }
            Err(ClientError::Unauthorized) => {
                warn!("push stream rejected; re-provisioning");
                if let Err(e) = session.reprovision(&key).await {
                    warn!("re-provisioning failed: {e}");
                }
            }
            Err(e) => debug!("push stream unavailable: {e}"),
        }
        sleep(RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(event: &str, data: &str) -> PushEvent {
        PushEvent {
            event: event.into(),
            data: data.into(),
        }
    }

    #[test]
    fn decodes_axum_framing() {
        let mut p = SseParser::default();
        let out = p.feed(b"event: settings\ndata: {\"version\":3}\n\n");
        assert_eq!(out, vec![ev("settings", "{\"version\":3}")]);
    }

    #[test]
    fn lines_split_across_chunks() {
        let mut p = SseParser::default();
        assert!(p.feed(b"eve").is_empty());
        assert!(p.feed(b"nt: settings\r\nda").is_empty());
        assert!(p.feed(b"ta: {}\r\n").is_empty());
        assert_eq!(p.feed(b"\r\n"), vec![ev("settings", "{}")]);
    }

    #[test]
    fn keep_alives_produce_nothing() {
        let mut p = SseParser::default();
        assert!(p.feed(b":\n\n: ping\n\n").is_empty());
    }

    #[test]
    fn multiple_events_and_multiline_data() {
        let mut p = SseParser::default();
        let out = p.feed(b"data: a\ndata: b\n\nevent: settings\ndata:x\n\n");
        assert_eq!(out, vec![ev("message", "a\nb"), ev("settings", "x")]);
    }
}
