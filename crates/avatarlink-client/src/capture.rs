//! Press-to-talk capture on top of a continuous speech recogniser.
//!
//! The bridge only collects text. Whatever it hands back as pending input is
//! for the caller to speak (or not).

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Events from a speech recogniser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Started,
    Result { text: String, is_final: bool },
    Ended,
    Error(String),
}

#[derive(Debug, Default)]
pub struct CaptureBridge {
    listening: bool,
    finalized: Vec<String>,
    partial: String,
    pending: Option<String>,
}

impl CaptureBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Begins a capture, dropping the previous transcript.
    pub fn start(&mut self) {
        self.listening = true;
        self.finalized.clear();
        self.partial.clear();
        self.pending = None;
    }

    /// Applies one recogniser event. Returns the transcript when the event
    /// ends the capture.
    pub fn apply(&mut self, event: RecognitionEvent) -> Option<String> {
        match event {
            RecognitionEvent::Started => {
                self.start();
                None
            }
            RecognitionEvent::Result { text, is_final } => {
                if !self.listening {
                    return None;
                }
                if is_final {
                    let text = text.trim();
                    if !text.is_empty() {
                        self.finalized.push(text.to_string());
                    }
                    self.partial.clear();
                } else {
                    self.partial = text;
                }
                None
            }
            RecognitionEvent::Ended => self.finish(),
            RecognitionEvent::Error(msg) => {
                warn!("speech recognition error: {msg}");
                self.finish()
            }
        }
    }

    /// Finalised text.
    pub fn transcript(&self) -> String {
        self.finalized.join(" ")
    }

    /// Finalised text followed by the latest partial result, for live display.
    pub fn live_text(&self) -> String {
        let partial = self.partial.trim();
        let transcript = self.transcript();
        match (transcript.is_empty(), partial.is_empty()) {
            (_, true) => transcript,
            (true, false) => partial.to_string(),
            (false, false) => format!("{transcript} {partial}"),
        }
    }

    pub fn stop(&mut self) -> Option<String> {
        self.finish()
    }

    /// Transcript left by the last finished capture, if not yet taken.
    pub fn take_pending(&mut self) -> Option<String> {
        self.pending.take()
    }

    fn finish(&mut self) -> Option<String> {
        if !self.listening {
            return None;
        }
        self.listening = false;
        let text = self.live_text();
        self.partial.clear();
        if text.is_empty() {
            debug!("capture ended without speech");
            return None;
        }
        self.pending = Some(text.clone());
        Some(text)
    }
}

/// Drives a bridge from a recogniser channel until it closes, publishing live
/// text. Returns the last finished transcript.
pub async fn run_capture(
    mut events: mpsc::Receiver<RecognitionEvent>,
    live: watch::Sender<String>,
) -> Option<String> {
    let mut bridge = CaptureBridge::new();
    bridge.start();
    let mut last = None;
    while let Some(event) = events.recv().await {
        if let Some(done) = bridge.apply(event) {
            last = Some(done);
        }
        live.send_replace(bridge.live_text());
    }
    if let Some(done) = bridge.stop() {
        last = Some(done);
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(text: &str, is_final: bool) -> RecognitionEvent {
        RecognitionEvent::Result {
            text: text.into(),
            is_final,
        }
    }

    #[test]
    fn test_accumulates_final_and_shows_partial() {
        let mut bridge = CaptureBridge::new();
        bridge.apply(RecognitionEvent::Started);
        bridge.apply(result("what is", false));
        assert_eq!(bridge.live_text(), "what is");
        bridge.apply(result("what is rust", true));
        bridge.apply(result("used", false));
        assert_eq!(bridge.transcript(), "what is rust");
        assert_eq!(bridge.live_text(), "what is rust used");

        let done = bridge.apply(RecognitionEvent::Ended);
        assert_eq!(done.as_deref(), Some("what is rust used"));
        assert!(!bridge.is_listening());
        assert_eq!(bridge.take_pending().as_deref(), Some("what is rust used"));
        assert_eq!(bridge.take_pending(), None);
    }

    #[test]
    fn test_start_clears_previous_transcript() {
        let mut bridge = CaptureBridge::new();
        bridge.start();
        bridge.apply(result("old words", true));
        bridge.stop();
        bridge.start();
        assert_eq!(bridge.transcript(), "");
        assert_eq!(bridge.take_pending(), None);
    }

    #[test]
    fn test_error_hands_over_what_was_heard() {
        let mut bridge = CaptureBridge::new();
        bridge.start();
        bridge.apply(result("hello", true));
        let done = bridge.apply(RecognitionEvent::Error("network".into()));
        assert_eq!(done.as_deref(), Some("hello"));
        assert_eq!(bridge.stop(), None);
    }

    #[test]
    fn test_silence_yields_nothing() {
        let mut bridge = CaptureBridge::new();
        bridge.start();
        bridge.apply(result("   ", true));
        assert_eq!(bridge.stop(), None);
        assert_eq!(bridge.take_pending(), None);
    }

    #[test]
    fn test_results_ignored_when_not_listening() {
        let mut bridge = CaptureBridge::new();
        bridge.apply(result("stray", true));
        assert_eq!(bridge.transcript(), "");
    }

    #[tokio::test]
    async fn test_run_capture_publishes_live_text() {
        let (tx, rx) = mpsc::channel(8);
        let (live_tx, live_rx) = watch::channel(String::new());
        tx.send(result("good", false)).await.unwrap();
        tx.send(result("good morning", true)).await.unwrap();
        drop(tx);

        let transcript = run_capture(rx, live_tx).await;
        assert_eq!(transcript.as_deref(), Some("good morning"));
        assert_eq!(*live_rx.borrow(), "good morning");
    }
}
