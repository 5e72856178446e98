//! Partial transcripts for the utterance currently in progress on each side.

/// User and assistant text accumulated from streaming deltas.
#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    user_pending: String,
    /// Whether any user delta already reached the client for this utterance
    user_delta_forwarded: bool,
    last_user_committed: Option<String>,
    assistant_pending: String,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// New utterance: drop partial user text and forget the last commit.
    pub fn reset_user(&mut self) {
        self.user_pending.clear();
        self.user_delta_forwarded = false;
        self.last_user_committed = None;
    }

    pub fn push_user_delta(&mut self, delta: &str) {
        self.user_pending.push_str(delta);
        self.user_delta_forwarded = true;
    }

    pub fn user_delta_forwarded(&self) -> bool {
        self.user_delta_forwarded
    }

    /// Explicit transcript if non-blank, else the accumulated deltas. Text is kept as streamed.
    pub fn resolve_user(&self, explicit: Option<&str>) -> String {
        explicit
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(&self.user_pending)
            .to_string()
    }

    /// Records `text` as committed unless it is blank or repeats the previous commit.
    pub fn accept_user(&mut self, text: &str) -> bool {
        if text.trim().is_empty() || self.last_user_committed.as_deref() == Some(text) {
            return false;
        }
        self.last_user_committed = Some(text.to_string());
        true
    }

    /// Utterance finished; the last commit is kept for duplicate suppression.
    pub fn finish_user(&mut self) {
        self.user_pending.clear();
        self.user_delta_forwarded = false;
    }

    pub fn push_assistant(&mut self, delta: &str) {
        self.assistant_pending.push_str(delta);
    }

    /// Takes the pending assistant text, `None` when it is blank.
    pub fn take_assistant(&mut self) -> Option<String> {
        let text = std::mem::take(&mut self.assistant_pending);
        (!text.trim().is_empty()).then_some(text)
    }

    pub fn discard_assistant(&mut self) {
        self.assistant_pending.clear();
    }

    #[cfg(test)]
    fn assistant_pending(&self) -> &str {
        &self.assistant_pending
    }

    pub fn clear(&mut self) {
        self.reset_user();
        self.discard_assistant();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_transcript_wins() {
        let mut acc = TranscriptAccumulator::new();
        acc.push_user_delta("hel");
        acc.push_user_delta("lo");
        assert_eq!(acc.resolve_user(Some("Hello.")), "Hello.");
        assert_eq!(acc.resolve_user(Some(" Hello. ")), " Hello. ");
        assert_eq!(acc.resolve_user(Some("  ")), "hello");
        assert_eq!(acc.resolve_user(None), "hello");
        assert!(acc.user_delta_forwarded());
    }

    #[test]
    fn test_duplicate_commit_rejected_until_reset() {
        let mut acc = TranscriptAccumulator::new();
        assert!(acc.accept_user("hello"));
        acc.finish_user();
        assert!(!acc.accept_user("hello"));
        assert!(!acc.accept_user(""));
        assert!(!acc.accept_user("  "));

        acc.reset_user();
        assert!(acc.accept_user("hello"));
    }

    #[test]
    fn test_assistant_take_and_discard() {
        let mut acc = TranscriptAccumulator::new();
        assert_eq!(acc.take_assistant(), None);

        acc.push_assistant("Hel");
        acc.push_assistant("lo there ");
        assert_eq!(acc.take_assistant(), Some("Hello there ".to_string()));
        assert_eq!(acc.assistant_pending(), "");

        acc.push_assistant("Hel");
        acc.discard_assistant();
        assert_eq!(acc.take_assistant(), None);

        acc.push_assistant(" \n");
        assert_eq!(acc.take_assistant(), None);
    }
}
