//! Streaming text handling for the turn controller.
//!
//! Chat backends may send cumulative deltas (full-text-so-far) instead of
//! increments, and may repeat content across chunks. `delta_from` strips
//! the already-seen prefix via longest suffix-prefix overlap;
//! `SentenceSplitter` buffers the resulting stream and flushes complete
//! sentences at `.`/`!`/`?` boundaries so synthesis can start before the
//! response finishes streaming.

const SENTENCE_ENDS: [char; 3] = ['.', '!', '?'];

/// Compute the unseen tail of `next` given the previously received chunk.
///
/// Direct prefix match first ("Hello wor" → "Hello world" yields "ld");
/// otherwise the longest suffix of `prev` matching a prefix of `next` is
/// dropped ("...wor" → "world wide" yields "ld wide"). No overlap means
/// the whole chunk is new.
pub fn delta_from<'a>(prev: &str, next: &'a str) -> &'a str {
    if prev.is_empty() {
        return next;
    }
    if let Some(tail) = next.strip_prefix(prev) {
        return tail;
    }
    let max = prev.len().min(next.len());
    for k in (1..=max).rev() {
        if !next.is_char_boundary(k) {
            continue;
        }
        if prev.ends_with(&next[..k]) {
            return &next[k..];
        }
    }
    next
}

/// Splits a streaming text buffer into sentence-bounded pieces.
pub struct SentenceSplitter {
    /// Text accumulated since the last flush boundary.
    pending: String,
    /// Raw previous chunk, for suffix-prefix de-duplication.
    prev_chunk: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self {
            pending: String::new(),
            prev_chunk: String::new(),
        }
    }

    /// Feed one raw chunk from the chat stream. Returns every complete
    /// sentence that became available, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let delta = delta_from(&self.prev_chunk, chunk).to_string();
        self.prev_chunk = chunk.to_string();
        self.pending.push_str(&delta);
        self.flush_complete()
    }

    /// Flush whatever remains after the stream ends (a trailing clause
    /// without terminal punctuation is still spoken).
    pub fn finish(&mut self) -> Option<String> {
        self.prev_chunk.clear();
        let rest = self.pending.trim().to_string();
        self.pending.clear();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    /// Emit everything up to the last sentence terminator, split into
    /// individual sentences.
    fn flush_complete(&mut self) -> Vec<String> {
        let Some(last_end) = self.pending.rfind(SENTENCE_ENDS) else {
            return Vec::new();
        };
        let boundary = last_end + self.pending[last_end..].chars().next().map_or(1, char::len_utf8);
        let complete = self.pending[..boundary].to_string();
        self.pending.drain(..boundary);

        let mut sentences = Vec::new();
        let mut start = 0;
        for (i, c) in complete.char_indices() {
            if SENTENCE_ENDS.contains(&c) {
                let end = i + c.len_utf8();
                let sentence = complete[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                start = end;
            }
        }
        sentences
    }
}

impl Default for SentenceSplitter {
    fn default() -> Self {
        Self::new()
    }
}
