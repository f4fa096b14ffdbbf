use super::{CaptionError, FragmentStream};
use futures::StreamExt;
use std::borrow::Cow;

/// Removes every occurrence of `marker`, repeating until none is left so that
/// a removal cannot splice a new marker together.
pub fn strip_marker<'a>(text: &'a str, marker: &str) -> Cow<'a, str> {
    if marker.is_empty() || !text.contains(marker) {
        return Cow::Borrowed(text);
    }
    let mut cleaned = text.replace(marker, "");
    while cleaned.contains(marker) {
        cleaned = cleaned.replace(marker, "");
    }
    Cow::Owned(cleaned)
}

/// Folds caption fragments into a running prefix.
///
/// Each fragment is cleaned before it is appended, so the prefix returned by
/// `push` only ever grows. `finish` runs one more pass over the whole buffer
/// to catch a marker that was split across two fragments.
#[derive(Debug)]
pub struct CaptionAccumulator {
    marker: String,
    buffer: String,
    fragments: usize,
}

impl CaptionAccumulator {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            buffer: String::new(),
            fragments: 0,
        }
    }

    pub fn push(&mut self, fragment: &str) -> &str {
        self.buffer.push_str(&strip_marker(fragment, &self.marker));
        self.fragments += 1;
        &self.buffer
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// The final caption: markers removed, then leading and trailing
    /// whitespace trimmed. Inner whitespace is kept as the model produced it.
    pub fn finish(self) -> String {
        strip_marker(&self.buffer, &self.marker).trim().to_string()
    }
}

/// Drives `fragments` to completion and returns the final caption.
///
/// Never returns if the stream never ends; callers bound it with a timeout.
pub async fn accumulate_caption(
    mut fragments: FragmentStream,
    marker: &str,
) -> Result<String, CaptionError> {
    let mut accumulator = CaptionAccumulator::new(marker);
    while let Some(fragment) = fragments.next().await {
        let partial = accumulator.push(&fragment?);
        tracing::trace!(partial_len = partial.len(), "Caption fragment received");
    }
    tracing::debug!(fragments = accumulator.fragments(), "Caption stream finished");
    Ok(accumulator.finish())
}
