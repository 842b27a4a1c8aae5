/// Turns successive full decodes into stream deltas.
///
/// A delta is cut at the first stop marker it contains, and a tail that could
/// still grow into a marker is held back until the next decode settles it.
/// A trailing U+FFFD means a multi-byte character is incomplete and is held
/// back as well.
#[derive(Debug, Clone)]
pub struct DeltaEmitter {
    markers: Vec<String>,
    emitted: String,
}

impl DeltaEmitter {
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            markers: markers.into_iter().filter(|m| !m.is_empty()).collect(),
            emitted: String::new(),
        }
    }

    /// Text already handed to the consumer
    pub fn emitted(&self) -> &str {
        &self.emitted
    }

    /// Next delta for the decoded text so far, if any is safe to emit
    pub fn push(&mut self, text: &str) -> Option<String> {
        let pending = text.strip_prefix(self.emitted.as_str())?;
        let pending = self.cut_at_marker(pending);
        let pending = pending.trim_end_matches('\u{FFFD}');
        let ready = &pending[..pending.len() - self.marker_prefix_len(pending)];
        self.emit(ready)
    }

    /// Flush whatever remains of the final text
    pub fn finish(&mut self, final_text: &str) -> Option<String> {
        let pending = final_text.strip_prefix(self.emitted.as_str())?;
        let pending = self.cut_at_marker(pending);
        self.emit(pending)
    }

    fn emit(&mut self, delta: &str) -> Option<String> {
        if delta.is_empty() {
            return None;
        }
        self.emitted.push_str(delta);
        Some(delta.to_string())
    }

    fn cut_at_marker<'a>(&self, text: &'a str) -> &'a str {
        match self.markers.iter().filter_map(|m| text.find(m.as_str())).min() {
            Some(pos) => &text[..pos],
            None => text,
        }
    }

    /// Length of the longest suffix that is a proper prefix of some marker
    fn marker_prefix_len(&self, text: &str) -> usize {
        text.char_indices()
            .map(|(i, _)| &text[i..])
            .filter(|suffix| {
                self.markers
                    .iter()
                    .any(|m| m.len() > suffix.len() && m.starts_with(suffix))
            })
            .map(str::len)
            .max()
            .unwrap_or(0)
    }
}
