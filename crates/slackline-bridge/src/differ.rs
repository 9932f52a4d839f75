/// Appended by the agent to a reply it is still composing.
pub const TYPING_MARKER: &str = "\n\n_Typing…_";

/// Remove a trailing typing marker. The flag reports whether one was there.
pub fn strip_typing_marker(text: &str) -> (&str, bool) {
    match text.strip_suffix(TYPING_MARKER) {
        Some(stripped) => (stripped, true),
        None => (text, false),
    }
}

/// Truncate at stop strings, applied in list order. A match at index 0 is
/// ignored so a reply cannot be cropped to nothing.
pub fn crop_at_stop_strings<'a>(text: &'a str, stops: &[String]) -> (&'a str, bool) {
    let mut cropped = text;
    let mut hit = false;
    for stop in stops.iter().filter(|s| !s.is_empty()) {
        if let Some(idx) = cropped.find(stop.as_str())
            && idx > 0
        {
            cropped = &cropped[..idx];
            hit = true;
        }
    }
    (cropped, hit)
}

/// Text to emit when the cumulative reply moves from `previous` to `current`.
///
/// `None` means `current` does not extend `previous` (out of order or
/// rewritten) and must be dropped. An unchanged text yields `Some("")`.
pub fn delta<'a>(previous: &str, current: &'a str) -> Option<&'a str> {
    current.strip_prefix(previous)
}

/// Cumulative text of the canonical reply plus the diffing rule above.
#[derive(Debug, Default, Clone)]
pub struct StreamDiffer {
    accumulated: String,
}

impl StreamDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to `current` if it extends the accumulated text. Returns the
    /// new suffix when there is one.
    pub fn advance(&mut self, current: &str) -> Option<String> {
        let suffix = delta(&self.accumulated, current)?;
        if suffix.is_empty() {
            return None;
        }
        let suffix = suffix.to_string();
        self.accumulated = current.to_string();
        Some(suffix)
    }

    /// Take `current` unconditionally. Used when nothing is streamed.
    pub fn replace(&mut self, current: &str) {
        self.accumulated.clear();
        self.accumulated.push_str(current);
    }

    pub fn text(&self) -> &str {
        &self.accumulated
    }

    pub fn is_empty(&self) -> bool {
        self.accumulated.is_empty()
    }

    pub fn reset(&mut self) {
        self.accumulated.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_only_trailing_marker() {
        assert_eq!(strip_typing_marker("Hello\n\n_Typing…_"), ("Hello", true));
        assert_eq!(strip_typing_marker("Hello"), ("Hello", false));
        assert_eq!(
            strip_typing_marker("\n\n_Typing…_ and more"),
            ("\n\n_Typing…_ and more", false)
        );
    }

    #[test]
    fn crops_at_first_stop_string() {
        let stops = vec!["\nH: ".to_string(), "<EOT>".to_string()];
        assert_eq!(
            crop_at_stop_strings("Sure thing.\nH: next turn", &stops),
            ("Sure thing.", true)
        );
        assert_eq!(
            crop_at_stop_strings("done<EOT> trailing\nH: x", &stops),
            ("done", true)
        );
        assert_eq!(crop_at_stop_strings("clean text", &stops), ("clean text", false));
    }

    #[test]
    fn stop_string_at_start_is_ignored() {
        let stops = vec!["<EOT>".to_string()];
        assert_eq!(crop_at_stop_strings("<EOT>tail", &stops), ("<EOT>tail", false));
    }

    #[test]
    fn equal_text_is_a_noop() {
        assert_eq!(delta("abc", "abc"), Some(""));
        let mut differ = StreamDiffer::new();
        differ.replace("abc");
        assert_eq!(differ.advance("abc"), None);
        assert_eq!(differ.text(), "abc");
    }

    #[test]
    fn regression_leaves_state_unchanged() {
        let cases = [("Hello world", "Hello"), ("abc", "abd"), ("abc", "xabc"), ("x", "")];
        for (previous, current) in cases {
            assert_eq!(delta(previous, current), None, "{previous:?} -> {current:?}");
            let mut differ = StreamDiffer::new();
            differ.replace(previous);
            assert_eq!(differ.advance(current), None);
            assert_eq!(differ.text(), previous);
        }
    }

    #[test]
    fn deltas_reconstruct_the_final_text() {
        let updates = ["He", "Hello", "Hello", "Hel", "Hello wor", "Hello world!"];
        let mut differ = StreamDiffer::new();
        let mut emitted = String::new();
        for update in updates {
            if let Some(suffix) = differ.advance(update) {
                emitted.push_str(&suffix);
            }
        }
        assert_eq!(emitted, "Hello world!");
        assert_eq!(differ.text(), "Hello world!");
    }

    #[test]
    fn suffix_is_exact() {
        let mut differ = StreamDiffer::new();
        differ.replace("Hello");
        assert_eq!(differ.advance("Hello world").as_deref(), Some(" world"));
    }
}
