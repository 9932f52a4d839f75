use regex::Regex;
use slackline_common::{Error, Result};
use slackline_config::BridgeConfig;

/// Content checks that make the bridge discard a reply and ask again.
///
/// Compiled once per [`crate::Bridge`] and shared by every session.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    min_length: usize,
    blacklist: Option<Regex>,
    blacklist_threshold: usize,
    prebuffer_length: usize,
}

impl ContentFilter {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let patterns: Vec<&str> = config
            .blacklist
            .iter()
            .map(String::as_str)
            .filter(|p| !p.is_empty())
            .collect();

        let blacklist = if patterns.is_empty() || config.blacklist_threshold == 0 {
            None
        } else {
            let union = format!(r"(?i)\b(?:{})\b", patterns.join("|"));
            let regex = Regex::new(&union)
                .map_err(|e| Error::Config(format!("invalid bridge.blacklist pattern: {e}")))?;
            Some(regex)
        };

        Ok(Self {
            min_length: config.min_length,
            blacklist,
            blacklist_threshold: config.blacklist_threshold,
            prebuffer_length: config.prebuffer_length,
        })
    }

    /// Whether `text` should be discarded. The length check only applies to
    /// finished replies; the blacklist applies to partial text too.
    pub fn should_reject(&self, text: &str, is_final: bool) -> bool {
        if is_final && self.min_length > 0 && text.chars().count() < self.min_length {
            return true;
        }
        self.blacklist.is_some() && self.blacklist_matches(text) >= self.blacklist_threshold
    }

    pub fn blacklist_matches(&self, text: &str) -> usize {
        self.blacklist
            .as_ref()
            .map_or(0, |regex| regex.find_iter(text).count())
    }

    /// Uncommitted replies are only filtered while this short; past it they
    /// are trusted and may start streaming.
    pub fn in_prebuffer(&self, text: &str) -> bool {
        text.chars().count() <= self.prebuffer_length
    }
}
