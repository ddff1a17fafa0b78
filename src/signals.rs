//! Marker and signal parsing from agent output.
//!
//! Completion is declared only by a well-formed
//! `<phase_complete>true</phase_complete>` marker (case-sensitive, whitespace
//! tolerated inside the tag body). Output may additionally carry
//! `<progress>N%</progress>` and `<blocker>description</blocker>` tags.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static COMPLETION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<phase_complete>\s*true\s*</phase_complete>").unwrap());

static PROGRESS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<progress>\s*(\d{1,3})%?\s*</progress>").unwrap());

static BLOCKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<blocker>(.*?)</blocker>").unwrap());

/// Whether the agent declared phase completion anywhere in `output`.
pub fn completion_declared(output: &str) -> bool {
    COMPLETION_REGEX.is_match(output)
}

/// Signals extracted from one iteration's output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IterationSignals {
    /// Progress percentages in order of appearance, clamped to 100.
    pub progress: Vec<u8>,
    /// Blocker descriptions, trimmed, empties dropped.
    pub blockers: Vec<String>,
}

impl IterationSignals {
    pub fn latest_progress(&self) -> Option<u8> {
        self.progress.last().copied()
    }

    pub fn has_signals(&self) -> bool {
        !self.progress.is_empty() || !self.blockers.is_empty()
    }
}

/// Extract all signals from the given text.
pub fn extract_signals(text: &str) -> IterationSignals {
    let mut signals = IterationSignals::default();

    for cap in PROGRESS_REGEX.captures_iter(text) {
        if let Some(value) = cap.get(1)
            && let Ok(pct) = value.as_str().parse::<u8>()
        {
            signals.progress.push(pct.min(100));
        }
    }

    for cap in BLOCKER_REGEX.captures_iter(text) {
        if let Some(desc) = cap.get(1) {
            let description = desc.as_str().trim();
            if !description.is_empty() {
                signals.blockers.push(description.to_string());
            }
        }
    }

    signals
}

/// Last non-empty line of the output, used as an error signature for
/// stuck detection.
pub fn error_signature(output: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}

/// Detects phases that repeat the same failure: `observe` returns true once
/// `threshold` consecutive iterations produced an identical signature.
#[derive(Debug, Clone)]
pub struct StuckTracker {
    threshold: u32,
    last: Option<String>,
    streak: u32,
}

impl StuckTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            last: None,
            streak: 0,
        }
    }

    /// Feed one iteration's error signature. A missing signature resets the
    /// streak.
    pub fn observe(&mut self, signature: Option<&str>) -> bool {
        match signature {
            Some(sig) if self.last.as_deref() == Some(sig) => {
                self.streak += 1;
            }
            Some(sig) => {
                self.last = Some(sig.to_string());
                self.streak = 1;
            }
            None => {
                self.last = None;
                self.streak = 0;
            }
        }
        self.streak >= self.threshold
    }

    pub fn signature(&self) -> Option<&str> {
        self.last.as_deref()
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_marker_detected() {
        assert!(completion_declared(
            "work done\n<phase_complete>true</phase_complete>\n"
        ));
    }

    #[test]
    fn test_completion_marker_with_whitespace() {
        assert!(completion_declared(
            "<phase_complete>  true  </phase_complete>"
        ));
        assert!(completion_declared("<phase_complete>\n true \n</phase_complete>"));
    }

    #[test]
    fn test_false_marker_not_detected() {
        assert!(!completion_declared(
            "<phase_complete>false</phase_complete>"
        ));
    }

    #[test]
    fn test_partial_marker_not_detected() {
        assert!(!completion_declared("<phase_complete>true"));
        assert!(!completion_declared("phase_complete true"));
    }

    #[test]
    fn test_marker_is_case_sensitive() {
        assert!(!completion_declared(
            "<Phase_Complete>true</Phase_Complete>"
        ));
        assert!(!completion_declared("<phase_complete>TRUE</phase_complete>"));
    }

    #[test]
    fn test_parse_progress_with_percent() {
        let signals = extract_signals("Working... <progress>50%</progress> so far.");
        assert_eq!(signals.progress, vec![50]);
    }

    #[test]
    fn test_parse_progress_clamps_to_100() {
        let signals = extract_signals("<progress>150%</progress>");
        assert_eq!(signals.progress, vec![100]);
    }

    #[test]
    fn test_parse_multiple_progress() {
        let signals = extract_signals("<progress>25</progress> then <progress>75%</progress>");
        assert_eq!(signals.progress, vec![25, 75]);
        assert_eq!(signals.latest_progress(), Some(75));
    }

    #[test]
    fn test_parse_blocker() {
        let signals = extract_signals("<blocker>  Need API key  </blocker>");
        assert_eq!(signals.blockers, vec!["Need API key".to_string()]);
    }

    #[test]
    fn test_empty_blocker_ignored() {
        let signals = extract_signals("<blocker>   </blocker>");
        assert!(signals.blockers.is_empty());
        assert!(!signals.has_signals());
    }

    #[test]
    fn test_error_signature_is_last_nonempty_line() {
        let out = "step one\nerror: permission denied /x\n\n  \n";
        assert_eq!(
            error_signature(out).as_deref(),
            Some("error: permission denied /x")
        );
        assert!(error_signature("\n\n").is_none());
    }

    #[test]
    fn test_stuck_tracker_trips_on_third_identical() {
        let mut tracker = StuckTracker::new(3);
        assert!(!tracker.observe(Some("permission denied /x")));
        assert!(!tracker.observe(Some("permission denied /x")));
        assert!(tracker.observe(Some("permission denied /x")));
        assert_eq!(tracker.signature(), Some("permission denied /x"));
    }

    #[test]
    fn test_stuck_tracker_resets_on_new_signature() {
        let mut tracker = StuckTracker::new(3);
        assert!(!tracker.observe(Some("err A")));
        assert!(!tracker.observe(Some("err A")));
        assert!(!tracker.observe(Some("err B")));
        assert!(!tracker.observe(Some("err B")));
        assert!(tracker.observe(Some("err B")));
    }

    #[test]
    fn test_stuck_tracker_resets_on_missing_signature() {
        let mut tracker = StuckTracker::new(3);
        tracker.observe(Some("err"));
        tracker.observe(Some("err"));
        assert!(!tracker.observe(None));
        assert_eq!(tracker.streak(), 0);
    }
}
