//! Input guard for the Thinker stage
//!
//! Two detector families run over the Thinker's input text: prompt
//! injection (attempts to rewrite the model's instructions) and action
//! hijacking (text that tries to name the action the pipeline should take).

use regex::{Regex, RegexBuilder};
use serde::Serialize;

const INJECTION_PATTERNS: &[&str] = &[
    r"ignore (all|previous) instructions",
    r"reveal (the )?(system prompt|prompt)",
    r"bypass",
    r"override",
    r"developer message",
    r"show me your hidden",
    r"api key|credentials|secret",
];

const HIJACK_PATTERNS: &[&str] = &[
    r"\bstop[_ ]?line\b",
    r"\btrigger\b.*\bp1\b",
    r"\bexecute\b.*\balert\b",
    r"\bsend\b.*\bpager\b",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    PromptInjection,
    ActionHijack,
}

impl Detector {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PromptInjection => "prompt_injection",
            Self::ActionHijack => "action_hijack",
        }
    }
}

/// First pattern that matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardHit {
    pub detector: Detector,
    pub pattern: String,
}

pub struct InputGuard {
    detectors: Vec<(Detector, Regex)>,
}

impl InputGuard {
    pub fn new() -> Result<Self, regex::Error> {
        let mut detectors = Vec::with_capacity(INJECTION_PATTERNS.len() + HIJACK_PATTERNS.len());
        for (detector, patterns) in [
            (Detector::PromptInjection, INJECTION_PATTERNS),
            (Detector::ActionHijack, HIJACK_PATTERNS),
        ] {
            for pattern in patterns {
                let re = RegexBuilder::new(pattern).case_insensitive(true).build()?;
                detectors.push((detector, re));
            }
        }
        Ok(Self { detectors })
    }

    /// Injection patterns are checked before hijack patterns.
    pub fn screen(&self, text: &str) -> Option<GuardHit> {
        self.detectors
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(detector, re)| GuardHit {
                detector: *detector,
                pattern: re.as_str().to_string(),
            })
    }
}
