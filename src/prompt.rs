//! Prompt cleanup and validation, applied before any rate budget is spent.

use crate::error::InvalidPromptError;

pub const MIN_PROMPT_CHARS: usize = 3;
pub const MAX_PROMPT_CHARS: usize = 1000;

/// Each pair blocks prompts containing the first word followed, anywhere
/// later, by the second.
const BLOCKED_SEQUENCES: &[(&str, &str)] = &[("child", "porn"), ("kill", "yourself")];

#[derive(Debug, Clone)]
pub struct PromptRules {
    pub min_chars: usize,
    pub max_chars: usize,
    blocked: Vec<(String, String)>,
}

impl Default for PromptRules {
    fn default() -> Self {
        Self {
            min_chars: MIN_PROMPT_CHARS,
            max_chars: MAX_PROMPT_CHARS,
            blocked: BLOCKED_SEQUENCES
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        }
    }
}

impl PromptRules {
    pub fn with_blocked(mut self, first: &str, then: &str) -> Self {
        self.blocked
            .push((first.to_lowercase(), then.to_lowercase()));
        self
    }

    /// Return the cleaned prompt: control characters removed (newlines and
    /// tabs become spaces) and surrounding whitespace trimmed.
    pub fn validate(&self, prompt: &str) -> Result<String, InvalidPromptError> {
        let cleaned: String = prompt
            .chars()
            .filter_map(|c| match c {
                '\n' | '\r' | '\t' => Some(' '),
                c if c.is_control() => None,
                c => Some(c),
            })
            .collect();
        let cleaned = cleaned.trim();

        if cleaned.is_empty() {
            return Err(InvalidPromptError::Empty);
        }

        let length = cleaned.chars().count();
        if length < self.min_chars {
            return Err(InvalidPromptError::TooShort {
                min: self.min_chars,
            });
        }
        if length > self.max_chars {
            return Err(InvalidPromptError::TooLong {
                max: self.max_chars,
            });
        }

        let lowered = cleaned.to_lowercase();
        for (first, then) in &self.blocked {
            let hit = lowered
                .find(first.as_str())
                .map(|at| lowered[at + first.len()..].contains(then.as_str()))
                .unwrap_or(false);
            if hit {
                tracing::warn!("Rejected prompt matching blocked pattern '{}…{}'", first, then);
                return Err(InvalidPromptError::Blocked);
            }
        }

        Ok(cleaned.to_string())
    }
}
