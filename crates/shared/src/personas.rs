//! Personality registry: the fixed set of personas a turn may be relayed
//! through, each carrying its steering prompt and sampling parameters.
//!
//! The registry is built once at startup and shared immutably; tests build
//! their own instead of mutating a process-wide table.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_MAX_TOKENS: u32 = 1_000;
const MAX_TEMPERATURE: f32 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Personality {
    pub key: String,
    pub display_name: String,
    pub system_prompt: String,
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("personality registry must not be empty")]
    Empty,
    #[error("personality key must not be blank")]
    BlankKey,
    #[error("personality key {0:?} has surrounding whitespace")]
    UntrimmedKey(String),
    #[error("duplicate personality key {0}")]
    DuplicateKey(String),
    #[error("personality {0} has a blank system prompt")]
    BlankPrompt(String),
    #[error("personality {key} has temperature {value} outside 0..=2")]
    InvalidTemperature { key: String, value: f32 },
    #[error("personality {0} must allow at least one output token")]
    InvalidMaxTokens(String),
    #[error("failed to read personalities file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse personalities file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PersonalityRegistry {
    entries: Vec<Personality>,
    index: HashMap<String, usize>,
}

impl PersonalityRegistry {
    pub fn new(entries: Vec<Personality>) -> Result<Self, PersonaError> {
        if entries.is_empty() {
            return Err(PersonaError::Empty);
        }

        let mut index = HashMap::with_capacity(entries.len());
        for (position, personality) in entries.iter().enumerate() {
            validate_personality(personality)?;
            if index.insert(personality.key.clone(), position).is_some() {
                return Err(PersonaError::DuplicateKey(personality.key.clone()));
            }
        }

        Ok(Self { entries, index })
    }

    pub fn builtin() -> Self {
        let entries = builtin_personalities();
        let index = entries
            .iter()
            .enumerate()
            .map(|(position, personality)| (personality.key.clone(), position))
            .collect();
        Self { entries, index }
    }

    /// Loads a JSON array of personalities, e.g.
    /// `[{"key": "jarvis", "display_name": "Jarvis", "system_prompt": "...", "temperature": 0.7}]`.
    pub fn from_json_file(path: &Path) -> Result<Self, PersonaError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, PersonaError> {
        let entries: Vec<Personality> = serde_json::from_str(raw)?;
        Self::new(entries)
    }

    pub fn lookup(&self, key: &str) -> Option<&Personality> {
        self.index
            .get(key)
            .and_then(|position| self.entries.get(*position))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Personality> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|personality| personality.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_personality(personality: &Personality) -> Result<(), PersonaError> {
    if personality.key.trim().is_empty() {
        return Err(PersonaError::BlankKey);
    }
    // Request keys are trimmed before lookup, so a padded key is unreachable.
    if personality.key.trim() != personality.key {
        return Err(PersonaError::UntrimmedKey(personality.key.clone()));
    }
    if personality.system_prompt.trim().is_empty() {
        return Err(PersonaError::BlankPrompt(personality.key.clone()));
    }
    if !personality.temperature.is_finite()
        || !(0.0..=MAX_TEMPERATURE).contains(&personality.temperature)
    {
        return Err(PersonaError::InvalidTemperature {
            key: personality.key.clone(),
            value: personality.temperature,
        });
    }
    if personality.max_tokens == 0 {
        return Err(PersonaError::InvalidMaxTokens(personality.key.clone()));
    }
    Ok(())
}

fn builtin_personalities() -> Vec<Personality> {
    vec![
        Personality {
            key: "jarvis".to_string(),
            display_name: "Jarvis".to_string(),
            system_prompt: "You are Jarvis, a superintelligent and witty AI assistant. Answer \
                            clearly and efficiently, with a dry touch of sarcasm."
                .to_string(),
            temperature: 0.7,
            max_tokens: DEFAULT_MAX_TOKENS,
        },
        Personality {
            key: "calm-guru".to_string(),
            display_name: "Calm Guru".to_string(),
            system_prompt: "You are Calm Guru, a wise and gentle mentor. Speak slowly and \
                            peacefully in short, simple, calming sentences. Never rush."
                .to_string(),
            temperature: 0.4,
            max_tokens: DEFAULT_MAX_TOKENS,
        },
        Personality {
            key: "vegeta".to_string(),
            display_name: "Vegeta".to_string(),
            system_prompt: "You are Vegeta, the proud Saiyan prince. Be blunt and intense, and \
                            always push the user to become stronger."
                .to_string(),
            temperature: 0.9,
            max_tokens: DEFAULT_MAX_TOKENS,
        },
        Personality {
            key: "sage".to_string(),
            display_name: "Sage".to_string(),
            system_prompt: "You are Sage, a thoughtful philosopher. Offer balanced perspective, \
                            ask a clarifying question when it helps, and keep answers grounded."
                .to_string(),
            temperature: 0.5,
            max_tokens: DEFAULT_MAX_TOKENS,
        },
    ]
}
