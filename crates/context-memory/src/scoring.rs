//! Importance scoring: assigns each message a scalar in [0,1] from weighted,
//! independently-normalized signals. Deterministic for a fixed (message, now)
//! pair; no hidden randomness.

use crate::memory::{Message, Role};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Emotion-bearing lexical markers.
    static ref EMOTION_RE: Regex = Regex::new(concat!(
        r"(?i)\b(excited|happy|sad|angry|frustrated|grateful|surprised|shocked",
        r"|disappointed|thrilled|worried|concerned|amazed|disgusted|furious",
        r"|delighted|love|hate|afraid|scared|proud|anxious)\b",
    )).unwrap();

    /// Date-like tokens that count as factual content even without digits.
    static ref DATE_RE: Regex = Regex::new(concat!(
        r"(?i)\b(january|february|march|april|may|june|july|august|september",
        r"|october|november|december|monday|tuesday|wednesday|thursday|friday",
        r"|saturday|sunday|today|tomorrow|yesterday)\b",
    )).unwrap();
}

/// Minimum score for any message. Empty text lands exactly here so it stays
/// searchable but is first to go under compression.
pub const MIN_SCORE_FLOOR: f32 = 0.05;

#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub emotional_weight: f32,
    pub factual_weight: f32,
    pub length_weight: f32,
    pub recency_weight: f32,
    /// Horizon over which the recency signal decays to zero, in seconds.
    pub recency_horizon_seconds: f32,
    pub system_prior: f32,
    pub user_prior: f32,
    pub assistant_prior: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            emotional_weight: 0.3,
            factual_weight: 0.3,
            length_weight: 0.15,
            recency_weight: 0.25,
            recency_horizon_seconds: 24.0 * 3600.0,
            system_prior: 1.0,
            user_prior: 0.8,
            assistant_prior: 0.6,
        }
    }
}

pub struct ImportanceScorer {
    config: ScoringConfig,
}

impl Default for ImportanceScorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

impl ImportanceScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Score a message as of `now`. Scores are recomputed whole whenever any
    /// input changes, never incrementally adjusted.
    pub fn score(&self, message: &Message, now: DateTime<Utc>) -> f32 {
        if message.text.trim().is_empty() {
            return MIN_SCORE_FLOOR;
        }

        let weighted = self.config.emotional_weight * self.emotional_intensity(&message.text)
            + self.config.factual_weight * self.factual_density(&message.text)
            + self.config.length_weight * self.length_factor(&message.text)
            + self.config.recency_weight * self.recency(message.timestamp, now);

        let prior = match message.role {
            Role::System => self.config.system_prior,
            Role::User => self.config.user_prior,
            Role::Assistant => self.config.assistant_prior,
        };

        (weighted * prior).clamp(MIN_SCORE_FLOOR, 1.0)
    }

    /// Convenience wrapper scoring against the current wall clock.
    pub fn score_now(&self, message: &Message) -> f32 {
        self.score(message, Utc::now())
    }

    /// Emotion marker count normalized by word count, capped at 1.
    fn emotional_intensity(&self, text: &str) -> f32 {
        let words = text.split_whitespace().count().max(1) as f32;
        let hits = EMOTION_RE.find_iter(text).count() as f32;
        (hits * 4.0 / words).min(1.0)
    }

    /// Numerals, dates, and proper-noun-like tokens, normalized by length.
    fn factual_density(&self, text: &str) -> f32 {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let total = tokens.len().max(1) as f32;
        let mut mass = 0.0f32;
        for (idx, token) in tokens.iter().enumerate() {
            if token.chars().any(|c| c.is_ascii_digit()) {
                mass += 0.5;
            } else if idx > 0
                && token.len() > 4
                && token.chars().next().is_some_and(|c| c.is_uppercase())
            {
                // Mid-sentence capitalized long token: likely a proper noun.
                mass += 0.3;
            }
        }
        mass += 0.3 * DATE_RE.find_iter(text).count() as f32;
        (mass * 4.0 / total).min(1.0)
    }

    fn length_factor(&self, text: &str) -> f32 {
        (text.chars().count() as f32 / 200.0).min(1.0)
    }

    /// Monotonically decreasing in age; never negative, never above 1.
    fn recency(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
        let age = (now - timestamp).num_seconds().max(0) as f32;
        (1.0 - age / self.config.recency_horizon_seconds).clamp(0.0, 1.0)
    }
}
