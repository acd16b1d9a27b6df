//! Vocabulary item generation.
//!
//! Builds the generation prompt from history, calls the generative backend
//! through the retry policy, validates the structured output, and enforces
//! case-insensitive uniqueness with a bounded regeneration loop.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use lexibot_core::prompts;
use lexibot_core::{BackendError, CompletionBackend, CompletionRequest};

use crate::repository::{RepositoryError, Resolution, VocabRepository, WordFilter};
use crate::retry::RetryPolicy;

/// How many generate-and-check cycles to run before giving up on a unique
/// word.
const UNIQUENESS_ATTEMPTS: u32 = 5;
/// How many malformed backend responses to tolerate per candidate.
const PARSE_ATTEMPTS: u32 = 3;

/// A structurally valid generated item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordPackage {
    pub word: String,
    pub meanings: Vec<String>,
    pub examples: Vec<String>,
}

#[derive(Debug)]
pub enum GenerateOutcome {
    Generated(WordPackage),
    /// An item is already pending a response; nothing to do.
    Waiting,
}

#[derive(Debug)]
pub enum GenerateError {
    /// Transport failure after the retry budget.
    Backend(BackendError),
    /// The backend kept returning output we could not parse.
    Malformed { attempts: u32 },
    /// Every candidate collided with history.
    NoUniqueWord { attempts: u32 },
    Repository(RepositoryError),
}

impl fmt::Display for GenerateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "generation failed: {}", e),
            Self::Malformed { attempts } => {
                write!(f, "generation failed: malformed output after {} attempts", attempts)
            }
            Self::NoUniqueWord { attempts } => {
                write!(f, "no unique word found after {} attempts", attempts)
            }
            Self::Repository(e) => write!(f, "generation failed: {}", e),
        }
    }
}

impl std::error::Error for GenerateError {}

impl From<RepositoryError> for GenerateError {
    fn from(e: RepositoryError) -> Self {
        Self::Repository(e)
    }
}

pub struct WordGenerator {
    backend: Arc<dyn CompletionBackend>,
    retry: RetryPolicy,
    temperature: f32,
    max_tokens: u32,
}

impl WordGenerator {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        retry: RetryPolicy,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            backend,
            retry,
            temperature,
            max_tokens,
        }
    }

    /// Generate the next vocabulary item.
    ///
    /// Returns `Waiting` without side effects when the latest item is still
    /// pending a response.
    pub async fn generate(
        &self,
        repository: &dyn VocabRepository,
    ) -> Result<GenerateOutcome, GenerateError> {
        if repository.latest_resolution().await? == Some(Resolution::Pending) {
            info!("Latest word still awaiting a response, not generating");
            return Ok(GenerateOutcome::Waiting);
        }

        let history = repository.list_words(WordFilter::All).await?;
        let existing: Vec<String> = history.iter().map(|w| w.word.clone()).collect();
        let known: Vec<String> = history
            .iter()
            .filter(|w| w.resolution == Resolution::Known)
            .map(|w| w.word.clone())
            .collect();
        let learning: Vec<String> = history
            .iter()
            .filter(|w| w.resolution == Resolution::Learning)
            .map(|w| w.word.clone())
            .collect();

        let theme = repository.current_theme().await?;
        if let Some(theme) = &theme {
            info!("Generating word with theme: {}", theme);
        }

        for attempt in 0..UNIQUENESS_ATTEMPTS {
            let package = self
                .generate_candidate(&existing, &known, &learning, theme.as_deref())
                .await?;

            if repository.find_by_word(&package.word).await?.is_none() {
                info!("Generated unique word: {}", package.word);
                return Ok(GenerateOutcome::Generated(package));
            }

            warn!(
                "Generated duplicate word '{}' (attempt {}/{})",
                package.word,
                attempt + 1,
                UNIQUENESS_ATTEMPTS
            );
        }

        Err(GenerateError::NoUniqueWord {
            attempts: UNIQUENESS_ATTEMPTS,
        })
    }

    /// One backend round trip producing a structurally valid package.
    ///
    /// Transient transport failures are retried by the policy; malformed
    /// output retries the call with the same backoff schedule up to
    /// `PARSE_ATTEMPTS`.
    async fn generate_candidate(
        &self,
        existing: &[String],
        known: &[String],
        learning: &[String],
        theme: Option<&str>,
    ) -> Result<WordPackage, GenerateError> {
        let prompt = prompts::word_generation_prompt(existing, known, learning, theme);

        for parse_attempt in 0..PARSE_ATTEMPTS {
            let request = CompletionRequest {
                system_prompt: prompts::system_prompt(),
                prompt: prompt.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            };

            let backend = Arc::clone(&self.backend);
            let raw = self
                .retry
                .run(
                    "word generation call",
                    move || {
                        let backend = Arc::clone(&backend);
                        let request = request.clone();
                        async move { backend.complete(request).await }
                    },
                    BackendError::is_transient,
                )
                .await
                .map_err(GenerateError::Backend)?;

            if let Some(package) = parse_word_response(&raw) {
                return Ok(package);
            }

            warn!(
                "Backend returned malformed word output (attempt {}/{})",
                parse_attempt + 1,
                PARSE_ATTEMPTS
            );
            if parse_attempt + 1 < PARSE_ATTEMPTS {
                tokio::time::sleep(self.retry.delay_for(parse_attempt)).await;
            }
        }

        Err(GenerateError::Malformed {
            attempts: PARSE_ATTEMPTS,
        })
    }
}

/// Strip Markdown code fences some backends wrap JSON in.
fn strip_code_fences(raw: &str) -> &str {
    let mut cleaned = raw.trim();
    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest;
    }
    cleaned.trim()
}

/// Coerce a JSON field into a trimmed string list.
///
/// A scalar becomes a single-element list; empty strings are dropped.
fn coerce_string_list(value: &serde_json::Value) -> Option<Vec<String>> {
    let items: Vec<String> = match value {
        serde_json::Value::Array(values) => values
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .collect(),
        serde_json::Value::String(s) => vec![s.trim().to_string()],
        _ => return None,
    };

    let items: Vec<String> = items.into_iter().filter(|s| !s.is_empty()).collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Extract a `WordPackage` from the backend's raw response.
///
/// Returns `None` (triggering a regeneration) when the response is not JSON
/// or any required field is missing or empty.
pub fn parse_word_response(raw: &str) -> Option<WordPackage> {
    let cleaned = strip_code_fences(raw);
    let value: serde_json::Value = serde_json::from_str(cleaned).ok()?;

    let word = value.get("word")?.as_str()?.trim().to_string();
    if word.is_empty() {
        return None;
    }

    let meanings = coerce_string_list(value.get("meanings")?)?;
    let examples = coerce_string_list(value.get("examples")?)?;

    Some(WordPackage {
        word,
        meanings,
        examples,
    })
}
