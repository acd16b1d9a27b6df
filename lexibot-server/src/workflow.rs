//! The post workflow: generate a word and publish it as a new thread,
//! all-or-nothing from the data model's perspective.

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::generator::{GenerateOutcome, WordPackage};
use crate::platform::PlatformError;
use crate::repository::WordEntry;
use crate::AppState;

#[derive(Debug)]
pub enum PostOutcome {
    Posted(WordEntry),
    /// An item is already pending; nothing was posted.
    Waiting,
}

/// Compose the four-part message set for a generated word:
/// headline, meanings, examples, reply instructions.
pub fn compose_messages(package: &WordPackage) -> [String; 4] {
    let headline = format!("\u{1F4DA} Today's vocabulary word: *{}*", package.word);

    let mut meanings = String::from("*Meanings:*");
    for (i, meaning) in package.meanings.iter().enumerate() {
        meanings.push_str(&format!("\n{}. {}", i + 1, meaning));
    }

    let mut examples = String::from("*Examples:*");
    for example in &package.examples {
        examples.push_str(&format!("\n\u{2022} {}", example));
    }

    let instructions = "Did you already know this word?\n\
         \u{2022} Reply '1' if you already knew it\n\
         \u{2022} Reply with any other message to learn it (you can ask questions about the \
         word, use it in a sentence for feedback, or ask for a phonetic or syllable breakdown \
         of the pronunciation)"
        .to_string();

    [headline, meanings, examples, instructions]
}

/// Generate the next word and post it to a fresh thread.
///
/// Holds the system-wide post lock across the entire generate-through-commit
/// sequence regardless of trigger origin, so a scheduler tick racing a user
/// request cannot double-post: the loser waits, re-evaluates, and finds the
/// freshly created pending item.
///
/// The repository row is written only after every platform post succeeded,
/// making the single insert the commit point. A mid-sequence post failure
/// leaves a human-visible dangling thread (logged) but no durable record, so
/// the next trigger treats the word as still unposted.
pub async fn post_new_word(state: &AppState) -> Result<PostOutcome> {
    let _guard = state.post_lock.lock().await;

    state
        .backend_limiter
        .acquire()
        .map_err(anyhow::Error::new)?;
    state
        .platform_limiter
        .acquire()
        .map_err(anyhow::Error::new)?;

    let package = match state.generator.generate(state.repository.as_ref()).await {
        Ok(GenerateOutcome::Waiting) => return Ok(PostOutcome::Waiting),
        Ok(GenerateOutcome::Generated(package)) => package,
        Err(e) => return Err(anyhow::Error::new(e)),
    };

    let messages = compose_messages(&package);

    let thread_ref = state
        .retry
        .run(
            "create thread",
            || state.platform.create_thread(&messages[0]),
            PlatformError::is_transient,
        )
        .await
        .map_err(anyhow::Error::new)
        .context("failed to create thread for new word")?;

    info!("Created thread {} for word '{}'", thread_ref, package.word);

    for (index, message) in messages[1..].iter().enumerate() {
        let posted = state
            .retry
            .run(
                "post word part",
                || state.platform.post_to_thread(&thread_ref, message),
                PlatformError::is_transient,
            )
            .await;

        if let Err(e) = posted {
            // Already-sent messages cannot be unsent; the dangling thread is
            // an accepted, logged inconsistency. No repository row exists, so
            // the next trigger will post again.
            warn!(
                "Abandoning thread {} after part {} failed: {}",
                thread_ref,
                index + 1,
                e
            );
            return Err(anyhow::Error::new(e)).context("failed to post word part");
        }
    }

    match state
        .repository
        .create_word(&package.word, Some(&thread_ref))
        .await
    {
        Ok(entry) => {
            info!(
                "Posted word '{}' with thread ref {}",
                entry.word, thread_ref
            );
            Ok(PostOutcome::Posted(entry))
        }
        Err(e) => {
            // Messages exist without a record: a durability risk for
            // operators, not something we retry automatically.
            error!(
                "Durability risk: word '{}' was fully posted to thread {} but could not be recorded: {}",
                package.word, thread_ref, e
            );
            Err(anyhow::Error::new(e)).context("failed to record posted word")
        }
    }
}
