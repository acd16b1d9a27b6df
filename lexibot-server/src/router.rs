//! The interaction router: classifies each inbound message against the item
//! referenced by its thread and drives the known/learning/theme-update/
//! new-item transitions.
//!
//! Idempotency contract: an event is claimed (durably marked) before its
//! side effects run, so concurrent deliveries of the same key have exactly
//! one winner; a fatal failure releases the claim so a redelivery can retry.
//! Rate-limit denials happen before the claim, leaving the event unmarked.

use anyhow::Result;
use tracing::{info, warn};

use crate::platform::PlatformError;
use crate::rate_limit::RateLimited;
use crate::repository::{RecordOutcome, Resolution, ThreadRef, WordEntry};
use crate::workflow::{self, PostOutcome};
use crate::{tutor, AppState};

/// Maximum theme length in Unicode scalar values.
const THEME_MAX_CHARS: usize = 100;

const KNOWN_ACK: &str =
    "Great! You already knew that word. I'll post a new word for you shortly.";
const NEW_WORD_ACK: &str = "I'll post a new word for you shortly!";
const THEME_SET_ACK: &str = "Theme updated! New words will follow the theme: ";
const THEME_CLEARED_ACK: &str = "Theme cleared. New words will not follow any theme.";
const THEME_TOO_LONG: &str =
    "That theme is too long. Please keep it to 100 characters or fewer.";

/// A normalized inbound event.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub thread_ref: Option<ThreadRef>,
    pub user_id: String,
    pub text: String,
    pub event_type: String,
    pub dedup_key: DedupKey,
}

/// Deduplication key derived from the event envelope; `NonIdempotent` is the
/// logged fallback when no signal was available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupKey {
    Key(String),
    NonIdempotent,
}

/// What handling an event did, reported to the webhook layer.
#[derive(Debug, PartialEq, Eq)]
pub enum RouterOutcome {
    /// Already handled (idempotency hit); prior success reported.
    Duplicate,
    /// Not a recognized thread; not an error.
    Ignored,
    ThemeSet,
    ThemeCleared,
    ThemeRejected,
    MarkedKnown { next_word_posted: bool },
    TutorReplied,
    /// A different item is still pending; the user was redirected to it.
    RedirectedToPending,
    NewWordRequested { posted: bool },
}

/// Per-thread state, keyed by the associated item.
enum ThreadState {
    NoItem,
    ThemeThread,
    PendingFirstResponse(WordEntry),
    Resolved(WordEntry),
}

/// A literal "1" (trimmed) asks for a new word.
fn is_new_word_request(text: &str) -> bool {
    text.trim() == "1"
}

enum ThemeUpdate {
    Set(String),
    Clear,
    TooLong,
}

fn parse_theme_update(text: &str) -> ThemeUpdate {
    let trimmed = text.trim();
    if trimmed.chars().count() > THEME_MAX_CHARS {
        return ThemeUpdate::TooLong;
    }
    let lowered = trimmed.to_lowercase();
    if matches!(
        lowered.as_str(),
        "" | "clear" | "reset" | "none" | "no theme" | "clear theme"
    ) {
        ThemeUpdate::Clear
    } else {
        ThemeUpdate::Set(trimmed.to_string())
    }
}

async fn classify_thread(state: &AppState, thread_ref: &ThreadRef) -> Result<ThreadState> {
    if let Some(entry) = state.repository.find_by_thread(thread_ref).await? {
        if entry.resolution.is_pending() {
            return Ok(ThreadState::PendingFirstResponse(entry));
        }
        return Ok(ThreadState::Resolved(entry));
    }

    if state.repository.theme_thread().await?.as_ref() == Some(thread_ref) {
        return Ok(ThreadState::ThemeThread);
    }

    Ok(ThreadState::NoItem)
}

/// Claim the event's idempotency key. Returns false when another worker
/// already claimed it (the Conflict no-op case).
async fn claim(state: &AppState, event: &InboundEvent) -> Result<bool> {
    match &event.dedup_key {
        DedupKey::Key(key) => {
            let outcome = state.dedup.mark_processed(key, &event.event_type).await?;
            Ok(outcome == RecordOutcome::Recorded)
        }
        DedupKey::NonIdempotent => Ok(true),
    }
}

/// Release a claim after a fatal failure so a redelivery can retry.
async fn unclaim(state: &AppState, event: &InboundEvent) {
    if let DedupKey::Key(key) = &event.dedup_key {
        if let Err(e) = state.dedup.release(key).await {
            warn!("Failed to release claim for {}: {}", key, e);
        }
    }
}

async fn post_reply(state: &AppState, thread_ref: &ThreadRef, text: &str) -> Result<()> {
    state
        .retry
        .run(
            "post reply",
            || state.platform.post_to_thread(thread_ref, text),
            PlatformError::is_transient,
        )
        .await
        .map_err(anyhow::Error::new)?;
    Ok(())
}

/// Central router for all inbound message events.
pub async fn handle_inbound(state: &AppState, event: InboundEvent) -> Result<RouterOutcome> {
    match &event.dedup_key {
        DedupKey::Key(key) => {
            if state.dedup.is_duplicate(key).await? {
                info!("Duplicate event {}; reporting prior success", key);
                return Ok(RouterOutcome::Duplicate);
            }
        }
        DedupKey::NonIdempotent => {
            warn!(
                "Event from user {} carries no idempotency signal; processing without dedup",
                event.user_id
            );
        }
    }

    let Some(thread_ref) = event.thread_ref.clone() else {
        return Ok(RouterOutcome::Ignored);
    };

    match classify_thread(state, &thread_ref).await? {
        ThreadState::NoItem => {
            info!("No item for thread {}; ignoring", thread_ref);
            Ok(RouterOutcome::Ignored)
        }
        ThreadState::ThemeThread => handle_theme_update(state, &event, &thread_ref).await,
        ThreadState::PendingFirstResponse(entry) => {
            handle_first_response(state, &event, &thread_ref, entry).await
        }
        ThreadState::Resolved(entry) => handle_followup(state, &event, &thread_ref, entry).await,
    }
}

async fn handle_theme_update(
    state: &AppState,
    event: &InboundEvent,
    thread_ref: &ThreadRef,
) -> Result<RouterOutcome> {
    state
        .platform_limiter
        .acquire()
        .map_err(anyhow::Error::new)?;

    if !claim(state, event).await? {
        return Ok(RouterOutcome::Duplicate);
    }

    let result: Result<RouterOutcome> = async {
        match parse_theme_update(&event.text) {
            ThemeUpdate::TooLong => {
                post_reply(state, thread_ref, THEME_TOO_LONG).await?;
                Ok(RouterOutcome::ThemeRejected)
            }
            ThemeUpdate::Clear => {
                state.repository.set_current_theme(None).await?;
                post_reply(state, thread_ref, THEME_CLEARED_ACK).await?;
                info!("Theme cleared");
                Ok(RouterOutcome::ThemeCleared)
            }
            ThemeUpdate::Set(theme) => {
                state.repository.set_current_theme(Some(&theme)).await?;
                post_reply(state, thread_ref, &format!("{}{}", THEME_SET_ACK, theme)).await?;
                info!("Theme updated to '{}'", theme);
                Ok(RouterOutcome::ThemeSet)
            }
        }
    }
    .await;

    if result.is_err() {
        unclaim(state, event).await;
    }
    result
}

async fn handle_first_response(
    state: &AppState,
    event: &InboundEvent,
    thread_ref: &ThreadRef,
    entry: WordEntry,
) -> Result<RouterOutcome> {
    state
        .platform_limiter
        .acquire()
        .map_err(anyhow::Error::new)?;

    if is_new_word_request(&event.text) {
        if !claim(state, event).await? {
            return Ok(RouterOutcome::Duplicate);
        }

        let result: Result<()> = async {
            state
                .repository
                .set_resolution(entry.id, Resolution::Known)
                .await?;
            info!("User knew the word '{}'", entry.word);
            post_reply(state, thread_ref, KNOWN_ACK).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            unclaim(state, event).await;
            return Err(e);
        }

        let next_word_posted = advance_to_next_word(state).await;
        return Ok(RouterOutcome::MarkedKnown { next_word_posted });
    }

    // Any other first reply means the user is learning the word.
    state
        .backend_limiter
        .acquire()
        .map_err(anyhow::Error::new)?;

    if !claim(state, event).await? {
        return Ok(RouterOutcome::Duplicate);
    }

    let result: Result<RouterOutcome> = async {
        state
            .repository
            .set_resolution(entry.id, Resolution::Learning)
            .await?;
        info!("User is learning the word '{}'", entry.word);

        let reply = tutor::tutor_reply(state, &entry, thread_ref, &event.text).await;
        post_reply(state, thread_ref, &reply).await?;
        Ok(RouterOutcome::TutorReplied)
    }
    .await;

    if result.is_err() {
        unclaim(state, event).await;
    }
    result
}

async fn handle_followup(
    state: &AppState,
    event: &InboundEvent,
    thread_ref: &ThreadRef,
    entry: WordEntry,
) -> Result<RouterOutcome> {
    state
        .platform_limiter
        .acquire()
        .map_err(anyhow::Error::new)?;

    if is_new_word_request(&event.text) {
        if !claim(state, event).await? {
            return Ok(RouterOutcome::Duplicate);
        }

        let result: Result<RouterOutcome> = async {
            // An explicit request for a new item, but only when nothing is
            // already waiting for a response.
            if let Some(latest) = state.repository.find_latest().await? {
                if latest.resolution.is_pending() {
                    info!(
                        "User asked for a new word while '{}' is still pending",
                        latest.word
                    );
                    post_reply(
                        state,
                        thread_ref,
                        &format!(
                            "There's already a new word waiting for you! Please respond to \
                             '{}' in its thread before requesting another word.",
                            latest.word
                        ),
                    )
                    .await?;
                    return Ok(RouterOutcome::RedirectedToPending);
                }
            }

            post_reply(state, thread_ref, NEW_WORD_ACK).await?;
            let posted = advance_to_next_word(state).await;
            Ok(RouterOutcome::NewWordRequested { posted })
        }
        .await;

        if result.is_err() {
            unclaim(state, event).await;
        }
        return result;
    }

    // Continued conversation in an already-resolved thread: tutoring only,
    // the resolution never changes after the first response.
    state
        .backend_limiter
        .acquire()
        .map_err(anyhow::Error::new)?;

    if !claim(state, event).await? {
        return Ok(RouterOutcome::Duplicate);
    }

    let result: Result<RouterOutcome> = async {
        let reply = tutor::tutor_reply(state, &entry, thread_ref, &event.text).await;
        post_reply(state, thread_ref, &reply).await?;
        Ok(RouterOutcome::TutorReplied)
    }
    .await;

    if result.is_err() {
        unclaim(state, event).await;
    }
    result
}

/// Invoke the post workflow for the next item, treating failure as
/// "will retry on schedule" rather than an event-handling error.
async fn advance_to_next_word(state: &AppState) -> bool {
    match workflow::post_new_word(state).await {
        Ok(PostOutcome::Posted(entry)) => {
            info!("Posted next word '{}'", entry.word);
            true
        }
        Ok(PostOutcome::Waiting) => {
            info!("Next word already pending; nothing to post");
            false
        }
        Err(e) => {
            if let Some(limited) = e.chain().find_map(|c| c.downcast_ref::<RateLimited>()) {
                warn!(
                    "Deferring next word to the schedule: {} (retry after {:.0}s)",
                    e,
                    limited.retry_after.as_secs_f64()
                );
            } else {
                warn!("Failed to post next word immediately, will retry on schedule: {}", e);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_word_request_requires_literal_one() {
        assert!(is_new_word_request("1"));
        assert!(is_new_word_request("  1  "));
        assert!(!is_new_word_request("11"));
        assert!(!is_new_word_request("one"));
        assert!(!is_new_word_request("1 please"));
    }

    #[test]
    fn theme_update_boundary_at_100_chars() {
        let exactly_100: String = "a".repeat(100);
        assert!(matches!(
            parse_theme_update(&exactly_100),
            ThemeUpdate::Set(_)
        ));

        let exactly_101: String = "a".repeat(101);
        assert!(matches!(parse_theme_update(&exactly_101), ThemeUpdate::TooLong));
    }

    #[test]
    fn theme_length_counts_chars_not_bytes() {
        // 100 multibyte characters are within the limit.
        let multibyte: String = "\u{00e9}".repeat(100);
        assert!(matches!(parse_theme_update(&multibyte), ThemeUpdate::Set(_)));
    }

    #[test]
    fn clear_phrases_reset_the_theme() {
        for phrase in ["clear", "Reset", "NONE", "no theme", "Clear Theme", "  clear  "] {
            assert!(
                matches!(parse_theme_update(phrase), ThemeUpdate::Clear),
                "expected '{}' to clear the theme",
                phrase
            );
        }
    }

    #[test]
    fn ordinary_text_sets_the_theme() {
        match parse_theme_update("  greek mythology  ") {
            ThemeUpdate::Set(theme) => assert_eq!(theme, "greek mythology"),
            _ => panic!("expected Set"),
        }
    }
}
