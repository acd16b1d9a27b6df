pub mod cache;
pub mod config;
pub mod dedup;
pub mod generator;
pub mod platform;
pub mod rate_limit;
pub mod repository;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod slack;
pub mod tutor;
pub mod webhook;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use lexibot_core::CompletionBackend;

use crate::config::{
    BACKEND_RATE_LIMIT, BACKEND_RATE_WINDOW, DEDUP_CACHE_SIZE, DEDUP_CACHE_TTL,
    PLATFORM_RATE_LIMIT, PLATFORM_RATE_WINDOW,
};
use crate::dedup::DedupStore;
use crate::generator::WordGenerator;
use crate::platform::ChatPlatform;
use crate::rate_limit::RateLimiter;
use crate::repository::VocabRepository;
use crate::retry::RetryPolicy;

pub fn get_bot_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub struct AppState {
    pub platform: Arc<dyn ChatPlatform>,
    pub backend: Arc<dyn CompletionBackend>,
    pub repository: Arc<dyn VocabRepository>,
    pub dedup: DedupStore,
    pub platform_limiter: RateLimiter,
    pub backend_limiter: RateLimiter,
    pub generator: WordGenerator,
    pub retry: RetryPolicy,
    /// System-wide guard for the generate-through-commit sequence; see
    /// `workflow::post_new_word`.
    pub post_lock: tokio::sync::Mutex<()>,
    pub signing_secret: String,
}

impl AppState {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        backend: Arc<dyn CompletionBackend>,
        repository: Arc<dyn VocabRepository>,
        signing_secret: String,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        let retry = RetryPolicy::new(3, Duration::from_secs(1));
        Self {
            platform,
            backend: Arc::clone(&backend),
            repository: Arc::clone(&repository),
            dedup: DedupStore::new(Arc::clone(&repository), DEDUP_CACHE_SIZE, DEDUP_CACHE_TTL),
            platform_limiter: RateLimiter::new(PLATFORM_RATE_LIMIT, PLATFORM_RATE_WINDOW),
            backend_limiter: RateLimiter::new(BACKEND_RATE_LIMIT, BACKEND_RATE_WINDOW),
            generator: WordGenerator::new(backend, retry, temperature, max_tokens),
            retry,
            post_lock: tokio::sync::Mutex::new(()),
            signing_secret,
        }
    }
}
