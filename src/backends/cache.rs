use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use super::GenerationParams;

#[derive(Hash, PartialEq, Eq)]
struct CacheKey {
    prompt: String,
    max_tokens: u32,
    temperature: u32,
    top_p: u32,
}

impl CacheKey {
    fn new(prompt: &str, params: &GenerationParams) -> Self {
        // Resolved values, so an omitted knob and its default share an entry.
        Self {
            prompt: prompt.to_string(),
            max_tokens: params.max_tokens(),
            temperature: params.temperature().to_bits(),
            top_p: params.top_p().to_bits(),
        }
    }
}

/// LRU of whole completions keyed by prompt and resolved parameters.
pub struct ResponseCache {
    entries: Mutex<LruCache<CacheKey, String>>,
}

impl ResponseCache {
    /// `None` for a zero capacity, which means caching is off.
    pub fn new(capacity: usize) -> Option<Self> {
        NonZeroUsize::new(capacity).map(|cap| Self {
            entries: Mutex::new(LruCache::new(cap)),
        })
    }

    pub fn get(&self, prompt: &str, params: &GenerationParams) -> Option<String> {
        let mut entries = self.entries.lock().ok()?;
        let hit = entries.get(&CacheKey::new(prompt, params)).cloned();
        hit
    }

    pub fn put(&self, prompt: &str, params: &GenerationParams, text: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(CacheKey::new(prompt, params), text.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
