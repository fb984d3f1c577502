use crate::error::{Result, SbaError};
use crate::sites::DEFAULT_ESCAPE_THRESHOLD;

/// Per-thread stack allocation settings.
#[derive(Debug, Clone)]
pub struct SbaConfig {
    /// Words in a fresh region. Power of two.
    /// Default: 4096.
    pub initial_stack_words: usize,
    /// Upper bound the stack collector may grow the region to. Power of two.
    /// Default: 65536.
    pub max_stack_words: usize,
    /// Escapes after which an allocation site flips to heap allocation.
    /// Default: 8.
    pub escape_threshold: u32,
    /// Escape counts of allocation sites halve this often, letting sites
    /// that flipped to heap allocation try the stack again. 0 disables decay.
    /// Default: 50000.
    pub site_decay_interval_ms: u64,
    /// Record escapes against allocation-site hints.
    /// Default: true.
    pub use_hints: bool,
    /// Promote every object of a repeatedly escaping site at once.
    /// Default: true.
    pub eager_escape: bool,
    /// Run the verifier around escapes and frame transitions.
    /// Default: false.
    pub verify: bool,
    /// Collect the region instead of falling back to the heap when an
    /// allocation does not fit.
    /// Default: true.
    pub collect_on_exhaustion: bool,
    /// Collections closer together than this grow the region, collections
    /// further apart may shrink it.
    /// Default: 3.0.
    pub resize_interval_secs: f64,
}

impl Default for SbaConfig {
    fn default() -> Self {
        SbaConfig {
            initial_stack_words: 1 << 12,
            max_stack_words: 1 << 16,
            escape_threshold: DEFAULT_ESCAPE_THRESHOLD,
            site_decay_interval_ms: 50_000,
            use_hints: true,
            eager_escape: true,
            verify: false,
            collect_on_exhaustion: true,
            resize_interval_secs: 3.0,
        }
    }
}

impl SbaConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.initial_stack_words.is_power_of_two() {
            return Err(SbaError::InvalidConfig(format!(
                "initial_stack_words {} is not a power of two",
                self.initial_stack_words
            )));
        }
        if !self.max_stack_words.is_power_of_two() {
            return Err(SbaError::InvalidConfig(format!(
                "max_stack_words {} is not a power of two",
                self.max_stack_words
            )));
        }
        if self.initial_stack_words > self.max_stack_words {
            return Err(SbaError::InvalidConfig(format!(
                "initial_stack_words {} exceeds max_stack_words {}",
                self.initial_stack_words, self.max_stack_words
            )));
        }
        if self.initial_stack_words < 16 {
            return Err(SbaError::InvalidConfig(
                "initial_stack_words must be at least 16".to_string(),
            ));
        }
        if self.escape_threshold == 0 {
            return Err(SbaError::InvalidConfig(
                "escape_threshold must be positive".to_string(),
            ));
        }
        if self.resize_interval_secs.is_nan() || self.resize_interval_secs <= 0.0 {
            return Err(SbaError::InvalidConfig(
                "resize_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
