/*!

Process-wide table of allocation sites that have seen escapes.

Every heap escape of a hinted object bumps the decayed escape count of its
site. Once a site has escaped `threshold` times it flips to heap allocation,
its fail count goes up, and its count is pre-inflated by `threshold << fails`
so that periodic decay takes exponentially longer to flip it back.

Decay is driven by [`EscapeSites::tick`], which threads call when a site
refuses them and after every stack collection. It halves the counts once per
elapsed decay interval.

The table is a fixed open-addressed array. Collisions reprobe with an odd
stride; when the chain is exhausted the slot with the fewest fails (then the
fewest escapes) is evicted.

*/

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::SbaConfig;

const SITES_LOG_SIZE: usize = 12;
const SITES_MASK: usize = (1 << SITES_LOG_SIZE) - 1;
const REPROBE_LIMIT: usize = 9;

/// Default escape threshold for the process-wide table.
pub const DEFAULT_ESCAPE_THRESHOLD: u32 = 8;

struct SiteTable {
    keys: Vec<u64>,
    decayed: Vec<i64>,
    fails: Vec<u32>,
    heap_only: Vec<bool>,
    last_decay: Instant,
}

pub struct EscapeSites {
    threshold: i64,
    decay_interval: Option<Duration>,
    table: Mutex<SiteTable>,
}

impl SiteTable {
    fn new() -> SiteTable {
        let n = 1 << SITES_LOG_SIZE;
        SiteTable {
            keys: vec![0; n],
            decayed: vec![0; n],
            fails: vec![0; n],
            heap_only: vec![false; n],
            last_decay: Instant::now(),
        }
    }

    fn index_of(&mut self, key: u64, claim: bool) -> Option<usize> {
        debug_assert!(key != 0, "unhinted objects have no site");
        let site = (key >> 32) as usize;
        let bci = ((key >> 16) & 0xffff) as usize;
        let mut idx = (site ^ bci) & SITES_MASK;
        let reprobe = idx | 1;
        let mut low = idx;
        for _ in 0..REPROBE_LIMIT {
            if self.keys[idx] == 0 {
                if !claim {
                    return None;
                }
                self.keys[idx] = key;
            }
            if self.keys[idx] == key {
                return Some(idx);
            }
            if self.fails[idx] < self.fails[low]
                || (self.fails[idx] == self.fails[low] && self.decayed[idx] < self.decayed[low])
            {
                low = idx;
            }
            idx = (idx + reprobe) & SITES_MASK;
        }
        if !claim {
            return None;
        }
        self.keys[low] = key;
        self.decayed[low] = 0;
        self.fails[low] = 0;
        self.heap_only[low] = false;
        Some(low)
    }
}

impl EscapeSites {
    /// A table that only decays when `decay` is called.
    pub fn new(threshold: u32) -> EscapeSites {
        EscapeSites {
            threshold: threshold as i64,
            decay_interval: None,
            table: Mutex::new(SiteTable::new()),
        }
    }

    /// A table whose counts `tick` halves every `interval`.
    pub fn with_decay(threshold: u32, interval: Duration) -> EscapeSites {
        EscapeSites {
            decay_interval: Some(interval).filter(|i| !i.is_zero()),
            ..EscapeSites::new(threshold)
        }
    }

    pub fn for_config(config: &SbaConfig) -> EscapeSites {
        EscapeSites::with_decay(
            config.escape_threshold,
            Duration::from_millis(config.site_decay_interval_ms),
        )
    }

    /// The table shared by threads created through the C ABI. The first
    /// caller's configuration sets it up.
    pub fn global(config: &SbaConfig) -> Arc<EscapeSites> {
        static GLOBAL: OnceLock<Arc<EscapeSites>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(EscapeSites::for_config(config)))
            .clone()
    }

    pub fn threshold(&self) -> u32 {
        self.threshold as u32
    }

    /// Record one escape from the site `key` (a pre-header site signature).
    pub fn record_escape(&self, key: u64) {
        let mut table = self.table.lock();
        let idx = match table.index_of(key, true) {
            Some(idx) => idx,
            None => return,
        };
        let prior = table.decayed[idx];
        table.decayed[idx] = prior + 1;
        if prior < self.threshold || table.heap_only[idx] {
            return;
        }
        table.heap_only[idx] = true;
        let fails = table.fails[idx];
        tracing::debug!(
            site = format_args!("{:#x}", key),
            escapes = table.decayed[idx],
            fails,
            "allocation site flipped to heap"
        );
        table.fails[idx] = fails + 1;
        table.decayed[idx] += self.threshold << fails.min(32);
    }

    pub fn decayed_escape_count(&self, key: u64) -> i64 {
        let mut table = self.table.lock();
        match table.index_of(key, false) {
            Some(idx) => table.decayed[idx],
            None => 0,
        }
    }

    pub fn fails(&self, key: u64) -> u32 {
        let mut table = self.table.lock();
        match table.index_of(key, false) {
            Some(idx) => table.fails[idx],
            None => 0,
        }
    }

    /// Sites never seen escaping stack-allocate.
    pub fn should_stack_allocate(&self, key: u64) -> bool {
        if key == 0 {
            return true;
        }
        let mut table = self.table.lock();
        match table.index_of(key, false) {
            Some(idx) => table.decayed[idx] < self.threshold,
            None => true,
        }
    }

    /// Whether escapes of `key` are frequent enough to promote every object
    /// from the site in one go.
    pub fn is_hot(&self, key: u64) -> bool {
        key != 0 && self.decayed_escape_count(key) > 4 + (self.threshold << 1)
    }

    /// Decay once per interval elapsed since the last decay. Returns whether
    /// anything was decayed.
    pub fn tick(&self) -> bool {
        let interval = match self.decay_interval {
            Some(interval) => interval,
            None => return false,
        };
        let mut table = self.table.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(table.last_decay);
        if elapsed < interval {
            return false;
        }
        // Past this every count is down to one anyway.
        let periods = (elapsed.as_nanos() / interval.as_nanos()).min(64);
        for _ in 0..periods {
            self.decay_table(&mut table);
        }
        table.last_decay = now;
        tracing::debug!(periods = periods as u64, "decayed escape sites");
        true
    }

    /// Halve every counter. Sites that decay to the threshold go back to
    /// stack allocation.
    pub fn decay(&self) {
        let mut table = self.table.lock();
        self.decay_table(&mut table);
    }

    fn decay_table(&self, table: &mut SiteTable) {
        for idx in 0..table.keys.len() {
            if table.keys[idx] == 0 {
                continue;
            }
            let d = (table.decayed[idx] + 1) >> 1;
            table.decayed[idx] = d;
            if d <= self.threshold {
                table.heap_only[idx] = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preheader::{PreHeader, SiteHint};

    fn key(method: u32, bci: u16) -> u64 {
        PreHeader::new(0, SiteHint::Method { method, bci }).site_signature()
    }

    #[test]
    fn test_flip_and_backoff() {
        let sites = EscapeSites::new(4);
        let k = key(11, 3);
        assert!(sites.should_stack_allocate(k));
        for _ in 0..4 {
            sites.record_escape(k);
        }
        assert_eq!(sites.decayed_escape_count(k), 4);
        assert!(!sites.should_stack_allocate(k));
        assert_eq!(sites.fails(k), 0);

        // The fifth escape flips the site and inflates its count.
        sites.record_escape(k);
        assert_eq!(sites.fails(k), 1);
        assert_eq!(sites.decayed_escape_count(k), 5 + 4);

        // Decay brings it back: 9 -> 5 -> 3.
        sites.decay();
        assert!(!sites.should_stack_allocate(k));
        sites.decay();
        assert_eq!(sites.decayed_escape_count(k), 3);
        assert!(sites.should_stack_allocate(k));
    }

    #[test]
    fn test_unknown_site() {
        let sites = EscapeSites::new(8);
        assert_eq!(sites.decayed_escape_count(key(1, 1)), 0);
        assert!(sites.should_stack_allocate(key(1, 1)));
        assert!(!sites.is_hot(key(1, 1)));
    }

    #[test]
    fn test_tick_decays_per_interval() {
        let sites = EscapeSites::with_decay(2, Duration::from_millis(5));
        let k = key(3, 9);
        for _ in 0..3 {
            sites.record_escape(k);
        }
        // Flipped: 3 + 2.
        assert_eq!(sites.decayed_escape_count(k), 5);
        assert!(!sites.should_stack_allocate(k));

        std::thread::sleep(Duration::from_millis(50));
        assert!(sites.tick());
        assert_eq!(sites.decayed_escape_count(k), 1);
        assert!(sites.should_stack_allocate(k));
    }

    #[test]
    fn test_tick_waits_for_interval() {
        let sites = EscapeSites::with_decay(2, Duration::from_secs(3600));
        let k = key(4, 4);
        sites.record_escape(k);
        sites.record_escape(k);
        assert!(!sites.tick());
        assert_eq!(sites.decayed_escape_count(k), 2);
        assert!(!EscapeSites::new(2).tick());
        assert!(!EscapeSites::with_decay(2, Duration::ZERO).tick());
    }

    #[test]
    fn test_colliding_sites_are_distinct() {
        let sites = EscapeSites::new(8);
        // Same hash bucket: method ^ bci is equal.
        let a = key(0x10, 0x01);
        let b = key(0x11, 0x00);
        sites.record_escape(a);
        sites.record_escape(a);
        sites.record_escape(b);
        assert_eq!(sites.decayed_escape_count(a), 2);
        assert_eq!(sites.decayed_escape_count(b), 1);
    }

    #[test]
    fn test_hot_site() {
        let sites = EscapeSites::new(2);
        let k = key(7, 7);
        for _ in 0..3 {
            sites.record_escape(k);
        }
        // 3 escapes, flipped at the third: 3 + 2 = 5, not yet above 4 + 4.
        assert!(!sites.is_hot(k));
        for _ in 0..4 {
            sites.record_escape(k);
        }
        assert!(sites.is_hot(k));
    }
}
