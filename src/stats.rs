/*!

Escape and collection statistics.

Each thread keeps plain counters in its region ([`AreaStats`]). Allocation
volume per frame id and the time spent escaping and collecting are shared by
all threads and kept in the process-wide [`TELEMETRY`] atomics.

*/

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::{Fid, MAX_FID};

/// Per-thread counters.
#[derive(Debug, Default, Clone)]
pub struct AreaStats {
    pub heap_escape_events: u64,
    pub heap_escape_objects: u64,
    pub heap_escape_words: u64,
    pub eager_escape_events: u64,
    pub rollbacks: u64,
    pub frame_escape_events: u64,
    pub frame_escape_objects: u64,
    pub frame_escape_words: u64,
    pub cheap_escapes: u64,
    pub stack_collections: u64,
    pub moved_objects: u64,
    pub moved_words: u64,
    pub moved_heap_words: u64,

    // Pass timings, filled in by `record_time!` under the sbastats feature.
    pub size_pass_time: f64,
    pub move_pass_time: f64,
    pub fixup_pass_time: f64,
    pub sweep_time: f64,
    pub findlive_time: f64,
    pub copy_compact_time: f64,
}

impl fmt::Display for AreaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "heap escapes: {} events, {} objects, {} words ({} eager, {} rollbacks)",
            self.heap_escape_events,
            self.heap_escape_objects,
            self.heap_escape_words,
            self.eager_escape_events,
            self.rollbacks
        )?;
        writeln!(
            f,
            "frame escapes: {} events, {} objects, {} words, {} cheap",
            self.frame_escape_events,
            self.frame_escape_objects,
            self.frame_escape_words,
            self.cheap_escapes
        )?;
        write!(
            f,
            "stack collections: {}, moved {} objects / {} words, {} words to heap",
            self.stack_collections, self.moved_objects, self.moved_words, self.moved_heap_words
        )
    }
}

/* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 * Process-wide telemetry
 * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 */

/// Slot 0 counts heap allocations, slot `fid + 1` allocations into that frame.
const ALLOC_SLOTS: usize = MAX_FID as usize + 1;

pub struct Telemetry {
    allocated_words: [AtomicU64; ALLOC_SLOTS],
    escape_nanos: AtomicU64,
    escapes: AtomicU64,
    stack_gc_nanos: AtomicU64,
    stack_gcs: AtomicU64,
}

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU64 = AtomicU64::new(0);

pub static TELEMETRY: Telemetry = Telemetry::new();

impl Telemetry {
    const fn new() -> Telemetry {
        Telemetry {
            allocated_words: [ZERO; ALLOC_SLOTS],
            escape_nanos: AtomicU64::new(0),
            escapes: AtomicU64::new(0),
            stack_gc_nanos: AtomicU64::new(0),
            stack_gcs: AtomicU64::new(0),
        }
    }

    pub fn reset(&self) {
        for slot in self.allocated_words.iter() {
            slot.store(0, Ordering::Relaxed);
        }
        self.escape_nanos.store(0, Ordering::Relaxed);
        self.escapes.store(0, Ordering::Relaxed);
        self.stack_gc_nanos.store(0, Ordering::Relaxed);
        self.stack_gcs.store(0, Ordering::Relaxed);
    }

    /// `None` records a heap allocation.
    pub fn record_allocation(&self, fid: Option<Fid>, words: usize) {
        let slot = match fid {
            None => 0,
            Some(fid) => (fid as usize + 1).min(ALLOC_SLOTS - 1),
        };
        self.allocated_words[slot].fetch_add(words as u64, Ordering::Relaxed);
    }

    pub fn record_escape(&self, elapsed: Duration) {
        self.escapes.fetch_add(1, Ordering::Relaxed);
        self.escape_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_stack_gc(&self, elapsed: Duration) {
        self.stack_gcs.fetch_add(1, Ordering::Relaxed);
        self.stack_gc_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn report(&self) -> TelemetryReport {
        TelemetryReport {
            allocated_words: self
                .allocated_words
                .iter()
                .map(|a| a.load(Ordering::Relaxed))
                .collect(),
            escapes: self.escapes.load(Ordering::Relaxed),
            escape_time: Duration::from_nanos(self.escape_nanos.load(Ordering::Relaxed)),
            stack_gcs: self.stack_gcs.load(Ordering::Relaxed),
            stack_gc_time: Duration::from_nanos(self.stack_gc_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// A snapshot of [`Telemetry`].
#[derive(Debug, Clone)]
pub struct TelemetryReport {
    /// Index 0 is the heap, index `fid + 1` a frame.
    pub allocated_words: Vec<u64>,
    pub escapes: u64,
    pub escape_time: Duration,
    pub stack_gcs: u64,
    pub stack_gc_time: Duration,
}

impl TelemetryReport {
    pub fn heap_words(&self) -> u64 {
        self.allocated_words[0]
    }

    pub fn frame_words(&self, fid: Fid) -> u64 {
        self.allocated_words[(fid as usize + 1).min(ALLOC_SLOTS - 1)]
    }

    pub fn total_words(&self) -> u64 {
        self.allocated_words.iter().sum()
    }
}

impl fmt::Display for TelemetryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.total_words();
        writeln!(f, "allocation: {} words", total)?;
        // Frames under 1% of the volume are not worth a line.
        let cutoff = total / 100;
        for (slot, &words) in self.allocated_words.iter().enumerate() {
            if words == 0 || words < cutoff {
                continue;
            }
            let pct = words as f64 * 100.0 / total as f64;
            if slot == 0 {
                writeln!(f, "  heap    {:>12} words {:5.1}%", words, pct)?;
            } else {
                writeln!(f, "  fid {:<3} {:>12} words {:5.1}%", slot - 1, words, pct)?;
            }
        }
        writeln!(
            f,
            "escapes: {} in {:.3} ms",
            self.escapes,
            self.escape_time.as_secs_f64() * 1000.0
        )?;
        write!(
            f,
            "stack collections: {} in {:.3} ms",
            self.stack_gcs,
            self.stack_gc_time.as_secs_f64() * 1000.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_cutoff() {
        let report = TelemetryReport {
            allocated_words: {
                let mut v = vec![0; ALLOC_SLOTS];
                v[0] = 1000;
                v[1] = 5;
                v[3] = 500;
                v
            },
            escapes: 2,
            escape_time: Duration::from_millis(1),
            stack_gcs: 0,
            stack_gc_time: Duration::ZERO,
        };
        let text = report.to_string();
        assert!(text.contains("heap"));
        assert!(text.contains("fid 2"));
        assert!(!text.contains("fid 0 "));
        assert_eq!(report.frame_words(2), 500);
        assert_eq!(report.total_words(), 1505);
    }

    #[test]
    fn test_area_stats_display() {
        let stats = AreaStats {
            heap_escape_events: 3,
            ..AreaStats::default()
        };
        assert!(stats.to_string().starts_with("heap escapes: 3 events"));
    }
}
