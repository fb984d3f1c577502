//! Stack-based allocation (SBA) runtime.
//!
//! Every mutator thread owns an [`SbaArea`]: a bump-allocated region carved
//! into per-activation frames, each named by a monotonically increasing frame
//! id (FID). Short-lived objects are allocated into the frame that created
//! them. When an object is about to outlive its frame, the escape engine
//! either promotes it (and everything it reaches on the stack) to the heap, or
//! re-parents it in place to an older, still-live frame.
//!
//! The entry point for generated store barriers and explicit escape sites is
//! [`escape`]; the [`SbaThread`] methods in `barrier` wrap it for ordinary
//! stores.

pub use area::SbaArea;
pub use closure::{Spaces, Visitor};
pub use config::SbaConfig;
pub use dispatch::{ensure_in_heap, escape, Destination};
pub use error::{Result, SbaError};
pub use heap::{new_heap_object, ArenaHeap, GcLocker, Heap, NoGcScope};
pub use marks::MarkBits;
pub use object::{LockState, Mark, Shape, FILLER_KIND, MIN_OBJECT_WORDS};
pub use preheader::{PreHeader, SiteHint};
pub use roots::{DerivedRoot, RootFrame, ShadowStack};
pub use sites::EscapeSites;
pub use stats::{AreaStats, Telemetry, TelemetryReport, TELEMETRY};
pub use tagged_pointer::{Ref, Space};
pub use thread::SbaThread;

mod area;
mod barrier;
mod closure;
mod collect;
mod config;
mod dispatch;
mod error;
pub mod ffi;
mod frame_escape;
mod heap;
mod heap_escape;
mod marks;
mod object;
mod preheader;
mod roots;
mod sites;
mod stats;
pub mod tagged_pointer;
mod thread;
mod verify;

/// Frame id. Frame 0 is the thread's root frame.
pub type Fid = u32;

/// The thread's outermost frame.
pub const ROOT_FID: Fid = 0;

/// Number of distinct frame ids. Frames nested deeper than `MAX_FID - 1` all
/// share the last id.
pub const MAX_FID: Fid = 255;

/// Destination sentinel used by the C ABI for "escape to the heap".
pub const HEAP_FID: i32 = -1;

/* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 * Timing
 * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 */

#[cfg(feature = "sbastats")]
#[macro_export]
macro_rules! record_time {
    ( $x:expr, $addr:expr ) => {{
        let start = std::time::Instant::now();
        let y = $x;
        let duration = start.elapsed();
        $addr += duration.as_secs_f64();
        y
    }};
}

#[cfg(not(feature = "sbastats"))]
#[macro_export]
macro_rules! record_time {
    ( $x:expr, $addr:expr ) => {{
        $x
    }};
}
