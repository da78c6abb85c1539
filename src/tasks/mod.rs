//! Built-in endpoint tasks.
//!
//! These give a graph its external inputs and outputs:
//!
//! | Task | Role |
//! |------|------|
//! | [`AppSrc`] | Root fed by the application |
//! | [`AppSink`] | Leaf drained by the application |
//! | [`NullSource`] | Root producing constant buffers |
//! | [`NullSink`] | Leaf discarding everything |

mod app;
mod null;

pub use app::{
    AppSink, AppSinkHandle, AppSinkStats, AppSrc, AppSrcHandle, AppSrcStats, HostArray,
};
pub use null::{NullSink, NullSource};
