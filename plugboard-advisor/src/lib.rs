//! Plugboard Advisor - Index Recommendation & Lifecycle
//!
//! Watches query shapes as they flow past, recommends secondary indexes
//! for field sets whose observed frequency crosses a threshold inside a
//! sliding window, and retires indexes that have gone unused. The advisor
//! owns only `IndexSpec` metadata; actual index creation and removal are
//! delegated to the entity store, which supports them online.

mod advisor;
mod shape;
mod spec;

pub use advisor::{IndexAdvisor, ReconcileReport};
pub use shape::QueryShape;
pub use spec::{IndexSpec, IndexState};
