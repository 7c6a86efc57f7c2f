//! Plugboard Resolve - Name Resolution Registry
//!
//! Bidirectional mapping between human-assigned names and stable entity
//! ids. Names change; ids do not. The registry keeps its own two
//! in-process tiers over the store's indexed name lookup, deliberately
//! specialized rather than reusing the generic cache manager, because
//! resolution entries are tiny, extremely hot, and must only be
//! invalidated on rename or delete, never on unrelated attribute writes.

mod registry;
mod tier;

pub use registry::{NameOrId, ResolutionEntry, ResolutionRegistry, ResolveOutcome, ResolverStats};
