//! Operator stages: composable transformation nodes.
//!
//! Each stage wraps an upstream [`Flow`](crate::Flow) description plus a
//! transformation, and owns no mutable state beyond per-subscription
//! wrappers created at subscribe time. Stage structs are crate-internal;
//! the public surface is the fluent API on `Flow`.

pub(crate) mod fallback;
pub(crate) mod flat_map;
pub(crate) mod map;
pub(crate) mod retry;
pub(crate) mod schedule;
