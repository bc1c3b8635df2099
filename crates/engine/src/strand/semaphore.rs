//! Well-known semaphore names
//!
//! Semaphores are durable named counters attached to a strand. Anyone may
//! raise them (API handlers, other strands); the strand observes them
//! cooperatively between steps.

/// Request teardown of the resource the strand manages
pub const DESTROY: &str = "destroy";

/// Value a pushed sub-call returns when teardown cancels it
pub const CANCELLED_BY_DESTROY: &str =
    "operation is cancelled due to the destruction of the resource";
