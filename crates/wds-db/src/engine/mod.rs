//! Participant admission engine.
//!
//! - [`group_state`]: capacity view of one group under a lifecycle value
//! - [`allocation`]: which group the next participant joins
//! - [`gate`]: whether the experiment takes new participants at all
//! - [`admission`]: the locked, transactional operations built on the above

pub mod admission;
pub mod allocation;
pub mod gate;
pub mod group_state;
