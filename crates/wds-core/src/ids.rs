//! ID prefix constants.
//!
//! Every stored entity gets an ID of the form `{prefix}-{16 hex chars}`,
//! generated by the database from [`ID_RANDOM_BYTES`] random bytes.

/// Random bytes behind each ID (rendered as twice as many hex chars).
pub const ID_RANDOM_BYTES: usize = 8;

pub const PREFIX_EXPERIMENT: &str = "exp";
pub const PREFIX_GROUP: &str = "grp";
pub const PREFIX_SESSION: &str = "ses";
pub const PREFIX_DATA_POINT: &str = "dat";

/// All prefixes, in table creation order.
pub const ALL_PREFIXES: &[&str] = &[
    PREFIX_EXPERIMENT,
    PREFIX_GROUP,
    PREFIX_SESSION,
    PREFIX_DATA_POINT,
];

/// Check whether `id` carries the given prefix (`"exp-a3f8b2c19e04d7b6"` has prefix `"exp"`).
#[must_use]
pub fn has_prefix(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|rest| !rest.is_empty())
}
