//! Entity structs for all datastore domain objects.
//!
//! Each entity maps to a table in the libSQL database (see `wds-db/migrations`).
//! All structs derive `Serialize`, `Deserialize`, and `JsonSchema` for JSON
//! roundtrip and schema validation.

mod data_point;
mod experiment;
mod group;
mod session;

pub use data_point::DataPoint;
pub use experiment::{AWAITING_APPROVAL, Experiment};
pub use group::{GroupStats, TargetGroup};
pub use session::ParticipantSession;
