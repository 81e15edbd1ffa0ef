//! Domain model (IDs, records, wait expressions, execution errors).

pub mod errors;
pub mod ids;
pub mod record;
pub mod wait;

pub use self::errors::{ErrorKind, ExecutionError};
pub use self::ids::{JobUid, RecordId};
pub use self::record::{DEFAULT_QUEUE, JobRecord, JobStatus, Lease, NewJobRecord};
pub use self::wait::{WaitExpr, WaitParseError};
