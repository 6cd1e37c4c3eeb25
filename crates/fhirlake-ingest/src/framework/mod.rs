//! Collaborator contracts and shared types
//!
//! The core talks to the outside world through four traits:
//! - [`oracle::ResourceCountOracle`]: record counts per time window
//! - [`queue::JobQueue`]: durable processing-job queue
//! - [`checkpoint_store::CheckpointStore`]: optimistic checkpoint persistence
//! - [`commit::CommitHook`]: finalization of a job's output
//!
//! plus [`patients::PatientSource`] for group-scoped runs. Each has an
//! in-memory implementation here; production ones live in `fhir` and
//! `storage`.

pub mod checkpoint_store;
pub mod commit;
pub mod oracle;
pub mod patients;
pub mod queue;
pub mod types;

pub use checkpoint_store::{CheckpointStore, MemoryCheckpointStore, VersionedCheckpoint};
pub use commit::{CommitHook, NoopCommitHook, RecordingCommitHook};
pub use oracle::{CountProbe, ResourceCountOracle};
pub use patients::{PatientSource, StaticPatientSource};
pub use queue::{JobInfo, JobQueue, MemoryJobQueue, QueuedJob};
pub use types::{JobId, JobStatus, ResourceCount, SubJobInfo, TimeRange};
