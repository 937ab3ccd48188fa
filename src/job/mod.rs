//! Job rows, lifecycle types, and the persistent-store seam.

mod store;
mod types;

pub use store::{JobStore, MemoryStore};
pub use types::{
    AgentRecord, AgentStatus, DeadLetterEnvelope, Job, JobStatus, JobSubmission, JobTicket,
    JobType, Project, RetryEnvelope,
};
