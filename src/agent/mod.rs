//! Agents: role profiles and the bounded reasoning loop.

pub mod agent_loop;
mod profiles;

pub use agent_loop::{AgentLoopConfig, AgentResult, AgentRun, CompletionNote};
pub use profiles::{AgentProfile, profile_for};
