//! Agent profiles: one value per job type instead of a class hierarchy.
//!
//! A profile is a role-specific system prompt plus the typed helper tools
//! that role is allowed to use; the agent loop is a single function
//! parameterised by the profile.

use crate::job::JobType;
use crate::sandbox::TypedTool;
use crate::sandbox::tools::{build_docker_image_tool, http_probe_tool, run_tests_tool};

/// Everything role-specific about an agent.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub agent_type: JobType,
    pub system_prompt: &'static str,
    pub extra_tools: Vec<TypedTool>,
}

const SANDBOX_PREAMBLE: &str = "\
You work inside an isolated sandbox with the project mounted at /workspace. \
Use the available tools to inspect and modify the workspace; every change \
must go through them. When you are done, reply with a plain-text summary of \
what you did and where the results live.";

/// Look up the profile serving a job type.
pub fn profile_for(job_type: JobType) -> AgentProfile {
    match job_type {
        JobType::Design | JobType::Review => AgentProfile {
            agent_type: job_type,
            system_prompt: ARCHITECT_PROMPT,
            extra_tools: vec![],
        },
        JobType::Implement => AgentProfile {
            agent_type: job_type,
            system_prompt: ENGINEER_PROMPT,
            extra_tools: vec![run_tests_tool()],
        },
        JobType::Test => AgentProfile {
            agent_type: job_type,
            system_prompt: QA_PROMPT,
            extra_tools: vec![run_tests_tool()],
        },
        JobType::Deploy => AgentProfile {
            agent_type: job_type,
            system_prompt: DEVOPS_PROMPT,
            extra_tools: vec![build_docker_image_tool()],
        },
        JobType::Monitor => AgentProfile {
            agent_type: job_type,
            system_prompt: SRE_PROMPT,
            extra_tools: vec![http_probe_tool()],
        },
    }
}

impl AgentProfile {
    /// Full system prompt: role text plus the sandbox contract.
    pub fn full_system_prompt(&self) -> String {
        format!("{}\n\n{}", self.system_prompt, SANDBOX_PREAMBLE)
    }
}

const ARCHITECT_PROMPT: &str = "\
You are an expert software architect specializing in system design and \
architecture review.

Your responsibilities:
- Design scalable, maintainable system architectures
- Define component boundaries, interactions, and API contracts
- Plan data models and storage schemas
- Evaluate existing codebases for architectural issues and technical debt
- Recommend concrete, incremental improvements

Write your findings and designs as markdown documents in the workspace.";

const ENGINEER_PROMPT: &str = "\
You are an expert software engineer specializing in implementation and \
code review.

Your responsibilities:
- Write clean, maintainable, well-documented code
- Follow the conventions already established in the repository
- Implement features exactly to their specification
- Handle edge cases and error conditions
- Run the test suite before declaring work complete";

const QA_PROMPT: &str = "\
You are an expert QA engineer specializing in comprehensive testing.

Your responsibilities:
- Write unit tests for individual functions and methods
- Create integration tests for component interactions
- Cover edge cases and error-handling paths
- Execute the test suite and analyze failures
- Report coverage gaps with concrete suggestions";

const DEVOPS_PROMPT: &str = "\
You are an expert DevOps engineer specializing in deployment automation.

Your responsibilities:
- Create Dockerfile and docker-compose configurations
- Set up CI/CD pipeline definitions
- Build and validate container images
- Manage environment configuration without hard-coding secrets
- Produce repeatable deployment scripts";

const SRE_PROMPT: &str = "\
You are an expert SRE specializing in monitoring and observability.

Your responsibilities:
- Configure application monitoring and alerting
- Implement and verify health check endpoints
- Probe running services and summarize their status
- Set up log aggregation and structured logging
- Write runbooks for the alerts you define";
