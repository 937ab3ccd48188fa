//! taskforge — the job lifecycle engine of an agent orchestration platform.
//!
//! Software-engineering tasks are submitted as jobs tied to projects; the
//! dispatcher routes each job to an LLM-backed agent running a bounded
//! tool-using loop inside a disposable Docker sandbox, with spend metered
//! against the project's budget.
//!
//! ```text
//! ┌──────────┐   enqueue   ┌──────────┐   reserve   ┌────────────┐
//! │ HTTP     │────────────▶│ incoming │────────────▶│ Dispatcher │
//! │ layer    │             │ queue    │             │  workers   │
//! └──────────┘             └──────────┘             └─────┬──────┘
//!                            ▲      ▲                     │ guard: budget,
//!                    pump    │      │ re-drive            │ circuit, status
//!                 ┌──────────┴┐   ┌─┴──────────┐          ▼
//!                 │ delayed   │   │ dead       │    ┌────────────┐
//!                 │ retries   │   │ letters    │    │ Agent Loop │
//!                 └───────────┘   └────────────┘    │ in Sandbox │
//!                                                   └─────┬──────┘
//!                                                         │ tool calls
//!                                                         ▼
//!                                  Provider Gateway ◀──▶ LLM providers
//!                                  (circuit breaker, cost ledger)
//! ```
//!
//! The persistent store and the broker are collaborators behind the
//! [`job::JobStore`] and [`queue::Broker`] seams; in-memory
//! implementations of both ship here for tests and single-process use.

pub mod agent;
pub mod breaker;
pub mod config;
pub mod cost;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod job;
pub mod queue;
pub mod retry;
pub mod sandbox;

pub use dispatcher::{Dispatcher, TickOutcome};
pub use error::Error;
