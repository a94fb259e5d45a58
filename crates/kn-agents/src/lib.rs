//! Agents and the build pipeline that drives them.

pub mod approval;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod prompts;
pub mod registry;
pub mod roles;
pub mod session;
pub mod state_machine;
