//! Automation: rule evaluation, the human approval gate, action execution,
//! job dispatch and the scheduler, plus the service facade over them.

pub mod actions;
pub mod approvals;
pub mod dispatch;
pub mod rules;
pub mod scheduler;
pub mod service;

pub use actions::{validate_budget, ActionExecutor, ActionOutcome};
pub use approvals::{approval_key, ApprovalGate};
pub use dispatch::CoreJobHandler;
pub use rules::{is_applicable, validate_rule, EvaluationReport, RuleEngine, RuleStore, SkipReason};
pub use scheduler::{Scheduler, TickReport};
pub use service::Autopilot;
