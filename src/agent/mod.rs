//! Agent loop: turns one inbound message into zero or more outbound
//! replies by driving the completion model hop-by-hop, gating risky tool
//! calls on human approval between "model asked for it" and "it runs".

pub mod run;
pub mod style;

pub use run::{AgentLoop, TurnOutcome};
