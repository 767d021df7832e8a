//! Behavioural scenarios for the job orchestrator.

mod orchestrator;
