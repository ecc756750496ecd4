//! Selects a hospital for an ambulance request and drives the per-incident
//! workflow from unit assignment through hospital arrival (spec §4.4).

#![forbid(unsafe_code)]

pub mod consumer;
pub mod hospital;
pub mod workflow;
