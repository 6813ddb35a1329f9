// tracker: per-broadcaster viewer tracking service.
//
// Webhook events drive the planner, which schedules chatter sampling
// cycles; samples land in storage as raw viewer events and are later
// reconciled into directed referrer edges and hourly flow aggregates.

pub mod active;
pub mod batcher;
pub mod config;
pub mod planner;
pub mod reconcile;
pub mod storage;
pub mod worker;
