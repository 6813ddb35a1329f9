// vf-core: domain models and pure utilities shared by the viewflow services.

pub mod models;
pub mod util;

pub use models::{
    Broadcaster, BroadcasterKind, FlowRow, ReferrerEdge, TrackedChannel, ViewerSample, EVENT_VIEW,
};
