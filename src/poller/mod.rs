//! Adaptive status poller: fast cadence while the job runs, slow while idle.

pub mod client;
pub mod machine;
pub mod runner;
pub mod view;

pub use client::{HttpStatusClient, StatusClient};
pub use machine::{transition, Effect, PollEvent, PollPeriods, PollState};
pub use runner::{Poller, PollerCommand, PollerHandle};
pub use view::PollerView;
