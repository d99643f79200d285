//! Actor-based edge agent
//!
//! Each long-running loop is an independent task owning its state, controlled through a
//! cloneable handle.
//!
//! ```text
//!   MetricsCollectorActor ──broadcast──┐
//!                                      ▼
//!   CommandExecutor ──subscription──▶ FleetLink ◀──▶ registry
//!          ▲                           │   │
//!          └────────── command ────────┘   └── set_phase ──▶ PlaybackActor ──▶ playlist file
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: mpsc channel per actor, oneshot for replies
//! 2. **Events**: broadcast for metrics snapshots, per-subscriber mpsc for job updates
//! 3. **Status**: watch channel for the link state

pub mod collector;
pub mod link;
pub mod messages;
pub mod playback;
