//! # piped-core
//!
//! Deployment scheduling and execution engine for the Piped continuous-delivery
//! agent: a single binary that watches configured git repositories, plans and
//! executes multi-stage deployments, and reports status back to a control-plane
//! API.
//!
//! ## Pipeline
//!
//! The core flow is **sync → plan → execute → report**:
//!
//! 1. [`git`] keeps a local checkout of every configured repository fresh and
//!    hands out workspace handles keyed by `(repo_id, commit)`.
//! 2. [`trigger`] notices new commits or `SyncApplication`/`ChainUpdate`
//!    commands and asks [`plan`] to build a deployment plan: a topologically
//!    sorted stage DAG derived from the application's config file.
//! 3. [`controller`] drives each deployment's stages to completion via
//!    [`executor`]'s registered [`executor::StageExecutor`] implementations,
//!    checkpointing progress through [`state`] so a restart can resume.
//! 4. [`progress`] and [`live_state`] stream status and resource health back
//!    through [`api`]'s `ApiClient`; [`image_watcher`] separately polls image
//!    registries to trigger new deployments on tag updates.
//! 5. [`supervisor`] owns startup (reclaiming in-flight deployments from a
//!    persisted [`types::PipedRuntimeState`]) and graceful shutdown.
//!
//! ## Modules
//!
//! - [`types`] — domain types: applications, deployments, stages, commands
//! - [`config`] — `piped.toml` loading, validation, and defaults
//! - [`api`] — `ApiClient` trait modelling the control-plane wire boundary
//! - [`auth`] — piped-key resolution and authentication
//! - [`cancel`] — cooperative cancellation primitive
//! - [`lock`] — per-application/per-repo mutual exclusion
//! - [`tool_registry`] — on-demand download and caching of deployment tools
//! - [`git`] — git workspace checkout, fetch, and cleanup
//! - [`executor`] — stage executor registry and trait
//! - [`plan`] — stage DAG planning and topological ordering
//! - [`store`] — in-memory application/deployment index
//! - [`state`] — schema-versioned runtime checkpoint persistence
//! - [`progress`] — deployment status/log event reporting
//! - [`command_stream`] — control-plane command long-poll and dispatch
//! - [`command_handlers`] — concrete `CommandHandler`s for each command kind
//! - [`trigger`] — per-repository commit and command polling
//! - [`controller`] — deployment state machine
//! - [`live_state`] — application live-state reporting
//! - [`image_watcher`] — container/chart image tag polling
//! - [`supervisor`] — process lifecycle: startup reclaim and shutdown
//! - [`encryption`] — sealed-secret unsealing (delegates to `piped-encrypt`)
//! - [`process`] — cross-platform command execution with timeout support
//!
//! ## Stability
//!
//! The library API is subject to change before v1.0.0.

pub mod api;
pub mod auth;
pub mod cancel;
pub mod command_handlers;
pub mod command_stream;
pub mod config;
pub mod controller;
pub mod encryption;
pub mod executor;
pub mod git;
pub mod image_watcher;
pub mod live_state;
pub mod lock;
pub mod plan;
pub mod process;
pub mod progress;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod tool_registry;
pub mod trigger;
pub mod types;

/// Configurable retry strategies with backoff and jitter.
pub use piped_retry as retry;
