//! App factory: turns a prompt into a deployed application.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (router, controller assembly)        │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!    (events.rs)        │         │ submit / run / pause / resume / cancel │
//!                       │         v                                        │
//!                       │  controller.rs  (GenerationJobController)        │
//!                       │     │          │            │                    │
//!                       │     │ acquire  │ iteration  │ on completion      │
//!                       │     v          v            v                    │
//!                       │  pool.rs    agent.rs     deploy.rs               │
//!                       │  (leases)   (AgentWorker) (CLI / REST channels)  │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `models`      | `GenerationJob`, `Credentials`, `DeployTarget`, ...     |
//! | `config`      | Environment configuration and pool slot discovery      |
//! | `poll`        | Readiness polling policy shared by both platforms      |
//! | `provisioner` | Creates backend projects via the management API        |
//! | `db`          | SQLite job store behind `JobRepository`                 |
//! | `selftest`    | Connectivity checks for `appfactory doctor`             |
//!
//! ## Job Flow
//!
//! 1. `POST /api/jobs` stores a `queued` job.
//! 2. `run` leases credentials from the pool. A full pool leaves the job
//!    queued and reports backpressure.
//! 3. The controller calls the agent worker once per iteration, checking
//!    cancel, pause and the iteration budget at each boundary.
//! 4. A finished job returns its lease and, when a deployer is configured,
//!    is linked to a deploy project, given its backend env vars and released.

pub mod agent;
pub mod api;
pub mod config;
pub mod controller;
pub mod db;
pub mod deploy;
pub mod events;
pub mod models;
pub mod poll;
pub mod pool;
pub mod provisioner;
pub mod selftest;
pub mod server;
