//! CLI command implementations.
//!
//! | Module      | Commands handled        |
//! |-------------|-------------------------|
//! | `doctor`    | `Doctor`                |
//! | `pool`      | `Pool`, `Jobs`          |
//! | `provision` | `Provision`             |
//! | `run`       | `Run`, `Resume`         |
//! | `serve`     | `Serve`                 |

pub mod doctor;
pub mod pool;
pub mod provision;
pub mod run;
pub mod serve;

pub use doctor::cmd_doctor;
pub use pool::{cmd_jobs, cmd_pool};
pub use provision::cmd_provision;
pub use run::{RunArgs, cmd_resume, cmd_run};
pub use serve::cmd_serve;
