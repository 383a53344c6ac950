//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                 |
//! |------------|----------------------------------|
//! | `sessions` | `List`, `Current`, `Diagnose`    |
//! | `treat`    | `Treat`, `Strategy`, `Formulary` |
//! | `guard`    | `Guard`, `Checkpoint`, `Reload`  |
//! | `doctor`   | `Doctor`                         |

pub mod doctor;
pub mod guard;
pub mod sessions;
pub mod treat;

pub use doctor::cmd_doctor;
pub use guard::{cmd_checkpoint, cmd_guard, cmd_reload, GuardArgs};
pub use sessions::{cmd_current, cmd_diagnose, cmd_list};
pub use treat::{cmd_formulary, cmd_strategy, cmd_treat};
