//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `run`           | `Run`, `Review`                                    |
//! | `serve`         | `Serve`                                            |
//! | `mcp`           | `Mcp`                                              |
//! | `inspect`       | `State`, `History`, `Replay`, `Sessions`, `Delete` |
//! | `config`        | `Config`                                           |

pub mod config;
pub mod inspect;
pub mod mcp;
pub mod run;
pub mod serve;

pub use config::cmd_config;
pub use inspect::{cmd_delete, cmd_history, cmd_replay, cmd_sessions, cmd_state};
pub use mcp::cmd_mcp;
pub use run::{ReviewMode, cmd_review, cmd_run};
pub use serve::cmd_serve;
