//! CLI command implementations.
//!
//! | Module   | Commands handled                         |
//! |----------|------------------------------------------|
//! | `serve`  | `Serve`                                  |
//! | `run`    | `Run`, `Approve`, `Cancel`, `Status`     |
//! | `config` | `Config`                                 |

pub mod config;
pub mod run;
pub mod serve;

pub use config::cmd_config;
pub use run::{cmd_approve, cmd_cancel, cmd_run, cmd_status};
pub use serve::cmd_serve;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `--verbose`.
pub fn init_tracing(verbose: bool, json: bool) {
    let fallback = if verbose { "bizimatch=debug,info" } else { "bizimatch=info,warn" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
