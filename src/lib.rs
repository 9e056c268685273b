//! Surfwright core library: plan execution engine, shared session state store and
//! maintenance jobs, consumed by the CLI and by tests through one flat namespace.

#[path = "model/assertion.rs"]
mod assertion;
#[path = "runtime/clock.rs"]
mod clock;
#[path = "platform/config.rs"]
mod config;
#[path = "cmd/devtools_ops.rs"]
mod devtools_ops;
#[path = "platform/duration.rs"]
mod duration;
#[path = "runtime/engine.rs"]
mod engine;
#[path = "platform/error.rs"]
mod error;
#[path = "platform/fsutil.rs"]
mod fsutil;
#[path = "store/handle.rs"]
mod handle;
#[path = "model/jsonpath.rs"]
mod jsonpath;
#[path = "model/lint.rs"]
mod lint;
#[path = "store/lock.rs"]
mod lock;
#[path = "session/maintenance.rs"]
mod maintenance;
#[path = "store/migrate.rs"]
mod migrate;
#[path = "runtime/ops.rs"]
mod ops;
#[path = "model/params.rs"]
mod params;
#[path = "model/plan.rs"]
mod plan;
#[path = "session/probe.rs"]
mod probe;
#[path = "runtime/record.rs"]
mod record;
#[path = "session/resolver.rs"]
mod resolver;
#[path = "cmd/run_cmd.rs"]
mod run_cmd;
#[path = "cmd/session_cmd.rs"]
mod session_cmd;
#[path = "store/shards.rs"]
mod shards;
#[path = "model/state.rs"]
mod state;
#[path = "runtime/template.rs"]
mod template;
#[path = "runtime/timeline.rs"]
mod timeline;

pub use assertion::*;
pub use clock::*;
pub use config::*;
pub use devtools_ops::*;
pub use duration::*;
pub use engine::*;
pub use error::*;
pub use fsutil::*;
pub use handle::*;
pub use jsonpath::*;
pub use lint::*;
pub use lock::*;
pub use maintenance::*;
pub use migrate::*;
pub use ops::*;
pub use params::*;
pub use plan::*;
pub use probe::*;
pub use record::*;
pub use resolver::*;
pub use run_cmd::*;
pub use session_cmd::*;
pub use shards::*;
pub use state::*;
pub use template::*;
pub use timeline::*;
