//! A distributed, data-flow task runtime.
//!
//! A computation is a static graph of *operators* wired through typed
//! terminals and edges. Each operator instance is addressed by a key; a task
//! materializes when the first input for a key arrives and runs when all of
//! them have. Values route to the key's owning rank, decided by the
//! operator's keymap, either locally or as an active message.
//!
//! ```no_run
//! use keyflow_dataflow::prelude::*;
//!
//! # fn main() -> keyflow_errors::KeyflowResult<()> {
//! let world = World::new(WorldConfig::default())?;
//!
//! // An operator that counts up to 100 through a self-loop.
//! let counter: Op<i64, (Read<i64>,), (Out<i64, i64>, Out<i64, i64>)> = Op::new(
//!     &world,
//!     "counter",
//!     &["value"],
//!     &["result", "next"],
//!     |key: &i64, (value,): (&i64,), (result, next): &(Out<i64, i64>, Out<i64, i64>)| {
//!         if *value >= 100 {
//!             result.send(*key, *value)
//!         } else {
//!             next.send(*key + 1, *value + 1)
//!         }
//!     },
//! )?;
//!
//! let sink: Op<i64, (Read<i64>,), ()> = Op::new(
//!     &world,
//!     "sink",
//!     &["final"],
//!     &[],
//!     |key: &i64, (value,): (&i64,), _: &()| {
//!         println!("{key} -> {value}");
//!         Ok(())
//!     },
//! )?;
//!
//! Edge::new("next").connect(&counter.outputs().1, &counter.inputs().0)?;
//! Edge::new("result").connect(&counter.outputs().0, &sink.inputs().0)?;
//! counter.make_executable()?;
//! sink.make_executable()?;
//!
//! world.execute()?;
//! counter.invoke(0, (0,))?;
//! world.fence()?;
//! world.finalize()
//! # }
//! ```

mod current;
mod edge;
mod op;
mod pool;
mod slots;
mod table;
mod task;
mod terminal;
mod world;

pub use edge::Edge;
pub use keyflow_comm::Rank;
pub use op::Op;
pub use slots::{InputSet, InputSlot, OutputSet, Read, Write};
pub use terminal::{In, Out};
pub use world::{TransportConfig, World, WorldConfig};

/// Metric names recorded by the runtime.
pub mod recorded {
    /// Tasks materialized (counter).
    pub const TASKS_CREATED: &str = "keyflow.tasks.created";
    /// Tasks handed to the worker pool (counter).
    pub const TASKS_SCHEDULED: &str = "keyflow.tasks.scheduled";
    /// Task bodies completed (counter).
    pub const TASKS_EXECUTED: &str = "keyflow.tasks.executed";
    /// Active messages sent to a remote rank (counter).
    pub const MESSAGES_SENT: &str = "keyflow.am.sent";
}

/// The usual imports for building a graph.
pub mod prelude {
    pub use crate::{Edge, In, InputSet, Op, Out, OutputSet, Rank, Read, TransportConfig, World,
                    WorldConfig, Write};
    pub use keyflow_data::{Key, Value};
    pub use keyflow_errors::{KeyflowError, KeyflowResult};
}
