pub mod cmd;
pub mod config;
pub mod cowtree;
pub mod error;
pub mod executor;
pub mod flow;
pub mod parsing;
pub mod planner;
pub mod root;
pub mod sys;
pub mod vol;

pub use cmd::{Cmd, Pipeline, StreamSpec};
pub use config::Config;
pub use cowtree::COWTree;
pub use error::BtrSyncError;
pub use executor::{BtrSync, RunResult};
pub use planner::{plan_transfers, flatten_layout, preserve_layout, Plan, PlanningResult};
pub use root::Root;
pub use vol::Vol;

#[cfg(test)]
mod tests {
    pub mod prelude {
        pub use indoc::indoc;
        pub use serial_test::serial;
    }
}
