//! Test execution engine
//!
//! Case runners, scheduler adapters, the capability registry and the session
//! driver that ties them to the graph and the resource pool.

mod driver;
mod registry;
mod runner;

pub use driver::{Driver, DriverConfig};
pub use registry::Registry;
pub use runner::{
    case_dir_name, case_environment, parse_case_codes, shell_quote, BatchScript, CaseRunner,
    JobHandle, JobOutcome, ProcessRunner, RunContext, SchedulerAdapter, ShellAdapter,
    INTERRUPTED_EXIT_CODE,
};
