//! Controller/worker split: the worker owns the pipelines, the controller
//! correlates requests with replies over three message channels.

pub mod channel;
pub mod dispatcher;
pub mod handler;
pub mod ipc_types;
pub mod process_manager;
pub mod supervisor;
pub mod worker_main;

pub use dispatcher::Dispatcher;
pub use process_manager::{ChildProcessLauncher, ThreadLauncher};
pub use supervisor::{ProcessState, ProcessSupervisor};
