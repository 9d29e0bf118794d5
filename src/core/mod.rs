//! Pool manager: lifecycle, dispatch, result correlation, timeouts and
//! worker maintenance.

pub mod error;
pub mod handler;
pub mod info;
pub mod maintainer;
pub mod pool;
pub mod result;
pub mod scaler;
pub mod state;
pub mod supervisor;
pub mod task;

pub use error::{AppResult, PoolError, TaskError};
pub use info::{PoolInfo, TaskLimit};
pub use pool::TaskPool;
pub use result::{AsyncResult, ResultRegistry};
pub use state::{Lifecycle, WorkerState};
pub use supervisor::{classify, TimeoutState};
pub use task::{ApplyOptions, Callback, Task};
