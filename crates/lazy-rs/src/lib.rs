pub mod backend;
mod env;
pub mod error;
pub mod lazy;
pub mod ops;
pub mod tensor;
pub mod view;

pub use backend::spec::{Backend, RawBuffer};
pub use env::default_device;
pub use error::LazyError;
pub use lazy::{BufferId, FusionLevel, LazyBuffer, LazyConfig, ScheduleItem};
pub use tensor::{DType, HostArray, Shape};
