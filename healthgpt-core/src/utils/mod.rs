pub(crate) mod debug;
pub mod device;
pub(crate) mod log;

pub use debug::setup_logger_and_debug;
pub use device::best_device;
