use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device, Result,
};
use tracing::info;

/// First CUDA device, then Metal, then the host. `cpu` forces the host.
pub fn best_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if cuda_is_available() {
        Device::new_cuda(0)
    } else if metal_is_available() {
        Device::new_metal(0)
    } else {
        info!("No accelerator available, running on the host.");
        Ok(Device::Cpu)
    }
}
