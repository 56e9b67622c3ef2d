//! CUDA context management for VRAM registrations.
//!
//! Transports that touch device memory need the owning context current on
//! the registering and progressing threads. The engine caches the device's
//! primary context on first VRAM registration and re-applies it on every
//! progress iteration. A single-device assumption is recorded; a second
//! device on the same engine is accepted only when the address workaround
//! is disabled via `FABRIX_DISABLE_CUDA_ADDR_WA`.

use std::sync::{Arc, Mutex};

use cudarc::driver::CudaDevice;

use crate::config::EngineParams;
use crate::error::{FabrixError, Result};
use crate::types::MemKind;

/// Cached device context, one per engine.
pub struct CudaCtx {
    workaround: bool,
    dev: Mutex<Option<(u32, Arc<CudaDevice>)>>,
}

impl CudaCtx {
    pub fn new() -> Self {
        Self {
            workaround: EngineParams::cuda_addr_workaround(),
            dev: Mutex::new(None),
        }
    }

    /// Bind and cache the context for `dev_id` on first use. Returns whether
    /// the cached context changed (progress threads must re-apply).
    pub fn update(&self, dev_id: u32) -> Result<bool> {
        let mut dev = self.dev.lock().unwrap();
        match dev.as_ref() {
            Some((cached, _)) if *cached == dev_id => Ok(false),
            Some((cached, _)) if self.workaround => Err(FabrixError::not_supported(format!(
                "engine bound to CUDA device {cached}; registering device {dev_id} requires \
                 FABRIX_DISABLE_CUDA_ADDR_WA"
            ))),
            _ => {
                let device = CudaDevice::new(dev_id as usize).map_err(|e| {
                    FabrixError::backend_with_source(format!("CUDA device {dev_id} open"), e)
                })?;
                *dev = Some((dev_id, device));
                Ok(true)
            }
        }
    }

    /// Make the cached context current on the calling thread. A no-op until
    /// the first VRAM registration, or when the workaround is disabled.
    pub fn apply(&self) {
        if !self.workaround {
            return;
        }
        if let Some((_, device)) = self.dev.lock().unwrap().as_ref() {
            if let Err(e) = device.bind_to_thread() {
                tracing::warn!("failed to bind cached CUDA context: {e}");
            }
        }
    }

    /// Whether an address the caller declared as device memory actually is.
    /// Degraded detection warns and proceeds best-effort.
    pub fn is_device_ptr(&self, addr: u64) -> bool {
        use cudarc::driver::sys;
        let mut mem_type: u32 = 0;
        let rc = unsafe {
            sys::cuPointerGetAttribute(
                &mut mem_type as *mut u32 as *mut std::ffi::c_void,
                sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_MEMORY_TYPE,
                addr,
            )
        };
        rc == sys::CUresult::CUDA_SUCCESS
            && mem_type == sys::CUmemorytype::CU_MEMORYTYPE_DEVICE as u32
    }
}

impl Default for CudaCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy between registered regions when at least one side is VRAM.
pub fn copy(src: u64, src_kind: MemKind, dst: u64, dst_kind: MemKind, len: usize) -> Result<()> {
    use cudarc::driver::result;
    let map_err =
        |e: cudarc::driver::DriverError| FabrixError::backend_with_source("CUDA memcpy", e);

    unsafe {
        match (src_kind, dst_kind) {
            (MemKind::Vram, MemKind::Vram) => {
                result::memcpy_dtod_sync(dst, src, len).map_err(map_err)
            }
            (MemKind::Vram, _) => {
                let dst = std::slice::from_raw_parts_mut(dst as *mut u8, len);
                result::memcpy_dtoh_sync(dst, src).map_err(map_err)
            }
            (_, MemKind::Vram) => {
                let src = std::slice::from_raw_parts(src as *const u8, len);
                result::memcpy_htod_sync(dst, src).map_err(map_err)
            }
            _ => {
                std::ptr::copy(src as *const u8, dst as *mut u8, len);
                Ok(())
            }
        }
    }
}

/// Whether a CUDA driver and at least one device are usable.
pub fn is_cuda_available() -> bool {
    CudaDevice::new(0).is_ok()
}
