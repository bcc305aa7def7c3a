//! Devices module
//!
//! Contains the NV2A-style GPU and the APU register window

mod apu;
pub mod nv2a;

pub use apu::{Apu, ApuSnapshot};
pub use nv2a::{GpuConfig, GpuCore, GpuSnapshot, GpuState};
