// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

mod context_frame;
mod exception_utils;
mod exit;
mod grant;
mod hal;
mod hypercall;
mod hypervisor;
mod irq;
mod lock;
mod pcpu;
mod pmu;
mod regs;
mod sched;
mod security;
mod smp;
mod stage2;
mod state;
mod sync;
mod timer;
mod vcpu;
mod vdev;
mod vm;
mod vtimer;

pub mod arch;

#[cfg(test)]
mod mock;
#[cfg(test)]
mod test;

pub use self::context_frame::{FpRegisters, GuestSystemRegisters};
pub use self::exit::TrapExit;
pub use self::grant::{ExclusiveMmio, GPU_IRQ_NUM};
pub use self::hal::{HypHal, SysReg, TranslationStage};
pub use self::hypervisor::{HypConfig, Hypervisor};
pub use self::pcpu::CpuId;
pub use self::sched::{SchedulerConfig, SchedulerId, SchedulerKind};
pub use self::stage2::{GuestTranslation, Stage2Root};
pub use self::vcpu::{VCpuId, VCpuState};
pub use self::vm::{MSG_BUFFER_SIZE, MemoryRegion, RegionKind, VmConfig, VmId};

/// Context frame saved by the exception vectors on every trap to EL2.
pub type TrapFrame = context_frame::Aarch64ContextFrame;

/// Maximum number of physical cores; the BCM2836 local block has four per-core register banks.
pub const CPU_NUM: usize = 4;

/// Maximum number of vCPUs a single VM may declare.
pub const MAX_VCPUS_PER_VM: usize = 4;

/// Granule of stage-2 mappings.
pub const PAGE_SIZE: usize = 0x1000;
