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

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::sched::SchedulerId;
use crate::security::SECURITY_CFI;
use crate::stage2::Stage2Root;
use crate::vcpu::VCpuId;

/// Size of the hypervisor↔guest message buffer mapped into a VM.
pub const MSG_BUFFER_SIZE: usize = 0x1000;

const FIQ_CTL_ENABLE: u32 = 1 << 7;
const FIQ_CTL_SOURCE: u32 = 0x7f;

/// Index of a VM in the hypervisor's VM pool. Slots are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(pub(crate) usize);

impl VmId {
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What backs a region of guest memory.
#[derive(Debug, Clone, Copy)]
pub enum RegionKind {
    /// Zeroed RAM.
    Plain,
    /// RAM preloaded with a guest image.
    Image(&'static [u8]),
    /// RAM shared with the hypervisor for `PUTS`.
    MessageBuffer,
}

/// One entry of a VM's IPA memory map. `end` is inclusive.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn new(start: u64, end: u64, kind: RegionKind) -> Self {
        Self { start, end, kind }
    }

    pub const fn len(&self) -> usize {
        (self.end + 1 - self.start) as usize
    }
}

/// Everything needed to create a VM.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub name: String,
    /// Number of vCPUs, at most [`MAX_VCPUS_PER_VM`](crate::MAX_VCPUS_PER_VM)
    /// and at most the number of physical cores.
    pub vcpu_count: usize,
    pub scheduler: SchedulerId,
    /// FCFS priority, 0 is the highest.
    pub priority: u8,
    /// Guest entry point (IPA).
    pub entry: u64,
    /// Initial `x0` of every vCPU, e.g. the device tree address.
    pub boot_arg: u64,
    pub memory_map: Vec<MemoryRegion>,
    /// See [`SECURITY_CFI`].
    pub security_options: u64,
    /// GPU interrupt lines owned by the VM.
    pub irq_grant: u64,
    /// [`ExclusiveMmio`](crate::ExclusiveMmio) pages owned by the VM.
    pub mmio_grant: u64,
    /// GPIO pins owned by the VM.
    pub gpio_grant: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: String::from("guest"),
            vcpu_count: 1,
            scheduler: SchedulerId(0),
            priority: 0,
            entry: 0x8_0000,
            boot_arg: 0x80_0000,
            memory_map: Vec::new(),
            security_options: SECURITY_CFI,
            irq_grant: 0,
            mmio_grant: 0,
            gpio_grant: 0,
        }
    }
}

/// A created VM.
#[derive(Debug)]
pub struct Vm {
    name: String,
    pub(crate) vcpus: Vec<VCpuId>,
    scheduler: SchedulerId,
    priority: u8,
    root: Stage2Root,
    msg_buffer: Option<u64>,
    security_options: u64,
    gpio_grant: u64,
    irq_grant: u64,
    /// Core-local GPU routing register: bits 1:0 pick the IRQ vCPU, 3:2 the FIQ vCPU.
    pub(crate) gpu_route: u32,
    /// ARM interrupt controller FIQ control as written by the guest.
    pub(crate) fiq_ctl: u32,
    pub(crate) shut_down: bool,
}

impl Vm {
    pub(crate) fn new(config: &VmConfig, root: Stage2Root, msg_buffer: Option<u64>) -> Self {
        Self {
            name: config.name.clone(),
            vcpus: Vec::with_capacity(config.vcpu_count),
            scheduler: config.scheduler,
            priority: config.priority,
            root,
            msg_buffer,
            security_options: config.security_options,
            gpio_grant: config.gpio_grant,
            irq_grant: config.irq_grant,
            gpu_route: 0,
            fiq_ctl: 0,
            shut_down: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vcpus(&self) -> &[VCpuId] {
        &self.vcpus
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub fn scheduler(&self) -> SchedulerId {
        self.scheduler
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn root(&self) -> Stage2Root {
        self.root
    }

    pub fn msg_buffer(&self) -> Option<u64> {
        self.msg_buffer
    }

    pub fn cfi_enabled(&self) -> bool {
        self.security_options & SECURITY_CFI != 0
    }

    pub fn gpio_grant(&self) -> u64 {
        self.gpio_grant
    }

    pub fn irq_grant(&self) -> u64 {
        self.irq_grant
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// vCPU receiving the VM's GPU IRQs.
    pub fn irq_vcpu(&self) -> Option<VCpuId> {
        self.vcpus.get((self.gpu_route & 0b11) as usize).copied()
    }

    /// vCPU receiving the VM's GPU FIQ.
    pub fn fiq_vcpu(&self) -> Option<VCpuId> {
        self.vcpus.get(((self.gpu_route >> 2) & 0b11) as usize).copied()
    }

    /// GPU line the guest routed to FIQ, if FIQ is enabled.
    pub fn fiq_line(&self) -> Option<usize> {
        (self.fiq_ctl & FIQ_CTL_ENABLE != 0).then_some((self.fiq_ctl & FIQ_CTL_SOURCE) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_with(vcpus: usize) -> Vm {
        let config = VmConfig {
            vcpu_count: vcpus,
            ..Default::default()
        };
        let mut vm = Vm::new(&config, Stage2Root::from_paddr(0x1000), None);
        vm.vcpus = (0..vcpus).map(|i| VCpuId(10 + i)).collect();
        vm
    }

    #[test]
    fn test_region_length_is_inclusive() {
        let region = MemoryRegion::new(0x0, 0x3ff_ffff, RegionKind::Plain);
        assert_eq!(region.len(), 0x400_0000);
    }

    #[test]
    fn test_gpu_route_selects_vcpus() {
        let mut vm = vm_with(3);
        assert_eq!(vm.irq_vcpu(), Some(VCpuId(10)));
        vm.gpu_route = 0b1001;
        assert_eq!(vm.irq_vcpu(), Some(VCpuId(11)));
        assert_eq!(vm.fiq_vcpu(), Some(VCpuId(12)));
    }

    #[test]
    fn test_fiq_line_needs_enable() {
        let mut vm = vm_with(1);
        vm.fiq_ctl = 57;
        assert_eq!(vm.fiq_line(), None);
        vm.fiq_ctl = 0x80 | 57;
        assert_eq!(vm.fiq_line(), Some(57));
    }
}
