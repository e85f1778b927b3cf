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

//! Emulated MMIO devices.
//!
//! A guest access to an unmapped IPA that falls in a registered range is
//! decoded by the trap handler and forwarded here. *Full* devices exist only
//! in software. *Exclusive* devices front a real page and filter each
//! register access through the accessing VM's grants. When ranges overlap
//! the full device wins.

mod arm_intc;
mod core_mailbox;
mod cprman;
mod gpio;
mod local_intc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};

use crate::hal::HypHal;
use crate::pcpu::CpuId;
use crate::state::{Env, VmmState};
use crate::vcpu::{VCpu, VCpuId};
use crate::vm::Vm;

pub(crate) use self::arm_intc::{disable_gpu_lines, gpu_pending};
pub(crate) use self::local_intc::{HYP_MBOX_BITS, irq_source, mbox_int_ctl};

/// Inclusive physical address range of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MmioRange {
    pub start: u64,
    pub end: u64,
}

impl MmioRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub const fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MmioKind {
    /// Every register is emulated.
    Full,
    /// Backed by hardware; accesses are filtered by ownership.
    Exclusive,
}

/// Size of a decoded load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessWidth {
    Byte,
    Half,
    Word,
    Double,
}

impl AccessWidth {
    /// From the `size` field (bits 31:30) of a load/store encoding.
    pub fn from_size_field(size: u32) -> Self {
        match size & 0b11 {
            0 => Self::Byte,
            1 => Self::Half,
            2 => Self::Word,
            _ => Self::Double,
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Self::Byte => 8,
            Self::Half => 16,
            Self::Word => 32,
            Self::Double => 64,
        }
    }
}

/// Everything an emulated register access may touch.
pub(crate) struct MmioContext<'a> {
    pub state: &'a mut VmmState,
    pub env: Env<'a>,
    /// The accessing vCPU, or the one being switched on a save/restore.
    pub vcpu: VCpuId,
}

impl MmioContext<'_> {
    pub fn hal(&self) -> &dyn HypHal {
        self.env.hal
    }

    pub fn current(&self) -> &VCpu {
        &self.state.vcpus[self.vcpu.index()]
    }

    pub fn current_mut(&mut self) -> &mut VCpu {
        &mut self.state.vcpus[self.vcpu.index()]
    }

    pub fn vm(&self) -> &Vm {
        &self.state.vms[self.current().vm().index()]
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        let vm = self.current().vm();
        &mut self.state.vms[vm.index()]
    }

    /// vCPU `index` of the accessing VM. Indices past the VM's vCPU count
    /// are rejected.
    pub fn sibling(&self, index: usize) -> AxResult<VCpuId> {
        match self.vm().vcpus().get(index) {
            Some(&id) => Ok(id),
            None => ax_err!(
                InvalidInput,
                "register of a cpu that is not assigned to the vm"
            ),
        }
    }
}

/// An emulated device on the MMIO bus.
pub(crate) trait VirtMmioDevice: Send + Sync {
    fn name(&self) -> &'static str;

    fn range(&self) -> MmioRange;

    fn kind(&self) -> MmioKind;

    /// Reads the 32-bit register at `addr`.
    fn read(&self, cx: &mut MmioContext<'_>, addr: u64) -> AxResult<u32>;

    /// Writes the 32-bit register at `addr`.
    fn write(&self, cx: &mut MmioContext<'_>, addr: u64, value: u32) -> AxResult;

    /// Clears the hardware state this device shares between VMs on the
    /// cores in `cpus`, none of which holds live guest state.
    fn reset(&self, _hal: &dyn HypHal, _cpus: &[CpuId]) {}

    /// Captures the hardware bits owned by `cx.vcpu` before it leaves the
    /// calling core, and removes them from the hardware.
    fn save(&self, _cx: &mut MmioContext<'_>) {}

    /// Reapplies the bits captured by [`VirtMmioDevice::save`] on the
    /// calling core.
    fn restore(&self, _cx: &mut MmioContext<'_>) {}
}

/// The device table, consulted on every MMIO trap.
pub(crate) struct MmioBus {
    full: Vec<Box<dyn VirtMmioDevice>>,
    exclusive: Vec<Box<dyn VirtMmioDevice>>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self {
            full: Vec::new(),
            exclusive: Vec::new(),
        }
    }

    /// The emulated peripherals of a BCM2837.
    pub fn bcm2837() -> Self {
        let mut bus = Self::new();
        bus.register(Box::new(local_intc::LocalIntc));
        bus.register(Box::new(core_mailbox::CoreMailbox));
        bus.register(Box::new(cprman::Cprman));
        bus.register(Box::new(arm_intc::ArmIntc));
        bus.register(Box::new(gpio::Gpio));
        bus
    }

    pub fn register(&mut self, device: Box<dyn VirtMmioDevice>) {
        let range = device.range();
        debug!(
            "mmio: {} {:?} at {:#x}..={:#x}",
            device.name(),
            device.kind(),
            range.start,
            range.end
        );
        match device.kind() {
            MmioKind::Full => self.full.push(device),
            MmioKind::Exclusive => self.exclusive.push(device),
        }
    }

    pub fn find(&self, addr: u64) -> Option<&dyn VirtMmioDevice> {
        self.full
            .iter()
            .chain(self.exclusive.iter())
            .find(|dev| dev.range().contains(addr))
            .map(|dev| dev.as_ref())
    }

    fn device_for(&self, addr: u64, width: AccessWidth) -> AxResult<&dyn VirtMmioDevice> {
        let Some(device) = self.find(addr) else {
            return ax_err!(NotFound, "not an emulated mmio address");
        };
        if width != AccessWidth::Word {
            error!(
                "{}: {}-bit access to {:#x}, only 32-bit accesses are emulated",
                device.name(),
                width.bits(),
                addr
            );
            return ax_err!(Unsupported);
        }
        Ok(device)
    }

    pub fn read(&self, cx: &mut MmioContext<'_>, addr: u64, width: AccessWidth) -> AxResult<u32> {
        let device = self.device_for(addr, width)?;
        let value = device.read(cx, addr)?;
        trace!("{}: read {:#x} -> {:#x}", device.name(), addr, value);
        Ok(value)
    }

    pub fn write(
        &self,
        cx: &mut MmioContext<'_>,
        addr: u64,
        value: u32,
        width: AccessWidth,
    ) -> AxResult {
        let device = self.device_for(addr, width)?;
        trace!("{}: write {:#x} <- {:#x}", device.name(), addr, value);
        device.write(cx, addr, value)
    }

    pub fn reset(&self, hal: &dyn HypHal, cpus: &[CpuId]) {
        for device in self.full.iter().chain(self.exclusive.iter()) {
            device.reset(hal, cpus);
        }
    }

    pub fn save(&self, cx: &mut MmioContext<'_>) {
        for device in &self.full {
            device.save(cx);
        }
    }

    pub fn restore(&self, cx: &mut MmioContext<'_>) {
        for device in &self.full {
            device.restore(cx);
        }
    }
}

/// A VMM with the board's device table, driven register by register.
#[cfg(test)]
pub(crate) mod bench {
    use alloc::vec;

    use super::*;
    use crate::hypervisor::HypConfig;
    use crate::mock::MockHal;
    use crate::stage2::Stage2Manager;
    use crate::timer::TimerEvents;
    use crate::vm::{MemoryRegion, RegionKind, VmConfig};

    pub(crate) struct Bench {
        pub hal: MockHal,
        timers: TimerEvents,
        stage2: Stage2Manager,
        bus: MmioBus,
        pub state: VmmState,
    }

    impl Bench {
        pub fn new() -> Self {
            let hal = MockHal::new();
            let stage2 = Stage2Manager::new(&hal, 64);
            Self {
                hal,
                timers: TimerEvents::new(4, 100),
                stage2,
                bus: MmioBus::bcm2837(),
                state: VmmState::new(&HypConfig::default()),
            }
        }

        fn split(&mut self) -> (Env<'_>, &mut VmmState) {
            let env = Env {
                hal: &self.hal,
                timers: &self.timers,
                stage2: &self.stage2,
                bus: &self.bus,
            };
            (env, &mut self.state)
        }

        /// Creates a one-page VM and returns its vCPUs.
        pub fn vm(&mut self, config: VmConfig) -> Vec<VCpuId> {
            let config = VmConfig {
                memory_map: vec![MemoryRegion::new(0x0, 0xfff, RegionKind::Plain)],
                ..config
            };
            let (env, state) = self.split();
            let vm = state.create_vm(env, &config).unwrap();
            state.vms[vm.index()].vcpus().to_vec()
        }

        pub fn read(&mut self, vcpu: VCpuId, addr: u64) -> AxResult<u32> {
            let (env, state) = self.split();
            let mut cx = MmioContext { state, env, vcpu };
            env.bus.read(&mut cx, addr, AccessWidth::Word)
        }

        pub fn write(&mut self, vcpu: VCpuId, addr: u64, value: u32) -> AxResult {
            let (env, state) = self.split();
            let mut cx = MmioContext { state, env, vcpu };
            env.bus.write(&mut cx, addr, value, AccessWidth::Word)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_device_table() {
        let bus = MmioBus::bcm2837();
        let name = |addr| bus.find(addr).map(|dev| dev.name());
        assert_eq!(name(0x4000_000C), Some("bcm2836-local-intc"));
        assert_eq!(name(0x4000_00C4), Some("bcm2836-mailbox"));
        assert_eq!(name(0x3F10_2FFC), Some("bcm2835-cprman"));
        assert_eq!(name(0x3F00_B210), Some("bcm2835-arm-intc"));
        assert_eq!(name(0x3F20_0004), Some("bcm2835-gpio"));
        assert_eq!(name(0x3F20_0100), None);
        assert_eq!(name(0x3F20_1000), None);
    }

    struct Stub {
        name: &'static str,
        range: MmioRange,
        kind: MmioKind,
    }

    impl VirtMmioDevice for Stub {
        fn name(&self) -> &'static str {
            self.name
        }

        fn range(&self) -> MmioRange {
            self.range
        }

        fn kind(&self) -> MmioKind {
            self.kind
        }

        fn read(&self, _cx: &mut MmioContext<'_>, _addr: u64) -> AxResult<u32> {
            Ok(0)
        }

        fn write(&self, _cx: &mut MmioContext<'_>, _addr: u64, _value: u32) -> AxResult {
            Ok(())
        }
    }

    #[test]
    fn test_full_devices_shadow_exclusive_ones() {
        let mut bus = MmioBus::new();
        bus.register(Box::new(Stub {
            name: "page",
            range: MmioRange::new(0x3F20_0000, 0x3F20_0FFF),
            kind: MmioKind::Exclusive,
        }));
        bus.register(Box::new(Stub {
            name: "window",
            range: MmioRange::new(0x3F20_0040, 0x3F20_007F),
            kind: MmioKind::Full,
        }));
        let name = |addr| bus.find(addr).map(|dev| dev.name());
        assert_eq!(name(0x3F20_0040), Some("window"));
        assert_eq!(name(0x3F20_007C), Some("window"));
        assert_eq!(name(0x3F20_0080), Some("page"));
        assert_eq!(name(0x3F20_1000), None);
    }

    #[test]
    fn test_access_width() {
        assert_eq!(AccessWidth::from_size_field(0b10), AccessWidth::Word);
        assert_eq!(AccessWidth::from_size_field(0b11).bits(), 64);
        assert_eq!(AccessWidth::from_size_field(0).bits(), 8);
    }
}
