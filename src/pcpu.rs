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

use tock_registers::LocalRegisterCopy;

use crate::hal::{HypHal, SysReg};
use crate::regs::{HCR, VTCR};
use crate::sched::SchedulerId;
use crate::vcpu::VCpuId;

/// Index of a physical core.
pub type CpuId = usize;

/// Per-CPU bookkeeping of the hypervisor.
#[derive(Debug)]
pub struct PhysCpu {
    /// per cpu id
    pub id: CpuId,
    /// counter frequency in Hz, read from `CNTFRQ_EL0` when the core comes up
    pub freq: u64,
    pub scheduler: Option<SchedulerId>,
    pub schedule_needed: bool,
    /// vCPU running (or about to run) on this core.
    pub current: Option<VCpuId>,
    /// vCPU whose state was live in hardware when the last trap was taken.
    pub last: Option<VCpuId>,
}

impl PhysCpu {
    pub fn new(id: CpuId, scheduler: Option<SchedulerId>) -> Self {
        Self {
            id,
            freq: 0,
            scheduler,
            schedule_needed: scheduler.is_some(),
            current: None,
            last: None,
        }
    }

    /// Programs the EL2 controls every core needs before running guests.
    ///
    /// `trap_idle` traps `WFI`/`WFE` so an idle guest gives its core back.
    pub fn hardware_enable(&mut self, hal: &dyn HypHal, trap_idle: bool) {
        self.freq = hal.read_sysreg(SysReg::CntfrqEl0);

        let mut hcr = LocalRegisterCopy::<u64, HCR::Register>::new(0);
        hcr.modify(
            HCR::VM::SET
                + HCR::SWIO::SET
                + HCR::FMO::SET
                + HCR::IMO::SET
                + HCR::AMO::SET
                + HCR::RW::SET,
        );
        if trap_idle {
            hcr.modify(HCR::TWI::SET + HCR::TWE::SET);
        }
        hal.write_sysreg(SysReg::HcrEl2, hcr.get());

        let vtcr = VTCR::T0SZ.val(64 - 39)
            + VTCR::SL0::Level1
            + VTCR::IRGN0::WriteBack
            + VTCR::ORGN0::WriteBack
            + VTCR::TG0::Granule4KB
            + VTCR::PS::PA_32B_4GB
            + VTCR::RES1::SET;
        hal.write_sysreg(SysReg::VtcrEl2, vtcr.value);

        debug!(
            "cpu {} enabled: hcr {:#x}, vtcr {:#x}, freq {} Hz",
            self.id,
            hcr.get(),
            vtcr.value,
            self.freq
        );
    }

    /// Milliseconds covered by `ticks` of the system counter.
    pub fn ticks_to_ms(&self, ticks: u64) -> u64 {
        if self.freq == 0 {
            return 0;
        }
        ((ticks as u128 * 1000) / self.freq as u128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHal;

    #[test]
    fn test_hardware_enable_traps_idle_on_request() {
        let hal = MockHal::new();
        let mut cpu = PhysCpu::new(0, None);
        cpu.hardware_enable(&hal, true);
        let hcr = hal.sysreg(SysReg::HcrEl2);
        assert_eq!(hcr & 0x8000_003B, 0x8000_003B);
        assert_eq!(hcr & (0b11 << 13), 0b11 << 13);
        assert_eq!(hal.sysreg(SysReg::VtcrEl2), 0x8000_0559);

        cpu.hardware_enable(&hal, false);
        assert_eq!(hal.sysreg(SysReg::HcrEl2) & (0b11 << 13), 0);
    }

    #[test]
    fn test_ticks_to_ms() {
        let mut cpu = PhysCpu::new(1, None);
        assert_eq!(cpu.ticks_to_ms(1000), 0);
        cpu.freq = 19_200_000;
        assert_eq!(cpu.ticks_to_ms(1_920_000), 100);
    }
}
