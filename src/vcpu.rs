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

use core::fmt;

use tock_registers::LocalRegisterCopy;

use crate::TrapFrame;
use crate::context_frame::{FpRegisters, GuestSystemRegisters};
use crate::pcpu::CpuId;
use crate::regs::HCR;
use crate::security::SecurityState;
use crate::stage2::Stage2Root;
use crate::vm::VmId;

const INITIAL_SCTLR_EL1: u64 = 0x00C5_0838;
/// Cortex-A53 r0p2
const INITIAL_VPIDR_EL2: u64 = 0x410F_D032;

/// Index of a vCPU in the hypervisor's vCPU pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VCpuId(pub(crate) usize);

impl VCpuId {
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for VCpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vcpu#{}", self.0)
    }
}

/// The state of a vCPU.
///
/// ```text
/// Init -> Ready -> Run -> Sleep -> Ready -> ...
///                  Run -> Init (shutdown)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VCpuState {
    /// Created, or shut down. Not known to any scheduler.
    Init,
    /// Queued on its VM's scheduler.
    Ready,
    /// Current on a physical core.
    Run,
    /// Waiting for an interrupt.
    Sleep,
}

/// Virtual interrupts waiting to be latched into `HCR_EL2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PendingInterrupts {
    pub serror: bool,
    pub irq: bool,
    pub fiq: bool,
}

/// Per-vCPU shadow of the BCM2836 core-local registers.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreLocalShadow {
    /// Core timer interrupt control, guest-owned bits.
    pub timer_intr_ctl: u32,
    /// Core mailbox interrupt control.
    pub mbox_intr_ctl: u32,
    /// The four core mailboxes.
    pub mailbox: [u32; 4],
}

/// Configuration for creating a new [`VCpu`].
#[derive(Debug, Clone, Copy)]
pub struct VCpuCreateConfig {
    pub vm: VmId,
    /// Index of the vCPU inside its VM, reported through `VMPIDR_EL2`.
    pub id: usize,
    pub root: Stage2Root,
    /// Physical address of the VM's message buffer.
    pub msg_buffer: Option<u64>,
    pub entry: u64,
    /// Initial `x0`.
    pub boot_arg: u64,
}

/// A virtual CPU within a guest.
#[derive(Debug)]
pub struct VCpu {
    vm: VmId,
    id: usize,
    pub(crate) state: VCpuState,
    pub(crate) phys_cpu: Option<CpuId>,
    root: Stage2Root,
    msg_buffer: Option<u64>,
    /// guest trap context
    pub(crate) ctx: TrapFrame,
    pub(crate) fp: FpRegisters,
    pub(crate) sysregs: GuestSystemRegisters,
    pub(crate) pending: PendingInterrupts,
    pub(crate) local: CoreLocalShadow,
    pub(crate) security: SecurityState,
    /// Core whose timer table holds this vCPU's virtual timer wake-up.
    pub(crate) vtimer_event: Option<CpuId>,
}

impl VCpu {
    pub fn new(config: VCpuCreateConfig) -> Self {
        let mut ctx = TrapFrame::default();
        ctx.set_argument(config.boot_arg);
        ctx.set_exception_pc(config.entry);

        let sysregs = GuestSystemRegisters {
            sctlr_el1: INITIAL_SCTLR_EL1,
            vpidr_el2: INITIAL_VPIDR_EL2,
            vmpidr_el2: (1 << 31) | config.id as u64,
            ..Default::default()
        };

        Self {
            vm: config.vm,
            id: config.id,
            state: VCpuState::Init,
            phys_cpu: None,
            root: config.root,
            msg_buffer: config.msg_buffer,
            ctx,
            fp: FpRegisters::default(),
            sysregs,
            pending: PendingInterrupts::default(),
            local: CoreLocalShadow::default(),
            security: SecurityState::default(),
            vtimer_event: None,
        }
    }

    pub fn vm(&self) -> VmId {
        self.vm
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> VCpuState {
        self.state
    }

    pub fn phys_cpu(&self) -> Option<CpuId> {
        self.phys_cpu
    }

    pub fn root(&self) -> Stage2Root {
        self.root
    }

    pub fn msg_buffer(&self) -> Option<u64> {
        self.msg_buffer
    }

    pub fn context(&self) -> &TrapFrame {
        &self.ctx
    }

    /// Folds the highest priority pending virtual interrupt into `hcr` and
    /// consumes it. SError wins over FIQ, FIQ over IRQ.
    pub fn latch_virtual_interrupt(&mut self, hcr: u64) -> u64 {
        let mut hcr = LocalRegisterCopy::<u64, HCR::Register>::new(hcr);
        hcr.modify(HCR::VSE::CLEAR + HCR::VF::CLEAR + HCR::VI::CLEAR);
        if self.pending.serror {
            self.pending.serror = false;
            hcr.modify(HCR::VSE::SET);
        } else if self.pending.fiq {
            self.pending.fiq = false;
            hcr.modify(HCR::VF::SET);
        } else if self.pending.irq {
            self.pending.irq = false;
            hcr.modify(HCR::VI::SET);
        }
        hcr.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vcpu(id: usize) -> VCpu {
        VCpu::new(VCpuCreateConfig {
            vm: VmId(0),
            id,
            root: Stage2Root::from_paddr(0x8_0000),
            msg_buffer: None,
            entry: 0x8_0000,
            boot_arg: 0x80_0000,
        })
    }

    #[test]
    fn test_initial_context() {
        let v = vcpu(2);
        assert_eq!(v.state(), VCpuState::Init);
        assert_eq!(v.ctx.exception_pc(), 0x8_0000);
        assert_eq!(v.ctx.gpr(0), 0x80_0000);
        assert_eq!(v.ctx.exception_level(), 1);
        assert_eq!(v.sysregs.vmpidr_el2, 0x8000_0002);
        assert_eq!(v.sysregs.sctlr_el1, 0x00C5_0838);
    }

    #[test]
    fn test_latch_priority() {
        let mut v = vcpu(0);
        v.pending = PendingInterrupts {
            serror: true,
            irq: true,
            fiq: true,
        };
        // a stale VI from the previous entry is dropped
        let hcr = v.latch_virtual_interrupt(1 << 7);
        assert_eq!(hcr, 1 << 8);
        assert_eq!(v.latch_virtual_interrupt(hcr), 1 << 6);
        assert_eq!(v.latch_virtual_interrupt(0), 1 << 7);
        assert_eq!(v.latch_virtual_interrupt(0x8000_0000), 0x8000_0000);
    }
}
