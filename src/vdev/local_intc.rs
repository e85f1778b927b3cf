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

//! BCM2836 core-local interrupt block (`0x4000_0000..=0x4000_007F`).
//!
//! The block is shared by all cores and fully emulated. Per-core registers
//! are indexed by the guest's vCPU number. The hypervisor keeps the CNTHP
//! timer interrupt and mailbox 0 for itself; everything else in the timer
//! interrupt control follows the vCPU that owns the core.

use axerrno::{AxResult, ax_err};

use super::{MmioContext, MmioKind, MmioRange, VirtMmioDevice};
use crate::hal::HypHal;
use crate::pcpu::CpuId;
use crate::vcpu::{CoreLocalShadow, VCpuState};

const BASE: u64 = 0x4000_0000;

const CORE_TIMER_CONTROL: u64 = 0x00;
const CORE_TIMER_PRESCALER: u64 = 0x08;
const GPU_ROUTING: u64 = 0x0C;
const PMU_ROUTING_SET: u64 = 0x10;
const PMU_ROUTING_CLR: u64 = 0x14;
const CORE_TIMER_LS: u64 = 0x1C;
const CORE_TIMER_MS: u64 = 0x20;
const LOCAL_TIMER_ROUTING: u64 = 0x24;
const AXI_COUNT: u64 = 0x2C;
const AXI_IRQ: u64 = 0x30;
const LOCAL_TIMER_CONTROL: u64 = 0x34;
const LOCAL_TIMER_WRITE: u64 = 0x38;
const TIMER_INT_CTL: u64 = 0x40;
const MBOX_INT_CTL: u64 = 0x50;
const IRQ_PENDING: u64 = 0x60;
const FIQ_PENDING: u64 = 0x70;

/// CNTHP IRQ and FIQ enables.
const HYP_TIMER_BITS: u32 = 0b0100_0100;
const GUEST_TIMER_BITS: u32 = !HYP_TIMER_BITS & 0xff;
/// Mailbox 0 IRQ enable, used for SMP mail.
pub(crate) const HYP_MBOX_BITS: u32 = 1 << 0;
/// CNTHP and the four mailbox sources of the pending registers.
const HYP_PENDING_BITS: u32 = (1 << 2) | (0xf << 4);
const MAILBOX_PENDING_SHIFT: u32 = 4;
const MAILBOX_FIQ_SHIFT: u32 = 4;

const fn per_core(reg: u64, cpu: CpuId) -> u64 {
    BASE + reg + 4 * cpu as u64
}

/// IRQ source register of `cpu`.
pub(crate) const fn irq_source(cpu: CpuId) -> u64 {
    per_core(IRQ_PENDING, cpu)
}

/// Mailbox interrupt control of `cpu`.
pub(crate) const fn mbox_int_ctl(cpu: CpuId) -> u64 {
    per_core(MBOX_INT_CTL, cpu)
}

/// Mailbox sources the guest would see pending, from the emulated mailboxes.
fn mailbox_pending(local: &CoreLocalShadow, enable_shift: u32) -> u32 {
    (0..4u32)
        .filter(|&n| {
            local.mailbox[n as usize] != 0 && local.mbox_intr_ctl & (1 << (n + enable_shift)) != 0
        })
        .fold(0, |acc, n| acc | (1 << (MAILBOX_PENDING_SHIFT + n)))
}

pub(crate) struct LocalIntc;

impl LocalIntc {
    fn pending(&self, cx: &mut MmioContext<'_>, reg: u64, index: usize) -> AxResult<u32> {
        let target = &cx.state.vcpus[cx.sibling(index)?.index()];
        let (hw_reg, fiq_shift) = match reg {
            IRQ_PENDING => (IRQ_PENDING, 0),
            _ => (FIQ_PENDING, MAILBOX_FIQ_SHIFT),
        };
        let hw = match (target.state(), target.phys_cpu()) {
            (VCpuState::Run, Some(cpu)) => {
                cx.hal().mmio_read32(per_core(hw_reg, cpu)) & !HYP_PENDING_BITS
            }
            _ => 0,
        };
        Ok(hw | mailbox_pending(&target.local, fiq_shift))
    }
}

impl VirtMmioDevice for LocalIntc {
    fn name(&self) -> &'static str {
        "bcm2836-local-intc"
    }

    fn range(&self) -> MmioRange {
        MmioRange::new(BASE, BASE + 0x7F)
    }

    fn kind(&self) -> MmioKind {
        MmioKind::Full
    }

    fn read(&self, cx: &mut MmioContext<'_>, addr: u64) -> AxResult<u32> {
        let offset = addr - BASE;
        let index = ((offset & 0xf) / 4) as usize;
        match offset {
            CORE_TIMER_CONTROL | CORE_TIMER_PRESCALER | CORE_TIMER_LS | CORE_TIMER_MS => {
                Ok(cx.hal().mmio_read32(addr))
            }
            GPU_ROUTING => Ok(cx.vm().gpu_route),
            PMU_ROUTING_SET | PMU_ROUTING_CLR | LOCAL_TIMER_ROUTING | AXI_COUNT | AXI_IRQ
            | LOCAL_TIMER_CONTROL | LOCAL_TIMER_WRITE => {
                ax_err!(Unsupported, "register is reserved by the hypervisor")
            }
            0x40..=0x4F => {
                let target = cx.sibling(index)?;
                Ok(cx.state.vcpus[target.index()].local.timer_intr_ctl)
            }
            0x50..=0x5F => {
                let target = cx.sibling(index)?;
                Ok(cx.state.vcpus[target.index()].local.mbox_intr_ctl)
            }
            0x60..=0x6F => self.pending(cx, IRQ_PENDING, index),
            0x70..=0x7F => self.pending(cx, FIQ_PENDING, index),
            _ => ax_err!(InvalidInput, "illegal access to unavailable address"),
        }
    }

    fn write(&self, cx: &mut MmioContext<'_>, addr: u64, value: u32) -> AxResult {
        let offset = addr - BASE;
        let index = ((offset & 0xf) / 4) as usize;
        match offset {
            CORE_TIMER_CONTROL | CORE_TIMER_PRESCALER | CORE_TIMER_LS | CORE_TIMER_MS => {
                cx.hal().mmio_write32(addr, value);
                Ok(())
            }
            GPU_ROUTING => {
                let vcpus = cx.vm().vcpu_count() as u32;
                if value & 0b11 >= vcpus || (value >> 2) & 0b11 >= vcpus {
                    return ax_err!(
                        InvalidInput,
                        "gpu interrupts routed to a cpu that is not assigned to the vm"
                    );
                }
                cx.vm_mut().gpu_route = value & 0b1111;
                Ok(())
            }
            PMU_ROUTING_SET | PMU_ROUTING_CLR | LOCAL_TIMER_ROUTING | AXI_COUNT | AXI_IRQ
            | LOCAL_TIMER_CONTROL | LOCAL_TIMER_WRITE => {
                ax_err!(Unsupported, "register is reserved by the hypervisor")
            }
            0x40..=0x4F => {
                let target = cx.sibling(index)?;
                let target = &mut cx.state.vcpus[target.index()];
                target.local.timer_intr_ctl = value & GUEST_TIMER_BITS;
                if let (VCpuState::Run, Some(cpu)) = (target.state(), target.phys_cpu()) {
                    let reg = per_core(TIMER_INT_CTL, cpu);
                    let hal = cx.env.hal;
                    let hw = hal.mmio_read32(reg) & HYP_TIMER_BITS;
                    hal.mmio_write32(reg, hw | (value & GUEST_TIMER_BITS));
                }
                Ok(())
            }
            0x50..=0x5F => {
                let target = cx.sibling(index)?;
                cx.state.vcpus[target.index()].local.mbox_intr_ctl = value;
                Ok(())
            }
            0x60..=0x7F => ax_err!(InvalidInput, "core interrupt pending registers are read-only"),
            _ => ax_err!(InvalidInput, "illegal access to unavailable address"),
        }
    }

    fn reset(&self, hal: &dyn HypHal, cpus: &[CpuId]) {
        for &cpu in cpus {
            let reg = per_core(TIMER_INT_CTL, cpu);
            hal.mmio_write32(reg, hal.mmio_read32(reg) & HYP_TIMER_BITS);
            hal.mmio_write32(mbox_int_ctl(cpu), HYP_MBOX_BITS);
        }
    }

    fn save(&self, cx: &mut MmioContext<'_>) {
        let reg = per_core(TIMER_INT_CTL, cx.hal().cpu_id());
        let hw = cx.hal().mmio_read32(reg);
        cx.current_mut().local.timer_intr_ctl = hw & GUEST_TIMER_BITS;
        cx.hal().mmio_write32(reg, hw & HYP_TIMER_BITS);
    }

    fn restore(&self, cx: &mut MmioContext<'_>) {
        let reg = per_core(TIMER_INT_CTL, cx.hal().cpu_id());
        let hw = cx.hal().mmio_read32(reg) & HYP_TIMER_BITS;
        let guest = cx.current().local.timer_intr_ctl & GUEST_TIMER_BITS;
        cx.hal().mmio_write32(reg, hw | guest);
    }
}
