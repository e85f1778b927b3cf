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

//! Virtual timer emulation for sleeping vCPUs.
//!
//! A guest that waits for its virtual timer with `WFI` gives its core away.
//! The remaining time until `CNTV_CVAL_EL0` becomes a timer event on that
//! core; when it expires the timer condition is reflected in the saved
//! `CNTV_CTL_EL0` and a virtual IRQ wakes the vCPU.

use tock_registers::LocalRegisterCopy;

use crate::hal::{HypHal, SysReg};
use crate::pcpu::PhysCpu;
use crate::regs::CNT_CTL;
use crate::timer::{TimerAction, TimerEvents};
use crate::vcpu::{VCpu, VCpuId};

/// Registers a wake-up for `vcpu`, which is going to sleep on `cpu`.
///
/// Uses the system registers saved at trap entry, so call it before the
/// core switches to another vCPU. A wake-up left over from an earlier sleep
/// is replaced.
pub(crate) fn arm_on_sleep(
    hal: &dyn HypHal,
    timers: &TimerEvents,
    cpu: &PhysCpu,
    id: VCpuId,
    vcpu: &mut VCpu,
) {
    cancel(hal, timers, id, vcpu);
    let ctl = LocalRegisterCopy::<u64, CNT_CTL::Register>::new(vcpu.sysregs.cntv_ctl_el0);
    if !ctl.is_set(CNT_CTL::ENABLE) {
        return;
    }
    let now = hal.read_sysreg(SysReg::CntvctEl0);
    let ticks = vcpu.sysregs.cntv_cval_el0.saturating_sub(now);
    let delay_ms = cpu.ticks_to_ms(ticks);
    debug!(
        "{} sleeps with vtimer in {} ticks ({} ms) on cpu {}",
        id, ticks, delay_ms, cpu.id
    );
    timers.add(hal, cpu.id, TimerAction::VirtualTimer(id), delay_ms);
    vcpu.vtimer_event = Some(cpu.id);
}

/// Drops the pending wake-up of `vcpu`, if any.
pub(crate) fn cancel(hal: &dyn HypHal, timers: &TimerEvents, id: VCpuId, vcpu: &mut VCpu) {
    let Some(cpu) = vcpu.vtimer_event.take() else {
        return;
    };
    if timers.remove(hal, cpu, TimerAction::VirtualTimer(id)).is_ok() {
        trace!("{}: virtual timer event on cpu {} dropped", id, cpu);
    }
}

/// Marks the saved virtual timer as expired.
pub(crate) fn fire(vcpu: &mut VCpu) {
    let mut ctl = LocalRegisterCopy::<u64, CNT_CTL::Register>::new(vcpu.sysregs.cntv_ctl_el0);
    ctl.modify(CNT_CTL::ISTATUS::SET);
    vcpu.sysregs.cntv_ctl_el0 = ctl.get();
}
