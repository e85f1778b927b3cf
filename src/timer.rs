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

//! Per-core timer events driven by the EL2 physical timer (CNTHP).
//!
//! Each core owns a small table of pending events. While the table is not
//! empty the core's hypervisor timer fires every period; each expiry
//! subtracts one period from every event and hands back those that are due.

use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};

use crate::hal::{HypHal, SysReg};
use crate::lock::IrqSpinLock;
use crate::pcpu::CpuId;
use crate::regs::CNT_CTL;
use crate::smp::{self, SmpMail};
use crate::vcpu::VCpuId;

/// Events per core.
pub const TIMER_EVENT_NUM: usize = 16;

const CORE_TIMER_INT_CTL: u64 = 0x4000_0040;
const CNTHP_IRQ_ENABLE: u32 = 1 << 2;

/// What to do when an event expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Rotate the round-robin scheduler of the expiring core.
    RoundRobinTick,
    /// The virtual timer of a sleeping vCPU would have fired.
    VirtualTimer(VCpuId),
    /// Log the cycle counter based CPU usage.
    CpuUsageDump,
}

#[derive(Debug, Clone, Copy)]
struct TimerEvent {
    action: TimerAction,
    remaining_ms: i64,
}

struct CoreTimers {
    events: [Option<TimerEvent>; TIMER_EVENT_NUM],
    running: bool,
}

impl CoreTimers {
    const fn new() -> Self {
        Self {
            events: [None; TIMER_EVENT_NUM],
            running: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.events.iter().all(Option::is_none)
    }
}

pub struct TimerEvents {
    cores: IrqSpinLock<Vec<CoreTimers>>,
    period_ms: u64,
}

impl TimerEvents {
    pub fn new(cpu_count: usize, period_ms: u64) -> Self {
        Self {
            cores: IrqSpinLock::new((0..cpu_count).map(|_| CoreTimers::new()).collect()),
            period_ms,
        }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    /// Puts the calling core's hypervisor timer in a known stopped state.
    pub fn init_core(&self, hal: &dyn HypHal) {
        let cpu = hal.cpu_id();
        self.cores.lock(hal)[cpu].running = false;
        stop_local(hal, cpu);
    }

    /// Schedules `action` on `cpu` in `delay_ms` milliseconds, rounded up to
    /// the next period.
    pub fn add(&self, hal: &dyn HypHal, cpu: CpuId, action: TimerAction, delay_ms: u64) {
        let mut cores = self.cores.lock(hal);
        let core = &mut cores[cpu];
        let slot = match core.events.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => panic!("cpu {}: no free timer event slot for {:?}", cpu, action),
        };
        core.events[slot] = Some(TimerEvent {
            action,
            remaining_ms: delay_ms as i64,
        });
        trace!("cpu {}: timer event {:?} in {} ms", cpu, action, delay_ms);
        if !core.running {
            core.running = true;
            self.start(hal, cpu);
        }
    }

    /// Cancels the first pending event of `cpu` carrying `action`.
    pub fn remove(&self, hal: &dyn HypHal, cpu: CpuId, action: TimerAction) -> AxResult {
        let mut cores = self.cores.lock(hal);
        let core = &mut cores[cpu];
        let slot = core
            .events
            .iter()
            .position(|e| e.is_some_and(|e| e.action == action));
        let Some(slot) = slot else {
            return ax_err!(NotFound, "timer event is not pending");
        };
        core.events[slot] = None;
        if core.is_empty() && core.running {
            core.running = false;
            self.stop(hal, cpu);
        }
        Ok(())
    }

    /// Handles a hypervisor timer interrupt on the calling core and returns
    /// the actions that are due. The table lock is released on return.
    pub fn expire(&self, hal: &dyn HypHal) -> Vec<TimerAction> {
        let cpu = hal.cpu_id();
        let mut cores = self.cores.lock(hal);
        let core = &mut cores[cpu];
        let mut due = Vec::new();
        for slot in core.events.iter_mut() {
            let Some(event) = slot else { continue };
            event.remaining_ms -= self.period_ms as i64;
            if event.remaining_ms <= 0 {
                due.push(event.action);
                *slot = None;
            }
        }
        if core.is_empty() {
            core.running = false;
            stop_local(hal, cpu);
        } else {
            self.start_local(hal, cpu);
        }
        due
    }

    pub fn pending(&self, hal: &dyn HypHal, cpu: CpuId) -> usize {
        self.cores.lock(hal)[cpu]
            .events
            .iter()
            .filter(|e| e.is_some())
            .count()
    }

    /// Serves a `TimerStart`/`TimerStop` mail from another core.
    pub fn handle_mail(&self, hal: &dyn HypHal, mail: SmpMail) {
        let cpu = hal.cpu_id();
        match mail {
            SmpMail::TimerStart => self.start_local(hal, cpu),
            SmpMail::TimerStop => stop_local(hal, cpu),
            SmpMail::Schedule => {}
        }
    }

    fn start(&self, hal: &dyn HypHal, cpu: CpuId) {
        if cpu == hal.cpu_id() {
            self.start_local(hal, cpu);
        } else {
            smp::send(hal, cpu, SmpMail::TimerStart);
        }
    }

    fn stop(&self, hal: &dyn HypHal, cpu: CpuId) {
        if cpu == hal.cpu_id() {
            stop_local(hal, cpu);
        } else {
            smp::send(hal, cpu, SmpMail::TimerStop);
        }
    }

    /// Arms CNTHP for one period and routes it to the core's IRQ.
    fn start_local(&self, hal: &dyn HypHal, cpu: CpuId) {
        let freq = hal.read_sysreg(SysReg::CntfrqEl0);
        hal.write_sysreg(SysReg::CnthpTvalEl2, freq * self.period_ms / 1000);
        hal.write_sysreg(SysReg::CnthpCtlEl2, CNT_CTL::ENABLE::SET.value);
        let ctl = core_timer_int_ctl(cpu);
        hal.mmio_write32(ctl, hal.mmio_read32(ctl) | CNTHP_IRQ_ENABLE);
    }
}

fn stop_local(hal: &dyn HypHal, cpu: CpuId) {
    let ctl = core_timer_int_ctl(cpu);
    hal.mmio_write32(ctl, hal.mmio_read32(ctl) & !CNTHP_IRQ_ENABLE);
    hal.write_sysreg(SysReg::CnthpCtlEl2, 0);
}

fn core_timer_int_ctl(cpu: CpuId) -> u64 {
    CORE_TIMER_INT_CTL + 4 * cpu as u64
}
