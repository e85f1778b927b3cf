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

//! Physical interrupts taken while a guest runs or the core idles.

use crate::pcpu::CpuId;
use crate::pmu;
use crate::sched::SchedulerKind;
use crate::smp::{self, SmpMail};
use crate::state::{Env, VmmState};
use crate::timer::TimerAction;
use crate::vcpu::VCpuState;
use crate::vdev;
use crate::vtimer;
use crate::GPU_IRQ_NUM;

const SRC_CNTHP: u32 = 1 << 2;
const SRC_MAILBOX0: u32 = 1 << 4;
const SRC_GPU: u32 = 1 << 8;
/// Sources that belong to the hypervisor or are dispatched separately.
const SRC_HYP: u32 = SRC_CNTHP | SRC_MAILBOX0 | SRC_GPU;

pub(crate) fn handle_irq(state: &mut VmmState, env: Env<'_>) {
    let hal = env.hal;
    let cpu = hal.cpu_id();
    let source = hal.mmio_read32(vdev::irq_source(cpu));
    trace!("cpu {}: irq source {:#x}", cpu, source);

    if source & SRC_CNTHP != 0 {
        for action in env.timers.expire(hal) {
            run_timer_action(state, env, cpu, action);
        }
    }
    if source & SRC_MAILBOX0 != 0 {
        for mail in smp::take(hal, cpu) {
            match mail {
                SmpMail::Schedule => state.cpus[cpu].schedule_needed = true,
                _ => env.timers.handle_mail(hal, mail),
            }
        }
    }
    if source & SRC_GPU != 0 {
        route_gpu_lines(state, env);
    }

    let local = source & !SRC_HYP;
    if local != 0 {
        let owner = state.cpus[cpu].current.or(state.cpus[cpu].last);
        match owner.and_then(|v| state.vms[state.vcpus[v.0].vm().0].irq_vcpu()) {
            Some(target) => state.do_virq(env, target),
            None => debug!("cpu {}: spurious core interrupt {:#x}", cpu, local),
        }
    }
    if source == 0 {
        debug!("cpu {}: spurious interrupt", cpu);
    }
}

fn run_timer_action(state: &mut VmmState, env: Env<'_>, cpu: CpuId, action: TimerAction) {
    let hal = env.hal;
    match action {
        TimerAction::RoundRobinTick => {
            let round_robin = state.cpus[cpu]
                .scheduler
                .is_some_and(|s| state.schedulers[s.0].kind() == SchedulerKind::RoundRobin);
            if round_robin {
                state.rotate(env, cpu);
                env.timers
                    .add(hal, cpu, TimerAction::RoundRobinTick, env.timers.period_ms());
            }
        }
        TimerAction::VirtualTimer(id) => {
            state.vcpus[id.0].vtimer_event = None;
            if state.vcpus[id.0].state() != VCpuState::Sleep {
                trace!("{}: stale virtual timer event", id);
                return;
            }
            vtimer::fire(&mut state.vcpus[id.0]);
            state.do_virq(env, id);
        }
        TimerAction::CpuUsageDump => {
            pmu::dump_cpu_usage(hal, cpu, state.cpus[cpu].freq);
            env.timers
                .add(hal, cpu, TimerAction::CpuUsageDump, pmu::CPU_USAGE_PERIOD_MS);
        }
    }
}

/// Delivers pending GPU lines to the VMs that own them.
fn route_gpu_lines(state: &mut VmmState, env: Env<'_>) {
    let pending = vdev::gpu_pending(env.hal);
    let mut orphans = 0;
    for line in (0..GPU_IRQ_NUM).filter(|&line| pending & (1 << line) != 0) {
        let Some(vm) = state.grants.irq_owner(line) else {
            orphans |= 1 << line;
            continue;
        };
        let vm = &state.vms[vm.0];
        if vm.fiq_line() == Some(line) {
            if let Some(target) = vm.fiq_vcpu() {
                state.do_vfiq(env, target);
            }
        } else if let Some(target) = vm.irq_vcpu() {
            state.do_virq(env, target);
        }
    }
    if orphans != 0 {
        warn!("gpu lines {:#x} have no owner, disabling them", orphans);
        vdev::disable_gpu_lines(env.hal, orphans);
    }
}
