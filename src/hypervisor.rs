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

use alloc::vec;
use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};
use log::Level;

use crate::exception_utils::Syndrome;
use crate::exit::TrapExit;
use crate::hal::{HypHal, SysReg};
use crate::lock::IrqSpinLock;
use crate::sched::{SchedulerConfig, SchedulerId, SchedulerKind};
use crate::stage2::Stage2Manager;
use crate::state::{Env, VmmState};
use crate::timer::{TimerAction, TimerEvents};
use crate::vcpu::{VCpuId, VCpuState};
use crate::vdev::{self, MmioBus};
use crate::vm::{VmConfig, VmId};
use crate::{CPU_NUM, CpuId, TrapFrame, irq, pmu, sync};

/// Boot-time configuration of the hypervisor.
#[derive(Debug, Clone)]
pub struct HypConfig {
    /// Number of physical cores brought up.
    pub cpu_count: usize,
    /// Size of the VM pool.
    pub max_vms: usize,
    /// Size of the vCPU pool, shared by all VMs.
    pub max_vcpus: usize,
    /// Number of 4 KiB stage-2 translation tables in the arena.
    pub stage2_tables: usize,
    /// Tick of the timer event service, also the round-robin time slice.
    pub schedule_period_ms: u64,
    pub schedulers: Vec<SchedulerConfig>,
    /// Scheduler of each physical core; `None` keeps the core out of guest
    /// scheduling.
    pub cpu_schedulers: Vec<Option<SchedulerId>>,
}

impl Default for HypConfig {
    fn default() -> Self {
        Self {
            cpu_count: CPU_NUM,
            max_vms: 10,
            max_vcpus: 10,
            stage2_tables: 512,
            schedule_period_ms: 100,
            schedulers: vec![
                SchedulerConfig::new(SchedulerKind::Fcfs),
                SchedulerConfig::new(SchedulerKind::RoundRobin),
                SchedulerConfig::new(SchedulerKind::Pinned),
            ],
            cpu_schedulers: vec![
                Some(SchedulerId(0)),
                Some(SchedulerId(1)),
                Some(SchedulerId(0)),
                Some(SchedulerId(0)),
            ],
        }
    }
}

impl HypConfig {
    fn validate(&self) -> AxResult {
        if self.cpu_count == 0 || self.cpu_count > CPU_NUM {
            return ax_err!(InvalidInput, "unsupported cpu count");
        }
        if self.cpu_schedulers.len() != self.cpu_count {
            return ax_err!(InvalidInput, "every cpu needs a scheduler entry");
        }
        let unknown = self
            .cpu_schedulers
            .iter()
            .flatten()
            .any(|s| s.0 >= self.schedulers.len());
        if unknown {
            return ax_err!(InvalidInput, "cpu bound to an unknown scheduler");
        }
        if self.max_vms == 0 || self.max_vcpus == 0 || self.stage2_tables == 0 {
            return ax_err!(InvalidInput, "empty pool");
        }
        if self.schedule_period_ms == 0 {
            return ax_err!(InvalidInput, "schedule period must not be zero");
        }
        Ok(())
    }
}

/// The hypervisor core: every trap of every physical core enters here.
///
/// All bookkeeping sits behind one lock that is held from trap entry until
/// the next guest context has been loaded. Timer events have their own lock,
/// always taken after the state lock.
pub struct Hypervisor<H: HypHal> {
    hal: H,
    state: IrqSpinLock<VmmState>,
    timers: TimerEvents,
    stage2: Stage2Manager,
    bus: MmioBus,
}

impl<H: HypHal> Hypervisor<H> {
    pub fn new(hal: H, config: HypConfig) -> AxResult<Self> {
        config.validate()?;
        let stage2 = Stage2Manager::new(&hal, config.stage2_tables);
        let bus = MmioBus::bcm2837();
        let cpus: Vec<CpuId> = (0..config.cpu_count).collect();
        bus.reset(&hal, &cpus);
        info!(
            "hypervisor: {} cpus, {} schedulers, {} vms, {} vcpus, {} ms period",
            config.cpu_count,
            config.schedulers.len(),
            config.max_vms,
            config.max_vcpus,
            config.schedule_period_ms
        );
        Ok(Self {
            state: IrqSpinLock::new(VmmState::new(&config)),
            timers: TimerEvents::new(config.cpu_count, config.schedule_period_ms),
            stage2,
            bus,
            hal,
        })
    }

    fn env(&self) -> Env<'_> {
        Env {
            hal: &self.hal,
            timers: &self.timers,
            stage2: &self.stage2,
            bus: &self.bus,
        }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Per-core EL2 setup. Runs once on every core before it enters a guest.
    pub fn init_current_cpu(&self) {
        let hal = &self.hal;
        let cpu = hal.cpu_id();
        let mut state = self.state.lock(hal);
        let sched = state.cpus[cpu].scheduler;
        let trap_idle = sched.is_some_and(|s| state.schedulers[s.0].trap_idle());
        state.cpus[cpu].hardware_enable(hal, trap_idle);
        self.timers.init_core(hal);
        hal.mmio_write32(vdev::mbox_int_ctl(cpu), vdev::HYP_MBOX_BITS);

        let round_robin =
            sched.is_some_and(|s| state.schedulers[s.0].kind() == SchedulerKind::RoundRobin);
        if round_robin {
            self.timers.add(
                hal,
                cpu,
                TimerAction::RoundRobinTick,
                self.timers.period_ms(),
            );
        }
        info!("cpu {} online, scheduler {:?}", cpu, sched.map(|s| s.0));
    }

    /// Creates a VM and queues its vCPUs.
    pub fn create_vm(&self, config: &VmConfig) -> AxResult<VmId> {
        let env = self.env();
        self.state.lock(&self.hal).create_vm(env, config)
    }

    /// Stops every vCPU of `vm` and returns its grants.
    pub fn force_shutdown(&self, vm: VmId) -> AxResult {
        let env = self.env();
        let mut state = self.state.lock(&self.hal);
        if vm.0 >= state.vms.len() {
            return ax_err!(InvalidInput, "unknown vm");
        }
        state.force_shutdown(env, vm);
        Ok(())
    }

    /// First entry of the calling core into guest scheduling.
    pub fn start_cpu(&self, frame: &mut TrapFrame) -> TrapExit {
        let env = self.env();
        let mut state = self.state.lock(&self.hal);
        Self::finish(&mut state, env, frame)
    }

    /// Synchronous exception from a guest (EL1 or EL0).
    pub fn handle_sync_trap(&self, frame: &mut TrapFrame) -> TrapExit {
        let env = self.env();
        let mut state = self.state.lock(&self.hal);
        if let Some(id) = state.save_guest(env, frame) {
            sync::handle_guest_trap(&mut state, env, id);
        }
        Self::finish(&mut state, env, frame)
    }

    /// Physical IRQ, taken from a guest or from the idle loop.
    pub fn handle_irq(&self, frame: &mut TrapFrame) -> TrapExit {
        let env = self.env();
        let mut state = self.state.lock(&self.hal);
        state.save_guest(env, frame);
        irq::handle_irq(&mut state, env);
        Self::finish(&mut state, env, frame)
    }

    /// Synchronous exception taken at EL2 itself.
    pub fn handle_current_el_sync(&self, frame: &TrapFrame) -> ! {
        let hal = &self.hal;
        let syndrome = Syndrome::new(hal.read_sysreg(SysReg::EsrEl2));
        panic!(
            "cpu {}: hypervisor exception {:?}, far {:#x}, elr {:#x}\n{}",
            hal.cpu_id(),
            syndrome,
            hal.read_sysreg(SysReg::FarEl2),
            frame.exception_pc(),
            frame
        );
    }

    fn finish(state: &mut VmmState, env: Env<'_>, frame: &mut TrapFrame) -> TrapExit {
        let cpu = env.hal.cpu_id();
        state.do_schedule(env, cpu);
        state.enter_guest(env, frame)
    }

    /// Starts logging the cycle counter based usage of the calling core
    /// every second.
    pub fn start_cpu_usage_dump(&self) {
        let hal = &self.hal;
        let _state = self.state.lock(hal);
        pmu::cycle_count_start(hal);
        self.timers.add(
            hal,
            hal.cpu_id(),
            TimerAction::CpuUsageDump,
            pmu::CPU_USAGE_PERIOD_MS,
        );
    }

    pub fn stop_cpu_usage_dump(&self) -> AxResult {
        let hal = &self.hal;
        let _state = self.state.lock(hal);
        self.timers
            .remove(hal, hal.cpu_id(), TimerAction::CpuUsageDump)?;
        pmu::cycle_count_stop(hal);
        Ok(())
    }

    /// Logs the ready queue of every scheduler.
    pub fn dump_ready(&self, level: Level) {
        self.state.lock(&self.hal).dump_ready(level);
    }

    pub fn vm_count(&self) -> usize {
        self.state.lock(&self.hal).vms.len()
    }

    pub fn vcpus_of(&self, vm: VmId) -> Vec<VCpuId> {
        let state = self.state.lock(&self.hal);
        state
            .vms
            .get(vm.0)
            .map(|vm| vm.vcpus().to_vec())
            .unwrap_or_default()
    }

    pub fn vcpu_state(&self, vcpu: VCpuId) -> Option<VCpuState> {
        let state = self.state.lock(&self.hal);
        state.vcpus.get(vcpu.0).map(|v| v.state())
    }

    pub fn is_shut_down(&self, vm: VmId) -> bool {
        let state = self.state.lock(&self.hal);
        state.vms.get(vm.0).is_some_and(|vm| vm.is_shut_down())
    }

    /// vCPU current on physical core `cpu`.
    pub fn current_vcpu(&self, cpu: usize) -> Option<VCpuId> {
        let state = self.state.lock(&self.hal);
        state.cpus.get(cpu).and_then(|c| c.current)
    }
}
