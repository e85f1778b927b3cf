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

//! Pools of VMs and vCPUs, the vCPU state machine and the per-core
//! scheduling choke point. Everything here runs under the global state lock.

use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};
use log::Level;

use crate::TrapFrame;
use crate::exit::TrapExit;
use crate::grant::{ExclusiveMmio, GrantTable};
use crate::hal::{HypHal, SysReg};
use crate::hypervisor::HypConfig;
use crate::pcpu::{CpuId, PhysCpu};
use crate::sched::{PRIORITY_LEVELS, Scheduler};
use crate::smp::{self, SmpMail};
use crate::stage2::{self, MemoryKind, Stage2Manager};
use crate::timer::TimerEvents;
use crate::vcpu::{PendingInterrupts, VCpu, VCpuCreateConfig, VCpuId, VCpuState};
use crate::vdev::{self, MmioBus, MmioContext};
use crate::vm::{MemoryRegion, RegionKind, Vm, VmConfig, VmId};
use crate::vtimer;
use crate::{MAX_VCPUS_PER_VM, PAGE_SIZE};

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Services shared by every operation that may touch hardware.
#[derive(Clone, Copy)]
pub(crate) struct Env<'a> {
    pub hal: &'a dyn HypHal,
    pub timers: &'a TimerEvents,
    pub stage2: &'a Stage2Manager,
    pub bus: &'a MmioBus,
}

pub(crate) struct VmmState {
    pub cpus: Vec<PhysCpu>,
    pub vms: Vec<Vm>,
    pub vcpus: Vec<VCpu>,
    pub schedulers: Vec<Scheduler>,
    pub grants: GrantTable,
    max_vms: usize,
    max_vcpus: usize,
}

impl VmmState {
    /// Builds the physical cores and binds them to their schedulers.
    pub fn new(config: &HypConfig) -> Self {
        let mut schedulers: Vec<Scheduler> =
            config.schedulers.iter().map(|&c| Scheduler::new(c)).collect();
        let cpus = config
            .cpu_schedulers
            .iter()
            .enumerate()
            .map(|(id, &sched)| {
                if let Some(sched) = sched {
                    schedulers[sched.0].bind(id);
                }
                PhysCpu::new(id, sched)
            })
            .collect();
        Self {
            cpus,
            vms: Vec::with_capacity(config.max_vms),
            vcpus: Vec::with_capacity(config.max_vcpus),
            schedulers,
            grants: GrantTable::new(),
            max_vms: config.max_vms,
            max_vcpus: config.max_vcpus,
        }
    }

    fn vm_of(&self, vcpu: VCpuId) -> &Vm {
        &self.vms[self.vcpus[vcpu.0].vm().0]
    }

    fn check_vm_config(&self, config: &VmConfig) -> AxResult {
        if config.vcpu_count == 0
            || config.vcpu_count > MAX_VCPUS_PER_VM
            || config.vcpu_count > self.cpus.len()
        {
            return ax_err!(InvalidInput, "unsupported vcpu count");
        }
        let Some(scheduler) = self.schedulers.get(config.scheduler.0) else {
            return ax_err!(InvalidInput, "unknown scheduler");
        };
        if scheduler.cpus().is_empty() {
            return ax_err!(InvalidInput, "scheduler has no physical cpu");
        }
        if config.priority as usize >= PRIORITY_LEVELS {
            return ax_err!(InvalidInput, "illegal priority");
        }
        for (i, region) in config.memory_map.iter().enumerate() {
            check_region(region)?;
            let overlaps = config.memory_map[..i]
                .iter()
                .any(|other| region.start <= other.end && other.start <= region.end);
            if overlaps {
                return ax_err!(InvalidInput, "overlapping memory regions");
            }
        }
        self.grants
            .check(config.gpio_grant, config.irq_grant, config.mmio_grant)
    }

    /// Creates a VM with all its vCPUs and makes them ready.
    ///
    /// Running out of VM or vCPU slots is fatal.
    pub fn create_vm(&mut self, env: Env<'_>, config: &VmConfig) -> AxResult<VmId> {
        self.check_vm_config(config)?;
        if self.vms.len() >= self.max_vms {
            panic!("vm pool exhausted ({} vms)", self.max_vms);
        }

        let hal = env.hal;
        let backing = alloc_backing(hal, &config.memory_map)?;
        let root = env.stage2.alloc_root();
        let mut msg_buffer = None;
        for (region, pa) in config.memory_map.iter().zip(backing) {
            let what = match region.kind {
                RegionKind::Plain => "ram",
                RegionKind::Image(image) => {
                    hal.write_phys(pa, image);
                    "image"
                }
                RegionKind::MessageBuffer => {
                    msg_buffer.get_or_insert(pa);
                    "message buffer"
                }
            };
            env.stage2.map_range(root, region.start, pa, region.len());
            debug!(
                "vm {}: {} ipa {:#x}..={:#x} -> pa {:#x}",
                config.name, what, region.start, region.end, pa
            );
        }
        for dev in ExclusiveMmio::from_mask(config.mmio_grant) {
            env.stage2
                .map_range_with(root, dev.base(), dev.base(), dev.len(), MemoryKind::Device);
            debug!("vm {}: exclusive mmio {:?} at {:#x}", config.name, dev, dev.base());
        }

        let vm_id = VmId(self.vms.len());
        self.grants
            .commit(vm_id, config.gpio_grant, config.irq_grant, config.mmio_grant);
        self.vms.push(Vm::new(config, root, msg_buffer));
        for index in 0..config.vcpu_count {
            let vcpu = self.create_vcpu(VCpuCreateConfig {
                vm: vm_id,
                id: index,
                root,
                msg_buffer,
                entry: config.entry,
                boot_arg: config.boot_arg,
            });
            self.vms[vm_id.0].vcpus.push(vcpu);
        }
        let quiet: Vec<CpuId> = self
            .cpus
            .iter()
            .filter(|c| c.current.is_none() && c.last.is_none())
            .map(|c| c.id)
            .collect();
        env.bus.reset(hal, &quiet);

        info!(
            "created vm {} ({}): {} vcpu(s), scheduler {}, priority {}, stage-2 root {:#x}",
            vm_id,
            config.name,
            config.vcpu_count,
            config.scheduler.0,
            config.priority,
            root.paddr()
        );
        for vcpu in self.vms[vm_id.0].vcpus.clone() {
            self.ready(env, vcpu);
        }
        Ok(vm_id)
    }

    /// Takes a vCPU from the pool, in [`VCpuState::Init`].
    pub fn create_vcpu(&mut self, config: VCpuCreateConfig) -> VCpuId {
        if self.vcpus.len() >= self.max_vcpus {
            panic!("vcpu pool exhausted ({} vcpus)", self.max_vcpus);
        }
        let id = VCpuId(self.vcpus.len());
        self.vcpus.push(VCpu::new(config));
        trace!("{} created for vm {}", id, config.vm);
        id
    }

    /// Queues `id` on its VM's scheduler.
    pub fn ready(&mut self, env: Env<'_>, id: VCpuId) {
        match self.vcpus[id.0].state {
            VCpuState::Run => panic!("{} is running and cannot become ready", id),
            VCpuState::Ready => {
                warn!("{} is already ready", id);
                return;
            }
            VCpuState::Init | VCpuState::Sleep => {}
        }
        self.vcpus[id.0].state = VCpuState::Ready;
        let vm = self.vm_of(id);
        let (sched, priority) = (vm.scheduler(), vm.priority());
        self.schedulers[sched.0].add(id, priority, &mut self.cpus, env.hal);
    }

    /// Makes `id` the current vCPU of `cpu`.
    pub fn activate(&mut self, id: VCpuId, cpu: CpuId) {
        let vcpu = &mut self.vcpus[id.0];
        if vcpu.state == VCpuState::Run {
            panic!("{} is already running on cpu {:?}", id, vcpu.phys_cpu);
        }
        vcpu.state = VCpuState::Run;
        vcpu.phys_cpu = Some(cpu);
        self.cpus[cpu].current = Some(id);
        trace!("cpu {}: {} activated", cpu, id);
    }

    /// Clears `cpu`'s current vCPU if it is `id` and asks the core to
    /// schedule again.
    fn release_cpu(&mut self, env: Env<'_>, id: VCpuId, cpu: CpuId) {
        let pcpu = &mut self.cpus[cpu];
        if pcpu.current != Some(id) {
            return;
        }
        pcpu.current = None;
        pcpu.schedule_needed = true;
        if cpu != env.hal.cpu_id() {
            smp::send(env.hal, cpu, SmpMail::Schedule);
        }
    }

    /// Parks a running vCPU until a virtual interrupt arrives.
    pub fn sleep(&mut self, env: Env<'_>, id: VCpuId) {
        let vcpu = &self.vcpus[id.0];
        if vcpu.state != VCpuState::Run {
            panic!("{} cannot sleep in state {:?}", id, vcpu.state);
        }
        let Some(cpu) = vcpu.phys_cpu else {
            panic!("running {} has no physical cpu", id);
        };
        let vm = self.vm_of(id);
        let (sched, priority) = (vm.scheduler(), vm.priority());
        if self.schedulers[sched.0].emulate_vtimer() {
            vtimer::arm_on_sleep(
                env.hal,
                env.timers,
                &self.cpus[cpu],
                id,
                &mut self.vcpus[id.0],
            );
        }
        if self.schedulers[sched.0].is_queued(id) {
            self.schedulers[sched.0].remove(id, priority, &mut self.cpus, env.hal);
        }
        self.release_cpu(env, id, cpu);
        self.vcpus[id.0].state = VCpuState::Sleep;
        trace!("cpu {}: {} sleeps", cpu, id);
    }

    /// Stops a vCPU wherever it is and returns it to [`VCpuState::Init`].
    pub fn off(&mut self, env: Env<'_>, id: VCpuId) {
        if let Some(cpu) = self.vcpus[id.0].phys_cpu {
            self.release_cpu(env, id, cpu);
        }
        if self.vcpus[id.0].state == VCpuState::Ready {
            let vm = self.vm_of(id);
            let (sched, priority) = (vm.scheduler(), vm.priority());
            self.schedulers[sched.0].remove(id, priority, &mut self.cpus, env.hal);
        }
        let vcpu = &mut self.vcpus[id.0];
        vtimer::cancel(env.hal, env.timers, id, vcpu);
        vcpu.state = VCpuState::Init;
        vcpu.phys_cpu = None;
        vcpu.pending = PendingInterrupts::default();
    }

    /// Stops every vCPU of `vm` and gives its grants back.
    pub fn force_shutdown(&mut self, env: Env<'_>, vm: VmId) {
        if self.vms[vm.0].shut_down {
            return;
        }
        for vcpu in self.vms[vm.0].vcpus.clone() {
            self.off(env, vcpu);
        }
        let released = self.grants.release(vm, self.vms[vm.0].gpio_grant());
        vdev::disable_gpu_lines(env.hal, released);
        self.vms[vm.0].shut_down = true;
        info!("vm {} ({}) is shut down", vm, self.vms[vm.0].name());
    }

    fn inject(&mut self, env: Env<'_>, id: VCpuId, raise: impl FnOnce(&mut PendingInterrupts)) {
        let vcpu = &mut self.vcpus[id.0];
        raise(&mut vcpu.pending);
        if vcpu.state == VCpuState::Sleep {
            self.ready(env, id);
        }
    }

    pub fn do_vserror(&mut self, env: Env<'_>, id: VCpuId) {
        debug!("{}: virtual serror", id);
        self.inject(env, id, |p| p.serror = true);
    }

    pub fn do_virq(&mut self, env: Env<'_>, id: VCpuId) {
        self.inject(env, id, |p| p.irq = true);
    }

    pub fn do_vfiq(&mut self, env: Env<'_>, id: VCpuId) {
        self.inject(env, id, |p| p.fiq = true);
    }

    /// Lets the scheduler of `cpu` pick, if the core was asked to.
    pub fn do_schedule(&mut self, env: Env<'_>, cpu: CpuId) {
        let pcpu = &mut self.cpus[cpu];
        let Some(sched) = pcpu.scheduler else {
            return;
        };
        if !pcpu.schedule_needed {
            return;
        }
        pcpu.schedule_needed = false;

        let running = pcpu.current.map(|v| (v, self.vm_of(v).priority()));
        let Some(next) = self.schedulers[sched.0].schedule(cpu, running, &mut self.cpus, env.hal)
        else {
            return;
        };
        if let Some((prev, priority)) = running {
            debug!("cpu {}: {} preempts {}", cpu, next, prev);
            self.vcpus[prev.0].state = VCpuState::Ready;
            self.schedulers[sched.0].requeue_preempted(prev, priority);
            self.cpus[cpu].current = None;
        }
        self.activate(next, cpu);
    }

    /// Sends the vCPU running on `cpu` to the back of its ready queue.
    pub fn rotate(&mut self, env: Env<'_>, cpu: CpuId) {
        let Some(id) = self.cpus[cpu].current.take() else {
            return;
        };
        self.cpus[cpu].schedule_needed = true;
        self.vcpus[id.0].state = VCpuState::Ready;
        let vm = self.vm_of(id);
        let (sched, priority) = (vm.scheduler(), vm.priority());
        self.schedulers[sched.0].add(id, priority, &mut self.cpus, env.hal);
    }

    /// Copies the trapped guest state into the current vCPU of the calling
    /// core. Returns that vCPU, or `None` when it was taken away meanwhile.
    pub fn save_guest(&mut self, env: Env<'_>, frame: &TrapFrame) -> Option<VCpuId> {
        let cpu = env.hal.cpu_id();
        let id = self.cpus[cpu].current?;
        let vcpu = &mut self.vcpus[id.0];
        vcpu.ctx = *frame;
        vcpu.sysregs.store(env.hal);
        Some(id)
    }

    /// Saves what is still live in hardware of the last vCPU of `cpu`.
    fn switch_out(&mut self, env: Env<'_>, cpu: CpuId) {
        let Some(prev) = self.cpus[cpu].last.take() else {
            return;
        };
        env.hal.save_fp(&mut self.vcpus[prev.0].fp);
        env.bus.save(&mut MmioContext {
            state: self,
            env,
            vcpu: prev,
        });
    }

    /// Loads the current vCPU of the calling core into hardware and `frame`.
    pub fn enter_guest(&mut self, env: Env<'_>, frame: &mut TrapFrame) -> TrapExit {
        let hal = env.hal;
        let cpu = hal.cpu_id();
        let Some(id) = self.cpus[cpu].current else {
            self.switch_out(env, cpu);
            return TrapExit::Idle;
        };

        if self.cpus[cpu].last != Some(id) {
            self.switch_out(env, cpu);
            let vcpu = &self.vcpus[id.0];
            stage2::set_active_root(hal, vcpu.root());
            hal.restore_fp(&vcpu.fp);
            vcpu.sysregs.restore(hal);
            env.bus.restore(&mut MmioContext {
                state: self,
                env,
                vcpu: id,
            });
            self.cpus[cpu].last = Some(id);
            debug!("cpu {}: switched to {}", cpu, id);
        }

        let vcpu = &mut self.vcpus[id.0];
        let hcr = vcpu.latch_virtual_interrupt(hal.read_sysreg(SysReg::HcrEl2));
        hal.write_sysreg(SysReg::HcrEl2, hcr);
        *frame = vcpu.ctx;
        TrapExit::Resume
    }

    pub fn dump_ready(&self, level: Level) {
        for sched in &self.schedulers {
            sched.dump_ready(level, &self.vms, &self.vcpus);
        }
    }
}

fn check_region(region: &MemoryRegion) -> AxResult {
    if region.start > region.end
        || region.start & PAGE_MASK != 0
        || region.end.wrapping_add(1) & PAGE_MASK != 0
    {
        return ax_err!(InvalidInput, "memory region is not page aligned");
    }
    if let RegionKind::Image(image) = region.kind {
        if image.len() > region.len() {
            return ax_err!(InvalidInput, "image does not fit its memory region");
        }
    }
    Ok(())
}

/// Allocates the backing memory of every region, or none of it.
fn alloc_backing(hal: &dyn HypHal, memory_map: &[MemoryRegion]) -> AxResult<Vec<u64>> {
    let mut backing = Vec::with_capacity(memory_map.len());
    for region in memory_map {
        match hal.alloc_phys(region.len()) {
            Some(pa) => backing.push(pa),
            None => {
                for (region, &pa) in memory_map.iter().zip(&backing) {
                    hal.free_phys(pa, region.len());
                }
                return ax_err!(NoMemory, "guest memory allocation failed");
            }
        }
    }
    Ok(backing)
}
