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

//! Pluggable vCPU schedulers.
//!
//! A scheduler owns a set of physical cores and decides which of its ready
//! vCPUs runs on each. Every queue mutation happens under the hypervisor's
//! state lock; cores learn that they must re-run [`Scheduler::schedule`]
//! through their `schedule_needed` flag, and remote cores are woken by an
//! SMP mail.

mod fcfs;
mod pinned;
mod rr;

use alloc::vec::Vec;

use log::Level;

use crate::hal::HypHal;
use crate::pcpu::{CpuId, PhysCpu};
use crate::smp::{self, SmpMail};
use crate::vcpu::{VCpu, VCpuId};
use crate::vm::Vm;

use self::fcfs::FcfsQueue;
use self::pinned::PinTable;
use self::rr::RoundRobinQueue;

/// Number of FCFS priority levels; 0 is the highest.
pub const PRIORITY_LEVELS: usize = 16;

/// Index of a scheduler in [`HypConfig::schedulers`](crate::HypConfig::schedulers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchedulerId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Fixed-priority, first come first served, with preemption by priority.
    Fcfs,
    /// One shared queue rotated by a periodic timer event.
    RoundRobin,
    /// One vCPU per core for life.
    Pinned,
}

/// Configuration of one scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    /// Trap `WFI`/`WFE` on the cores this scheduler owns.
    pub trap_idle: bool,
    /// Emulate the virtual timer of sleeping vCPUs with timer events.
    pub emulate_vtimer: bool,
}

impl SchedulerConfig {
    pub const fn new(kind: SchedulerKind) -> Self {
        let idle_aware = matches!(kind, SchedulerKind::Fcfs);
        Self {
            kind,
            trap_idle: idle_aware,
            emulate_vtimer: idle_aware,
        }
    }
}

/// Maps a queued vCPU to its VM name and index for dumps.
type Describe<'a> = dyn Fn(VCpuId) -> (&'a str, usize) + 'a;

enum Policy {
    Fcfs(FcfsQueue),
    RoundRobin(RoundRobinQueue),
    Pinned(PinTable),
}

/// Cores of a scheduler together with the per-core state it updates.
pub(crate) struct BoundCpus<'a> {
    ids: &'a [CpuId],
    cpus: &'a mut [PhysCpu],
    hal: &'a dyn HypHal,
}

impl BoundCpus<'_> {
    fn flag_all(&mut self) {
        for &id in self.ids {
            self.cpus[id].schedule_needed = true;
        }
    }

    fn flag(&mut self, cpu: CpuId) {
        self.cpus[cpu].schedule_needed = true;
    }

    fn is_idle(&self, cpu: CpuId) -> bool {
        self.cpus[cpu].current.is_none()
    }

    /// Mails every flagged core other than the caller.
    fn notify_flagged(&self) {
        let me = self.hal.cpu_id();
        for &id in self.ids {
            if id != me && self.cpus[id].schedule_needed {
                smp::send(self.hal, id, SmpMail::Schedule);
            }
        }
    }
}

/// A scheduler instance.
pub struct Scheduler {
    config: SchedulerConfig,
    cpus: Vec<CpuId>,
    policy: Policy,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let policy = match config.kind {
            SchedulerKind::Fcfs => Policy::Fcfs(FcfsQueue::new()),
            SchedulerKind::RoundRobin => Policy::RoundRobin(RoundRobinQueue::new()),
            SchedulerKind::Pinned => Policy::Pinned(PinTable::new()),
        };
        Self {
            config,
            cpus: Vec::new(),
            policy,
        }
    }

    /// Binds `cpu` to this scheduler. Called once per core at boot.
    pub fn bind(&mut self, cpu: CpuId) {
        self.cpus.push(cpu);
        if let Policy::Pinned(pins) = &mut self.policy {
            pins.add_core(cpu);
        }
    }

    pub fn kind(&self) -> SchedulerKind {
        self.config.kind
    }

    pub fn trap_idle(&self) -> bool {
        self.config.trap_idle
    }

    pub fn emulate_vtimer(&self) -> bool {
        self.config.emulate_vtimer
    }

    pub fn cpus(&self) -> &[CpuId] {
        &self.cpus
    }

    /// Enqueues a vCPU that just became ready.
    pub fn add(&mut self, vcpu: VCpuId, priority: u8, cpus: &mut [PhysCpu], hal: &dyn HypHal) {
        let mut bound = BoundCpus {
            ids: &self.cpus,
            cpus,
            hal,
        };
        match &mut self.policy {
            Policy::Fcfs(queue) => queue.add(vcpu, priority, &mut bound),
            Policy::RoundRobin(queue) => queue.add(vcpu, &mut bound),
            Policy::Pinned(pins) => pins.add(vcpu, &mut bound),
        }
    }

    /// Drops a vCPU from the ready bookkeeping. Removing an absent vCPU is
    /// reported, not fatal.
    pub fn remove(&mut self, vcpu: VCpuId, priority: u8, cpus: &mut [PhysCpu], hal: &dyn HypHal) {
        let mut bound = BoundCpus {
            ids: &self.cpus,
            cpus,
            hal,
        };
        match &mut self.policy {
            Policy::Fcfs(queue) => queue.remove(vcpu, priority, &mut bound),
            Policy::RoundRobin(queue) => queue.remove(vcpu),
            Policy::Pinned(pins) => pins.remove(vcpu),
        }
    }

    /// Picks the vCPU `cpu` should run next.
    ///
    /// `running` is the vCPU currently on `cpu` and its priority. A pick
    /// while something runs means the running vCPU is preempted.
    pub fn schedule(
        &mut self,
        cpu: CpuId,
        running: Option<(VCpuId, u8)>,
        cpus: &mut [PhysCpu],
        hal: &dyn HypHal,
    ) -> Option<VCpuId> {
        let mut bound = BoundCpus {
            ids: &self.cpus,
            cpus,
            hal,
        };
        match &mut self.policy {
            Policy::Fcfs(queue) => queue.schedule(running.map(|(_, prio)| prio), &mut bound),
            Policy::RoundRobin(queue) => queue.schedule(cpu, &bound),
            Policy::Pinned(pins) => pins.schedule(cpu, &bound),
        }
    }

    /// Puts a preempted vCPU back at the head of its level.
    pub fn requeue_preempted(&mut self, vcpu: VCpuId, priority: u8) {
        if let Policy::Fcfs(queue) = &mut self.policy {
            queue.push_front(vcpu, priority);
        }
    }

    /// Whether `vcpu` sits in this scheduler's ready structure.
    pub fn is_queued(&self, vcpu: VCpuId) -> bool {
        match &self.policy {
            Policy::Fcfs(queue) => queue.contains(vcpu),
            Policy::RoundRobin(queue) => queue.contains(vcpu),
            Policy::Pinned(pins) => pins.is_ready(vcpu),
        }
    }

    pub fn dump_ready(&self, level: Level, vms: &[Vm], vcpus: &[VCpu]) {
        let describe = |id: VCpuId| {
            let vcpu = &vcpus[id.0];
            (vms[vcpu.vm().0].name(), vcpu.id())
        };
        let describe: &Describe<'_> = &describe;
        match &self.policy {
            Policy::Fcfs(queue) => queue.dump(level, describe),
            Policy::RoundRobin(queue) => queue.dump(level, describe),
            Policy::Pinned(pins) => pins.dump(level, describe),
        }
        log!(level, "=================   End   =================");
    }
}
