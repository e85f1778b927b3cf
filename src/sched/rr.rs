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

use alloc::collections::VecDeque;

use log::Level;

use super::{BoundCpus, Describe};
use crate::pcpu::CpuId;
use crate::vcpu::VCpuId;

/// One FIFO shared by every core of the scheduler.
///
/// Rotation is driven from outside: the periodic tick puts the running vCPU
/// back at the tail and the core then picks the new head.
pub(super) struct RoundRobinQueue {
    queue: VecDeque<VCpuId>,
}

impl RoundRobinQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn add(&mut self, vcpu: VCpuId, bound: &mut BoundCpus<'_>) {
        self.queue.push_back(vcpu);
        bound.flag_all();
        bound.notify_flagged();
    }

    pub fn remove(&mut self, vcpu: VCpuId) {
        self.queue.retain(|&v| v != vcpu);
    }

    /// Only an idle core takes work; a busy one waits for the tick.
    pub fn schedule(&mut self, cpu: CpuId, bound: &BoundCpus<'_>) -> Option<VCpuId> {
        if !bound.is_idle(cpu) {
            return None;
        }
        self.queue.pop_front()
    }

    pub fn contains(&self, vcpu: VCpuId) -> bool {
        self.queue.contains(&vcpu)
    }

    pub fn dump(&self, level: Level, describe: &Describe<'_>) {
        log!(level, "Start dump vcpu in round robin scheduler ready queue");
        for &vcpu in &self.queue {
            let (vm, id) = describe(vcpu);
            log!(level, "ready vm:{} vcpu_id:{}", vm, id);
        }
    }
}
