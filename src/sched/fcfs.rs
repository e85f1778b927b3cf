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

use super::{BoundCpus, Describe, PRIORITY_LEVELS};
use crate::vcpu::VCpuId;

/// Sixteen FIFO levels, level 0 first.
pub(super) struct FcfsQueue {
    levels: [VecDeque<VCpuId>; PRIORITY_LEVELS],
}

fn check_priority(priority: u8) -> usize {
    if priority as usize >= PRIORITY_LEVELS {
        panic!("illegal priority: {}", priority);
    }
    priority as usize
}

impl FcfsQueue {
    pub fn new() -> Self {
        Self {
            levels: core::array::from_fn(|_| VecDeque::new()),
        }
    }

    pub fn add(&mut self, vcpu: VCpuId, priority: u8, bound: &mut BoundCpus<'_>) {
        let level = check_priority(priority);
        self.levels[level].push_back(vcpu);
        bound.flag_all();
        bound.notify_flagged();
    }

    pub fn push_front(&mut self, vcpu: VCpuId, priority: u8) {
        let level = check_priority(priority);
        self.levels[level].push_front(vcpu);
    }

    pub fn remove(&mut self, vcpu: VCpuId, priority: u8, bound: &mut BoundCpus<'_>) {
        let level = check_priority(priority);
        debug!("fcfs: remove {} from level {}", vcpu, level);
        let queue = &mut self.levels[level];
        match queue.iter().position(|&v| v == vcpu) {
            Some(pos) => {
                queue.remove(pos);
                bound.flag_all();
            }
            None => warn!("fcfs: {} is not in the ready queue", vcpu),
        }
    }

    /// Takes the head of the first non-empty level, unless the running vCPU
    /// is at least as urgent.
    pub fn schedule(&mut self, running: Option<u8>, bound: &mut BoundCpus<'_>) -> Option<VCpuId> {
        let level = self.levels.iter().position(|q| !q.is_empty())?;
        if running.is_some_and(|prio| level >= prio as usize) {
            return None;
        }
        let picked = self.levels[level].pop_front();
        bound.notify_flagged();
        picked
    }

    pub fn contains(&self, vcpu: VCpuId) -> bool {
        self.levels.iter().any(|q| q.contains(&vcpu))
    }

    pub fn dump(&self, level: Level, describe: &Describe<'_>) {
        log!(level, "Start dump vcpu in fcfs scheduler ready queue");
        for (prio, queue) in self.levels.iter().enumerate() {
            if queue.is_empty() {
                continue;
            }
            log!(level, "Priority level : {}", prio);
            for &vcpu in queue {
                let (vm, id) = describe(vcpu);
                log!(level, "ready vm:{} vcpu_id:{}", vm, id);
            }
        }
    }
}
