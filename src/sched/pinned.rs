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

use alloc::vec::Vec;

use log::Level;

use super::{BoundCpus, Describe};
use crate::pcpu::CpuId;
use crate::vcpu::VCpuId;

struct Pin {
    cpu: CpuId,
    vcpu: Option<VCpuId>,
    ready: bool,
}

/// Each core runs at most one vCPU, bound on its first `add`.
pub(super) struct PinTable {
    pins: Vec<Pin>,
}

impl PinTable {
    pub fn new() -> Self {
        Self { pins: Vec::new() }
    }

    pub fn add_core(&mut self, cpu: CpuId) {
        self.pins.push(Pin {
            cpu,
            vcpu: None,
            ready: false,
        });
    }

    pub fn add(&mut self, vcpu: VCpuId, bound: &mut BoundCpus<'_>) {
        let slot = match self.pins.iter().position(|p| p.vcpu == Some(vcpu)) {
            Some(slot) => slot,
            None => self
                .pins
                .iter()
                .position(|p| p.vcpu.is_none() && bound.is_idle(p.cpu))
                .unwrap_or_else(|| panic!("no free physical cpu to pin {}", vcpu)),
        };
        let pin = &mut self.pins[slot];
        if pin.vcpu.is_none() {
            info!("pinned {} to cpu {}", vcpu, pin.cpu);
        }
        pin.vcpu = Some(vcpu);
        pin.ready = true;
        bound.flag(pin.cpu);
        bound.notify_flagged();
    }

    pub fn remove(&mut self, vcpu: VCpuId) {
        if let Some(pin) = self.pins.iter_mut().find(|p| p.vcpu == Some(vcpu)) {
            pin.ready = false;
        }
    }

    pub fn schedule(&mut self, cpu: CpuId, bound: &BoundCpus<'_>) -> Option<VCpuId> {
        if !bound.is_idle(cpu) {
            return None;
        }
        let pin = self.pins.iter_mut().find(|p| p.cpu == cpu)?;
        if !pin.ready {
            return None;
        }
        pin.ready = false;
        pin.vcpu
    }

    pub fn is_ready(&self, vcpu: VCpuId) -> bool {
        self.pins.iter().any(|p| p.ready && p.vcpu == Some(vcpu))
    }

    pub fn dump(&self, level: Level, describe: &Describe<'_>) {
        log!(level, "Start dump vcpu in pinned scheduler");
        for pin in &self.pins {
            if let Some(vcpu) = pin.vcpu {
                let (vm, id) = describe(vcpu);
                log!(level, "cpu {}: vm:{} vcpu_id:{} ready:{}", pin.cpu, vm, id, pin.ready);
            }
        }
    }
}
