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

//! Cycle counter of the performance monitor, used by the cycle count
//! hypercalls and the periodic CPU usage report.

use tock_registers::LocalRegisterCopy;

use crate::hal::{HypHal, SysReg};
use crate::regs::PMCR;

/// `PMCNTENSET_EL0`/`PMCNTENCLR_EL0` bit of the cycle counter.
const CYCLE_COUNTER: u64 = 1 << 31;

/// Delay between two CPU usage reports.
pub const CPU_USAGE_PERIOD_MS: u64 = 1000;

/// Enables the PMU, resets the cycle counter and starts it.
pub(crate) fn cycle_count_start(hal: &dyn HypHal) {
    let mut pmcr = LocalRegisterCopy::<u64, PMCR::Register>::new(hal.read_sysreg(SysReg::PmcrEl0));
    pmcr.modify(PMCR::E::SET + PMCR::C::SET);
    hal.write_sysreg(SysReg::PmcrEl0, pmcr.get());
    hal.write_sysreg(SysReg::PmcntensetEl0, CYCLE_COUNTER);
}

/// Stops the cycle counter and returns its value.
pub(crate) fn cycle_count_stop(hal: &dyn HypHal) -> u64 {
    hal.write_sysreg(SysReg::PmcntenclrEl0, CYCLE_COUNTER);
    hal.read_sysreg(SysReg::PmccntrEl0)
}

/// Logs the cycles spent since the last report against one period of the
/// system counter, then restarts counting.
pub(crate) fn dump_cpu_usage(hal: &dyn HypHal, cpu: usize, freq: u64) {
    let cycles = cycle_count_stop(hal);
    let period_ticks = freq * CPU_USAGE_PERIOD_MS / 1000;
    info!("cpu {}: cycle count {}, timer count {}", cpu, cycles, period_ticks);
    if period_ticks != 0 {
        info!("cpu {}: usage {}%", cpu, cycles * 100 / period_ticks);
    }
    cycle_count_start(hal);
}
