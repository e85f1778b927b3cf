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

//! BCM2835 ARM interrupt controller (`0x3F00_B000..=0x3F00_BFFF`).
//!
//! Only the 64 GPU lines are virtualized. Every read and write of the
//! pending, enable and disable banks is masked by the VM's interrupt grant.
//! Basic interrupts are reserved by the hypervisor. FIQ control only records
//! which granted line the guest wants as FIQ.

use axerrno::{AxResult, ax_err};

use super::{MmioContext, MmioKind, MmioRange, VirtMmioDevice};
use crate::hal::HypHal;

const BASE: u64 = 0x3F00_B000;

const BASIC_PENDING: u64 = BASE + 0x200;
const PENDING_1: u64 = BASE + 0x204;
const PENDING_2: u64 = BASE + 0x208;
const FIQ_CONTROL: u64 = BASE + 0x20C;
const ENABLE_1: u64 = BASE + 0x210;
const ENABLE_2: u64 = BASE + 0x214;
const ENABLE_BASIC: u64 = BASE + 0x218;
const DISABLE_1: u64 = BASE + 0x21C;
const DISABLE_2: u64 = BASE + 0x220;
const DISABLE_BASIC: u64 = BASE + 0x224;

const FIQ_ENABLE: u32 = 1 << 7;
const FIQ_SOURCE: u32 = 0x7f;

/// Pending bits of GPU lines 0..=31 and 32..=63.
pub(crate) fn gpu_pending(hal: &dyn HypHal) -> u64 {
    hal.mmio_read32(PENDING_1) as u64 | ((hal.mmio_read32(PENDING_2) as u64) << 32)
}

/// Disables every GPU line in `lines` at the controller.
pub(crate) fn disable_gpu_lines(hal: &dyn HypHal, lines: u64) {
    if lines as u32 != 0 {
        hal.mmio_write32(DISABLE_1, lines as u32);
    }
    if (lines >> 32) as u32 != 0 {
        hal.mmio_write32(DISABLE_2, (lines >> 32) as u32);
    }
}

/// Half of the 64-bit interrupt grant covering bank 1 or bank 2.
fn grant_word(cx: &MmioContext<'_>, bank2: bool) -> u32 {
    let grant = cx.vm().irq_grant();
    if bank2 { (grant >> 32) as u32 } else { grant as u32 }
}

pub(crate) struct ArmIntc;

impl VirtMmioDevice for ArmIntc {
    fn name(&self) -> &'static str {
        "bcm2835-arm-intc"
    }

    fn range(&self) -> MmioRange {
        MmioRange::new(BASE, BASE + 0xFFF)
    }

    fn kind(&self) -> MmioKind {
        MmioKind::Exclusive
    }

    fn read(&self, cx: &mut MmioContext<'_>, addr: u64) -> AxResult<u32> {
        match addr {
            BASIC_PENDING => Ok(cx.hal().mmio_read32(addr)),
            ENABLE_BASIC | DISABLE_BASIC => {
                ax_err!(Unsupported, "basic interrupts are reserved by the hypervisor")
            }
            FIQ_CONTROL => Ok(cx.vm().fiq_ctl),
            PENDING_1 | ENABLE_1 | DISABLE_1 => {
                Ok(cx.hal().mmio_read32(addr) & grant_word(cx, false))
            }
            PENDING_2 | ENABLE_2 | DISABLE_2 => {
                Ok(cx.hal().mmio_read32(addr) & grant_word(cx, true))
            }
            _ => ax_err!(InvalidInput, "illegal access to unavailable address"),
        }
    }

    fn write(&self, cx: &mut MmioContext<'_>, addr: u64, value: u32) -> AxResult {
        match addr {
            BASIC_PENDING | PENDING_1 | PENDING_2 => {
                ax_err!(InvalidInput, "irq pending registers are read-only")
            }
            ENABLE_BASIC | DISABLE_BASIC => {
                ax_err!(Unsupported, "basic interrupts are reserved by the hypervisor")
            }
            FIQ_CONTROL => {
                let line = (value & FIQ_SOURCE) as u64;
                let granted = line < 64 && cx.vm().irq_grant() & (1 << line) != 0;
                if value & FIQ_ENABLE != 0 && !granted {
                    return ax_err!(InvalidInput, "fiq source is not granted to the vm");
                }
                cx.vm_mut().fiq_ctl = value & (FIQ_ENABLE | FIQ_SOURCE);
                Ok(())
            }
            ENABLE_1 | DISABLE_1 | ENABLE_2 | DISABLE_2 => {
                let grant = grant_word(cx, matches!(addr, ENABLE_2 | DISABLE_2));
                if value & !grant != 0 {
                    warn!(
                        "vm {}: interrupt bits {:#x} are not granted",
                        cx.vm().name(),
                        value & !grant
                    );
                }
                cx.hal().mmio_write32(addr, value & grant);
                Ok(())
            }
            _ => ax_err!(InvalidInput, "illegal access to unavailable address"),
        }
    }
}

#[cfg(test)]
mod tests {
    use axerrno::AxError;

    use super::*;
    use crate::vdev::bench::Bench;
    use crate::vm::VmConfig;

    #[test]
    fn test_enable_and_disable_are_masked_by_the_grant() {
        let mut bench = Bench::new();
        let vcpu = bench.vm(VmConfig {
            irq_grant: (1 << 57) | (1 << 3),
            ..Default::default()
        })[0];
        bench.hal.clear_mmio_writes();

        assert_eq!(bench.write(vcpu, ENABLE_2, u32::MAX), Ok(()));
        assert_eq!(bench.write(vcpu, DISABLE_1, 0b1111), Ok(()));
        assert_eq!(
            bench.hal.mmio_writes(),
            [(ENABLE_2, 1 << 25), (DISABLE_1, 1 << 3)]
        );

        bench.hal.set_mmio(PENDING_1, u32::MAX);
        assert_eq!(bench.read(vcpu, PENDING_1), Ok(1 << 3));
        assert_eq!(bench.write(vcpu, PENDING_1, 0), Err(AxError::InvalidInput));
        assert_eq!(bench.read(vcpu, ENABLE_BASIC), Err(AxError::Unsupported));
    }

    #[test]
    fn test_fiq_control_needs_a_granted_line() {
        let mut bench = Bench::new();
        let vcpu = bench.vm(VmConfig {
            irq_grant: 1 << 57,
            ..Default::default()
        })[0];

        assert_eq!(
            bench.write(vcpu, FIQ_CONTROL, FIQ_ENABLE | 56),
            Err(AxError::InvalidInput)
        );
        assert_eq!(bench.read(vcpu, FIQ_CONTROL), Ok(0));

        assert_eq!(bench.write(vcpu, FIQ_CONTROL, FIQ_ENABLE | 57), Ok(()));
        assert_eq!(bench.read(vcpu, FIQ_CONTROL), Ok(FIQ_ENABLE | 57));
        assert_eq!(bench.state.vms[0].fiq_line(), Some(57));
    }
}
