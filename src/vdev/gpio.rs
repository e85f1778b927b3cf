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

//! BCM2835 GPIO (`0x3F20_0000..=0x3F20_00FF`) shared pin by pin.
//!
//! A VM only sees and changes the pins in its GPIO grant. Function select
//! writes are merged into the hardware value so pins of other VMs keep their
//! function. Pull-up/down control is ignored.

use axerrno::{AxResult, ax_err};

use super::{MmioContext, MmioKind, MmioRange, VirtMmioDevice};

const BASE: u64 = 0x3F20_0000;

const GPFSEL0: u64 = BASE;
const GPFSEL5: u64 = BASE + 0x14;
const GPSET0: u64 = BASE + 0x1C;
const GPSET1: u64 = BASE + 0x20;
const GPCLR0: u64 = BASE + 0x28;
const GPCLR1: u64 = BASE + 0x2C;
const GPLEV0: u64 = BASE + 0x34;
const GPLEV1: u64 = BASE + 0x38;
const GPEDS0: u64 = BASE + 0x40;
const GPEDS1: u64 = BASE + 0x44;
const GPREN0: u64 = BASE + 0x4C;
const GPREN1: u64 = BASE + 0x50;
const GPFEN0: u64 = BASE + 0x58;
const GPFEN1: u64 = BASE + 0x5C;
const GPHEN0: u64 = BASE + 0x64;
const GPHEN1: u64 = BASE + 0x68;
const GPLEN0: u64 = BASE + 0x70;
const GPLEN1: u64 = BASE + 0x74;
const GPAREN0: u64 = BASE + 0x7C;
const GPAREN1: u64 = BASE + 0x80;
const GPAFEN0: u64 = BASE + 0x88;
const GPAFEN1: u64 = BASE + 0x8C;
const GPPUD: u64 = BASE + 0x94;
const GPPUDCLK0: u64 = BASE + 0x98;
const GPPUDCLK1: u64 = BASE + 0x9C;

const PINS_PER_FSEL: u64 = 10;
const PIN_COUNT: u64 = 54;

/// Function select fields of the granted pins in register `GPFSELn`.
fn fsel_mask(grant: u64, addr: u64) -> u32 {
    let first = (addr - GPFSEL0) / 4 * PINS_PER_FSEL;
    (first..(first + PINS_PER_FSEL).min(PIN_COUNT))
        .filter(|&pin| grant & (1 << pin) != 0)
        .fold(0, |mask, pin| mask | (0b111 << ((pin % PINS_PER_FSEL) * 3)))
}

/// Granted pins of the bank `addr` belongs to.
fn bank_mask(grant: u64, addr: u64) -> u32 {
    let bank1 = matches!(
        addr,
        GPSET1
            | GPCLR1
            | GPLEV1
            | GPEDS1
            | GPREN1
            | GPFEN1
            | GPHEN1
            | GPLEN1
            | GPAREN1
            | GPAFEN1
            | GPPUDCLK1
    );
    if bank1 { (grant >> 32) as u32 } else { grant as u32 }
}

pub(crate) struct Gpio;

impl VirtMmioDevice for Gpio {
    fn name(&self) -> &'static str {
        "bcm2835-gpio"
    }

    fn range(&self) -> MmioRange {
        MmioRange::new(BASE, BASE + 0xFF)
    }

    fn kind(&self) -> MmioKind {
        MmioKind::Exclusive
    }

    fn read(&self, cx: &mut MmioContext<'_>, addr: u64) -> AxResult<u32> {
        let grant = cx.vm().gpio_grant();
        match addr {
            GPFSEL0..=GPFSEL5 if addr % 4 == 0 => {
                Ok(cx.hal().mmio_read32(addr) & fsel_mask(grant, addr))
            }
            GPSET0 | GPSET1 | GPCLR0 | GPCLR1 => {
                ax_err!(InvalidInput, "gpio set and clear registers are write-only")
            }
            GPPUD => Ok(0),
            GPLEV0 | GPLEV1 | GPEDS0 | GPEDS1 | GPREN0 | GPREN1 | GPFEN0 | GPFEN1 | GPHEN0
            | GPHEN1 | GPLEN0 | GPLEN1 | GPAREN0 | GPAREN1 | GPAFEN0 | GPAFEN1 | GPPUDCLK0
            | GPPUDCLK1 => Ok(cx.hal().mmio_read32(addr) & bank_mask(grant, addr)),
            _ => ax_err!(InvalidInput, "illegal access to unavailable address"),
        }
    }

    fn write(&self, cx: &mut MmioContext<'_>, addr: u64, value: u32) -> AxResult {
        let grant = cx.vm().gpio_grant();
        let hal = cx.env.hal;
        let allowed = match addr {
            GPFSEL0..=GPFSEL5 if addr % 4 == 0 => fsel_mask(grant, addr),
            GPLEV0 | GPLEV1 => return ax_err!(InvalidInput, "gpio level registers are read-only"),
            GPPUD => return Ok(()),
            GPSET0 | GPSET1 | GPCLR0 | GPCLR1 | GPEDS0 | GPEDS1 | GPREN0 | GPREN1 | GPFEN0
            | GPFEN1 | GPHEN0 | GPHEN1 | GPLEN0 | GPLEN1 | GPAREN0 | GPAREN1 | GPAFEN0
            | GPAFEN1 | GPPUDCLK0 | GPPUDCLK1 => bank_mask(grant, addr),
            _ => return ax_err!(InvalidInput, "illegal access to unavailable address"),
        };
        if value & !allowed != 0 {
            warn!(
                "vm {}: gpio write {:#x} <- {:#x} touches pins outside grant {:#x}",
                cx.vm().name(),
                addr,
                value,
                grant
            );
        }
        let value = match addr {
            // Set, clear, event status and pull clock are write-one strobes.
            GPSET0 | GPSET1 | GPCLR0 | GPCLR1 | GPEDS0 | GPEDS1 | GPPUDCLK0 | GPPUDCLK1 => {
                value & allowed
            }
            _ => (hal.mmio_read32(addr) & !allowed) | (value & allowed),
        };
        hal.mmio_write32(addr, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fsel_mask_covers_granted_pins() {
        // pins 14 and 15 live in GPFSEL1, fields 4 and 5
        let grant = (1 << 14) | (1 << 15);
        assert_eq!(fsel_mask(grant, GPFSEL0), 0);
        assert_eq!(fsel_mask(grant, GPFSEL0 + 4), 0b111_111 << 12);
        // GPFSEL5 only has pins 50..=53
        assert_eq!(fsel_mask(u64::MAX, GPFSEL5), 0xfff);
    }

    #[test]
    fn test_bank_mask() {
        let grant = 0x0000_0003_8000_0001;
        assert_eq!(bank_mask(grant, GPSET0), 0x8000_0001);
        assert_eq!(bank_mask(grant, GPSET1), 0x3);
        assert_eq!(bank_mask(grant, GPAFEN1), 0x3);
    }
}
