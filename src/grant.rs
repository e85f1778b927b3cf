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

//! Ownership of passthrough resources: GPIO pins, GPU interrupt lines and
//! exclusive MMIO pages.
//!
//! Each resource belongs to at most one VM. Requests are checked as a whole
//! before anything is committed, so a rejected VM leaves no partial grants.

use axerrno::{AxResult, ax_err};
use numeric_enum_macro::numeric_enum;

use crate::vm::VmId;

/// Number of GPU peripheral interrupt lines routed through the ARM interrupt controller.
pub const GPU_IRQ_NUM: usize = 64;

const EXCLUSIVE_MMIO_SLOTS: usize = 17;

numeric_enum! {
    #[repr(u8)]
    /// Peripheral pages that can be handed to one VM as-is.
    ///
    /// The discriminant is the bit position in a VM's `mmio_grant` mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ExclusiveMmio {
        SysTimer = 1,
        Gpio = 2,
        Pl011 = 3,
        I2s = 4,
        Pwm = 5,
        Spi = 6,
        Aux = 7,
        CmGp = 8,
        Emmc = 9,
        Dma = 10,
        Dma15 = 11,
        Bsc0 = 12,
        Bsc1 = 13,
        Bsc2 = 14,
        Usb = 15,
        Cprman = 16,
    }
}

impl ExclusiveMmio {
    pub const fn mask(self) -> u64 {
        1 << self as u8
    }

    pub const fn base(self) -> u64 {
        match self {
            Self::SysTimer => 0x3F00_3000,
            Self::Gpio => 0x3F20_0000,
            Self::Pl011 => 0x3F20_1000,
            Self::I2s => 0x3F20_3000,
            Self::Pwm => 0x3F20_C000,
            Self::Spi => 0x3F20_4000,
            Self::Aux => 0x3F21_5000,
            Self::CmGp => 0x3F10_1000,
            Self::Emmc => 0x3F30_0000,
            Self::Dma => 0x3F00_7000,
            Self::Dma15 => 0x3FE0_5000,
            Self::Bsc0 => 0x3F20_5000,
            Self::Bsc1 => 0x3F80_4000,
            Self::Bsc2 => 0x3F80_5000,
            Self::Usb => 0x3F98_0000,
            Self::Cprman => 0x3F10_1000,
        }
    }

    pub const fn len(self) -> usize {
        match self {
            Self::Cprman => 0x2000,
            _ => 0x1000,
        }
    }

    fn overlaps(self, other: Self) -> bool {
        self.base() < other.base() + other.len() as u64
            && other.base() < self.base() + self.len() as u64
    }

    /// Devices selected by `mask`, in bit order.
    pub fn from_mask(mask: u64) -> impl Iterator<Item = Self> {
        (1..EXCLUSIVE_MMIO_SLOTS as u8)
            .filter(move |bit| mask & (1 << bit) != 0)
            .filter_map(|bit| Self::try_from(bit).ok())
    }

    fn valid_mask() -> u64 {
        ((1u64 << EXCLUSIVE_MMIO_SLOTS) - 1) & !1
    }
}

/// Who owns what.
pub struct GrantTable {
    gpio_in_use: u64,
    irq_owner: [Option<VmId>; GPU_IRQ_NUM],
    mmio_owner: [Option<VmId>; EXCLUSIVE_MMIO_SLOTS],
}

impl GrantTable {
    pub const fn new() -> Self {
        Self {
            gpio_in_use: 0,
            irq_owner: [None; GPU_IRQ_NUM],
            mmio_owner: [None; EXCLUSIVE_MMIO_SLOTS],
        }
    }

    /// Checks that a VM may take `gpio`, `irq` and `mmio` without touching
    /// anything another VM already owns.
    pub fn check(&self, gpio: u64, irq: u64, mmio: u64) -> AxResult {
        if mmio & !ExclusiveMmio::valid_mask() != 0 {
            return ax_err!(InvalidInput, "unknown exclusive MMIO device in grant");
        }
        if self.gpio_in_use & gpio != 0 {
            warn!(
                "gpio grant {:#x} overlaps pins in use {:#x}",
                gpio, self.gpio_in_use
            );
            return ax_err!(AlreadyExists, "GPIO pins already granted");
        }
        let taken_line =
            (0..GPU_IRQ_NUM).find(|&line| irq & (1 << line) != 0 && self.irq_owner[line].is_some());
        if let Some(line) = taken_line {
            warn!("gpu irq {} already owned by {:?}", line, self.irq_owner[line]);
            return ax_err!(AlreadyExists, "interrupt line already granted");
        }
        for dev in ExclusiveMmio::from_mask(mmio) {
            let taken = self.owned_mmio().find(|(owned, _)| owned.overlaps(dev));
            if let Some((owned, vm)) = taken {
                warn!("{:?} page overlaps {:?} owned by vm {}", dev, owned, vm);
                return ax_err!(AlreadyExists, "MMIO page already granted");
            }
        }
        Ok(())
    }

    /// Records the grants of `vm`. Callers run [`GrantTable::check`] first.
    pub fn commit(&mut self, vm: VmId, gpio: u64, irq: u64, mmio: u64) {
        self.gpio_in_use |= gpio;
        for line in 0..GPU_IRQ_NUM {
            if irq & (1 << line) != 0 {
                self.irq_owner[line] = Some(vm);
            }
        }
        for dev in ExclusiveMmio::from_mask(mmio) {
            self.mmio_owner[dev as usize] = Some(vm);
        }
        debug!(
            "vm {} granted gpio {:#x}, irq {:#x}, mmio {:#x}; gpio in use {:#x}",
            vm, gpio, irq, mmio, self.gpio_in_use
        );
    }

    /// Gives back everything `vm` holds and returns its interrupt lines.
    pub fn release(&mut self, vm: VmId, gpio: u64) -> u64 {
        self.gpio_in_use &= !gpio;
        let mut lines = 0;
        for (line, owner) in self.irq_owner.iter_mut().enumerate() {
            if *owner == Some(vm) {
                *owner = None;
                lines |= 1 << line;
            }
        }
        for owner in self.mmio_owner.iter_mut() {
            if *owner == Some(vm) {
                *owner = None;
            }
        }
        lines
    }

    pub fn gpio_in_use(&self) -> u64 {
        self.gpio_in_use
    }

    pub fn irq_owner(&self, line: usize) -> Option<VmId> {
        self.irq_owner.get(line).copied().flatten()
    }

    pub fn mmio_owner(&self, dev: ExclusiveMmio) -> Option<VmId> {
        self.mmio_owner[dev as usize]
    }

    fn owned_mmio(&self) -> impl Iterator<Item = (ExclusiveMmio, VmId)> + '_ {
        self.mmio_owner.iter().enumerate().filter_map(|(bit, owner)| {
            let dev = ExclusiveMmio::try_from(bit as u8).ok()?;
            Some((dev, (*owner)?))
        })
    }
}
