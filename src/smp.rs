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

//! Cross-core notifications over BCM2836 core mailbox 0.

use numeric_enum_macro::numeric_enum;

use crate::hal::HypHal;
use crate::pcpu::CpuId;

const CORE_MBOX0_SET: u64 = 0x4000_0080;
const CORE_MBOX0_RDCLR: u64 = 0x4000_00C0;
const CORE_MBOX_STRIDE: u64 = 0x10;

numeric_enum! {
    #[repr(u32)]
    /// Mail kinds; each one is a bit of the mailbox word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SmpMail {
        Schedule = 1,
        TimerStart = 2,
        TimerStop = 4,
    }
}

const ALL_MAIL: [SmpMail; 3] = [SmpMail::Schedule, SmpMail::TimerStart, SmpMail::TimerStop];

pub fn send(hal: &dyn HypHal, cpu: CpuId, mail: SmpMail) {
    trace!("cpu {} -> cpu {}: {:?}", hal.cpu_id(), cpu, mail);
    hal.mmio_write32(CORE_MBOX0_SET + CORE_MBOX_STRIDE * cpu as u64, mail as u32);
}

/// Reads and clears the mails pending for `cpu`.
pub fn take(hal: &dyn HypHal, cpu: CpuId) -> impl Iterator<Item = SmpMail> {
    let addr = CORE_MBOX0_RDCLR + CORE_MBOX_STRIDE * cpu as u64;
    let pending = hal.mmio_read32(addr);
    if pending != 0 {
        hal.mmio_write32(addr, pending);
    }
    let unknown = pending & !ALL_MAIL.iter().fold(0, |acc, m| acc | *m as u32);
    if unknown != 0 {
        warn!("cpu {}: unknown mailbox bits {:#x}", cpu, unknown);
    }
    ALL_MAIL
        .into_iter()
        .filter(move |mail| pending & *mail as u32 != 0)
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::mock::MockHal;

    #[test]
    fn test_send_then_take_clears() {
        let hal = MockHal::new();
        send(&hal, 2, SmpMail::TimerStart);
        send(&hal, 2, SmpMail::Schedule);
        assert_eq!(hal.mmio(0x4000_00E0), 0b011);

        let mails: Vec<_> = take(&hal, 2).collect();
        assert_eq!(mails, [SmpMail::Schedule, SmpMail::TimerStart]);
        assert_eq!(hal.mmio(0x4000_00E0), 0);
        assert_eq!(take(&hal, 2).count(), 0);
        assert_eq!(take(&hal, 1).count(), 0);
    }
}
