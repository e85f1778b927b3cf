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

use axerrno::AxResult;

use super::{MmioContext, MmioKind, MmioRange, VirtMmioDevice};

/// BCM2835 clock manager. Guests see a device that reads as zero and
/// ignores writes, so clock drivers initialize without touching real clocks.
pub(crate) struct Cprman;

impl VirtMmioDevice for Cprman {
    fn name(&self) -> &'static str {
        "bcm2835-cprman"
    }

    fn range(&self) -> MmioRange {
        MmioRange::new(0x3F10_1000, 0x3F10_2FFF)
    }

    fn kind(&self) -> MmioKind {
        MmioKind::Full
    }

    fn read(&self, _cx: &mut MmioContext<'_>, addr: u64) -> AxResult<u32> {
        debug!("cprman: read {:#x}", addr);
        Ok(0)
    }

    fn write(&self, _cx: &mut MmioContext<'_>, addr: u64, value: u32) -> AxResult {
        debug!("cprman: ignored write {:#x} <- {:#x}", addr, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::vdev::bench::Bench;
    use crate::vm::VmConfig;

    #[test]
    fn test_reads_zero_and_ignores_writes() {
        let mut bench = Bench::new();
        let vcpu = bench.vm(VmConfig::default())[0];
        // PLLA control
        bench.hal.set_mmio(0x3F10_1104, 0x5a00_0021);
        bench.hal.clear_mmio_writes();

        assert_eq!(bench.write(vcpu, 0x3F10_1104, 0x5a00_0011), Ok(()));
        assert_eq!(bench.read(vcpu, 0x3F10_1104), Ok(0));
        assert!(bench.hal.mmio_writes().is_empty());
        assert_eq!(bench.hal.mmio(0x3F10_1104), 0x5a00_0021);
    }
}
