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

//! In-memory [`HypHal`] used by the unit tests.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use spin::Mutex;

use crate::PAGE_SIZE;
use crate::context_frame::FpRegisters;
use crate::hal::{HypHal, SysReg, TranslationStage};

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;
const MOCK_RAM_BASE: u64 = 0x1000_0000;

const CORE_MBOX_SET_BASE: u64 = 0x4000_0080;
const CORE_MBOX_RDCLR_BASE: u64 = 0x4000_00C0;
const CORE_MBOX_END: u64 = 0x4000_0100;

#[derive(Default)]
struct MockState {
    cpu: usize,
    masked: bool,
    sysregs: BTreeMap<SysReg, u64>,
    events: Vec<String>,
    guest_va: BTreeMap<u64, u64>,
    pages: BTreeMap<u64, Vec<u8>>,
    mmio: BTreeMap<u64, u32>,
    mmio_writes: Vec<(u64, u32)>,
    next_phys: u64,
    phys_limit: Option<u64>,
    freed_phys: Vec<(u64, usize)>,
    fp_restores: usize,
}

impl MockState {
    fn page_mut(&mut self, pa: u64) -> &mut Vec<u8> {
        self.pages
            .entry(pa & !PAGE_MASK)
            .or_insert_with(|| alloc::vec![0; PAGE_SIZE])
    }

    fn read_byte(&self, pa: u64) -> u8 {
        self.pages
            .get(&(pa & !PAGE_MASK))
            .map_or(0, |page| page[(pa & PAGE_MASK) as usize])
    }
}

/// Records what the core asks of the platform and serves memory from maps.
///
/// The core mailbox block behaves like the hardware: a write to a SET
/// register ORs into the matching RD/CLR register, and RD/CLR writes clear.
pub struct MockHal {
    state: Mutex<MockState>,
}

impl MockHal {
    pub fn new() -> Self {
        let mut state = MockState {
            next_phys: MOCK_RAM_BASE,
            ..Default::default()
        };
        // 19.2 MHz, as on the Raspberry Pi 3
        state.sysregs.insert(SysReg::CntfrqEl0, 19_200_000);
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn set_cpu(&self, cpu: usize) {
        self.state.lock().cpu = cpu;
    }

    pub fn sysreg(&self, reg: SysReg) -> u64 {
        self.state.lock().sysregs.get(&reg).copied().unwrap_or(0)
    }

    pub fn set_sysreg(&self, reg: SysReg, value: u64) {
        self.state.lock().sysregs.insert(reg, value);
    }

    pub fn irqs_masked(&self) -> bool {
        self.state.lock().masked
    }

    /// TLB flushes and `VTTBR_EL2` writes, in order.
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn fp_restores(&self) -> usize {
        self.state.lock().fp_restores
    }

    /// Makes the guest page at `va` translate to the page at `pa`.
    pub fn map_guest_va(&self, va: u64, pa: u64) {
        self.state
            .lock()
            .guest_va
            .insert(va & !PAGE_MASK, pa & !PAGE_MASK);
    }

    pub fn write_phys_u32(&self, pa: u64, value: u32) {
        self.write_phys(pa, &value.to_le_bytes());
    }

    pub fn mmio(&self, pa: u64) -> u32 {
        self.state.lock().mmio.get(&pa).copied().unwrap_or(0)
    }

    pub fn set_mmio(&self, pa: u64, value: u32) {
        self.state.lock().mmio.insert(pa, value);
    }

    pub fn mmio_writes(&self) -> Vec<(u64, u32)> {
        self.state.lock().mmio_writes.clone()
    }

    pub fn clear_mmio_writes(&self) {
        self.state.lock().mmio_writes.clear();
    }

    /// Makes `alloc_phys` fail once `bytes` of guest memory are handed out.
    pub fn set_phys_limit(&self, bytes: u64) {
        self.state.lock().phys_limit = Some(bytes);
    }

    pub fn freed_phys(&self) -> Vec<(u64, usize)> {
        self.state.lock().freed_phys.clone()
    }
}

impl HypHal for MockHal {
    fn cpu_id(&self) -> usize {
        self.state.lock().cpu
    }

    fn read_sysreg(&self, reg: SysReg) -> u64 {
        self.sysreg(reg)
    }

    fn write_sysreg(&self, reg: SysReg, value: u64) {
        let mut state = self.state.lock();
        if reg == SysReg::VttbrEl2 {
            state.events.push(format!("vttbr={:#x}", value));
        }
        state.sysregs.insert(reg, value);
    }

    fn irq_save(&self) -> u64 {
        let mut state = self.state.lock();
        let flags = state.masked as u64;
        state.masked = true;
        flags
    }

    fn irq_restore(&self, flags: u64) {
        self.state.lock().masked = flags != 0;
    }

    fn flush_guest_tlb(&self) {
        self.state.lock().events.push("tlbi".to_string());
    }

    fn address_translate(&self, va: u64, _stage: TranslationStage) {
        let mut state = self.state.lock();
        let par = match state.guest_va.get(&(va & !PAGE_MASK)) {
            Some(pa) => *pa,
            None => 1,
        };
        state.sysregs.insert(SysReg::ParEl1, par);
    }

    fn read_phys_u32(&self, pa: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_phys(pa, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn read_phys(&self, pa: u64, buf: &mut [u8]) {
        let state = self.state.lock();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = state.read_byte(pa + i as u64);
        }
    }

    fn write_phys(&self, pa: u64, data: &[u8]) {
        let mut state = self.state.lock();
        for (i, byte) in data.iter().enumerate() {
            let addr = pa + i as u64;
            state.page_mut(addr)[(addr & PAGE_MASK) as usize] = *byte;
        }
    }

    fn alloc_phys(&self, size: usize) -> Option<u64> {
        let mut state = self.state.lock();
        let base = state.next_phys;
        let len = ((size as u64 + PAGE_MASK) & !PAGE_MASK).max(PAGE_SIZE as u64);
        if state
            .phys_limit
            .is_some_and(|limit| base + len > MOCK_RAM_BASE + limit)
        {
            return None;
        }
        state.next_phys += len;
        Some(base)
    }

    fn free_phys(&self, pa: u64, size: usize) {
        self.state.lock().freed_phys.push((pa, size));
    }

    fn virt_to_phys(&self, vaddr: usize) -> u64 {
        vaddr as u64
    }

    fn mmio_read32(&self, pa: u64) -> u32 {
        self.mmio(pa)
    }

    fn mmio_write32(&self, pa: u64, value: u32) {
        let mut state = self.state.lock();
        state.mmio_writes.push((pa, value));
        if (CORE_MBOX_SET_BASE..CORE_MBOX_RDCLR_BASE).contains(&pa) {
            *state.mmio.entry(pa + 0x40).or_insert(0) |= value;
        } else if (CORE_MBOX_RDCLR_BASE..CORE_MBOX_END).contains(&pa) {
            *state.mmio.entry(pa).or_insert(0) &= !value;
        } else {
            state.mmio.insert(pa, value);
        }
    }

    fn save_fp(&self, _fp: &mut FpRegisters) {}

    fn restore_fp(&self, _fp: &FpRegisters) {
        self.state.lock().fp_restores += 1;
    }
}
