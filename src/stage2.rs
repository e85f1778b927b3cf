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

//! Stage-2 (IPA → PA) translation tables.
//!
//! A VM's tables start at level 1 (`VTCR_EL2.SL0 = 1`, 39-bit IPA space) and
//! map 4 KiB pages through three levels. All tables come from one arena sized
//! at boot; there is no unmap and no reclamation.

use alloc::boxed::Box;
use alloc::vec;

use spin::Mutex;
use tock_registers::LocalRegisterCopy;

use crate::PAGE_SIZE;
use crate::hal::{HypHal, SysReg, TranslationStage};
use crate::regs::{PAR, S2_DESC};

const ENTRIES_PER_TABLE: usize = 512;
const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;
const DESC_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

#[repr(C, align(4096))]
#[derive(Clone, Copy)]
struct PageTable {
    entries: [u64; ENTRIES_PER_TABLE],
}

impl PageTable {
    const EMPTY: Self = Self {
        entries: [0; ENTRIES_PER_TABLE],
    };
}

/// Physical address of a VM's level-1 stage-2 table, as written to `VTTBR_EL2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage2Root(u64);

impl Stage2Root {
    pub const fn paddr(&self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) const fn from_paddr(paddr: u64) -> Self {
        Self(paddr)
    }
}

/// Memory type of a stage-2 leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Inner shareable write-back RAM.
    Normal,
    /// Device-nGnRE, used for passthrough peripheral pages.
    Device,
}

fn table_descriptor(paddr: u64) -> u64 {
    (S2_DESC::VALID::SET + S2_DESC::TABLE::SET + S2_DESC::OUTPUT_ADDR.val(paddr >> 12)).value
}

fn page_descriptor(paddr: u64, kind: MemoryKind) -> u64 {
    let attr = match kind {
        MemoryKind::Normal => S2_DESC::MEMATTR::Normal + S2_DESC::SH::Inner,
        MemoryKind::Device => S2_DESC::MEMATTR::Device,
    };
    (S2_DESC::VALID::SET
        + S2_DESC::TABLE::SET
        + attr
        + S2_DESC::S2AP::ReadWrite
        + S2_DESC::AF::SET
        + S2_DESC::OUTPUT_ADDR.val(paddr >> 12))
    .value
}

fn descriptor_is_valid(desc: u64) -> bool {
    LocalRegisterCopy::<u64, S2_DESC::Register>::new(desc).is_set(S2_DESC::VALID)
}

struct TableArena {
    tables: Box<[PageTable]>,
    base_paddr: u64,
    next: usize,
}

impl TableArena {
    fn alloc(&mut self) -> usize {
        if self.next >= self.tables.len() {
            panic!(
                "stage-2 table arena exhausted ({} tables)",
                self.tables.len()
            );
        }
        let index = self.next;
        self.next += 1;
        index
    }

    fn paddr_of(&self, index: usize) -> u64 {
        self.base_paddr + (index * PAGE_SIZE) as u64
    }

    fn index_of(&self, paddr: u64) -> usize {
        let offset = paddr.wrapping_sub(self.base_paddr);
        let index = (offset / PAGE_SIZE as u64) as usize;
        if paddr < self.base_paddr || index >= self.next {
            panic!("stage-2 descriptor points outside the table arena: {paddr:#x}");
        }
        index
    }

    /// Follows `table[index]`, allocating the next level table if the slot is empty.
    fn next_level(&mut self, table: usize, index: usize) -> usize {
        let desc = self.tables[table].entries[index];
        if descriptor_is_valid(desc) {
            return self.index_of(desc & DESC_ADDR_MASK);
        }
        let child = self.alloc();
        self.tables[table].entries[index] = table_descriptor(self.paddr_of(child));
        child
    }

    fn lookup(&self, table: usize, index: usize) -> Option<u64> {
        let desc = self.tables[table].entries[index];
        descriptor_is_valid(desc).then_some(desc)
    }
}

fn level_index(ipa: u64, level: usize) -> usize {
    let shift = 12 + 9 * (3 - level);
    ((ipa >> shift) & 0x1ff) as usize
}

/// Owner of all stage-2 translation tables.
pub struct Stage2Manager {
    arena: Mutex<TableArena>,
}

impl Stage2Manager {
    /// Reserves an arena of `table_count` zeroed 4 KiB tables.
    pub fn new(hal: &dyn HypHal, table_count: usize) -> Self {
        let tables = vec![PageTable::EMPTY; table_count].into_boxed_slice();
        let base_paddr = hal.virt_to_phys(tables.as_ptr() as usize);
        Self {
            arena: Mutex::new(TableArena {
                tables,
                base_paddr,
                next: 0,
            }),
        }
    }

    /// Allocates a fresh level-1 table for a new VM.
    pub fn alloc_root(&self) -> Stage2Root {
        let mut arena = self.arena.lock();
        let index = arena.alloc();
        let root = Stage2Root(arena.paddr_of(index));
        debug!("stage-2 root {:#x} allocated", root.0);
        root
    }

    pub fn tables_used(&self) -> usize {
        self.arena.lock().next
    }

    /// Maps `[ipa, ipa + len)` to `[paddr, paddr + len)` as normal memory.
    pub fn map_range(&self, root: Stage2Root, ipa: u64, paddr: u64, len: usize) {
        self.map_range_with(root, ipa, paddr, len, MemoryKind::Normal)
    }

    /// Maps every page touched by `[ipa, ipa + len)`.
    ///
    /// Existing intermediate tables are reused; leaf entries are overwritten.
    pub fn map_range_with(
        &self,
        root: Stage2Root,
        ipa: u64,
        paddr: u64,
        len: usize,
        kind: MemoryKind,
    ) {
        if root.0 == 0 {
            panic!("map_range on a null stage-2 root");
        }
        if len == 0 {
            return;
        }
        let first = ipa & !PAGE_MASK;
        let last = (ipa + len as u64 - 1) & !PAGE_MASK;
        let mut pa = paddr & !PAGE_MASK;

        let mut arena = self.arena.lock();
        let l1 = arena.index_of(root.0);
        let mut page = first;
        while page <= last {
            let l2 = arena.next_level(l1, level_index(page, 1));
            let l3 = arena.next_level(l2, level_index(page, 2));
            arena.tables[l3].entries[level_index(page, 3)] = page_descriptor(pa, kind);
            page += PAGE_SIZE as u64;
            pa += PAGE_SIZE as u64;
        }
        trace!(
            "stage-2 {:#x}: mapped ipa {:#x}..={:#x} -> pa {:#x} ({:?})",
            root.0,
            first,
            last + PAGE_MASK,
            paddr & !PAGE_MASK,
            kind
        );
    }

    /// Software walk of `root`; `None` when `ipa` is unmapped.
    pub fn translate(&self, root: Stage2Root, ipa: u64) -> Option<u64> {
        let arena = self.arena.lock();
        let mut table = arena.index_of(root.0);
        for level in 1..3 {
            let desc = arena.lookup(table, level_index(ipa, level))?;
            table = arena.index_of(desc & DESC_ADDR_MASK);
        }
        let leaf = arena.lookup(table, level_index(ipa, 3))?;
        Some((leaf & DESC_ADDR_MASK) | (ipa & PAGE_MASK))
    }
}

/// Makes `root` the active stage-2 table of the calling core.
pub fn set_active_root(hal: &dyn HypHal, root: Stage2Root) {
    hal.flush_guest_tlb();
    hal.write_sysreg(SysReg::VttbrEl2, root.0);
}

/// Result of a hardware `AT` lookup, as left in `PAR_EL1`.
///
/// A failed lookup is not an error: the fault bit stays visible and callers
/// decide what to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestTranslation {
    par: u64,
    va: u64,
}

impl GuestTranslation {
    pub fn is_fault(&self) -> bool {
        LocalRegisterCopy::<u64, PAR::Register>::new(self.par).is_set(PAR::F)
    }

    /// Translated address, including the page offset of the input.
    pub fn addr(&self) -> u64 {
        (self.par & DESC_ADDR_MASK) | (self.va & PAGE_MASK)
    }

    pub fn raw(&self) -> u64 {
        self.par
    }
}

/// Translates a guest EL1 virtual address through the current guest regime.
pub fn translate_guest_va(hal: &dyn HypHal, va: u64, stage: TranslationStage) -> GuestTranslation {
    hal.address_translate(va, stage);
    GuestTranslation {
        par: hal.read_sysreg(SysReg::ParEl1),
        va,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHal;

    #[test]
    fn test_mapping_round_trip() {
        let hal = MockHal::new();
        let s2 = Stage2Manager::new(&hal, 16);
        let root = s2.alloc_root();

        s2.map_range(root, 0x8_0000, 0x2000_0000, 0x3000);
        for off in [0u64, 0x4, 0xfff, 0x1000, 0x2ffc] {
            assert_eq!(s2.translate(root, 0x8_0000 + off), Some(0x2000_0000 + off));
        }

        // Same L3 table, a different L1 slot, and a region above 1 GiB.
        s2.map_range(root, 0x8_4000, 0x3000_0000, 0x1000);
        s2.map_range(root, 0x4000_0000, 0x4000_0000, 0x100);
        for off in [0u64, 0x4, 0xfff, 0x1000, 0x2ffc] {
            assert_eq!(s2.translate(root, 0x8_0000 + off), Some(0x2000_0000 + off));
        }
        assert_eq!(s2.translate(root, 0x8_4010), Some(0x3000_0010));
        assert_eq!(s2.translate(root, 0x4000_00fc), Some(0x4000_00fc));
        assert_eq!(s2.translate(root, 0x8_3000), None);
        assert_eq!(s2.translate(root, 0x8000_0000), None);
    }

    #[test]
    fn test_unaligned_range_covers_every_byte() {
        let hal = MockHal::new();
        let s2 = Stage2Manager::new(&hal, 8);
        let root = s2.alloc_root();
        s2.map_range(root, 0x1ff8, 0x9ff8, 0x10);
        assert_eq!(s2.translate(root, 0x1ff8), Some(0x9ff8));
        assert_eq!(s2.translate(root, 0x2004), Some(0xa004));
        assert_eq!(s2.translate(root, 0x3000), None);
    }

    #[test]
    fn test_leaf_attributes() {
        let desc = page_descriptor(0x3F20_0000, MemoryKind::Device);
        assert_eq!(desc & 0b11, 0b11);
        assert_eq!(desc & (1 << 10), 1 << 10);
        assert_eq!((desc >> 6) & 0b11, 0b11);
        assert_eq!((desc >> 2) & 0xf, 0b0001);
        assert_eq!(desc & DESC_ADDR_MASK, 0x3F20_0000);
        assert_eq!(table_descriptor(0x1000), 0x1003);
    }

    #[test]
    fn test_roots_are_unique() {
        let hal = MockHal::new();
        let s2 = Stage2Manager::new(&hal, 8);
        let a = s2.alloc_root();
        let b = s2.alloc_root();
        assert_ne!(a, b);
        assert_eq!(b.paddr() - a.paddr(), PAGE_SIZE as u64);
        assert_eq!(s2.tables_used(), 2);
    }

    #[test]
    #[should_panic(expected = "arena exhausted")]
    fn test_arena_exhaustion_is_fatal() {
        let hal = MockHal::new();
        let s2 = Stage2Manager::new(&hal, 3);
        let root = s2.alloc_root();
        s2.map_range(root, 0, 0x1000_0000, 0x1000);
        // needs a second L2 and L3 table
        s2.map_range(root, 0x4000_0000, 0x1000_0000, 0x1000);
    }

    #[test]
    #[should_panic(expected = "null stage-2 root")]
    fn test_null_root_is_fatal() {
        let hal = MockHal::new();
        let s2 = Stage2Manager::new(&hal, 2);
        s2.map_range(Stage2Root::from_paddr(0), 0, 0, 0x1000);
    }

    #[test]
    fn test_set_active_root_flushes_first() {
        let hal = MockHal::new();
        set_active_root(&hal, Stage2Root::from_paddr(0x8_0000));
        assert_eq!(hal.events(), ["tlbi", "vttbr=0x80000"]);
        assert_eq!(hal.sysreg(SysReg::VttbrEl2), 0x8_0000);
    }

    #[test]
    fn test_guest_translation_keeps_fault_visible() {
        let hal = MockHal::new();
        hal.map_guest_va(0xffff_0000_0000_1000, 0x4_5000);
        let ok = translate_guest_va(&hal, 0xffff_0000_0000_1234, TranslationStage::Stage12El1);
        assert!(!ok.is_fault());
        assert_eq!(ok.addr(), 0x4_5234);

        let bad = translate_guest_va(&hal, 0xffff_0000_0000_9000, TranslationStage::Stage1El1);
        assert!(bad.is_fault());
        assert_eq!(bad.raw() & 1, 1);
    }
}
