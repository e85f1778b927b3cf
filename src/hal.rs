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

use crate::context_frame::FpRegisters;

/// System registers the core reads or writes through [`HypHal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SysReg {
    EsrEl2,
    FarEl2,
    HpfarEl2,
    HcrEl2,
    VtcrEl2,
    VttbrEl2,
    ParEl1,

    CntfrqEl0,
    CntvctEl0,
    CnthpCtlEl2,
    CnthpCvalEl2,
    CnthpTvalEl2,

    PmcrEl0,
    PmcntensetEl0,
    PmcntenclrEl0,
    PmccntrEl0,

    SpEl0,
    SpEl1,
    ElrEl1,
    SpsrEl1,
    VbarEl1,
    EsrEl1,
    FarEl1,
    SctlrEl1,
    TcrEl1,
    Ttbr0El1,
    Ttbr1El1,
    MairEl1,
    CpacrEl1,
    ContextidrEl1,
    TpidrEl0,
    TpidrEl1,
    TpidrroEl0,
    CntkctlEl1,
    CntvCtlEl0,
    CntvCvalEl0,
    CntvoffEl2,
    CntpCtlEl0,
    CntpCvalEl0,
    VpidrEl2,
    VmpidrEl2,
}

/// Which translation regime an `AT` lookup walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationStage {
    /// Guest EL1 stage 1 only: the result is an IPA.
    Stage1El1,
    /// Guest EL1 stage 1 followed by stage 2: the result is a PA.
    Stage12El1,
}

/// Privileged hardware access for the hypervisor core.
///
/// Everything in this crate except the platform layer is written against this
/// trait, so scheduling, paging and device emulation can be exercised without
/// running at EL2.
pub trait HypHal: Sync {
    /// Index of the executing physical core.
    fn cpu_id(&self) -> usize;

    fn read_sysreg(&self, reg: SysReg) -> u64;
    fn write_sysreg(&self, reg: SysReg, value: u64);

    /// Masks all exceptions on the local core and returns the previous mask.
    fn irq_save(&self) -> u64;
    /// Restores a mask returned by [`HypHal::irq_save`].
    fn irq_restore(&self, flags: u64);

    /// Invalidates every EL1 stage-1 and stage-2 TLB entry of the running VMID,
    /// completing before the next `VTTBR_EL2` write.
    fn flush_guest_tlb(&self);

    /// Issues an `AT` read lookup for `va`; the result lands in `PAR_EL1`.
    fn address_translate(&self, va: u64, stage: TranslationStage);

    fn read_phys_u32(&self, pa: u64) -> u32;
    fn read_phys(&self, pa: u64, buf: &mut [u8]);
    fn write_phys(&self, pa: u64, data: &[u8]);

    /// Allocates zeroed, page-aligned physical memory for guest RAM.
    fn alloc_phys(&self, size: usize) -> Option<u64>;

    /// Returns memory obtained from [`HypHal::alloc_phys`] with the same `size`.
    fn free_phys(&self, pa: u64, size: usize);

    /// Converts a hypervisor virtual address to the physical address the MMU walks.
    fn virt_to_phys(&self, vaddr: usize) -> u64;

    fn mmio_read32(&self, pa: u64) -> u32;
    fn mmio_write32(&self, pa: u64, value: u32);

    /// Saves the SIMD&FP register bank.
    fn save_fp(&self, fp: &mut FpRegisters);
    /// Loads the SIMD&FP register bank.
    fn restore_fp(&self, fp: &FpRegisters);
}
