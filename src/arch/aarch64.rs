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

//! EL2 on a BCM2837 with physical memory identity mapped.
//!
//! Boot order on every core: [`init_hypervisor`] (primary core only, after
//! the heap and percpu areas are set up), [`init_current_cpu`], then
//! [`start_current_cpu`], which never returns.

use core::alloc::Layout;
use core::arch::{asm, global_asm};
use core::ptr;

use aarch64_cpu::asm::barrier;
use aarch64_cpu::registers::*;
use axerrno::AxResult;
use spin::Once;
use tock_registers::interfaces::{Readable, Writeable};

use crate::exit::TrapExit;
use crate::hal::{HypHal, SysReg, TranslationStage};
use crate::hypervisor::{HypConfig, Hypervisor};
use crate::{FpRegisters, PAGE_SIZE, TrapFrame};

#[percpu::def_percpu]
static ORI_EXCEPTION_VECTOR_BASE: usize = 0;

static HYPERVISOR: Once<Hypervisor<Aarch64Hal>> = Once::new();

unsafe extern "C" {
    fn vmm_exception_vector();
    fn vmm_enter() -> !;
}

macro_rules! sysregs {
    (rw: { $($rw:ident => $rw_name:ident),* $(,)? } ro: { $($ro:ident => $ro_name:ident),* $(,)? }) => {
        fn read_sysreg(reg: SysReg) -> u64 {
            let value: u64;
            match reg {
                $(SysReg::$rw => unsafe {
                    asm!(concat!("mrs {}, ", stringify!($rw_name)), out(reg) value, options(nomem, nostack))
                },)*
                $(SysReg::$ro => unsafe {
                    asm!(concat!("mrs {}, ", stringify!($ro_name)), out(reg) value, options(nomem, nostack))
                },)*
            }
            value
        }

        fn write_sysreg(reg: SysReg, value: u64) {
            match reg {
                $(SysReg::$rw => unsafe {
                    asm!(concat!("msr ", stringify!($rw_name), ", {}"), in(reg) value, options(nostack))
                },)*
                $(SysReg::$ro => panic!("{:?} is read-only", reg),)*
            }
        }
    };
}

sysregs! {
    rw: {
        EsrEl2 => esr_el2,
        FarEl2 => far_el2,
        HpfarEl2 => hpfar_el2,
        HcrEl2 => hcr_el2,
        VtcrEl2 => vtcr_el2,
        VttbrEl2 => vttbr_el2,
        ParEl1 => par_el1,
        CntfrqEl0 => cntfrq_el0,
        CnthpCtlEl2 => cnthp_ctl_el2,
        CnthpCvalEl2 => cnthp_cval_el2,
        CnthpTvalEl2 => cnthp_tval_el2,
        PmcrEl0 => pmcr_el0,
        PmcntensetEl0 => pmcntenset_el0,
        PmcntenclrEl0 => pmcntenclr_el0,
        PmccntrEl0 => pmccntr_el0,
        SpEl0 => sp_el0,
        SpEl1 => sp_el1,
        ElrEl1 => elr_el1,
        SpsrEl1 => spsr_el1,
        VbarEl1 => vbar_el1,
        EsrEl1 => esr_el1,
        FarEl1 => far_el1,
        SctlrEl1 => sctlr_el1,
        TcrEl1 => tcr_el1,
        Ttbr0El1 => ttbr0_el1,
        Ttbr1El1 => ttbr1_el1,
        MairEl1 => mair_el1,
        CpacrEl1 => cpacr_el1,
        ContextidrEl1 => contextidr_el1,
        TpidrEl0 => tpidr_el0,
        TpidrEl1 => tpidr_el1,
        TpidrroEl0 => tpidrro_el0,
        CntkctlEl1 => cntkctl_el1,
        CntvCtlEl0 => cntv_ctl_el0,
        CntvCvalEl0 => cntv_cval_el0,
        CntvoffEl2 => cntvoff_el2,
        CntpCtlEl0 => cntp_ctl_el0,
        CntpCvalEl0 => cntp_cval_el0,
        VpidrEl2 => vpidr_el2,
        VmpidrEl2 => vmpidr_el2,
    }
    ro: {
        CntvctEl0 => cntvct_el0,
    }
}

/// [`HypHal`] backed by the executing core.
pub struct Aarch64Hal;

impl HypHal for Aarch64Hal {
    fn cpu_id(&self) -> usize {
        (MPIDR_EL1.get() & 0xff) as usize
    }

    fn read_sysreg(&self, reg: SysReg) -> u64 {
        read_sysreg(reg)
    }

    fn write_sysreg(&self, reg: SysReg, value: u64) {
        write_sysreg(reg, value);
        barrier::isb(barrier::SY);
    }

    fn irq_save(&self) -> u64 {
        let flags = DAIF.get();
        // SAFETY: masking exceptions on the local core has no memory effects.
        unsafe { asm!("msr daifset, #0xf", options(nomem, nostack)) };
        flags
    }

    fn irq_restore(&self, flags: u64) {
        DAIF.set(flags);
    }

    fn flush_guest_tlb(&self) {
        // SAFETY: TLB maintenance for the current VMID only.
        unsafe {
            asm!(
                "dsb ishst",
                "tlbi vmalls12e1is",
                "dsb ish",
                "isb",
                options(nostack, preserves_flags)
            );
        }
    }

    fn address_translate(&self, va: u64, stage: TranslationStage) {
        // SAFETY: `AT` only updates PAR_EL1.
        unsafe {
            match stage {
                TranslationStage::Stage1El1 => asm!("at s1e1r, {}", in(reg) va, options(nostack)),
                TranslationStage::Stage12El1 => {
                    asm!("at s12e1r, {}", in(reg) va, options(nostack))
                }
            }
        }
        barrier::isb(barrier::SY);
    }

    fn read_phys_u32(&self, pa: u64) -> u32 {
        // SAFETY: physical memory is identity mapped.
        unsafe { ptr::read_unaligned(pa as *const u32) }
    }

    fn read_phys(&self, pa: u64, buf: &mut [u8]) {
        // SAFETY: physical memory is identity mapped.
        unsafe { ptr::copy_nonoverlapping(pa as *const u8, buf.as_mut_ptr(), buf.len()) }
    }

    fn write_phys(&self, pa: u64, data: &[u8]) {
        // SAFETY: physical memory is identity mapped and `pa` was handed out
        // by `alloc_phys`.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), pa as *mut u8, data.len()) }
    }

    fn alloc_phys(&self, size: usize) -> Option<u64> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        // SAFETY: the layout has a non-zero size for every memory region.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        (!ptr.is_null()).then_some(ptr as u64)
    }

    fn free_phys(&self, pa: u64, size: usize) {
        let Ok(layout) = Layout::from_size_align(size, PAGE_SIZE) else {
            return;
        };
        // SAFETY: `pa` came from `alloc_phys` with this very layout.
        unsafe { alloc::alloc::dealloc(pa as *mut u8, layout) }
    }

    fn virt_to_phys(&self, vaddr: usize) -> u64 {
        vaddr as u64
    }

    fn mmio_read32(&self, pa: u64) -> u32 {
        // SAFETY: peripherals are identity mapped as device memory.
        unsafe { ptr::read_volatile(pa as *const u32) }
    }

    fn mmio_write32(&self, pa: u64, value: u32) {
        // SAFETY: peripherals are identity mapped as device memory.
        unsafe { ptr::write_volatile(pa as *mut u32, value) }
    }

    fn save_fp(&self, fp: &mut FpRegisters) {
        let (fpcr, fpsr): (u64, u64);
        // SAFETY: `fp.q` holds the 32 128-bit registers.
        unsafe {
            asm!(
                ".arch_extension fp",
                ".arch_extension simd",
                "stp q0, q1, [{0}, #0x000]",
                "stp q2, q3, [{0}, #0x020]",
                "stp q4, q5, [{0}, #0x040]",
                "stp q6, q7, [{0}, #0x060]",
                "stp q8, q9, [{0}, #0x080]",
                "stp q10, q11, [{0}, #0x0a0]",
                "stp q12, q13, [{0}, #0x0c0]",
                "stp q14, q15, [{0}, #0x0e0]",
                "stp q16, q17, [{0}, #0x100]",
                "stp q18, q19, [{0}, #0x120]",
                "stp q20, q21, [{0}, #0x140]",
                "stp q22, q23, [{0}, #0x160]",
                "stp q24, q25, [{0}, #0x180]",
                "stp q26, q27, [{0}, #0x1a0]",
                "stp q28, q29, [{0}, #0x1c0]",
                "stp q30, q31, [{0}, #0x1e0]",
                "mrs {1}, fpcr",
                "mrs {2}, fpsr",
                in(reg) fp.q.as_mut_ptr(),
                out(reg) fpcr,
                out(reg) fpsr,
                options(nostack)
            );
        }
        fp.fpcr = fpcr;
        fp.fpsr = fpsr;
    }

    fn restore_fp(&self, fp: &FpRegisters) {
        // SAFETY: `fp.q` holds the 32 128-bit registers.
        unsafe {
            asm!(
                ".arch_extension fp",
                ".arch_extension simd",
                "ldp q0, q1, [{0}, #0x000]",
                "ldp q2, q3, [{0}, #0x020]",
                "ldp q4, q5, [{0}, #0x040]",
                "ldp q6, q7, [{0}, #0x060]",
                "ldp q8, q9, [{0}, #0x080]",
                "ldp q10, q11, [{0}, #0x0a0]",
                "ldp q12, q13, [{0}, #0x0c0]",
                "ldp q14, q15, [{0}, #0x0e0]",
                "ldp q16, q17, [{0}, #0x100]",
                "ldp q18, q19, [{0}, #0x120]",
                "ldp q20, q21, [{0}, #0x140]",
                "ldp q22, q23, [{0}, #0x160]",
                "ldp q24, q25, [{0}, #0x180]",
                "ldp q26, q27, [{0}, #0x1a0]",
                "ldp q28, q29, [{0}, #0x1c0]",
                "ldp q30, q31, [{0}, #0x1e0]",
                "msr fpcr, {1}",
                "msr fpsr, {2}",
                in(reg) fp.q.as_ptr(),
                in(reg) fp.fpcr,
                in(reg) fp.fpsr,
                options(nostack)
            );
        }
    }
}

/// Creates the global hypervisor. Runs once, on the primary core.
pub fn init_hypervisor(config: HypConfig) -> AxResult<&'static Hypervisor<Aarch64Hal>> {
    HYPERVISOR.try_call_once(|| Hypervisor::new(Aarch64Hal, config))
}

pub fn hypervisor() -> &'static Hypervisor<Aarch64Hal> {
    match HYPERVISOR.get() {
        Some(hv) => hv,
        None => panic!("hypervisor is not initialized"),
    }
}

/// Installs the exception vectors and prepares the calling core.
pub fn init_current_cpu() {
    // SAFETY: called once per core before guests run, with preemption off.
    unsafe { ORI_EXCEPTION_VECTOR_BASE.write_current_raw(VBAR_EL2.get() as usize) }
    VBAR_EL2.set(vmm_exception_vector as usize as _);
    hypervisor().init_current_cpu();
}

/// Puts back the exception vectors that were installed before
/// [`init_current_cpu`] and turns stage-2 translation off.
pub fn disable_current_cpu() {
    // SAFETY: see `init_current_cpu`.
    VBAR_EL2.set(unsafe { ORI_EXCEPTION_VECTOR_BASE.read_current_raw() } as _);
    HCR_EL2.set(0);
    barrier::isb(barrier::SY);
}

/// Hands the calling core over to guest scheduling.
pub fn start_current_cpu() -> ! {
    // SAFETY: the vectors and the core state are set up by `init_current_cpu`.
    unsafe { vmm_enter() }
}

#[unsafe(no_mangle)]
extern "C" fn vmm_start_cpu(frame: &mut TrapFrame) -> TrapExit {
    hypervisor().start_cpu(frame)
}

#[unsafe(no_mangle)]
extern "C" fn vmm_handle_guest_sync(frame: &mut TrapFrame) -> TrapExit {
    hypervisor().handle_sync_trap(frame)
}

#[unsafe(no_mangle)]
extern "C" fn vmm_handle_irq(frame: &mut TrapFrame) -> TrapExit {
    hypervisor().handle_irq(frame)
}

#[unsafe(no_mangle)]
extern "C" fn vmm_handle_current_el_sync(frame: &mut TrapFrame) -> ! {
    hypervisor().handle_current_el_sync(frame)
}

#[unsafe(no_mangle)]
extern "C" fn vmm_invalid_exception(frame: &mut TrapFrame, kind: u64) -> ! {
    panic!(
        "cpu {}: unexpected exception kind {}, esr {:#x}\n{}",
        Aarch64Hal.cpu_id(),
        kind,
        ESR_EL2.get(),
        frame
    );
}

global_asm!(
    r#"
.equ FRAME_SIZE, 34 * 8

.macro SAVE_FRAME
    sub     sp, sp, #FRAME_SIZE
    stp     x0, x1, [sp, #0 * 8]
    stp     x2, x3, [sp, #2 * 8]
    stp     x4, x5, [sp, #4 * 8]
    stp     x6, x7, [sp, #6 * 8]
    stp     x8, x9, [sp, #8 * 8]
    stp     x10, x11, [sp, #10 * 8]
    stp     x12, x13, [sp, #12 * 8]
    stp     x14, x15, [sp, #14 * 8]
    stp     x16, x17, [sp, #16 * 8]
    stp     x18, x19, [sp, #18 * 8]
    stp     x20, x21, [sp, #20 * 8]
    stp     x22, x23, [sp, #22 * 8]
    stp     x24, x25, [sp, #24 * 8]
    stp     x26, x27, [sp, #26 * 8]
    stp     x28, x29, [sp, #28 * 8]
    mrs     x9, elr_el2
    mrs     x10, spsr_el2
    stp     x30, x9, [sp, #30 * 8]
    str     x10, [sp, #32 * 8]
.endm

.macro RESTORE_FRAME
    ldr     x10, [sp, #32 * 8]
    ldp     x30, x9, [sp, #30 * 8]
    msr     elr_el2, x9
    msr     spsr_el2, x10
    ldp     x28, x29, [sp, #28 * 8]
    ldp     x26, x27, [sp, #26 * 8]
    ldp     x24, x25, [sp, #24 * 8]
    ldp     x22, x23, [sp, #22 * 8]
    ldp     x20, x21, [sp, #20 * 8]
    ldp     x18, x19, [sp, #18 * 8]
    ldp     x16, x17, [sp, #16 * 8]
    ldp     x14, x15, [sp, #14 * 8]
    ldp     x12, x13, [sp, #12 * 8]
    ldp     x10, x11, [sp, #10 * 8]
    ldp     x8, x9, [sp, #8 * 8]
    ldp     x6, x7, [sp, #6 * 8]
    ldp     x4, x5, [sp, #4 * 8]
    ldp     x2, x3, [sp, #2 * 8]
    ldp     x0, x1, [sp, #0 * 8]
    add     sp, sp, #FRAME_SIZE
.endm

.macro VECTOR target
.balign 0x80
    b       \target
.endm

.macro INVALID kind
.balign 0x80
    SAVE_FRAME
    mov     x0, sp
    mov     x1, #\kind
    bl      vmm_invalid_exception
.endm

.section .text
.balign 0x800
.global vmm_exception_vector
vmm_exception_vector:
    // current EL, SP_EL0
    INVALID 0
    INVALID 1
    INVALID 2
    INVALID 3
    // current EL, SP_ELx
    VECTOR  vmm_current_el_sync
    VECTOR  vmm_irq
    INVALID 6
    INVALID 7
    // lower EL, AArch64
    VECTOR  vmm_guest_sync
    VECTOR  vmm_irq
    INVALID 10
    INVALID 11
    // lower EL, AArch32
    INVALID 12
    INVALID 13
    INVALID 14
    INVALID 15

vmm_current_el_sync:
    SAVE_FRAME
    mov     x0, sp
    bl      vmm_handle_current_el_sync

vmm_guest_sync:
    SAVE_FRAME
    mov     x0, sp
    bl      vmm_handle_guest_sync
    b       vmm_exit

vmm_irq:
    SAVE_FRAME
    mov     x0, sp
    bl      vmm_handle_irq
    b       vmm_exit

.global vmm_enter
vmm_enter:
    sub     sp, sp, #FRAME_SIZE
    mov     x0, sp
    bl      vmm_start_cpu

// x0: TrapExit
vmm_exit:
    cbnz    x0, vmm_idle
    RESTORE_FRAME
    eret

vmm_idle:
    add     sp, sp, #FRAME_SIZE
    msr     daifclr, #2
1:  wfi
    b       1b
"#
);
