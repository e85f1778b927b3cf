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

use core::fmt;

use tock_registers::LocalRegisterCopy;

use crate::hal::{HypHal, SysReg};
use crate::regs::SPSR;

/// General purpose registers and exception return state of a trapped guest.
///
/// The exception vectors fill this frame on entry and load it back before
/// `eret`, so `elr` and `spsr` are the guest's PC and PSTATE.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Aarch64ContextFrame {
    pub gpr: [u64; 31],
    pub elr: u64,
    pub spsr: u64,
}

impl fmt::Display for Aarch64ContextFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..31 {
            write!(f, "x{:02}: {:016x}   ", i, self.gpr[i])?;
            if (i + 1) % 2 == 0 {
                writeln!(f)?;
            }
        }
        writeln!(f, "spsr:{:016x}", self.spsr)?;
        write!(f, "elr: {:016x}", self.elr)?;
        Ok(())
    }
}

impl Default for Aarch64ContextFrame {
    /// EL1h with D, A, I and F masked.
    fn default() -> Self {
        let spsr = SPSR::M::EL1h + SPSR::D::SET + SPSR::A::SET + SPSR::I::SET + SPSR::F::SET;
        Self {
            gpr: [0; 31],
            elr: 0,
            spsr: spsr.value,
        }
    }
}

impl Aarch64ContextFrame {
    pub fn exception_pc(&self) -> u64 {
        self.elr
    }

    pub fn set_exception_pc(&mut self, pc: u64) {
        self.elr = pc;
    }

    pub fn set_argument(&mut self, arg: u64) {
        self.gpr[0] = arg;
    }

    /// Writes `Xn`; index 31 is the zero register and discards the value.
    pub fn set_gpr(&mut self, index: usize, val: u64) {
        if index < 31 {
            self.gpr[index] = val;
        }
    }

    /// Reads `Xn`; index 31 reads as zero.
    pub fn gpr(&self, index: usize) -> u64 {
        if index < 31 { self.gpr[index] } else { 0 }
    }

    /// Exception level the guest was executing at when it trapped.
    pub fn exception_level(&self) -> u8 {
        let spsr = LocalRegisterCopy::<u64, SPSR::Register>::new(self.spsr);
        (spsr.read(SPSR::M) >> 2) as u8
    }
}

/// SIMD&FP register bank, saved and restored by the platform layer.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default)]
pub struct FpRegisters {
    pub q: [u128; 32],
    pub fpcr: u64,
    pub fpsr: u64,
}

macro_rules! guest_sysregs {
    ($($field:ident => $reg:ident),* $(,)?) => {
        /// EL1 system state owned by a guest vCPU.
        #[repr(C)]
        #[derive(Clone, Copy, Debug, Default)]
        pub struct GuestSystemRegisters {
            $(pub $field: u64,)*
        }

        impl GuestSystemRegisters {
            /// Captures the live guest registers.
            pub fn store(&mut self, hal: &dyn HypHal) {
                $(self.$field = hal.read_sysreg(SysReg::$reg);)*
            }

            /// Loads the saved guest registers into the hardware.
            pub fn restore(&self, hal: &dyn HypHal) {
                $(hal.write_sysreg(SysReg::$reg, self.$field);)*
            }
        }
    };
}

guest_sysregs! {
    sp_el0 => SpEl0,
    sp_el1 => SpEl1,
    elr_el1 => ElrEl1,
    spsr_el1 => SpsrEl1,
    vbar_el1 => VbarEl1,
    esr_el1 => EsrEl1,
    far_el1 => FarEl1,
    par_el1 => ParEl1,
    sctlr_el1 => SctlrEl1,
    tcr_el1 => TcrEl1,
    ttbr0_el1 => Ttbr0El1,
    ttbr1_el1 => Ttbr1El1,
    mair_el1 => MairEl1,
    cpacr_el1 => CpacrEl1,
    contextidr_el1 => ContextidrEl1,
    tpidr_el0 => TpidrEl0,
    tpidr_el1 => TpidrEl1,
    tpidrro_el0 => TpidrroEl0,
    cntkctl_el1 => CntkctlEl1,
    cntv_ctl_el0 => CntvCtlEl0,
    cntv_cval_el0 => CntvCvalEl0,
    cntvoff_el2 => CntvoffEl2,
    cntp_ctl_el0 => CntpCtlEl0,
    cntp_cval_el0 => CntpCvalEl0,
    vpidr_el2 => VpidrEl2,
    vmpidr_el2 => VmpidrEl2,
}
