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

use numeric_enum_macro::numeric_enum;
use tock_registers::LocalRegisterCopy;

use crate::regs::{DABT_ISS, ESR};

numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ExceptionClass {
        Unknown = 0x00,
        TrappedWfx = 0x01,
        TrappedCp15McrMrc = 0x03,
        TrappedCp15McrrMrrc = 0x04,
        TrappedCp14McrMrc = 0x05,
        TrappedCp14LdcStc = 0x06,
        TrappedFpSimd = 0x07,
        TrappedVmrs = 0x08,
        TrappedCp14Mrrc = 0x0C,
        IllegalExecutionState = 0x0E,
        Svc32 = 0x11,
        Hvc32 = 0x12,
        Smc32 = 0x13,
        Svc64 = 0x15,
        Hvc64 = 0x16,
        Smc64 = 0x17,
        TrappedMsrMrs = 0x18,
        InstrAbortLowerEl = 0x20,
        InstrAbortCurrentEl = 0x21,
        PcAlignment = 0x22,
        DataAbortLowerEl = 0x24,
        DataAbortCurrentEl = 0x25,
        SpAlignment = 0x26,
        FpException32 = 0x28,
        FpException64 = 0x2C,
        SError = 0x2F,
        BreakpointLowerEl = 0x30,
        BreakpointCurrentEl = 0x31,
        SoftwareStepLowerEl = 0x32,
        SoftwareStepCurrentEl = 0x33,
        WatchpointLowerEl = 0x34,
        WatchpointCurrentEl = 0x35,
        Bkpt32 = 0x38,
        VectorCatch32 = 0x3A,
        Brk64 = 0x3C,
    }
}

/// A decoded `ESR_EL2` value.
#[derive(Clone, Copy)]
pub struct Syndrome(LocalRegisterCopy<u64, ESR::Register>);

impl Syndrome {
    pub fn new(esr: u64) -> Self {
        Self(LocalRegisterCopy::new(esr))
    }

    pub fn raw(&self) -> u64 {
        self.0.get()
    }

    pub fn class_value(&self) -> u8 {
        self.0.read(ESR::EC) as u8
    }

    pub fn class(&self) -> Option<ExceptionClass> {
        ExceptionClass::try_from(self.class_value()).ok()
    }

    pub fn iss(&self) -> u32 {
        self.0.read(ESR::ISS) as u32
    }

    /// Immediate of a trapped `HVC`.
    pub fn hvc_imm(&self) -> u16 {
        (self.iss() & 0xffff) as u16
    }

    /// Data abort was caused by a write.
    pub fn dabt_is_write(&self) -> bool {
        dabt_iss(self.iss()).is_set(DABT_ISS::WNR)
    }

    /// `FAR_EL2` does not hold a valid address for this data abort.
    pub fn dabt_far_invalid(&self) -> bool {
        dabt_iss(self.iss()).is_set(DABT_ISS::FNV)
    }

    pub fn fault_status(&self) -> u8 {
        dabt_iss(self.iss()).read(DABT_ISS::DFSC) as u8
    }
}

impl core::fmt::Debug for Syndrome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Syndrome(EC={:#x}, ISS={:#x})", self.class_value(), self.iss())
    }
}

fn dabt_iss(iss: u32) -> LocalRegisterCopy<u64, DABT_ISS::Register> {
    LocalRegisterCopy::new(iss as u64)
}

/// Faulting IPA of a stage-2 abort from `HPFAR_EL2` and the page offset in `FAR_EL2`.
pub fn fault_ipa(hpfar: u64, far: u64) -> u64 {
    ((hpfar >> 4) << 12) | (far & 0xfff)
}

/// Human readable fault status of an instruction or data abort.
pub fn describe_fault_status(status: u8) -> &'static str {
    match status & 0b11_1100 {
        0b00_0000 => "address size fault",
        0b00_0100 => "translation fault",
        0b00_1000 => "access flag fault",
        0b00_1100 => "permission fault",
        0b01_0000 => "synchronous external abort",
        0b01_0100 => "synchronous external abort on table walk",
        0b01_1000 => "synchronous parity or ECC error",
        0b01_1100 => "synchronous parity or ECC error on table walk",
        0b10_0000 => "alignment fault",
        0b11_0000 => "TLB conflict abort",
        _ => "unknown fault",
    }
}

/// `HVC #imm16` encoding.
pub fn is_hvc_insn(insn: u32) -> bool {
    insn & 0xFFE0_001F == 0xD400_0002
}

/// Immediate field of an `HVC`/`SVC`/`SMC` encoding.
pub fn insn_imm16(insn: u32) -> u16 {
    ((insn >> 5) & 0xffff) as u16
}

/// `BL <label>`.
pub fn is_bl_insn(insn: u32) -> bool {
    insn >> 26 == 0b10_0101
}

/// `BLR Xn`.
pub fn is_blr_insn(insn: u32) -> bool {
    insn & 0xFFFF_FC1F == 0xD63F_0000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_decoding() {
        let esr = (0x24u64 << 26) | (1 << 25) | (1 << 6);
        let syndrome = Syndrome::new(esr);
        assert_eq!(syndrome.class(), Some(ExceptionClass::DataAbortLowerEl));
        assert!(syndrome.dabt_is_write());
        assert!(!syndrome.dabt_far_invalid());

        assert_eq!(Syndrome::new(0x3f << 26).class(), None);
    }

    #[test]
    fn test_branch_with_link_encodings() {
        // bl #0x40
        assert!(is_bl_insn(0x9400_0010));
        // blr x8
        assert!(is_blr_insn(0xD63F_0100));
        // br x8 and ret are not calls
        assert!(!is_blr_insn(0xD61F_0100));
        assert!(!is_blr_insn(0xD65F_03C0));
        // nop
        assert!(!is_bl_insn(0xD503_201F));
    }

    #[test]
    fn test_hvc_immediate() {
        // hvc #0x1000
        let insn = 0xD400_0002 | (0x1000 << 5);
        assert!(is_hvc_insn(insn));
        assert_eq!(insn_imm16(insn), 0x1000);
        // svc #0
        assert!(!is_hvc_insn(0xD400_0001));
    }

    #[test]
    fn test_fault_ipa() {
        assert_eq!(fault_ipa(0x3F200 << 4, 0xFFFF_0000_0000_001C), 0x3F20_001C);
    }
}
