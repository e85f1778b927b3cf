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

//! Control-flow integrity checks carried by reserved hypercalls.
//!
//! An instrumented guest replaces every `ret` with `hvc #0x1000` and every
//! `blr xN` with `hvc #(0x1100 | N)`. The hypervisor verifies that returns
//! land right after a call instruction and performs the indirect calls
//! itself.

use crate::TrapFrame;
use crate::exception_utils::{is_bl_insn, is_blr_insn};
use crate::hal::{HypHal, TranslationStage};
use crate::stage2::translate_guest_va;

/// `VmConfig::security_options` bit enabling the CFI hypercalls.
pub const SECURITY_CFI: u64 = 1 << 0;

const CFI_RET_BASE: u16 = 0x1000;
const CFI_CALL_BASE: u16 = 0x1100;
const CFI_CLASS_MASK: u16 = 0xFFE0;
const CFI_REG_MASK: u16 = 0x1F;
const LINK_REGISTER: usize = 30;

/// A control-flow violation detected in a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityViolation {
    /// A return whose link register does not follow a call.
    Rop,
    /// An emulated call naming the zero register.
    MalformedTarget,
}

impl SecurityViolation {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Rop => "a ROP attack is detected",
            Self::MalformedTarget => "malformed security hypercall target",
        }
    }
}

/// Per-vCPU CFI bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecurityState {
    /// Violation waiting to be reported.
    pub error: Option<SecurityViolation>,
    pub ret_count: u64,
    pub call_count: u64,
}

impl SecurityState {
    pub fn reset_counters(&mut self) {
        self.ret_count = 0;
        self.call_count = 0;
    }
}

/// Whether a hypercall was consumed by the CFI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CfiOutcome {
    /// Not a CFI hypercall; dispatch it normally.
    Pass,
    /// Verified and emulated; the frame points at the new PC.
    Handled,
    /// Rejected; `SecurityState::error` is set.
    Violation,
}

/// Runs the CFI check for hypercall `imm` trapped from `frame`.
pub(crate) fn check_hypercall(
    hal: &dyn HypHal,
    frame: &mut TrapFrame,
    security: &mut SecurityState,
    imm: u16,
    next_pc: u64,
) -> CfiOutcome {
    match imm & CFI_CLASS_MASK {
        CFI_RET_BASE => {
            let lr = frame.gpr(LINK_REGISTER);
            let caller = translate_guest_va(hal, lr.wrapping_sub(4), TranslationStage::Stage12El1);
            let insn = (!caller.is_fault()).then(|| hal.read_phys_u32(caller.addr()));
            match insn {
                Some(insn) if is_bl_insn(insn) || is_blr_insn(insn) => {
                    frame.set_exception_pc(lr);
                    security.ret_count += 1;
                    CfiOutcome::Handled
                }
                _ => {
                    error!(
                        "caller {:#x} (par {:#x}) is not a call instruction: {:x?}",
                        lr.wrapping_sub(4),
                        caller.raw(),
                        insn
                    );
                    security.error = Some(SecurityViolation::Rop);
                    frame.set_exception_pc(next_pc);
                    CfiOutcome::Violation
                }
            }
        }
        CFI_CALL_BASE => {
            let reg = (imm & CFI_REG_MASK) as usize;
            if reg == 31 {
                security.error = Some(SecurityViolation::MalformedTarget);
                frame.set_exception_pc(next_pc);
                return CfiOutcome::Violation;
            }
            let target = frame.gpr(reg);
            frame.set_gpr(LINK_REGISTER, next_pc);
            frame.set_exception_pc(target);
            security.call_count += 1;
            trace!("emulated blr x{}: pc {:#x}, lr {:#x}", reg, target, next_pc);
            CfiOutcome::Handled
        }
        _ => CfiOutcome::Pass,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHal;

    const CODE_VA: u64 = 0xffff_0000_0008_0000;
    const CODE_PA: u64 = 0x2008_0000;

    fn hal_with_code(caller: u32) -> MockHal {
        let hal = MockHal::new();
        hal.map_guest_va(CODE_VA, CODE_PA);
        hal.write_phys_u32(CODE_PA + 0x10, caller);
        hal
    }

    #[test]
    fn test_return_after_bl_is_accepted() {
        // bl <fn>
        let hal = hal_with_code(0x9400_0040);
        let mut frame = TrapFrame::default();
        frame.gpr[30] = CODE_VA + 0x14;
        let mut sec = SecurityState::default();
        let out = check_hypercall(&hal, &mut frame, &mut sec, 0x1000, 0x4000);
        assert_eq!(out, CfiOutcome::Handled);
        assert_eq!(frame.exception_pc(), CODE_VA + 0x14);
        assert_eq!(sec.ret_count, 1);
        assert_eq!(sec.error, None);
    }

    #[test]
    fn test_return_after_non_call_is_rop() {
        // add x0, x0, #1
        let hal = hal_with_code(0x9100_0400);
        let mut frame = TrapFrame::default();
        frame.gpr[30] = CODE_VA + 0x14;
        let mut sec = SecurityState::default();
        let out = check_hypercall(&hal, &mut frame, &mut sec, 0x1000, 0x4000);
        assert_eq!(out, CfiOutcome::Violation);
        assert_eq!(sec.error, Some(SecurityViolation::Rop));
        assert_eq!(frame.exception_pc(), 0x4000);
    }

    #[test]
    fn test_return_to_unmapped_address_is_rop() {
        let hal = MockHal::new();
        let mut frame = TrapFrame::default();
        frame.gpr[30] = 0xdead_0000;
        let mut sec = SecurityState::default();
        assert_eq!(
            check_hypercall(&hal, &mut frame, &mut sec, 0x1000, 0x4000),
            CfiOutcome::Violation
        );
    }

    #[test]
    fn test_call_emulates_blr() {
        let hal = MockHal::new();
        let mut frame = TrapFrame::default();
        frame.gpr[8] = 0x9_0000;
        let mut sec = SecurityState::default();
        let out = check_hypercall(&hal, &mut frame, &mut sec, 0x1108, 0x8_1004);
        assert_eq!(out, CfiOutcome::Handled);
        assert_eq!(frame.exception_pc(), 0x9_0000);
        assert_eq!(frame.gpr(30), 0x8_1004);
        assert_eq!(sec.call_count, 1);
    }

    #[test]
    fn test_call_through_zero_register_is_malformed() {
        let hal = MockHal::new();
        let mut frame = TrapFrame::default();
        let mut sec = SecurityState::default();
        let out = check_hypercall(&hal, &mut frame, &mut sec, 0x111F, 0x8_1004);
        assert_eq!(out, CfiOutcome::Violation);
        assert_eq!(sec.error, Some(SecurityViolation::MalformedTarget));
    }

    #[test]
    fn test_ordinary_hypercalls_pass() {
        let hal = MockHal::new();
        let mut frame = TrapFrame::default();
        let mut sec = SecurityState::default();
        for imm in [0, 1, 5, 0x0FFF, 0x1020, 0x1120] {
            assert_eq!(
                check_hypercall(&hal, &mut frame, &mut sec, imm, 0),
                CfiOutcome::Pass
            );
        }
    }
}
