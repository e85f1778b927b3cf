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

//! Synchronous traps taken from a guest.

use axerrno::{AxResult, ax_err};

use crate::TrapFrame;
use crate::exception_utils::{
    ExceptionClass, Syndrome, describe_fault_status, fault_ipa, insn_imm16, is_hvc_insn,
};
use crate::exit::GuestTrap;
use crate::hal::{HypHal, SysReg, TranslationStage};
use crate::hypercall;
use crate::security::{self, CfiOutcome, SecurityViolation};
use crate::stage2::translate_guest_va;
use crate::state::{Env, VmmState};
use crate::vcpu::VCpuId;
use crate::vdev::{AccessWidth, MmioContext};

const INSN_SIZE: u64 = 4;

const LDST_OPC_SHIFT: u32 = 22;
const LDST_OPC_MASK: u32 = 0xFF;
const STR_IMM_UNSCALED: u32 = 0b1110_0000;
const STR_IMM_UNSIGNED: u32 = 0b1110_0100;
const LDR_IMM_UNSCALED: u32 = 0b1110_0001;
const LDR_IMM_UNSIGNED: u32 = 0b1110_0101;

/// Single register load or store that faulted on an emulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MmioInsn {
    rt: usize,
    width: AccessWidth,
    is_store: bool,
}

impl MmioInsn {
    fn decode(insn: u32) -> AxResult<Self> {
        let is_store = match (insn >> LDST_OPC_SHIFT) & LDST_OPC_MASK {
            STR_IMM_UNSCALED | STR_IMM_UNSIGNED => true,
            LDR_IMM_UNSCALED | LDR_IMM_UNSIGNED => false,
            _ => return ax_err!(Unsupported, "not a single register load/store"),
        };
        Ok(Self {
            rt: (insn & 0x1F) as usize,
            width: AccessWidth::from_size_field(insn >> 30),
            is_store,
        })
    }
}

/// Sorts a guest trap by what the hypervisor has to do about it.
pub(crate) fn classify(hal: &dyn HypHal, syndrome: Syndrome, ctx: &TrapFrame) -> GuestTrap {
    let class = syndrome.class_value();
    let pc = ctx.exception_pc();
    let Some(ec) = syndrome.class() else {
        return GuestTrap::Recoverable { class };
    };
    match ec {
        ExceptionClass::Unknown => {
            // HVC issued at EL0
            let at = translate_guest_va(hal, pc, TranslationStage::Stage12El1);
            if !at.is_fault() {
                let insn = hal.read_phys_u32(at.addr());
                if is_hvc_insn(insn) {
                    return GuestTrap::Hypercall {
                        imm: insn_imm16(insn),
                        next_pc: pc + INSN_SIZE,
                    };
                }
            }
            GuestTrap::Recoverable { class }
        }
        ExceptionClass::Hvc64 => GuestTrap::Hypercall {
            imm: syndrome.hvc_imm(),
            next_pc: pc,
        },
        ExceptionClass::TrappedWfx => GuestTrap::WaitForInterrupt,
        ExceptionClass::DataAbortLowerEl => GuestTrap::DataAbort {
            is_write: syndrome.dabt_is_write(),
            far_invalid: syndrome.dabt_far_invalid(),
            ipa: fault_ipa(
                hal.read_sysreg(SysReg::HpfarEl2),
                hal.read_sysreg(SysReg::FarEl2),
            ),
            fault_status: syndrome.fault_status(),
        },
        ExceptionClass::InstrAbortLowerEl => GuestTrap::Fatal {
            class,
            reason: "instruction abort",
        },
        ExceptionClass::PcAlignment => GuestTrap::Fatal {
            class,
            reason: "pc alignment fault",
        },
        ExceptionClass::IllegalExecutionState => GuestTrap::Fatal {
            class,
            reason: "illegal execution state",
        },
        ExceptionClass::TrappedCp15McrMrc
        | ExceptionClass::TrappedCp15McrrMrrc
        | ExceptionClass::TrappedCp14McrMrc
        | ExceptionClass::TrappedCp14LdcStc
        | ExceptionClass::TrappedCp14Mrrc
        | ExceptionClass::TrappedVmrs
        | ExceptionClass::Svc32
        | ExceptionClass::Hvc32
        | ExceptionClass::Smc32
        | ExceptionClass::FpException32
        | ExceptionClass::Bkpt32
        | ExceptionClass::VectorCatch32 => GuestTrap::Fatal {
            class,
            reason: "AArch32 guests are not supported",
        },
        _ => GuestTrap::Recoverable { class },
    }
}

/// Handles a synchronous trap of `id`, whose registers are already saved.
pub(crate) fn handle_guest_trap(state: &mut VmmState, env: Env<'_>, id: VCpuId) {
    let hal = env.hal;
    let syndrome = Syndrome::new(hal.read_sysreg(SysReg::EsrEl2));
    let trap = classify(hal, syndrome, &state.vcpus[id.0].ctx);
    trace!("{}: {:?} {:?}", id, syndrome, trap);

    match trap {
        GuestTrap::Hypercall { imm, next_pc } => handle_hypercall(state, env, id, imm, next_pc),
        GuestTrap::WaitForInterrupt => {
            let ctx = &mut state.vcpus[id.0].ctx;
            ctx.set_exception_pc(ctx.exception_pc() + INSN_SIZE);
            state.sleep(env, id);
        }
        GuestTrap::DataAbort {
            far_invalid: true, ..
        } => {
            warn!("{}: data abort without a valid fault address", id);
            state.do_vserror(env, id);
        }
        GuestTrap::DataAbort {
            is_write,
            ipa,
            fault_status,
            ..
        } => match emulate_mmio(state, env, id, ipa) {
            Ok(()) => {
                let ctx = &mut state.vcpus[id.0].ctx;
                ctx.set_exception_pc(ctx.exception_pc() + INSN_SIZE);
            }
            Err(err) => {
                warn!(
                    "{}: {} {} at ipa {:#x} could not be emulated: {:?}",
                    id,
                    describe_fault_status(fault_status),
                    if is_write { "on write" } else { "on read" },
                    ipa,
                    err
                );
                state.do_vserror(env, id);
            }
        },
        GuestTrap::Recoverable { class } => {
            warn!(
                "{}: unhandled exception class {:#x} at pc {:#x}",
                id,
                class,
                state.vcpus[id.0].ctx.exception_pc()
            );
            state.do_vserror(env, id);
        }
        GuestTrap::Fatal { class, reason } => {
            let vcpu = &state.vcpus[id.0];
            panic!(
                "{} of vm {}: {} (EC {:#x}), esr {:#x}, far {:#x}, ctx: {}",
                id,
                vcpu.vm(),
                reason,
                class,
                syndrome.raw(),
                hal.read_sysreg(SysReg::FarEl2),
                vcpu.ctx
            );
        }
    }
}

fn handle_hypercall(state: &mut VmmState, env: Env<'_>, id: VCpuId, imm: u16, next_pc: u64) {
    let cfi = state.vms[state.vcpus[id.0].vm().0].cfi_enabled();
    let vcpu = &mut state.vcpus[id.0];
    vcpu.ctx.set_exception_pc(next_pc);
    if cfi && vcpu.security.error.is_none() {
        match security::check_hypercall(env.hal, &mut vcpu.ctx, &mut vcpu.security, imm, next_pc) {
            CfiOutcome::Handled => return,
            CfiOutcome::Violation => {
                report_violation(state, env, id);
                return;
            }
            CfiOutcome::Pass => {}
        }
    }
    hypercall::dispatch(state, env, id, imm);
}

fn report_violation(state: &mut VmmState, env: Env<'_>, id: VCpuId) {
    let vcpu = &mut state.vcpus[id.0];
    let Some(violation) = vcpu.security.error.take() else {
        return;
    };
    let el = vcpu.ctx.exception_level();
    let vm = vcpu.vm();
    error!(
        "{} of vm {}: {} at EL{}, pc {:#x}",
        id,
        vm,
        violation.describe(),
        el,
        vcpu.ctx.exception_pc()
    );
    if violation == SecurityViolation::Rop && el == 0 {
        state.do_vserror(env, id);
    } else {
        state.force_shutdown(env, vm);
    }
}

/// Replays the faulting load/store of `id` against the device bus.
fn emulate_mmio(state: &mut VmmState, env: Env<'_>, id: VCpuId, ipa: u64) -> AxResult {
    let hal = env.hal;
    let pc = state.vcpus[id.0].ctx.exception_pc();
    let at = translate_guest_va(hal, pc, TranslationStage::Stage12El1);
    if at.is_fault() {
        return ax_err!(BadAddress, "faulting instruction is not mapped");
    }
    let insn = MmioInsn::decode(hal.read_phys_u32(at.addr()))?;

    let mut cx = MmioContext {
        state,
        env,
        vcpu: id,
    };
    if insn.is_store {
        let value = cx.current().ctx.gpr(insn.rt) as u32;
        env.bus.write(&mut cx, ipa, value, insn.width)
    } else {
        let value = env.bus.read(&mut cx, ipa, insn.width)?;
        cx.current_mut().ctx.set_gpr(insn.rt, value as u64);
        Ok(())
    }
}
