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

/// What the exception vector must do after a trap has been handled.
///
/// Every entry point of [`Hypervisor`](crate::Hypervisor) that consumes a
/// [`TrapFrame`](crate::TrapFrame) returns one of these. The frame itself has
/// already been rewritten when a guest is to be resumed.
///
/// # Resuming
///
/// On [`TrapExit::Resume`] the frame holds the general purpose registers,
/// `ELR_EL2` and `SPSR_EL2` of the vCPU chosen by the scheduler, and the
/// remaining guest state (stage-2 root, EL1 system registers, SIMD&FP bank,
/// virtual interrupt lines) is already live in hardware. The vector restores
/// the frame and executes `eret`.
///
/// # Idling
///
/// On [`TrapExit::Idle`] no vCPU is runnable on this core. The vector must
/// unmask IRQs and wait (`wfe`/`wfi`) for the next interrupt, which will be
/// delivered to [`Hypervisor::handle_irq`](crate::Hypervisor::handle_irq).
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapExit {
    /// Return to the guest described by the trap frame.
    Resume = 0,
    /// Nothing to run on this core.
    Idle = 1,
}

/// Classified cause of a synchronous trap from a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GuestTrap {
    /// `HVC`, either trapped explicitly or decoded from the faulting instruction.
    Hypercall {
        /// The 16-bit hypercall type.
        imm: u16,
        /// Address of the instruction after the hypercall.
        next_pc: u64,
    },
    /// `WFI` or `WFE` with trapping enabled.
    WaitForInterrupt,
    /// Stage-2 data abort, usually an access to an emulated device.
    DataAbort {
        is_write: bool,
        far_invalid: bool,
        ipa: u64,
        fault_status: u8,
    },
    /// Something the guest can observe as an SError and handle itself.
    Recoverable { class: u8 },
    /// A trap the hypervisor cannot service.
    Fatal { class: u8, reason: &'static str },
}
