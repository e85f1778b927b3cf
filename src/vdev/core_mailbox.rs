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

//! BCM2836 core mailboxes (`0x4000_0080..=0x4000_00FF`).
//!
//! Each vCPU has four emulated mailboxes. A write to a SET register ORs into
//! the mailbox and interrupts the target vCPU when that mailbox's interrupt
//! is enabled in its mailbox interrupt control. RD/CLR registers read the
//! mailbox and clear the bits written.

use axerrno::{AxResult, ax_err};

use super::{MmioContext, MmioKind, MmioRange, VirtMmioDevice};
use crate::vcpu::VCpuId;

const BASE: u64 = 0x4000_0080;
const RDCLR_OFFSET: u64 = 0x40;

pub(crate) struct CoreMailbox;

impl VirtMmioDevice for CoreMailbox {
    fn name(&self) -> &'static str {
        "bcm2836-mailbox"
    }

    fn range(&self) -> MmioRange {
        MmioRange::new(BASE, BASE + 0x7F)
    }

    fn kind(&self) -> MmioKind {
        MmioKind::Full
    }

    fn read(&self, cx: &mut MmioContext<'_>, addr: u64) -> AxResult<u32> {
        let (target, mailbox, is_rdclr) = decode(cx, addr)?;
        if !is_rdclr {
            return ax_err!(InvalidInput, "mailbox set registers are write-only");
        }
        Ok(cx.state.vcpus[target.index()].local.mailbox[mailbox])
    }

    fn write(&self, cx: &mut MmioContext<'_>, addr: u64, value: u32) -> AxResult {
        let (target, mailbox, is_rdclr) = decode(cx, addr)?;
        let local = &mut cx.state.vcpus[target.index()].local;
        if is_rdclr {
            local.mailbox[mailbox] &= !value;
            return Ok(());
        }
        local.mailbox[mailbox] |= value;
        if value != 0 && local.mbox_intr_ctl & (1 << mailbox) != 0 {
            cx.state.do_virq(cx.env, target);
        }
        Ok(())
    }
}

/// Splits `addr` into the target vCPU, the mailbox number and whether it is
/// a RD/CLR register.
fn decode(cx: &MmioContext<'_>, addr: u64) -> AxResult<(VCpuId, usize, bool)> {
    let offset = addr - BASE;
    let is_rdclr = offset >= RDCLR_OFFSET;
    let index = ((offset % RDCLR_OFFSET) / 0x10) as usize;
    let mailbox = ((offset & 0xf) / 4) as usize;
    let target = cx.sibling(index)?;
    Ok((target, mailbox, is_rdclr))
}
