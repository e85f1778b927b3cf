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

use alloc::string::String;
use alloc::vec;

use numeric_enum_macro::numeric_enum;

use crate::hal::HypHal;
use crate::pmu;
use crate::state::{Env, VmmState};
use crate::vcpu::VCpuId;
use crate::vm::MSG_BUFFER_SIZE;

numeric_enum! {
    #[repr(u16)]
    /// Hypercall types below the CFI range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum HyperCallCode {
        Puts = 0,
        ForceShutdown = 1,
        CycleCountStart = 4,
        CycleCountRead = 5,
        CycleCountStop = 6,
    }
}

/// Services hypercall `imm` issued by `id`. The PC has already been moved
/// past the trapping instruction.
pub(crate) fn dispatch(state: &mut VmmState, env: Env<'_>, id: VCpuId, imm: u16) {
    let hal = env.hal;
    let vm = state.vcpus[id.0].vm();
    let Ok(code) = HyperCallCode::try_from(imm) else {
        error!("{}: illegal hypercall #{:#x}", id, imm);
        state.force_shutdown(env, vm);
        return;
    };
    trace!("{}: hypercall {:?}", id, code);

    match code {
        HyperCallCode::Puts => match state.vcpus[id.0].msg_buffer() {
            Some(pa) => {
                let msg = read_message(hal, pa);
                info!("[from vm {}] {}", state.vms[vm.0].name(), msg.trim_end());
            }
            None => warn!("{}: PUTS without a message buffer", id),
        },
        HyperCallCode::ForceShutdown => {
            info!("vm {} asked to be shut down", vm);
            state.force_shutdown(env, vm);
        }
        HyperCallCode::CycleCountStart => {
            info!("{}: cycle counter start", id);
            state.vcpus[id.0].security.reset_counters();
            pmu::cycle_count_start(hal);
        }
        HyperCallCode::CycleCountRead => {
            let security = &state.vcpus[id.0].security;
            info!("{}: cycle counter value {:#x}", id, pmu::cycle_count_stop(hal));
            info!("{}: cfi returns {:#x}", id, security.ret_count);
            info!("{}: cfi calls {:#x}", id, security.call_count);
        }
        HyperCallCode::CycleCountStop => {
            info!("{}: cycle count {:#x}", id, pmu::cycle_count_stop(hal));
        }
    }
}

/// The NUL terminated string at the start of a message buffer.
fn read_message(hal: &dyn HypHal, pa: u64) -> String {
    let mut buf = vec![0u8; MSG_BUFFER_SIZE];
    hal.read_phys(pa, &mut buf);
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHal;

    #[test]
    fn test_message_stops_at_nul() {
        let hal = MockHal::new();
        hal.write_phys(0x2000_0000, b"hello from el1\n\0stale");
        assert_eq!(read_message(&hal, 0x2000_0000), "hello from el1\n");
    }

    #[test]
    fn test_unterminated_message_is_bounded() {
        let hal = MockHal::new();
        hal.write_phys(0x2000_0000, &[b'a'; MSG_BUFFER_SIZE + 16]);
        assert_eq!(read_message(&hal, 0x2000_0000).len(), MSG_BUFFER_SIZE);
    }

    #[test]
    fn test_codes() {
        assert_eq!(HyperCallCode::try_from(5), Ok(HyperCallCode::CycleCountRead));
        assert!(HyperCallCode::try_from(2).is_err());
        assert!(HyperCallCode::try_from(0x1000).is_err());
    }
}
