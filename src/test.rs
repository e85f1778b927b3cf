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

use alloc::vec;
use alloc::vec::Vec;

use axerrno::AxError;

use crate::hal::{HypHal, SysReg};
use crate::mock::MockHal;
use crate::timer::TIMER_EVENT_NUM;
use crate::{
    HypConfig, Hypervisor, MemoryRegion, RegionKind, SchedulerConfig, SchedulerId, SchedulerKind,
    TrapExit, TrapFrame, VCpuId, VCpuState, VmConfig,
};

const HCR_VSE: u64 = 1 << 8;
const HCR_VI: u64 = 1 << 7;

const CORE0_TIMER_INT_CTL: u64 = 0x4000_0040;
const CORE0_IRQ_SOURCE: u64 = 0x4000_0060;
const GPU_PENDING_2: u64 = 0x3F00_B208;
const CORE1_MBOX0_RDCLR: u64 = 0x4000_00D0;

const GUEST_CODE_PA: u64 = 0x3000_0000;

fn esr_hvc(imm: u16) -> u64 {
    (0x16 << 26) | (1 << 25) | imm as u64
}

fn esr_wfi() -> u64 {
    (0x01 << 26) | (1 << 25)
}

fn esr_data_abort_write() -> u64 {
    (0x24 << 26) | (1 << 25) | (1 << 6) | 0x07
}

fn one_kind(kind: SchedulerKind, cpus: usize) -> HypConfig {
    HypConfig {
        cpu_count: cpus,
        schedulers: vec![SchedulerConfig::new(kind)],
        cpu_schedulers: vec![Some(SchedulerId(0)); cpus],
        ..Default::default()
    }
}

fn guest(name: &str) -> VmConfig {
    VmConfig {
        name: name.into(),
        memory_map: vec![
            MemoryRegion::new(0x0, 0xf_ffff, RegionKind::Plain),
            MemoryRegion::new(0x10_0000, 0x10_0fff, RegionKind::MessageBuffer),
        ],
        ..Default::default()
    }
}

fn boot(config: HypConfig) -> Hypervisor<MockHal> {
    let cpus = config.cpu_count;
    let hv = Hypervisor::new(MockHal::new(), config).unwrap();
    for cpu in 0..cpus {
        hv.hal().set_cpu(cpu);
        hv.init_current_cpu();
    }
    hv.hal().set_cpu(0);
    hv
}

/// Runs the trap path of a guest that executed the instruction `insn` at
/// its current PC.
fn trap_on(hv: &Hypervisor<MockHal>, frame: &mut TrapFrame, esr: u64, insn: Option<u32>) -> TrapExit {
    let hal = hv.hal();
    if let Some(insn) = insn {
        hal.map_guest_va(frame.exception_pc(), GUEST_CODE_PA);
        hal.write_phys_u32(GUEST_CODE_PA + (frame.exception_pc() & 0xfff), insn);
    }
    hal.set_sysreg(SysReg::EsrEl2, esr);
    hv.handle_sync_trap(frame)
}

/// Guest store `str w1, [x0]` of `value` to `ipa`.
fn guest_store(hv: &Hypervisor<MockHal>, frame: &mut TrapFrame, ipa: u64, value: u32) -> TrapExit {
    let hal = hv.hal();
    hal.set_sysreg(SysReg::HpfarEl2, (ipa >> 12) << 4);
    hal.set_sysreg(SysReg::FarEl2, ipa & 0xfff);
    frame.gpr[0] = ipa;
    frame.gpr[1] = value as u64;
    trap_on(hv, frame, esr_data_abort_write(), Some(0xB900_0001))
}

#[test]
fn test_config_validation() {
    let bad_binding = HypConfig {
        cpu_schedulers: vec![Some(SchedulerId(3)); 4],
        ..Default::default()
    };
    assert!(Hypervisor::new(MockHal::new(), bad_binding).is_err());
    let too_many_cpus = HypConfig {
        cpu_count: 5,
        ..Default::default()
    };
    assert!(Hypervisor::new(MockHal::new(), too_many_cpus).is_err());
    assert!(Hypervisor::new(MockHal::new(), HypConfig::default()).is_ok());
}

#[test]
fn test_first_entry_loads_the_guest() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    let vm = hv.create_vm(&guest("linux")).unwrap();
    let vcpu = hv.vcpus_of(vm)[0];

    let mut frame = TrapFrame::default();
    assert_eq!(hv.start_cpu(&mut frame), TrapExit::Resume);
    assert_eq!(frame.exception_pc(), 0x8_0000);
    assert_eq!(frame.gpr(0), 0x80_0000);
    assert_eq!(hv.vcpu_state(vcpu), Some(VCpuState::Run));
    assert_eq!(hv.current_vcpu(0), Some(vcpu));
    assert_eq!(hv.hal().sysreg(SysReg::VmpidrEl2), 1 << 31);
    assert_ne!(hv.hal().sysreg(SysReg::VttbrEl2), 0);
}

#[test]
fn test_idle_core_without_guests() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    let mut frame = TrapFrame::default();
    assert_eq!(hv.start_cpu(&mut frame), TrapExit::Idle);
}

#[test]
fn test_repeated_traps_skip_the_context_switch() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    hv.create_vm(&guest("solo")).unwrap();
    let mut frame = TrapFrame::default();
    hv.start_cpu(&mut frame);
    assert_eq!(hv.hal().fp_restores(), 1);
    hv.hal().clear_events();

    for _ in 0..3 {
        assert_eq!(trap_on(&hv, &mut frame, esr_hvc(6), None), TrapExit::Resume);
    }
    assert_eq!(hv.hal().fp_restores(), 1);
    assert!(hv.hal().events().is_empty());
}

#[test]
fn test_wfi_sleeps_until_virtual_timer() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    let vm = hv.create_vm(&guest("sleepy")).unwrap();
    let vcpu = hv.vcpus_of(vm)[0];
    let mut frame = TrapFrame::default();
    hv.start_cpu(&mut frame);

    // CNTV armed 100 ms ahead
    hv.hal().set_sysreg(SysReg::CntvCtlEl0, 1);
    hv.hal().set_sysreg(SysReg::CntvCvalEl0, 1_920_000);
    assert_eq!(trap_on(&hv, &mut frame, esr_wfi(), None), TrapExit::Idle);
    assert_eq!(hv.vcpu_state(vcpu), Some(VCpuState::Sleep));
    assert_eq!(hv.current_vcpu(0), None);

    hv.hal().set_mmio(CORE0_IRQ_SOURCE, 1 << 2);
    let mut idle = TrapFrame::default();
    assert_eq!(hv.handle_irq(&mut idle), TrapExit::Resume);
    assert_eq!(hv.vcpu_state(vcpu), Some(VCpuState::Run));
    assert_eq!(idle.exception_pc(), 0x8_0004);
    assert_ne!(hv.hal().sysreg(SysReg::HcrEl2) & HCR_VI, 0);
    // ISTATUS is visible once the guest reads its timer back
    assert_eq!(hv.hal().sysreg(SysReg::CntvCtlEl0), 0b101);
}

#[test]
fn test_early_wakes_do_not_pile_up_timer_events() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    let vm = hv
        .create_vm(&VmConfig {
            irq_grant: 1 << 57,
            ..guest("chatty")
        })
        .unwrap();
    let vcpu = hv.vcpus_of(vm)[0];
    let mut frame = TrapFrame::default();
    hv.start_cpu(&mut frame);
    let hal = hv.hal();

    for _ in 0..2 * TIMER_EVENT_NUM {
        // CNTV armed 10 s ahead, but the device interrupt comes first
        hal.set_sysreg(SysReg::CntvCtlEl0, 1);
        hal.set_sysreg(SysReg::CntvCvalEl0, 192_000_000);
        assert_eq!(trap_on(&hv, &mut frame, esr_wfi(), None), TrapExit::Idle);
        assert_eq!(hv.vcpu_state(vcpu), Some(VCpuState::Sleep));

        hal.set_mmio(GPU_PENDING_2, 1 << 25);
        hal.set_mmio(CORE0_IRQ_SOURCE, 1 << 8);
        assert_eq!(hv.handle_irq(&mut frame), TrapExit::Resume);
        assert_eq!(hv.vcpu_state(vcpu), Some(VCpuState::Run));
    }
}

#[test]
fn test_round_robin_rotates_in_arrival_order() {
    let hv = boot(one_kind(SchedulerKind::RoundRobin, 1));
    let order: Vec<VCpuId> = ["a", "b", "c"]
        .iter()
        .map(|name| hv.vcpus_of(hv.create_vm(&guest(name)).unwrap())[0])
        .collect();
    let mut frame = TrapFrame::default();
    hv.start_cpu(&mut frame);
    assert_eq!(hv.current_vcpu(0), Some(order[0]));

    let mut runs = [0; 3];
    hv.hal().set_mmio(CORE0_IRQ_SOURCE, 1 << 2);
    for period in 1..=10 {
        assert_eq!(hv.handle_irq(&mut frame), TrapExit::Resume);
        assert_eq!(hv.current_vcpu(0), Some(order[period % 3]));
        runs[period % 3] += 1;
    }
    assert_eq!(runs, [3, 4, 3]);
}

#[test]
fn test_fcfs_priority_preempts_on_creation() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    let low = hv
        .create_vm(&VmConfig {
            priority: 8,
            ..guest("low")
        })
        .unwrap();
    let mut frame = TrapFrame::default();
    hv.start_cpu(&mut frame);
    let high = hv
        .create_vm(&VmConfig {
            priority: 2,
            ..guest("high")
        })
        .unwrap();

    trap_on(&hv, &mut frame, esr_hvc(6), None);
    assert_eq!(hv.current_vcpu(0), Some(hv.vcpus_of(high)[0]));
    assert_eq!(hv.vcpu_state(hv.vcpus_of(low)[0]), Some(VCpuState::Ready));
}

#[test]
fn test_runtime_vm_creation_keeps_the_running_guest_timer_irq() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    hv.create_vm(&guest("first")).unwrap();
    let mut frame = TrapFrame::default();
    hv.start_cpu(&mut frame);

    // enable the virtual timer irq of this core
    assert_eq!(guest_store(&hv, &mut frame, CORE0_TIMER_INT_CTL, 1 << 3), TrapExit::Resume);
    assert_eq!(hv.hal().mmio(CORE0_TIMER_INT_CTL) & (1 << 3), 1 << 3);

    hv.create_vm(&guest("second")).unwrap();
    assert_eq!(hv.hal().mmio(CORE0_TIMER_INT_CTL) & (1 << 3), 1 << 3);
    assert_eq!(trap_on(&hv, &mut frame, esr_hvc(6), None), TrapExit::Resume);
    assert_eq!(hv.hal().mmio(CORE0_TIMER_INT_CTL) & (1 << 3), 1 << 3);
}

#[test]
fn test_force_shutdown_hypercall() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    let vm = hv.create_vm(&guest("quitter")).unwrap();
    let mut frame = TrapFrame::default();
    hv.start_cpu(&mut frame);

    assert_eq!(trap_on(&hv, &mut frame, esr_hvc(1), None), TrapExit::Idle);
    assert!(hv.is_shut_down(vm));
    assert_eq!(hv.vcpu_state(hv.vcpus_of(vm)[0]), Some(VCpuState::Init));
}

#[test]
fn test_unknown_hypercall_shuts_the_vm_down() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    let vm = hv.create_vm(&guest("rogue")).unwrap();
    let mut frame = TrapFrame::default();
    hv.start_cpu(&mut frame);
    assert_eq!(trap_on(&hv, &mut frame, esr_hvc(0x42), None), TrapExit::Idle);
    assert!(hv.is_shut_down(vm));
}

#[test]
fn test_cfi_return_checks() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    let vm = hv.create_vm(&guest("checked")).unwrap();
    let mut frame = TrapFrame::default();
    hv.start_cpu(&mut frame);
    let hal = hv.hal();
    hal.map_guest_va(0x9_0000, 0x3100_0000);

    // return right after `bl`
    hal.write_phys_u32(0x3100_0010, 0x9400_0040);
    frame.gpr[30] = 0x9_0014;
    assert_eq!(trap_on(&hv, &mut frame, esr_hvc(0x1000), None), TrapExit::Resume);
    assert_eq!(frame.exception_pc(), 0x9_0014);

    // a return after `add` at EL0 only costs the process an SError
    hal.write_phys_u32(0x3100_0010, 0x9100_0400);
    frame.spsr = 0;
    frame.set_exception_pc(0x8_1000);
    assert_eq!(trap_on(&hv, &mut frame, esr_hvc(0x1000), None), TrapExit::Resume);
    assert_eq!(frame.exception_pc(), 0x8_1000);
    assert_ne!(hal.sysreg(SysReg::HcrEl2) & HCR_VSE, 0);
    assert!(!hv.is_shut_down(vm));

    // the same at EL1 takes the VM down
    frame.spsr = 0x3c5;
    assert_eq!(trap_on(&hv, &mut frame, esr_hvc(0x1000), None), TrapExit::Idle);
    assert!(hv.is_shut_down(vm));
}

#[test]
fn test_mailbox_write_interrupts_sibling() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 2));
    let vm = hv
        .create_vm(&VmConfig {
            vcpu_count: 2,
            ..guest("smp")
        })
        .unwrap();
    let vcpus = hv.vcpus_of(vm);
    let mut frame = TrapFrame::default();
    hv.start_cpu(&mut frame);
    assert_eq!(hv.current_vcpu(0), Some(vcpus[0]));

    // enable mailbox 0 of vcpu 1, then ring it
    assert_eq!(guest_store(&hv, &mut frame, 0x4000_0054, 1), TrapExit::Resume);
    assert_eq!(frame.exception_pc(), 0x8_0004);
    assert_eq!(guest_store(&hv, &mut frame, 0x4000_0090, 0x10), TrapExit::Resume);

    hv.hal().set_cpu(1);
    let mut other = TrapFrame::default();
    assert_eq!(hv.start_cpu(&mut other), TrapExit::Resume);
    assert_eq!(hv.current_vcpu(1), Some(vcpus[1]));
    assert_ne!(hv.hal().sysreg(SysReg::HcrEl2) & HCR_VI, 0);
}

#[test]
fn test_mmio_to_missing_sibling_is_an_serror() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    hv.create_vm(&guest("up")).unwrap();
    let mut frame = TrapFrame::default();
    hv.start_cpu(&mut frame);

    assert_eq!(guest_store(&hv, &mut frame, 0x4000_0090, 1), TrapExit::Resume);
    assert_eq!(frame.exception_pc(), 0x8_0000);
    assert_ne!(hv.hal().sysreg(SysReg::HcrEl2) & HCR_VSE, 0);
}

#[test]
fn test_remote_shutdown_mails_the_core() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 2));
    let vm = hv
        .create_vm(&VmConfig {
            vcpu_count: 2,
            ..guest("pair")
        })
        .unwrap();
    let mut frame = TrapFrame::default();
    hv.start_cpu(&mut frame);
    hv.hal().set_cpu(1);
    hv.start_cpu(&mut TrapFrame::default());
    hv.hal().set_cpu(0);
    hv.hal().set_mmio(CORE1_MBOX0_RDCLR, 0);

    hv.force_shutdown(vm).unwrap();
    assert_eq!(hv.hal().mmio(CORE1_MBOX0_RDCLR) & 1, 1);
    assert_eq!(hv.current_vcpu(1), None);
    assert_eq!(hv.force_shutdown(crate::VmId(7)), Err(AxError::InvalidInput));
}

#[test]
fn test_conflicting_grants_are_rejected() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    let first = VmConfig {
        gpio_grant: 0b1100 << 20,
        irq_grant: 1 << 57,
        ..guest("uart")
    };
    hv.create_vm(&first).unwrap();
    let second = VmConfig {
        gpio_grant: 1 << 22,
        ..guest("gpio")
    };
    assert_eq!(hv.create_vm(&second), Err(AxError::AlreadyExists));
    assert_eq!(hv.vm_count(), 1);
}

#[test]
#[should_panic(expected = "vm pool exhausted")]
fn test_pool_exhaustion_is_fatal() {
    let hv = boot(HypConfig {
        max_vms: 2,
        ..one_kind(SchedulerKind::Fcfs, 1)
    });
    hv.create_vm(&guest("a")).unwrap();
    hv.create_vm(&guest("b")).unwrap();
    let _ = hv.create_vm(&guest("c"));
}

#[test]
fn test_cpu_usage_dump_start_stop() {
    let hv = boot(one_kind(SchedulerKind::Fcfs, 1));
    hv.start_cpu_usage_dump();
    assert_eq!(hv.hal().sysreg(SysReg::PmcntensetEl0), 1 << 31);
    assert_eq!(hv.stop_cpu_usage_dump(), Ok(()));
    assert_eq!(hv.stop_cpu_usage_dump(), Err(AxError::NotFound));
}
