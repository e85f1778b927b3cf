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

//! Bitfield layouts decoded or built by the portable core.
//!
//! These are plain value layouts used with `LocalRegisterCopy`, so they work
//! on saved register values on any host.

#![allow(dead_code)]

use tock_registers::register_bitfields;

register_bitfields! {u64,
    pub HCR [
        VM OFFSET(0) NUMBITS(1) [],
        SWIO OFFSET(1) NUMBITS(1) [],
        FMO OFFSET(3) NUMBITS(1) [],
        IMO OFFSET(4) NUMBITS(1) [],
        AMO OFFSET(5) NUMBITS(1) [],
        VF OFFSET(6) NUMBITS(1) [],
        VI OFFSET(7) NUMBITS(1) [],
        VSE OFFSET(8) NUMBITS(1) [],
        TWI OFFSET(13) NUMBITS(1) [],
        TWE OFFSET(14) NUMBITS(1) [],
        RW OFFSET(31) NUMBITS(1) []
    ],

    pub VTCR [
        T0SZ OFFSET(0) NUMBITS(6) [],
        SL0 OFFSET(6) NUMBITS(2) [
            Level2 = 0,
            Level1 = 1,
            Level0 = 2
        ],
        IRGN0 OFFSET(8) NUMBITS(2) [
            WriteBack = 1
        ],
        ORGN0 OFFSET(10) NUMBITS(2) [
            WriteBack = 1
        ],
        SH0 OFFSET(12) NUMBITS(2) [],
        TG0 OFFSET(14) NUMBITS(2) [
            Granule4KB = 0
        ],
        PS OFFSET(16) NUMBITS(3) [
            PA_32B_4GB = 0
        ],
        RES1 OFFSET(31) NUMBITS(1) []
    ],

    pub S2_DESC [
        VALID OFFSET(0) NUMBITS(1) [],
        TABLE OFFSET(1) NUMBITS(1) [],
        MEMATTR OFFSET(2) NUMBITS(4) [
            Device = 0b0001,
            Normal = 0b1111
        ],
        S2AP OFFSET(6) NUMBITS(2) [
            ReadWrite = 0b11
        ],
        SH OFFSET(8) NUMBITS(2) [
            Inner = 0b11
        ],
        AF OFFSET(10) NUMBITS(1) [],
        OUTPUT_ADDR OFFSET(12) NUMBITS(36) []
    ],

    pub SPSR [
        M OFFSET(0) NUMBITS(4) [
            EL0t = 0b0000,
            EL1t = 0b0100,
            EL1h = 0b0101
        ],
        F OFFSET(6) NUMBITS(1) [],
        I OFFSET(7) NUMBITS(1) [],
        A OFFSET(8) NUMBITS(1) [],
        D OFFSET(9) NUMBITS(1) []
    ],

    pub CNT_CTL [
        ENABLE OFFSET(0) NUMBITS(1) [],
        IMASK OFFSET(1) NUMBITS(1) [],
        ISTATUS OFFSET(2) NUMBITS(1) []
    ],

    pub ESR [
        ISS OFFSET(0) NUMBITS(25) [],
        IL OFFSET(25) NUMBITS(1) [],
        EC OFFSET(26) NUMBITS(6) []
    ],

    pub DABT_ISS [
        DFSC OFFSET(0) NUMBITS(6) [],
        WNR OFFSET(6) NUMBITS(1) [],
        FNV OFFSET(10) NUMBITS(1) [],
        SRT OFFSET(16) NUMBITS(5) [],
        SAS OFFSET(22) NUMBITS(2) [],
        ISV OFFSET(24) NUMBITS(1) []
    ],

    pub PAR [
        F OFFSET(0) NUMBITS(1) [],
        PA OFFSET(12) NUMBITS(36) []
    ],

    pub PMCR [
        E OFFSET(0) NUMBITS(1) [],
        C OFFSET(2) NUMBITS(1) []
    ]
}
