//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants and the boot handoff consumed by the memory core.
//!
//! ## Modules
//!
//! ### Boot Information ([`boot`])
//! The values the boot collaborator hands over exactly once: where the kernel
//! image ends and how much physical memory the machine has.
//!
//! ### Memory Layout ([`memory`])
//! Frame and sector geometry, the reserved bootstrap margin, the fixed
//! identity-mapped regions and the usable swap window.
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Boot sector, BIOS (< 1 MiB)    │
//! 0x0010_0000 ├─────────────────────────────────┤
//!             │  Kernel image, frame pool       │  identity, pinned, supervisor
//! USER_BASE   ├─────────────────────────────────┤ 0x0400_0000 (64 MiB)
//!             │                                 │
//!             │         User Space              │
//!             │                                 │
//! DEVICE_BASE ├─────────────────────────────────┤ 0xFEC0_0000
//!             │  I/O APIC, local APIC, MMIO     │  identity, pinned, user
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
