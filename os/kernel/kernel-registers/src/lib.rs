//! # Typed IA-32 Control Registers
//!
//! Bit-level models of the control registers the paging code touches:
//!
//! | Register | Use |
//! |:--|:--|
//! | [`Cr0`](cr0::Cr0) | `PG` (paging) and `WP` (supervisor write protection). |
//! | [`Cr2`](cr2::Cr2) | Faulting linear address after a page fault. |
//! | [`Cr3`](cr3::Cr3) | Physical base of the active page directory. |
//! | [`Cr4`](cr4::Cr4) | `PAE` must stay clear for two-level paging. |
//!
//! The `move to/from CRn` instructions only exist on 32-bit x86 builds with the
//! `asm` feature; everywhere else the types are plain bitfields.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr2")]
pub mod cr2;

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "cr4")]
pub mod cr4;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Control register access is privileged and requires ring 0.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Writing a control register changes processor-global state.
    unsafe fn store_unsafe(self);
}
