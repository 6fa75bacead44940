//! Wire protocol shared between the CrxShield kernel gateway, the VEH
//! monitor DLL and the controller.
//!
//! Everything in here is layout: control codes, packed request records and
//! the shared-memory header. Both sides of every boundary compile this crate,
//! so field offsets are pinned with compile-time asserts instead of comments.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate static_assertions;

pub mod ctl_code;
pub mod obf;
pub mod protocol;
pub mod veh;
