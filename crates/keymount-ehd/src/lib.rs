//! dm-crypt/LUKS engine for keymount.
//!
//! Maps encrypted containers through an on-demand loop device into a
//! device-mapper crypto target, driving the external `cryptsetup` helper.
//! The cryptsetup C API is neither stable nor commonly shared, so the
//! program is the interface.

pub mod crypto;
pub mod ehd;
pub mod loopdev;

pub use crypto::CryptsetupRunner;
pub use ehd::DmcryptEngine;
