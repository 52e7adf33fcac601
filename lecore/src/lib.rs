//! A Bluetooth Low Energy Link-Layer controller core.
//!
//! Tries to adhere to the *Bluetooth Core Specification v5.1*, Vol 6, Part B.
//!
//! # Using the controller
//!
//! The crate is runtime and hardware-agnostic: It does not need an RTOS and never blocks. The
//! platform provides a few services by implementing [`Config`]:
//! * A microsecond-precision [`Timer`].
//! * A [`Radio`] driver that runs one programmed TX/RX operation at a time.
//! * A hardware entropy source ([`Trng`]) feeding the DRBG.
//! * A P-256 implementation ([`EcdhProvider`]), run as background work.
//!
//! The [`LinkLayer`] is then driven from three contexts: the timer interrupt calls `update`, the
//! radio interrupt calls `radio_done`, and the idle loop calls `run_background` and drains host
//! events.
//!
//! [`Config`]: config/trait.Config.html
//! [`Timer`]: time/trait.Timer.html
//! [`Radio`]: link/trait.Radio.html
//! [`Trng`]: security/rng/trait.Trng.html
//! [`EcdhProvider`]: ecdh/trait.EcdhProvider.html
//! [`LinkLayer`]: link/struct.LinkLayer.html

// We're `#[no_std]`, except when we're testing
#![cfg_attr(not(test), no_std)]
// Deny a few warnings in doctests, since rustdoc `allow`s many warnings by default
#![doc(test(attr(deny(unused_imports, unused_must_use))))]
#![warn(rust_2018_idioms)]
// The claims of this lint are dubious, disable it
#![allow(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod bytes;
pub mod config;
pub mod ecdh;
mod error;
pub mod link;
pub mod phy;
pub mod security;
pub mod time;

pub use self::error::{Error, ErrorCode, HardwareError};

use self::link::llcp::VersionNumber;

/// Version of the Bluetooth specification implemented by this controller.
pub const BLUETOOTH_VERSION: VersionNumber = VersionNumber::V5_1;
