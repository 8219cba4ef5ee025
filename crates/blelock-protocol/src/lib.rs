//! Wire protocol codecs for BLE padlocks.
//!
//! This crate speaks both lock families byte-exactly:
//!
//! - **G-Series** ("Bander V11"): header/tail framed commands with an outer
//!   SunCheck byte and an AES-128-ECB envelope carrying CRC-16, a monotonic
//!   BCD serial and a random nonce ([`gseries`]).
//! - **TT-Series** ("TOTARGET A7"): compact `ENC | LEN | BODY | CRC-8`
//!   frames with optional AES bodies ([`ttseries`]).
//!
//! [`reassembly`] recovers whole frames from arbitrarily fragmented
//! notification payloads; [`crypto`] and [`clock`] hold the shared
//! primitives. The codecs are pure: the only state anywhere is the
//! monotonic serial clock injected into [`gseries::GSeriesCodec`].

pub mod clock;
pub mod crypto;
pub mod gseries;
pub mod reassembly;
pub mod ttseries;

pub use clock::{SerialClock, nonce4};
pub use gseries::{GSeriesCodec, GSeriesResponse};
pub use reassembly::{Assembler, GSeriesAssembler, TtAssembler};
pub use ttseries::{TtFrame, TtMessage};
