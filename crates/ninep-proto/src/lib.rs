#![forbid(unsafe_code)]
//! Protocol engine for 9P2000.L servers, extended with the small set of
//! Windows-oriented messages known as 9P2000.W (`access`, `wreaddir`,
//! `wopen`).
//!
//! This crate owns the wire codec, the per-connection message pipeline, the
//! fid table, and the cooperative bookkeeping (fairness limiting,
//! cancellation, request tracking for `flush`) that a 9P server needs
//! regardless of what it serves. What each fid actually *does* — walking a
//! path, opening a file, answering `getattr` — is supplied by a type
//! implementing [`srv::Filesystem`]; see the `ninep-fs` crate for a concrete
//! implementation backed by the host filesystem.
//!
//! # Getting started
//!
//! 1. Define a type to hold per-fid state (or use `()` if you need none).
//! 2. Implement [`srv::Filesystem`] for your server type.
//! 3. Start serving with [`srv::srv_async`].
//!
//! ```no_run
//! use ninep_proto::{srv::{Filesystem, FId}, acceptor::srv_async, Result, FCall};
//! use async_trait::async_trait;
//!
//! #[derive(Clone)]
//! struct MyFs;
//!
//! #[derive(Default)]
//! struct MyFId;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     type FId = MyFId;
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &FId<Self::FId>,
//!         _afid: Option<&FId<Self::FId>>,
//!         _uname: &str,
//!         _aname: &str,
//!         _n_uname: u32,
//!     ) -> Result<FCall> {
//!         Ok(FCall::RAttach {
//!             qid: ninep_proto::QId { typ: ninep_proto::QIdType::DIR, version: 0, path: 0 },
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     srv_async(MyFs, "tcp!127.0.0.1!564").await
//! }
//! ```
//!
//! # Protocol
//!
//! 1. **Version negotiation**: `Tversion`/`Rversion` fixes the maximum frame
//!    size and whether 9P2000.W extensions are in effect.
//! 2. **Attach**: `Tattach` binds a client-chosen fid to the root of a share.
//! 3. **Operations**: `walk`, `lopen`/`wopen`, `read`, `write`, `readdir`/
//!    `wreaddir`, `getattr`/`setattr`, and friends.
//! 4. **Cleanup**: `Tclunk` releases a fid's server-side state.
//!
//! Every in-flight request runs as its own task, bounded by a per-connection
//! fairness limit; `Tflush` cancels one by tag and is guaranteed to be
//! observed only after the original response (if any) has been sent.
//!
//! # Safety
//!
//! This crate forbids unsafe code and relies on the type system and on
//! tokio's scheduler for memory safety and cancellation.
pub mod acceptor;
pub mod error;
pub mod fcall;
pub mod sched;
pub mod serialize;
pub mod srv;
pub mod tracker;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
