#![forbid(unsafe_code)]
//! Warp9: an asynchronous Rust implementation of the Warp9 remote-object
//! protocol, a simplified descendant of Plan 9's 9P2000.
//!
//! Warp9 is a synchronous, tagged request/reply protocol over a byte
//! stream. A client walks a namespace of objects, opens one, and reads or
//! writes it — the same verbs whether the object behind the fid is a
//! directory, a file, a content-addressed blob, or a live event queue.
//! This crate speaks both sides of the wire.
//!
//! # Overview
//!
//! - [`fcall`] — the wire types: `Qid`, `Dir`, and the `FCall` message
//!   catalog.
//! - [`serialize`] — the codec: `Encodable`/`Decodable` plus
//!   `read_msg`/`write_msg`.
//! - [`error`] — the fixed, closed `ErrCode` taxonomy and `Error` type.
//! - [`identity`] — numeric uid/gid resolution.
//! - [`srv`] — the server engine: implement [`srv::Filesystem`] and call
//!   [`srv::serve`].
//! - [`clnt`] — the client engine: [`clnt::Client::mount`] plus the
//!   per-fid RPC surface.
//! - [`wkit`] — an object toolkit (`Directory`, `PlainItem`, `BytesItem`,
//!   `DigestItem`, `EventItem`) that implements [`srv::Filesystem`] over
//!   an in-memory object graph, so a server rarely needs to hand-write
//!   the `Filesystem` trait itself.
//!
//! # Getting started (server)
//!
//! ```no_run
//! use warp9::wkit::{DirItem, Item, PlainItem, ObjectTree};
//! use warp9::srv;
//!
//! #[tokio::main]
//! async fn main() -> warp9::error::Result<()> {
//!     let root = DirItem::new("/");
//!     let hello = PlainItem::new("hello");
//!     hello.write(0, b"hello, warp9\n").await?;
//!     root.insert(hello).await;
//!     let tree = ObjectTree::new(root);
//!     srv::serve(tree, "tcp!0.0.0.0!9090").await
//! }
//! ```
//!
//! # Message flow
//!
//! 1. **Version**: `Tversion`/`Rversion` negotiate `msize` and dialect.
//! 2. **Auth** (optional): `Tauth`/`Rauth`.
//! 3. **Attach**: `Tattach` binds a fid to the namespace root.
//! 4. **Operations**: `Twalk`/`Topen`/`Tread`/`Twrite`/`Tstat`/`Twstat`/
//!    `Tcreate`/`Tremove`.
//! 5. **Cleanup**: `Tclunk` releases a fid; `Tflush` cancels a pending tag.
//!
//! # Error handling
//!
//! Operations return [`error::Result`]; server-side errors become
//! `Rerror{code, msg}` replies carrying one of the fixed [`error::ErrCode`]
//! values, never a raw OS errno.
//!
//! # Transport
//!
//! Dial strings follow Plan 9's bang syntax: `"tcp!host!port"` or
//! `"unix!path!0"`.
pub mod clnt;
pub mod error;
pub mod fcall;
pub mod identity;
pub mod serialize;
pub mod srv;
pub mod utils;
pub mod wkit;

pub use crate::error::{Error, Result};
pub use crate::fcall::*;
