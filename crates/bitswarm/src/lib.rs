//! A library for sharing a torrent with the BitTorrent protocol V1.
//!
//! The building blocks go from the bottom up:
//!
//! * [`tcp_wire`] frames the peer wire protocol.
//! * [`peer`] holds the protocol state machine of one connection.
//! * [`store`] verifies pieces and tracks which blocks were acquired, on
//!   top of a byte range [`storage`].
//! * [`scheduler`] owns the sessions and decides who we serve, who we
//!   download from and which blocks we request.
//! * [`client`] runs all of the above, plus the [`tracker`] announces.
//!
//! # Example
//!
//! ```no_run
//! use bitswarm::{
//!     client::Client, config::Config, metainfo::MetaInfo,
//!     storage::FileStorage,
//! };
//!
//! # async fn run() -> Result<(), bitswarm::error::Error> {
//! let config = Config::load()?;
//! let metainfo = MetaInfo::from_file("debian.torrent").await?;
//! let storage =
//!     FileStorage::new(&config.download_dir, metainfo.info.file_layout());
//!
//! let (ctx, handle) = Client::new(config, metainfo, storage).start().await?;
//!
//! // share the torrent until ctrl-c
//! tokio::signal::ctrl_c().await?;
//! ctx.stop();
//! handle.await.ok();
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod client;
pub mod config;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod tcp_wire;
pub mod throttle;
pub mod tracker;
pub mod utils;
