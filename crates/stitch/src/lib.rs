//! # stitch-engine
//!
//! Plays many short, independently stored video files as one continuous
//! timeline. Two decoders alternate: while one plays segment `n`, the other
//! preloads segment `n + 1`, starts it muted just before the boundary and takes
//! over exactly at the nominal segment end while the audio crossfades across
//! the overlap both files share.
//!
//! The crate is host-agnostic. Media elements and fullscreen are reached through
//! the [`Decoder`] and [`FullscreenController`] traits; segment bytes are
//! resolved and fetched through a same-origin relay.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stitch_engine::{
//!     CacheConfig, HttpFetcher, HttpResolver, MemoryBlobStore, Player, PlayerConfig,
//!     ResolverConfig, SegmentCache, SimulatedDecoder,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver_config = ResolverConfig::default();
//! let client = stitch_engine::http::build_client(&resolver_config)?;
//! let fetcher = HttpFetcher::new(client.clone(), resolver_config.fetch_timeout());
//! let resolver = HttpResolver::with_client(client, resolver_config);
//!
//! let cache = Arc::new(SegmentCache::new(
//!     Arc::new(resolver),
//!     Arc::new(fetcher),
//!     Arc::new(MemoryBlobStore::new()),
//!     CacheConfig::default(),
//! ));
//! let mut player = Player::new(
//!     PlayerConfig::default(),
//!     cache,
//!     SimulatedDecoder::new(7.5),
//!     SimulatedDecoder::new(7.5),
//! );
//! player.load("live:5.5|seg0,seg1")?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod decoder;
pub mod driver;
pub mod error;
pub mod events;
pub mod http;
pub mod live;
pub mod player;
pub mod playlist;
pub mod reference;
pub mod resolver;
pub mod scheduler;
pub mod timeline;

pub use cache::{BlobStore, HttpFetcher, MemoryBlobStore, SegmentCache, SegmentFetcher};
pub use config::{CacheConfig, PlayerConfig, ResolverConfig};
pub use decoder::{Decoder, FullscreenController, PlaybackRejection, ReadyState, SimulatedDecoder};
pub use driver::run_render_loop;
pub use error::{PlayerError, PlaylistError};
pub use events::PlayerEvent;
pub use player::{Player, PlayerSnapshot};
pub use playlist::{Playlist, PlaylistChange, PlaylistController};
pub use reference::{SegmentRef, parse_reference};
pub use resolver::{HttpResolver, SegmentResolver, resolve_poster};
pub use scheduler::{SlotId, SlotState};
pub use timeline::{Timeline, format_time};
