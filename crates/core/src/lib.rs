//! Republish HLS live streams as RTSP.
//!
//! Each configured source gets a [`Bridge`] that pulls the HLS playlist
//! through an [`Ingest`](ingest::Ingest) implementation, negotiates H.264
//! parameters from the bitstream, and forwards RTP packets to a mount on the
//! shared RTSP [`Server`].

pub mod auth;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod ingest;
pub mod media;
pub mod metrics;
pub mod mount;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use bridge::{Bridge, BridgeOptions, BridgeState};
pub use codec::CodecDescriptor;
pub use config::Config;
pub use error::{Error, Result};
pub use media::Packetizer;
pub use mount::{Mount, MountRegistry};
pub use server::{Server, ServerConfig, Viewer};
