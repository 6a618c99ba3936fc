//! Backend registry
//!
//! Backends register themselves through the system API; every protocol
//! engine asks the registry which backend owns a stream.
//!
//! ```text
//!   SRS backends ──POST /api/v1/srs/register──► BackendRegistry.update()
//!                                                      │
//!        ┌─────────────────┬───────────────────┬───────┴──────────┐
//!        ▼                 ▼                   ▼                  ▼
//!   RTMP session      SRT connection      WHIP/WHEP         RTC UDP relay
//!        └───────── BackendRegistry.pick(stream_url) ─────────────┘
//! ```

pub mod balancer;
pub mod config;
pub mod server;

pub use balancer::BackendRegistry;
pub use config::RegistryConfig;
pub use server::BackendServer;
