//! Xtream Codes Integration
//!
//! Wire client for the Xtream Codes Player API v2, used by the per-credential
//! Upstream Client.
//!
//! ```text
//! GET {base}/player_api.php?username=X&password=Y&action=get_live_categories
//! GET {base}/player_api.php?username=X&password=Y&action=get_live_streams
//! GET {base}/live/X/Y/{stream_id}.ts
//! ```

pub mod client;
pub mod types;

// Re-exports for convenience
pub use client::{XtreamApi, XtreamClient, XtreamCredentials, XtreamError};
pub use types::{
    XtreamAuthResponse, XtreamCategory, XtreamEpgEntry, XtreamEpgListings, XtreamLiveStream,
    XtreamServerInfo, XtreamUserInfo,
};
