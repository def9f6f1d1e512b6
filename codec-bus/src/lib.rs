pub mod adapter;
pub mod async_adapter;
pub mod codec;
pub mod enqueuer;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod multiplexer;
pub mod software;
pub mod sync_adapter;
pub mod types;

#[cfg(test)]
mod mock;

pub use adapter::{CodecAdapter, CodecAdapterFactory};
pub use async_adapter::{AdapterState, AsyncCodecAdapter, AsyncCodecAdapterFactory};
pub use codec::{Codec, CodecEvent, CodecEventSender, CodecProvider, FrameRenderedListener};
pub use error::{AdapterError, AdapterResult, CodecError, CodecErrorKind, CodecResult};
pub use software::{LoopbackCodec, PassthroughEngine, SoftwareCodec, loopback_provider};
pub use sync_adapter::{SyncCodecAdapter, SyncCodecAdapterFactory};
pub use types::*;
