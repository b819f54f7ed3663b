//! Codec configuration.

use crate::block::Strategy;
use crate::channel::{CHANNEL_KEY, WireFraming};
use crate::view::Endian;

/// Signing Block entry id holding the channel record ("zxk!").
pub const CHANNEL_BLOCK_ID: u32 = 0x7a78_6b21;

/// Trailing bytes searched by [`Strategy::PluginMagicScan`].
pub const PLUGIN_SCAN_WINDOW: u64 = 0x10_0000;

/// Everything the read path needs to know about the channel layout.
///
/// Passed explicitly to every read; there is no global state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    /// Byte order of the multi-byte fields.
    pub endian: Endian,

    /// Entry id of the channel value inside the Signing Block.
    pub block_id: u32,

    /// Record key holding the market name.
    pub channel_key: String,

    /// Entry-value framings accepted, in preference order.
    pub framings: Vec<WireFraming>,

    /// Block location strategies, tried in order.
    pub strategies: Vec<Strategy>,

    pub plugin_scan_window: u64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            endian: Endian::Little,
            block_id: CHANNEL_BLOCK_ID,
            channel_key: CHANNEL_KEY.to_owned(),
            framings: vec![WireFraming::MagicFramed, WireFraming::KvSeparated],
            strategies: Strategy::DEFAULT_ORDER.to_vec(),
            plugin_scan_window: PLUGIN_SCAN_WINDOW,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_packer_layout() {
        let config = CodecConfig::default();
        assert_eq!(config.block_id.to_be_bytes(), *b"zxk!");
        assert_eq!(config.channel_key, "CHANNEL");
        assert_eq!(config.framings[0], WireFraming::MagicFramed);
        assert_eq!(config.strategies[0], Strategy::Structural);
        assert_eq!(config.plugin_scan_window, 1024 * 1024);
    }
}
