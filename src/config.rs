//! CLI parsing and the `Preprocessor`'s configuration surface, including the
//! three canned quality profiles.

use clap::Parser;

use crate::bitrate::QualityMode;
use crate::error::{VoxError, VoxResult};
use crate::{DEFAULT_BITRATE, MAX_BITRATE, MIN_BITRATE};

/// Default port used when the flagged CLI surface omits one.
pub const DEFAULT_PORT: u16 = 40_000;

/// Which invocation style selected this mode, and the addressing it
/// resolved to. Both CLI surfaces ultimately reduce to one of these three
/// shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliMode {
    /// `<remote_ip> <local_port> <remote_port> [--device NAME]`
    PeerToPeer {
        remote_ip: String,
        local_port: u16,
        remote_port: u16,
        device: Option<String>,
    },
    /// `-s|--server [PORT] [--device NAME]`
    Server { port: u16, device: Option<String> },
    /// `-c|--client IP [PORT] [--device NAME]`
    Client {
        ip: String,
        port: u16,
        device: Option<String>,
    },
}

impl CliMode {
    pub fn device(&self) -> Option<&str> {
        match self {
            CliMode::PeerToPeer { device, .. } => device.as_deref(),
            CliMode::Server { device, .. } => device.as_deref(),
            CliMode::Client { device, .. } => device.as_deref(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "voxlink", about = "Peer-to-peer real-time voice endpoint")]
struct PositionalArgs {
    remote_ip: String,
    local_port: u16,
    remote_port: u16,
    #[arg(short = 'd', long = "device")]
    device: Option<String>,
}

#[derive(Parser, Debug)]
#[command(name = "voxlink", about = "Peer-to-peer real-time voice endpoint")]
struct FlaggedArgs {
    #[arg(short = 's', long = "server", conflicts_with = "client")]
    server: bool,

    #[arg(short = 'c', long = "client", value_name = "IP")]
    client: Option<String>,

    /// Listen port (server mode) or remote+local port (client mode).
    port: Option<u16>,

    #[arg(short = 'd', long = "device")]
    device: Option<String>,
}

/// Parse `std::env::args()` into a [`CliMode`], dispatching between the
/// positional peer-to-peer grammar and the flagged `-s`/`-c` grammar by
/// inspecting the shape of the arguments before handing off to `clap` — the
/// two styles aren't a single flat grammar, so `clap` alone can't pick
/// between them.
pub fn parse_cli() -> VoxResult<CliMode> {
    parse_cli_from(std::env::args())
}

pub fn parse_cli_from<I: IntoIterator<Item = String>>(args: I) -> VoxResult<CliMode> {
    let args: Vec<String> = args.into_iter().collect();
    let looks_flagged = args
        .get(1)
        .map(|a| a.starts_with('-'))
        .unwrap_or(false);

    if looks_flagged {
        let parsed = FlaggedArgs::try_parse_from(&args)
            .map_err(|e| VoxError::Config(e.to_string()))?;
        if parsed.server {
            Ok(CliMode::Server {
                port: parsed.port.unwrap_or(DEFAULT_PORT),
                device: parsed.device,
            })
        } else if let Some(ip) = parsed.client {
            Ok(CliMode::Client {
                ip,
                port: parsed.port.unwrap_or(DEFAULT_PORT),
                device: parsed.device,
            })
        } else {
            Err(VoxError::Config(
                "one of -s/--server or -c/--client is required".into(),
            ))
        }
    } else {
        let parsed =
            PositionalArgs::try_parse_from(&args).map_err(|e| VoxError::Config(e.to_string()))?;
        Ok(CliMode::PeerToPeer {
            remote_ip: parsed.remote_ip,
            local_port: parsed.local_port,
            remote_port: parsed.remote_port,
            device: parsed.device,
        })
    }
}

/// Recognized feature flags and tunables for the `Preprocessor`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessorConfig {
    pub enable_noise_suppression: bool,
    pub enable_codec: bool,
    pub enable_bitrate_adaptation: bool,
    pub enable_vad: bool,
    pub enable_agc: bool,
    /// Out of scope for this endpoint; kept as a config field because it's
    /// part of the recognized-option table, always `false`.
    pub enable_echo_cancellation: bool,
    pub noise_suppression_level: f64,
    pub vad_threshold: f64,
    pub agc_target_level: f64,
    pub target_bitrate: u32,
    pub quality_mode: QualityMode,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            enable_noise_suppression: true,
            enable_codec: true,
            enable_bitrate_adaptation: true,
            enable_vad: true,
            enable_agc: true,
            enable_echo_cancellation: false,
            noise_suppression_level: 0.5,
            vad_threshold: 0.5,
            agc_target_level: 0.3,
            target_bitrate: DEFAULT_BITRATE,
            quality_mode: QualityMode::Balanced,
        }
    }
}

impl PreprocessorConfig {
    /// No denoise, no VAD, max bitrate: minimize processing latency.
    pub fn low_latency() -> Self {
        Self {
            enable_noise_suppression: false,
            enable_vad: false,
            target_bitrate: MAX_BITRATE,
            quality_mode: QualityMode::HighQuality,
            ..Self::default()
        }
    }

    /// Everything on, max bitrate.
    pub fn high_quality() -> Self {
        Self {
            target_bitrate: MAX_BITRATE,
            quality_mode: QualityMode::HighQuality,
            ..Self::default()
        }
    }

    /// Everything on except AGC, min bitrate.
    pub fn power_save() -> Self {
        Self {
            enable_agc: false,
            target_bitrate: MIN_BITRATE,
            quality_mode: QualityMode::PowerSave,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        std::iter::once("voxlink".to_string())
            .chain(s.split_whitespace().map(str::to_string))
            .collect()
    }

    #[test]
    fn parses_positional_peer_to_peer_form() {
        let mode = parse_cli_from(args("10.0.0.5 40000 40001")).unwrap();
        assert_eq!(
            mode,
            CliMode::PeerToPeer {
                remote_ip: "10.0.0.5".into(),
                local_port: 40000,
                remote_port: 40001,
                device: None,
            }
        );
    }

    #[test]
    fn parses_positional_form_with_device() {
        let mode = parse_cli_from(args("10.0.0.5 40000 40001 --device hw:1")).unwrap();
        assert_eq!(mode.device(), Some("hw:1"));
    }

    #[test]
    fn parses_flagged_server_form() {
        let mode = parse_cli_from(args("-s 50000")).unwrap();
        assert_eq!(
            mode,
            CliMode::Server {
                port: 50000,
                device: None,
            }
        );
    }

    #[test]
    fn parses_flagged_server_form_with_default_port() {
        let mode = parse_cli_from(args("--server")).unwrap();
        assert_eq!(
            mode,
            CliMode::Server {
                port: DEFAULT_PORT,
                device: None,
            }
        );
    }

    #[test]
    fn parses_flagged_client_form() {
        let mode = parse_cli_from(args("-c 10.0.0.9 50000")).unwrap();
        assert_eq!(
            mode,
            CliMode::Client {
                ip: "10.0.0.9".into(),
                port: 50000,
                device: None,
            }
        );
    }

    #[test]
    fn rejects_neither_server_nor_client() {
        assert!(parse_cli_from(args("--device hw:0")).is_err());
    }

    #[test]
    fn quality_profiles_respect_recognized_ranges() {
        for profile in [
            PreprocessorConfig::low_latency(),
            PreprocessorConfig::high_quality(),
            PreprocessorConfig::power_save(),
        ] {
            assert!((MIN_BITRATE..=MAX_BITRATE).contains(&profile.target_bitrate));
            assert!((0.0..=1.0).contains(&profile.vad_threshold));
        }
    }
}
