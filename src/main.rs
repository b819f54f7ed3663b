use std::path::PathBuf;
use std::process::ExitCode;

use apkchannel::batch::DEFAULT_TEMPLATE;
use apkchannel::channel::CHANNEL_KEY;
use apkchannel::reader::Found;
use apkchannel::{
    CodecConfig, Endian, GenerateOptions, NoPackageInfo, PackageInfo, PackageInspector, RawApk,
    Scheme, Strategy, generate, inspect, parse_markets, read_channel,
};
use clap::{
    Parser, Subcommand,
    builder::{
        Styles,
        styling::{AnsiColor, Style},
    },
};
use eyre::{Result, WrapErr};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "apkchannel", version, about, long_about = None, styles = get_style())]
struct Cli {
    /// Log locator decisions (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write one legacy-tagged copy of the APK per market
    Generate {
        /// Original release APK
        apk: PathBuf,
        /// Comma-separated markets, or @file with one market per line
        #[arg(short, long, required = true)]
        channels: String,
        /// Output directory
        #[arg(short, long, default_value = "apks")]
        output: PathBuf,
        /// Output file name template
        #[arg(short = 'f', long = "format", default_value = DEFAULT_TEMPLATE)]
        template: String,
        /// Delete *.apk files already in the output directory
        #[arg(long)]
        clean: bool,
        /// Package name for ${package}; without it the default template falls back to ${name}-${market}${ext}
        #[arg(long)]
        package: Option<String>,
        /// Version name for ${vname}
        #[arg(long, requires = "package")]
        version_name: Option<String>,
        /// Version code for ${vcode}
        #[arg(long, requires = "package")]
        version_code: Option<String>,
    },
    /// Print the channel record of an APK
    Show {
        apk: PathBuf,
        #[arg(short, long, value_enum, default_value_t = Scheme::V2ThenLegacy)]
        scheme: Scheme,
        /// Record key holding the market name
        #[arg(short, long, default_value = CHANNEL_KEY)]
        key: String,
        #[command(flatten)]
        codec: CodecArgs,
    },
    /// Print ZIP sections, locator outcomes and Signing Block entries
    Inspect {
        apk: PathBuf,
        #[command(flatten)]
        codec: CodecArgs,
    },
}

#[derive(clap::Args)]
struct CodecArgs {
    /// Signing Block entry id of the channel value
    #[arg(long, value_parser = parse_id)]
    block_id: Option<u32>,
    /// Block location strategies, in order
    #[arg(long, value_enum, value_delimiter = ',')]
    strategy: Vec<Strategy>,
    #[arg(long, value_enum, default_value_t = Endian::Little)]
    endian: Endian,
}

impl CodecArgs {
    fn config(&self, channel_key: &str) -> CodecConfig {
        let mut config = CodecConfig {
            endian: self.endian,
            channel_key: channel_key.to_owned(),
            ..CodecConfig::default()
        };
        if let Some(id) = self.block_id {
            config.block_id = id;
        }
        if !self.strategy.is_empty() {
            config.strategies = self.strategy.clone();
        }
        config
    }
}

fn parse_id(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| format!("invalid entry id {value:?}: {err}"))
}

const fn get_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::BrightYellow.on_default())
        .usage(AnsiColor::Green.on_default())
        .literal(Style::new().fg_color(None).bold())
        .placeholder(AnsiColor::Green.on_default())
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Generate {
            apk,
            channels,
            output,
            template,
            clean,
            package,
            version_name,
            version_code,
        } => {
            let markets = parse_markets(&channels)
                .wrap_err_with(|| format!("reading market list {channels:?}"))?;
            if markets.is_empty() {
                eyre::bail!("no markets given");
            }

            let options = GenerateOptions {
                output_dir: output,
                template,
                clean,
                ..GenerateOptions::default()
            };
            let fixed;
            let inspector: &dyn PackageInspector = match package {
                Some(package) => {
                    fixed = PackageInfo {
                        package,
                        version_name: version_name.unwrap_or_default(),
                        version_code: version_code.unwrap_or_default(),
                        app_name: String::new(),
                    };
                    &fixed
                }
                None => &NoPackageInfo,
            };

            let report = generate(&apk, &markets, &options, inspector)
                .wrap_err_with(|| format!("generating from {}", apk.display()))?;
            for (market, path) in &report.written {
                println!("{market}: {}", path.display());
            }
            for (market, err) in &report.failures {
                eprintln!("{market}: FAILED: {err}");
            }
            println!(
                "{} of {} apks saved to {}",
                report.written.len(),
                markets.len(),
                options.output_dir.display()
            );
            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Show {
            apk,
            scheme,
            key,
            codec,
        } => {
            let config = codec.config(&key);
            let file = RawApk::open(&apk).wrap_err_with(|| format!("opening {}", apk.display()))?;
            let read = read_channel(file.as_bytes(), scheme, &config)
                .wrap_err_with(|| format!("reading channel from {}", apk.display()))?;

            match read {
                Some(read) => {
                    println!("Market: {}", read.channel(&key).unwrap_or("-"));
                    println!("Framing: {}", read.framing);
                    if let Some(strategy) = read.strategy {
                        println!("Strategy: {strategy}");
                    }
                    for (k, v) in read.record.iter().filter(|(k, _)| *k != key) {
                        println!("{k}: {v}");
                    }
                }
                None => println!("no market info"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Inspect { apk, codec } => {
            let config = codec.config(CHANNEL_KEY);
            let file = RawApk::open(&apk).wrap_err_with(|| format!("opening {}", apk.display()))?;
            let report = inspect(file.as_bytes(), &config)
                .wrap_err_with(|| format!("inspecting {}", apk.display()))?;

            let sections = &report.sections;
            println!("File size:          {}", file.len());
            println!(
                "Central directory:  [{}, {}) with {} records",
                sections.central_dir_start,
                sections.central_dir_end(),
                sections.central_dir_record_count
            );
            println!(
                "EOCD:               {} (comment {} bytes)",
                sections.eocd.offset, sections.eocd.comment_length
            );

            for attempt in &report.attempts {
                match &attempt.outcome {
                    Ok(Found::Block(range)) => println!(
                        "{:<18}  block [{}, {}) size {}",
                        attempt.strategy.to_string(),
                        range.start,
                        range.end,
                        range.size_in_header
                    ),
                    Ok(Found::Value { offset, len }) => println!(
                        "{:<18}  value at {offset} ({len} bytes)",
                        attempt.strategy.to_string()
                    ),
                    Err(err) => println!("{:<18}  {err}", attempt.strategy.to_string()),
                }
            }
            match &report.cross_check {
                Ok(_) => println!("Cross-check:        locators agree"),
                Err(err) => println!("Cross-check:        {err}"),
            }

            for entry in &report.entries {
                match entry {
                    Ok(entry) => {
                        let note = if entry.id == apkchannel::block::APK_SIGNATURE_SCHEME_V2_BLOCK_ID
                        {
                            " (v2 signature)"
                        } else if entry.id == config.block_id {
                            " (channel)"
                        } else {
                            ""
                        };
                        println!(
                            "  entry {:#010x} at {} ({} bytes){note}",
                            entry.id, entry.offset, entry.len
                        );
                    }
                    Err(err) => println!("  {err}"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
