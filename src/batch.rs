//! Batch generation of legacy-tagged APKs, one per market.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::RawApk;
use crate::error::{Error, Result};
use crate::legacy::{self, read_trailer};
use crate::view::{ByteView, Endian};
use crate::zip::locate_sections;

/// Output file name used when package metadata is available.
pub const DEFAULT_TEMPLATE: &str = "${name}-${package}-v${vname}-${vcode}-${market}${ext}";

/// Replaces [`DEFAULT_TEMPLATE`] when package metadata could not be read.
pub const FALLBACK_TEMPLATE: &str = "${name}-${market}${ext}";

/// Characters replaced with `_` in market names.
const FILENAME_HOSTILE: &[char] = &['\\', '/', ':', '*', '?', '"', '\'', '<', '>', '|'];

// ============================================================================
// Collaborators
// ============================================================================

/// Metadata read from the manifest and resource table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageInfo {
    pub package: String,
    pub version_name: String,
    pub version_code: String,
    pub app_name: String,
}

/// Extracts [`PackageInfo`] from APK bytes.
///
/// Parsing the binary manifest is left to the implementor; a failure only
/// changes how output files are named.
pub trait PackageInspector {
    fn inspect(&self, apk: &[u8]) -> eyre::Result<PackageInfo>;
}

/// Inspector for callers without a manifest parser; always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPackageInfo;

impl PackageInspector for NoPackageInfo {
    fn inspect(&self, _apk: &[u8]) -> eyre::Result<PackageInfo> {
        Err(eyre::eyre!("no package inspector configured"))
    }
}

/// Fixed metadata, e.g. supplied on the command line.
impl PackageInspector for PackageInfo {
    fn inspect(&self, _apk: &[u8]) -> eyre::Result<PackageInfo> {
        Ok(self.clone())
    }
}

// ============================================================================
// Market Lists
// ============================================================================

/// Parse a market list file: one `name#comment` per line, blank lines skipped.
pub fn parse_market_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split('#').next())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse `@path` as a market list file, anything else as a comma-separated
/// list.
///
/// Names are made safe for file names and de-duplicated, keeping first-seen
/// order.
pub fn parse_markets(value: &str) -> Result<Vec<String>> {
    let names = match value.strip_prefix('@') {
        Some(path) => parse_market_list(&fs::read_to_string(path)?),
        None => value
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect(),
    };

    let mut markets: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = sanitize_market(&name);
        if !markets.contains(&name) {
            markets.push(name);
        }
    }
    Ok(markets)
}

pub fn sanitize_market(name: &str) -> String {
    name.replace(FILENAME_HOSTILE, "_")
}

// ============================================================================
// Naming
// ============================================================================

/// Substitute `${key}` placeholders. Unknown placeholders are kept verbatim.
pub fn render_name(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            rest = &rest[open..];
            break;
        };

        let key = &after[..close];
        match vars.iter().find(|(k, _)| *k == key) {
            Some((_, value)) => out.push_str(value),
            None => out.push_str(&rest[open..open + 2 + close + 1]),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Base name and extension (with its dot) of `path`.
fn split_file_name(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

/// Copy `src` to `dst`, creating parent directories of `dst`.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

// ============================================================================
// Generation
// ============================================================================

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub output_dir: PathBuf,
    pub template: String,
    pub endian: Endian,
    /// Delete `*.apk` files already in `output_dir` before writing.
    pub clean: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("apks"),
            template: DEFAULT_TEMPLATE.to_owned(),
            endian: Endian::Little,
            clean: false,
        }
    }
}

/// Outcome of a batch: every market either wrote a verified file or failed.
#[derive(Debug, Default)]
pub struct GenerateReport {
    pub written: Vec<(String, PathBuf)>,
    pub failures: Vec<(String, Error)>,
}

impl GenerateReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Write one legacy-tagged copy of `src` per market into the output directory.
///
/// Each copy is read back and deleted if it does not carry its market. A
/// failing market is logged and recorded, and the batch moves on.
///
/// When the inspector fails, the default template is swapped for
/// [`FALLBACK_TEMPLATE`]. A custom template is kept and its package fields
/// render empty.
///
/// # Errors
///
/// For problems with the source itself (unreadable, not a ZIP, already
/// tagged) and for I/O failures while cleaning the output directory.
pub fn generate(
    src: &Path,
    markets: &[String],
    options: &GenerateOptions,
    inspector: &dyn PackageInspector,
) -> Result<GenerateReport> {
    let (name, ext) = split_file_name(src);
    let (template, package) = {
        let apk = RawApk::open(src)?;
        locate_sections(&apk.view(options.endian))?;
        if let Some(existing) = legacy::read_market(apk.as_bytes(), options.endian)? {
            return Err(Error::AlreadyTagged { existing });
        }
        match inspector.inspect(apk.as_bytes()) {
            Ok(package) => (options.template.as_str(), package),
            Err(err) if options.template == DEFAULT_TEMPLATE => {
                warn!(error = %err, "package info unavailable, using fallback name template");
                (FALLBACK_TEMPLATE, PackageInfo::default())
            }
            Err(err) => {
                warn!(error = %err, "package info unavailable");
                (options.template.as_str(), PackageInfo::default())
            }
        }
    };

    if options.clean {
        remove_apks(&options.output_dir, src)?;
    }

    let mut report = GenerateReport::default();
    for market in markets {
        let file_name = render_name(
            template,
            &[
                ("name", name.as_str()),
                ("package", package.package.as_str()),
                ("vname", package.version_name.as_str()),
                ("vcode", package.version_code.as_str()),
                ("market", market.as_str()),
                ("ext", ext.as_str()),
            ],
        );
        let dst = options.output_dir.join(file_name);

        match write_verified(src, &dst, market, options.endian) {
            Ok(()) => {
                info!(market, dst = %dst.display(), "generated");
                report.written.push((market.clone(), dst));
            }
            Err(err) => {
                warn!(market, error = %err, "market failed");
                report.failures.push((market.clone(), err));
            }
        }
    }
    Ok(report)
}

/// Delete the `*.apk` files directly inside `dir`, except `keep`. A missing
/// directory is left alone.
fn remove_apks(dir: &Path, keep: &Path) -> Result<()> {
    let keep = fs::canonicalize(keep)?;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let path = entry?.path();
        let is_apk = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("apk"));
        if is_apk && path.is_file() && fs::canonicalize(&path)? != keep {
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "removed old apk");
        }
    }
    Ok(())
}

fn write_verified(src: &Path, dst: &Path, market: &str, endian: Endian) -> Result<()> {
    legacy::write_legacy_file(src, dst, market, endian)?;

    let found = {
        let written = RawApk::open(dst)?;
        match read_trailer(&ByteView::new(written.as_bytes(), endian)) {
            Ok(trailer) => Some(trailer.raw),
            Err(err) if err.is_absence() => None,
            Err(err) => return Err(err),
        }
    };
    if found.as_deref() == Some(market) {
        debug!(market, "verified");
        return Ok(());
    }

    if let Err(err) = fs::remove_file(dst) {
        warn!(dst = %dst.display(), error = %err, "could not remove unverified output");
    }
    Err(Error::VerifyFailed {
        path: dst.to_path_buf(),
        expected: market.to_owned(),
        found,
    })
}
