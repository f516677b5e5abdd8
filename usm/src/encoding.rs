//! Resolves the named character encoding applied to `@UTF` *payload* string
//! values (filenames, codec tags). Structural names — the table name and
//! column names — are always ASCII and are decoded as UTF-8 regardless of
//! this setting.

use encoding_rs::Encoding;

/// The reference implementation's default: CRI titles are overwhelmingly
/// Japanese releases, and `shift-jis` is what `wannacri.py` defaults every
/// subcommand's `--encoding` flag to.
pub const DEFAULT: &Encoding = encoding_rs::SHIFT_JIS;

/// Resolves a user-facing label (`"shift-jis"`, `"utf-8"`, `"euc-jp"`, ...)
/// to an [`Encoding`]. Labels are matched the way the Encoding Standard
/// defines (case-insensitive, whitespace-trimmed); unrecognized labels fall
/// back to [`DEFAULT`] rather than failing outright, mirroring the
/// reference implementation, which never validates `--encoding` either.
pub fn resolve(label: &str) -> &'static Encoding {
    Encoding::for_label(label.as_bytes()).unwrap_or(DEFAULT)
}
