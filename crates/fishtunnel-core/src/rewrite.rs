//! Line rewriting applied to outbound lines before they hit the connection.
//!
//! The listener masks the version the engine reports about itself, so
//! `id name Stockfish 15.1 64-bit` goes out as `id name Stockfish Remote 64-bit`.
//! The connector relays lines verbatim.

use std::borrow::Cow;
use std::fmt;

use regex::Regex;

/// Engine name matched by [`VersionMask::stockfish`].
pub const DEFAULT_ENGINE_NAME: &str = "Stockfish";

/// Marker that replaces the version token.
pub const DEFAULT_MARKER: &str = "Remote";

/// Per-line transformation applied after a line is read and before it is
/// written to the connection.
pub trait LineRewrite: Send + Sync + fmt::Debug {
    /// Rewrite one line, including its terminator if it had one.
    fn rewrite<'a>(&self, line: &'a [u8]) -> Cow<'a, [u8]>;
}

/// Relay lines unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl LineRewrite for Passthrough {
    #[inline]
    fn rewrite<'a>(&self, line: &'a [u8]) -> Cow<'a, [u8]> {
        Cow::Borrowed(line)
    }
}

/// Replace `<name> <major>.<minor>` with `<name> <marker>` in lines that
/// contain it, keeping whatever comes before and after.
#[derive(Debug, Clone)]
pub struct VersionMask {
    pattern: Regex,
    name: String,
    marker: String,
}

impl VersionMask {
    pub fn new(name: &str, marker: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(
            r"^(?P<pre>.*){} [0-9]+\.[0-9]+(?P<post>.*)$",
            regex::escape(name)
        ))?;
        Ok(Self {
            pattern,
            name: name.to_string(),
            marker: marker.to_string(),
        })
    }

    /// Mask for Stockfish's `id name` banner.
    pub fn stockfish() -> Result<Self, regex::Error> {
        Self::new(DEFAULT_ENGINE_NAME, DEFAULT_MARKER)
    }
}

impl LineRewrite for VersionMask {
    fn rewrite<'a>(&self, line: &'a [u8]) -> Cow<'a, [u8]> {
        // Non-UTF-8 output cannot be a banner; relay it as-is.
        let Ok(text) = std::str::from_utf8(line) else {
            return Cow::Borrowed(line);
        };
        let (body, ending) = split_line_ending(text);
        let Some(caps) = self.pattern.captures(body) else {
            return Cow::Borrowed(line);
        };
        let rewritten = format!(
            "{}{} {}{}{ending}",
            &caps["pre"], self.name, self.marker, &caps["post"]
        );
        Cow::Owned(rewritten.into_bytes())
    }
}

/// Split `"text\r\n"` into `("text", "\r\n")`.
fn split_line_ending(line: &str) -> (&str, &str) {
    let body = line
        .strip_suffix('\n')
        .map_or(line, |l| l.strip_suffix('\r').unwrap_or(l));
    (body, &line[body.len()..])
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn mask(line: &str) -> String {
        let mask = VersionMask::stockfish().unwrap();
        String::from_utf8(mask.rewrite(line.as_bytes()).into_owned()).unwrap()
    }

    #[test]
    fn masks_id_name_banner() {
        assert_eq!(
            mask("id name Stockfish 15.1 64-bit\n"),
            "id name Stockfish Remote 64-bit\n"
        );
    }

    #[test]
    fn masks_startup_banner() {
        assert_eq!(
            mask("Stockfish 16.1 by the Stockfish developers (see AUTHORS file)\n"),
            "Stockfish Remote by the Stockfish developers (see AUTHORS file)\n"
        );
    }

    #[test]
    fn other_lines_pass_through() {
        assert_eq!(mask("uciok\n"), "uciok\n");
        assert_eq!(mask("bestmove e2e4 ponder e7e5\n"), "bestmove e2e4 ponder e7e5\n");
        assert_eq!(mask("id author the Stockfish developers\n"), "id author the Stockfish developers\n");
    }

    #[test]
    fn version_without_minor_is_untouched() {
        assert_eq!(mask("id name Stockfish 16\n"), "id name Stockfish 16\n");
    }

    #[test]
    fn preserves_crlf_and_missing_terminator() {
        assert_eq!(
            mask("id name Stockfish 15.1\r\n"),
            "id name Stockfish Remote\r\n"
        );
        assert_eq!(mask("id name Stockfish 15.1"), "id name Stockfish Remote");
    }

    #[test]
    fn unchanged_lines_are_borrowed() {
        let mask = VersionMask::stockfish().unwrap();
        assert!(matches!(mask.rewrite(b"readyok\n"), Cow::Borrowed(_)));
        assert!(matches!(mask.rewrite(&[0xff, 0xfe, b'\n']), Cow::Borrowed(_)));
    }

    #[test]
    fn custom_name_is_escaped() {
        let mask = VersionMask::new("Fish.NET", "Hidden").unwrap();
        let out = mask.rewrite(b"id name Fish.NET 2.3 beta\n");
        assert_eq!(out.as_ref(), b"id name Fish.NET Hidden beta\n");
        // '.' in the name must not match arbitrary characters
        let out = mask.rewrite(b"id name FishXNET 2.3\n");
        assert_eq!(out.as_ref(), b"id name FishXNET 2.3\n");
    }

    #[test]
    fn passthrough_is_identity() {
        assert_eq!(
            Passthrough.rewrite(b"id name Stockfish 15.1\n").as_ref(),
            b"id name Stockfish 15.1\n"
        );
    }
}
