//! The source-map stitcher: merges each module's offset-shifted raw
//! source map into one output generator via the `sourcemap` crate. Only the
//! in-process variant is implemented; an auxiliary-worker-process variant
//! is an implementer's choice this crate doesn't take (see DESIGN.md).

use std::io::Cursor;
use std::path::Path;

use sourcemap::{SourceMap, SourceMapBuilder};

use crate::error::{BundlerError, BundlerResult};

/// Accumulates per-module raw source maps, shifting each by the line
/// offset at which its wrapped chunk landed in the output, and produces
/// one merged map.
pub struct SourceMapStitcher {
    builder: SourceMapBuilder,
}

impl SourceMapStitcher {
    pub fn new(output_file: &str) -> Self {
        let mut builder = SourceMapBuilder::new(Some(output_file));
        builder.set_file(Some(output_file));
        Self { builder }
    }

    /// Appends `raw_source_map` (a module's own source map, as produced by
    /// the `ParserEngine`) to the stitched output, shifting every token by
    /// `line_offset` lines to account for where the module's wrapped chunk
    /// was placed in the bundle.
    pub fn append(
        &mut self,
        apath: &Path,
        raw_source_map: &str,
        line_offset: u32,
    ) -> BundlerResult<()> {
        let source_map = SourceMap::from_reader(Cursor::new(raw_source_map.as_bytes()))
            .map_err(|e| BundlerError::internal(format!("invalid source map for {}: {e}", apath.display())))?;

        for token in source_map.tokens() {
            let Some(src) = token.get_source() else {
                continue;
            };
            let src_id = self.builder.add_source(src);
            if let Some(contents) = token.get_source_view().and_then(|v| v.source()) {
                self.builder.set_source_contents(src_id, Some(contents));
            }
            self.builder.add_raw(
                token.get_dst_line() + line_offset,
                token.get_dst_col(),
                token.get_src_line(),
                token.get_src_col(),
                Some(src_id),
                token.get_name(),
            );
        }

        Ok(())
    }

    /// Serializes the stitched map to a JSON string.
    pub fn save(&self) -> BundlerResult<String> {
        let map = self.builder.clone().into_sourcemap();
        let mut out = Vec::new();
        map.to_writer(&mut out)
            .map_err(|e| BundlerError::internal(format!("failed to serialize source map: {e}")))?;
        String::from_utf8(out)
            .map_err(|e| BundlerError::internal(format!("source map is not valid utf-8: {e}")))
    }
}
