//! Shell stand-ins for ffmpeg so pipeline tests run without a real encoder.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Writes segments and a rendition playlist where real ffmpeg would.
pub const HLS_ENCODER: &str = r##"#!/bin/sh
seg=""
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -hls_segment_filename) seg="$2"; shift 2 ;;
    *) out="$1"; shift ;;
  esac
done
echo "out_time_us=1000000" >&2
echo "progress=end" >&2
printf 'segment' > "$(printf "$seg" 0)"
printf 'segment' > "$(printf "$seg" 1)"
printf '#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:4.0,\nsegment_000.ts\n#EXTINF:4.0,\nsegment_001.ts\n#EXT-X-ENDLIST\n' > "$out"
"##;

pub const FAILING_ENCODER: &str = r##"#!/bin/sh
echo "progress=continue" >&2
echo "source.mp4: Invalid data found when processing input" >&2
exit 3
"##;

pub const HANGING_ENCODER: &str = r##"#!/bin/sh
exec sleep 30
"##;

pub fn write_stub_encoder(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("ffmpeg-stub");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
