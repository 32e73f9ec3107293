use std::collections::HashSet;

/// One fixed-resolution HLS rendition. Ladder order is master playlist order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenditionSpec {
    pub label: String,
    pub width: u32,
    pub height: u32,
    /// Target video bitrate in kbit/s.
    pub bitrate_kbps: u32,
}

impl RenditionSpec {
    pub fn new(label: &str, width: u32, height: u32, bitrate_kbps: u32) -> Self {
        Self {
            label: label.to_string(),
            width,
            height,
            bitrate_kbps,
        }
    }

    /// Peak bandwidth advertised in the master playlist, bits per second.
    pub fn bandwidth(&self) -> u64 {
        u64::from(self.bitrate_kbps) * 1000
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// ffmpeg-style rate string, e.g. `800k`.
    pub fn rate_arg(&self) -> String {
        format!("{}k", self.bitrate_kbps)
    }

    pub fn bufsize_arg(&self) -> String {
        format!("{}k", self.bitrate_kbps * 2)
    }

    /// Playlist path relative to the artifact root.
    pub fn playlist_path(&self) -> String {
        format!("{}/index.m3u8", self.label)
    }
}

pub fn default_ladder() -> Vec<RenditionSpec> {
    vec![
        RenditionSpec::new("240p", 426, 240, 400),
        RenditionSpec::new("360p", 640, 360, 800),
        RenditionSpec::new("720p", 1280, 720, 2800),
    ]
}

/// Parses `label:WxH:bitrate` entries separated by commas, e.g.
/// `240p:426x240:400k,720p:1280x720:2800k`.
pub fn parse_ladder(raw: &str) -> Result<Vec<RenditionSpec>, String> {
    let mut ladder = Vec::new();
    let mut seen = HashSet::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let spec = parse_entry(entry)?;
        if !seen.insert(spec.label.clone()) {
            return Err(format!("duplicate rendition label '{}'", spec.label));
        }
        ladder.push(spec);
    }

    if ladder.is_empty() {
        return Err("rendition ladder is empty".to_string());
    }

    Ok(ladder)
}

fn parse_entry(entry: &str) -> Result<RenditionSpec, String> {
    let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
    let [label, size, bitrate] = parts.as_slice() else {
        return Err(format!("'{}' is not of the form label:WxH:bitrate", entry));
    };

    if label.is_empty() || !label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(format!("label '{}' must be lowercase alphanumeric", label));
    }

    let (width, height) = size
        .split_once('x')
        .and_then(|(w, h)| Some((w.parse::<u32>().ok()?, h.parse::<u32>().ok()?)))
        .ok_or_else(|| format!("size '{}' must be WIDTHxHEIGHT", size))?;

    // libx264 with 4:2:0 chroma rejects odd dimensions
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(format!("size '{}' must be non-zero and even", size));
    }

    let bitrate_kbps = parse_bitrate(bitrate)?;

    Ok(RenditionSpec::new(label, width, height, bitrate_kbps))
}

fn parse_bitrate(raw: &str) -> Result<u32, String> {
    let lower = raw.to_ascii_lowercase();
    let kbps = if let Some(m) = lower.strip_suffix('m') {
        m.parse::<u32>().ok().and_then(|v| v.checked_mul(1000))
    } else {
        lower.strip_suffix('k').unwrap_or(&lower).parse::<u32>().ok()
    };

    match kbps {
        Some(v) if v > 0 => Ok(v),
        _ => Err(format!("bitrate '{}' must be a positive number of kbit/s", raw)),
    }
}
