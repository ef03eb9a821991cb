use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_SPEED: f64 = 1.0;

/// Relative transfer speed per image name. Images that no section names
/// weigh `DEFAULT_SPEED`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeedWeights {
    speeds: BTreeMap<String, f64>,
}

impl SpeedWeights {
    pub fn get(&self, image: &str) -> f64 {
        self.speeds.get(image).copied().unwrap_or(DEFAULT_SPEED)
    }

    pub fn set(&mut self, image: impl Into<String>, speed: f64) {
        self.speeds.insert(image.into(), speed);
    }

    pub fn len(&self) -> usize {
        self.speeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speeds.is_empty()
    }

    pub fn weigh(&self, image: &str, bytes: u64) -> f64 {
        self.get(image) * bytes as f64
    }
}

pub fn load(path: &Path) -> Result<SpeedWeights> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read speed conf {}: {e}", path.display())))?;
    parse(&data).map_err(|e| Error::config(format!("{}: {e}", path.display())))
}

#[derive(Debug)]
struct Section {
    name: String,
    line: usize,
    items: Vec<(String, String)>,
}

/// Parses the speed-weight file:
///
/// ```text
/// [flash]
/// speed=100.0
/// bin=vela_ap.bin,vela_test.bin
/// ```
pub fn parse(data: &str) -> Result<SpeedWeights> {
    let mut sections: Vec<Section> = Vec::new();
    for (idx, raw) in data.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let Some(name) = rest.strip_suffix(']') else {
                return Err(Error::config(format!("line {lineno}: unterminated section header")));
            };
            sections.push(Section {
                name: name.trim().to_string(),
                line: lineno,
                items: Vec::new(),
            });
            continue;
        }
        let Some((key, value)) = split_item(line) else {
            return Err(Error::config(format!("line {lineno}: expected 'key = value'")));
        };
        let Some(section) = sections.last_mut() else {
            return Err(Error::config(format!(
                "line {lineno}: '{key}' appears before any [section]"
            )));
        };
        section.items.push((key.to_ascii_lowercase(), value.to_string()));
    }

    let mut out = SpeedWeights::default();
    for section in &sections {
        let keys: Vec<&str> = section.items.iter().map(|(k, _)| k.as_str()).collect();
        if keys != ["speed", "bin"] {
            return Err(Error::config(format!(
                "section [{}] (line {}) must contain exactly 'speed' then 'bin', got [{}]",
                section.name,
                section.line,
                keys.join(", ")
            )));
        }
        let raw_speed = section.items[0].1.as_str();
        let speed: f64 = raw_speed.parse().map_err(|_| {
            Error::config(format!("section [{}]: invalid speed '{raw_speed}'", section.name))
        })?;
        if !speed.is_finite() || speed <= 0.0 {
            return Err(Error::config(format!(
                "section [{}]: speed must be a positive number, got {speed}",
                section.name
            )));
        }
        for bin in section.items[1].1.split(',').map(str::trim) {
            if bin.is_empty() {
                continue;
            }
            debug!("speed {speed} for {bin} from [{}]", section.name);
            out.set(bin, speed);
        }
    }
    Ok(out)
}

fn split_item(line: &str) -> Option<(&str, &str)> {
    let pos = line.find(['=', ':'])?;
    let key = line[..pos].trim();
    if key.is_empty() {
        return None;
    }
    Some((key, line[pos + 1..].trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_defaults() {
        let w = parse(
            r#"
# media speeds
[flash]
speed=100.0
bin=vela_ap.bin, vela_test.bin
[sdcard]
Speed: 50
bin = vela_app.bin
"#,
        )
        .unwrap();
        assert_eq!(w.get("vela_ap.bin"), 100.0);
        assert_eq!(w.get("vela_test.bin"), 100.0);
        assert_eq!(w.get("vela_app.bin"), 50.0);
        assert_eq!(w.get("vela_other.bin"), DEFAULT_SPEED);
        assert_eq!(w.weigh("vela_app.bin", 4), 200.0);
    }

    #[test]
    fn empty_file_means_default_weights() {
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn wrong_key_order_rejected() {
        let err = parse("[flash]\nbin=vela_ap.bin\nspeed=2\n").unwrap_err();
        assert!(err.to_string().contains("'speed' then 'bin'"), "{err}");
    }

    #[test]
    fn extra_key_rejected() {
        assert!(parse("[flash]\nspeed=2\nbin=vela_ap.bin\nother=1\n").is_err());
    }

    #[test]
    fn non_positive_speed_rejected() {
        assert!(parse("[flash]\nspeed=0\nbin=vela_ap.bin\n").is_err());
        assert!(parse("[flash]\nspeed=fast\nbin=vela_ap.bin\n").is_err());
    }

    #[test]
    fn item_outside_section_rejected() {
        assert!(parse("speed=2\n").is_err());
    }
}
