//! Subject/level taxonomy and postal-sector geography tables.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tap_core::normalize_token;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub region: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

/// Synchronous key → value geography lookup. `None` means unknown.
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, postal_code: &str) -> Option<GeoPoint>;
}

#[derive(Debug, Clone, Deserialize)]
struct SectorsYaml {
    regions: Vec<RegionYaml>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegionYaml {
    region: String,
    sectors: Vec<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

const DEFAULT_SECTORS_YAML: &str = r#"
regions:
  - region: central
    latitude: 1.2903
    longitude: 103.8520
    sectors: ["01","02","03","04","05","06","07","08","09","10","11","12","13","14","15","16","17","18","19","20","21","22","23","24","25","26","27","28","29","30","31","32","33","34","35","36","37","38","39","40","41","58","59","77","78"]
  - region: east
    latitude: 1.3530
    longitude: 103.9440
    sectors: ["42","43","44","45","46","47","48","49","50","51","52","81"]
  - region: north-east
    latitude: 1.3720
    longitude: 103.8930
    sectors: ["53","54","55","56","57","79","80","82"]
  - region: west
    latitude: 1.3400
    longitude: 103.7070
    sectors: ["60","61","62","63","64","65","66","67","68","69","70","71"]
  - region: north
    latitude: 1.4360
    longitude: 103.7860
    sectors: ["72","73","75","76"]
"#;

/// Postal sector (first two digits) → region table.
#[derive(Debug, Clone)]
pub struct SectorTable {
    sectors: HashMap<String, GeoPoint>,
}

impl SectorTable {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let parsed: SectorsYaml = serde_yaml::from_str(yaml).context("parsing sector table")?;
        let mut sectors = HashMap::new();
        for region in parsed.regions {
            let point = GeoPoint {
                region: region.region.clone(),
                latitude: region.latitude,
                longitude: region.longitude,
            };
            for sector in region.sectors {
                sectors.insert(sector, point.clone());
            }
        }
        Ok(Self { sectors })
    }

    pub fn builtin() -> Self {
        // The embedded table is covered by tests.
        Self::from_yaml_str(DEFAULT_SECTORS_YAML).unwrap_or_else(|_| Self {
            sectors: HashMap::new(),
        })
    }

    /// Loads `sectors.yaml` from `dir`, falling back to the built-in table.
    pub fn load_or_builtin(dir: Option<&Path>) -> Self {
        let Some(path) = dir.map(|d| d.join("sectors.yaml")) else {
            return Self::builtin();
        };
        if !path.exists() {
            return Self::builtin();
        }
        match fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))
            .and_then(|yaml| Self::from_yaml_str(&yaml))
        {
            Ok(table) => table,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "falling back to built-in sector table");
                Self::builtin()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }
}

impl GeoLookup for SectorTable {
    fn lookup(&self, postal_code: &str) -> Option<GeoPoint> {
        let digits = postal_code
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect::<String>();
        if digits.len() != 6 {
            return None;
        }
        self.sectors.get(&digits[..2]).cloned()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TaxonomyYaml {
    subjects: Vec<SubjectYaml>,
    levels: Vec<LevelYaml>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubjectYaml {
    code: String,
    #[serde(default)]
    aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LevelYaml {
    code: String,
    #[serde(default)]
    aliases: Vec<String>,
    /// Highest grade number for graded levels (e.g. 6 for primary).
    #[serde(default)]
    grades: Option<u8>,
}

const DEFAULT_TAXONOMY_YAML: &str = r#"
subjects:
  - code: math
    aliases: [mathematics, maths, e math, e maths, emath, elementary math, elementary mathematics]
  - code: a-math
    aliases: [amath, additional math, additional mathematics]
  - code: english
    aliases: [eng, english language, el]
  - code: science
    aliases: [sci, general science]
  - code: physics
    aliases: [phy, pure physics]
  - code: chemistry
    aliases: [chem, pure chemistry]
  - code: biology
    aliases: [bio, pure biology]
  - code: combined-science
    aliases: [combined sci, combined science, physics chemistry, chemistry biology]
  - code: chinese
    aliases: [cl, chinese language, mandarin, higher chinese]
  - code: malay
    aliases: [ml, malay language]
  - code: tamil
    aliases: [tl, tamil language]
  - code: economics
    aliases: [econs, econ]
  - code: geography
    aliases: [geog]
  - code: history
    aliases: [hist]
  - code: literature
    aliases: [lit, english literature]
  - code: accounting
    aliases: [poa, principles of accounts]
  - code: computing
    aliases: [computer science, coding, programming]
  - code: gp
    aliases: [general paper]
  - code: phonics
    aliases: []
  - code: music
    aliases: [piano]
levels:
  - code: preschool
    aliases: [pre school, kindergarten, k1, k2, nursery]
  - code: pri
    aliases: [primary, pri, p]
    grades: 6
  - code: sec
    aliases: [secondary, sec, s]
    grades: 5
  - code: jc
    aliases: [junior college, jc, j]
    grades: 2
  - code: ib
    aliases: [ib, international baccalaureate, ibdp]
  - code: igcse
    aliases: [igcse]
  - code: poly
    aliases: [polytechnic, poly, diploma]
  - code: uni
    aliases: [university, uni, degree, undergraduate]
  - code: adult
    aliases: [adult, working adult]
"#;

#[derive(Debug, Clone)]
struct LevelFamily {
    code: String,
    grades: Option<u8>,
    pattern: Regex,
}

/// Canonical subject and level codes with case/punctuation-insensitive aliases.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    subjects: HashMap<String, String>,
    levels: Vec<LevelFamily>,
}

impl Taxonomy {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let parsed: TaxonomyYaml = serde_yaml::from_str(yaml).context("parsing taxonomy")?;

        let mut subjects = HashMap::new();
        for subject in parsed.subjects {
            subjects.insert(normalize_token(&subject.code), subject.code.clone());
            for alias in &subject.aliases {
                subjects.insert(normalize_token(alias), subject.code.clone());
            }
        }

        let mut levels = Vec::with_capacity(parsed.levels.len());
        for level in parsed.levels {
            let mut aliases = level
                .aliases
                .iter()
                .chain(std::iter::once(&level.code))
                .map(|a| regex::escape(&normalize_token(a)).replace("\\ ", "\\s*").replace(' ', "\\s*"))
                .collect::<Vec<_>>();
            // Longest alias first so "sec" wins over "s".
            aliases.sort_by_key(|a| std::cmp::Reverse(a.len()));
            let alternation = aliases.join("|");
            let pattern = if level.grades.is_some() {
                format!(r"\b(?:{alternation})\s*([1-9])(?:\s*(?:to|and|or)?\s*([1-9]))?\b|\b(?:{alternation})\b")
            } else {
                format!(r"\b(?:{alternation})\b")
            };
            let pattern = Regex::new(&pattern)
                .with_context(|| format!("compiling level pattern for {}", level.code))?;
            levels.push(LevelFamily {
                code: level.code,
                grades: level.grades,
                pattern,
            });
        }
        Ok(Self { subjects, levels })
    }

    pub fn builtin() -> Self {
        Self::from_yaml_str(DEFAULT_TAXONOMY_YAML).unwrap_or_else(|_| Self {
            subjects: HashMap::new(),
            levels: Vec::new(),
        })
    }

    /// Loads `taxonomy.yaml` from `dir`, falling back to the built-in taxonomy.
    pub fn load_or_builtin(dir: Option<&Path>) -> Self {
        let Some(path) = dir.map(|d| d.join("taxonomy.yaml")) else {
            return Self::builtin();
        };
        if !path.exists() {
            return Self::builtin();
        }
        match fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))
            .and_then(|yaml| Self::from_yaml_str(&yaml))
        {
            Ok(taxonomy) => taxonomy,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "falling back to built-in taxonomy");
                Self::builtin()
            }
        }
    }

    pub fn canonical_subject(&self, text: &str) -> Option<String> {
        self.subjects.get(&normalize_token(text)).cloned()
    }

    /// Splits a free-text subject list ("Math & Physics") and canonicalizes each part.
    /// Unknown parts are returned in the second vector as normalized text.
    pub fn canonical_subjects(&self, items: &[String]) -> (Vec<String>, Vec<String>) {
        let mut known = Vec::new();
        let mut unknown = Vec::new();
        for item in items {
            let whole = self.canonical_subject(item);
            if let Some(code) = whole {
                push_unique(&mut known, code);
                continue;
            }
            for part in item.split(|c| matches!(c, '&' | ',' | '/' | '+' | ';')).flat_map(|p| p.split(" and ")) {
                let token = normalize_token(part);
                if token.is_empty() {
                    continue;
                }
                match self.subjects.get(&token) {
                    Some(code) => push_unique(&mut known, code.clone()),
                    None => push_unique(&mut unknown, token),
                }
            }
        }
        (known, unknown)
    }

    /// Level codes mentioned in `text`, e.g. "Sec 3/4" → `["sec3", "sec4"]`.
    pub fn canonical_levels(&self, text: &str) -> Vec<String> {
        let normalized = normalize_token(text);
        let mut out = Vec::new();
        for family in &self.levels {
            for caps in family.pattern.captures_iter(&normalized) {
                let first = caps.get(1).and_then(|m| m.as_str().parse::<u8>().ok());
                let second = caps.get(2).and_then(|m| m.as_str().parse::<u8>().ok());
                match (family.grades, first) {
                    (Some(max), Some(lo)) if lo >= 1 && lo <= max => {
                        let hi = second.filter(|hi| *hi >= lo && *hi <= max).unwrap_or(lo);
                        for grade in lo..=hi {
                            push_unique(&mut out, format!("{}{}", family.code, grade));
                        }
                    }
                    (Some(_), Some(_)) => {}
                    _ => push_unique(&mut out, family.code.clone()),
                }
            }
        }
        out
    }
}

fn push_unique(out: &mut Vec<String>, value: String) {
    if !out.contains(&value) {
        out.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builtin_tables_load() {
        assert!(SectorTable::builtin().len() > 70);
        let taxonomy = Taxonomy::builtin();
        assert_eq!(taxonomy.canonical_subject("E-Maths"), Some("math".to_string()));
    }

    #[test]
    fn subjects_split_and_canonicalize() {
        let taxonomy = Taxonomy::builtin();
        let (known, unknown) = taxonomy.canonical_subjects(&[
            "Math & Physics".to_string(),
            "Chem".to_string(),
            "Underwater basket weaving".to_string(),
        ]);
        assert_eq!(known, vec!["math", "physics", "chemistry"]);
        assert_eq!(unknown, vec!["underwater basket weaving"]);
    }

    #[test]
    fn levels_expand_to_codes() {
        let taxonomy = Taxonomy::builtin();
        assert_eq!(taxonomy.canonical_levels("Sec 3"), vec!["sec3"]);
        assert_eq!(taxonomy.canonical_levels("P5"), vec!["pri5"]);
        assert_eq!(taxonomy.canonical_levels("Secondary 3/4"), vec!["sec3", "sec4"]);
        assert_eq!(taxonomy.canonical_levels("JC1 H2"), vec!["jc1"]);
        assert_eq!(taxonomy.canonical_levels("IGCSE or IB"), vec!["ib", "igcse"]);
        assert!(taxonomy.canonical_levels("Sec 9").is_empty());
    }

    #[test]
    fn postal_codes_map_to_regions() {
        let table = SectorTable::builtin();
        assert_eq!(table.lookup("520123").map(|p| p.region), Some("east".to_string()));
        assert_eq!(table.lookup("S(650123)").map(|p| p.region), Some("west".to_string()));
        assert!(table.lookup("12345").is_none());
        assert!(table.lookup("990000").is_none());
    }

    #[test]
    fn tables_load_from_directory_with_fallback() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("sectors.yaml"),
            "regions:\n  - region: test-zone\n    sectors: [\"99\"]\n",
        )
        .expect("write sectors");
        std::fs::write(dir.path().join("taxonomy.yaml"), "not: [valid").expect("write taxonomy");

        let table = SectorTable::load_or_builtin(Some(dir.path()));
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("990000").map(|p| p.region), Some("test-zone".to_string()));

        let taxonomy = Taxonomy::load_or_builtin(Some(dir.path()));
        assert_eq!(taxonomy.canonical_subject("maths"), Some("math".to_string()));
    }
}
