use std::fs::File;
use std::io::Read;
use std::path::Path;

use fxhash::FxHashMap;
use serde::Deserialize;

use super::error::TrfCodeTableError;

/// Load the default code table for windows
#[cfg(target_family = "windows")]
fn load_default_codes() -> String {
    String::from(include_str!("data\\trf_codes.yml"))
}

/// Load the default code table for macos and linux
#[cfg(target_family = "unix")]
fn load_default_codes() -> String {
    String::from(include_str!("data/trf_codes.yml"))
}

/// TrfCodes maps the integer linac state and wedge codes of a trajectory log to their names,
/// and holds the sampling interval of the log table.
///
/// The table can differ between machine software versions, so a YAML file with the keys
/// `time_increment`, `linac_state_codes` and `wedge_codes` can replace the bundled one.
#[derive(Debug, Clone, Deserialize)]
pub struct TrfCodes {
    pub time_increment: f64,
    linac_state_codes: FxHashMap<u16, String>,
    wedge_codes: FxHashMap<u16, String>,
}

impl TrfCodes {
    /// Create a new TrfCodes
    /// If the path is None, we load the default that is bundled with the library
    pub fn new(path: Option<&Path>) -> Result<Self, TrfCodeTableError> {
        let mut contents = String::new();
        if let Some(p) = path {
            let mut file = File::open(p)?;
            file.read_to_string(&mut contents)?;
        } else {
            contents = load_default_codes();
        }

        let codes: Self = serde_yaml::from_str(&contents)?;
        // Zero rows of a mis-sized table must never pass as valid state codes
        if codes.linac_state_codes.contains_key(&0) {
            return Err(TrfCodeTableError::ZeroStateCode);
        }
        Ok(codes)
    }

    pub fn is_linac_state(&self, code: u16) -> bool {
        self.linac_state_codes.contains_key(&code)
    }

    pub fn linac_state(&self, code: u16) -> Option<&str> {
        self.linac_state_codes.get(&code).map(String::as_str)
    }

    pub fn wedge(&self, code: u16) -> Option<&str> {
        self.wedge_codes.get(&code).map(String::as_str)
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_codes() {
        let codes = TrfCodes::new(None).unwrap();
        assert_eq!(codes.time_increment, 0.04);
        assert_eq!(codes.linac_state(4), Some("Radiation On"));
        assert!(!codes.is_linac_state(0));
        assert_eq!(codes.wedge(0), Some("No Wedge"));
        assert_eq!(codes.wedge(7), None);
    }

    #[test]
    fn test_custom_codes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codes.yml");
        std::fs::write(
            &path,
            "time_increment: 0.02\nlinac_state_codes:\n  12: Beam\nwedge_codes:\n  0: None\n",
        )
        .unwrap();
        let codes = TrfCodes::new(Some(&path)).unwrap();
        assert_eq!(codes.time_increment, 0.02);
        assert_eq!(codes.linac_state(12), Some("Beam"));
        assert!(!codes.is_linac_state(4));

        std::fs::write(
            &path,
            "time_increment: 0.02\nlinac_state_codes:\n  0: Off\nwedge_codes: {}\n",
        )
        .unwrap();
        assert!(matches!(
            TrfCodes::new(Some(&path)),
            Err(TrfCodeTableError::ZeroStateCode)
        ));
    }
}
