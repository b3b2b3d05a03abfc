use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::UtcOffset;

use super::constants::*;
use super::error::ConfigError;
use super::metersetmap::MetersetMapConfig;

/// The supported MLC leaf geometries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MlcModel {
    #[default]
    Agility,
    Millennium,
    BrainLabM3,
}

impl MlcModel {
    /// Width in mm of every leaf pair, ordered along the jaw axis
    pub fn leaf_pair_widths(&self) -> Vec<f64> {
        match self {
            Self::Agility => expand_leaf_widths(&AGILITY_LEAF_PAIR_WIDTHS),
            Self::Millennium => expand_leaf_widths(&MILLENNIUM_LEAF_PAIR_WIDTHS),
            Self::BrainLabM3 => expand_leaf_widths(&BRAINLAB_M3_LEAF_PAIR_WIDTHS),
        }
    }
}

/// Structure representing the application configuration. Contains the engine geometry,
/// the trajectory log code table location and the iCom/Mosaiq connection settings.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub grid_resolution: f64,
    pub max_leaf_gap: f64,
    pub mlc_model: MlcModel,
    pub leaf_pair_widths: Option<Vec<f64>>,
    pub min_step_per_pixel: usize,
    pub gantry_tolerance: f64,
    pub trf_codes_path: Option<PathBuf>,
    pub icom_port: u16,
    pub icom_reads_per_flush: usize,
    pub icom_read_size: usize,
    pub icom_reconnect_delay_secs: u64,
    pub mosaiq_utc_offset: String,
    pub mosaiq_match_buffer_secs: i64,
    pub mosaiq_max_read_attempts: usize,
    pub output_path: Option<PathBuf>,
}

impl Default for Config {
    /// Generate a new Config with Agility geometry and the standard iCom settings
    fn default() -> Self {
        Self {
            grid_resolution: DEFAULT_GRID_RESOLUTION,
            max_leaf_gap: DEFAULT_MAX_LEAF_GAP,
            mlc_model: MlcModel::Agility,
            leaf_pair_widths: None,
            min_step_per_pixel: DEFAULT_MIN_STEP_PER_PIXEL,
            gantry_tolerance: DEFAULT_GANTRY_TOLERANCE,
            trf_codes_path: None,
            icom_port: ICOM_PORT,
            icom_reads_per_flush: ICOM_READS_PER_FLUSH,
            icom_read_size: ICOM_READ_SIZE,
            icom_reconnect_delay_secs: ICOM_RECONNECT_DELAY_SECS,
            mosaiq_utc_offset: String::from("+00:00"),
            mosaiq_match_buffer_secs: 0,
            mosaiq_max_read_attempts: MOSAIQ_MAX_READ_ATTEMPTS,
            output_path: None,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Explicit leaf widths take precedence over the MLC model
    pub fn get_leaf_pair_widths(&self) -> Vec<f64> {
        match &self.leaf_pair_widths {
            Some(widths) => widths.clone(),
            None => self.mlc_model.leaf_pair_widths(),
        }
    }

    pub fn metersetmap_config(&self) -> MetersetMapConfig {
        MetersetMapConfig {
            grid_resolution: self.grid_resolution,
            max_leaf_gap: self.max_leaf_gap,
            leaf_pair_widths: self.get_leaf_pair_widths(),
            min_step_per_pixel: self.min_step_per_pixel,
        }
    }

    /// The Mosaiq server's offset from UTC, given as +HH:MM or -HH:MM
    pub fn get_mosaiq_utc_offset(&self) -> Result<UtcOffset, ConfigError> {
        UtcOffset::parse(
            &self.mosaiq_utc_offset,
            format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
        )
        .map_err(|_| ConfigError::BadUtcOffset(self.mosaiq_utc_offset.clone()))
    }

    /// Get the directory meterset maps are written to, creating it if needed
    pub fn get_output_directory(&self) -> Result<PathBuf, ConfigError> {
        match &self.output_path {
            Some(path) => {
                if !path.exists() {
                    std::fs::create_dir_all(path)?;
                }
                Ok(path.clone())
            }
            None => Err(ConfigError::NoOutputPath),
        }
    }
}
