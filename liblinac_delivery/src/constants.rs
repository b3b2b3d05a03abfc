// Engine defaults
pub const DEFAULT_GRID_RESOLUTION: f64 = 1.0;
pub const DEFAULT_MAX_LEAF_GAP: f64 = 400.0;
pub const DEFAULT_MIN_STEP_PER_PIXEL: usize = 10;
pub const MIN_TIME_STEPS: usize = 10;
/// Tolerance used when placing a transition sub-grid into the full grid
pub const GRID_MATCH_TOLERANCE: f64 = 1.0e-4;

/// Masked deliveries have their monitor units rounded to this many decimals
pub const MASK_MU_DECIMALS: i32 = 7;
pub const DEFAULT_GANTRY_TOLERANCE: f64 = 3.0;

pub const CM_TO_MM: f64 = 10.0;
pub const LEAF_PAIRS: usize = 80;

// Trajectory log layout
/// Supported (row width in bytes, linac state column) pairs
pub const TRF_ROW_LAYOUTS: [(usize, usize); 2] = [(700, 2), (708, 6)];
pub const TRF_BASE_COLUMNS: usize = 350;
pub const TRF_EXTRA_COLUMNS: usize = 4;
pub const TRF_HEADER_ROW_SKIPS: usize = 6;
pub const TRF_SIGNED_OFFSET: u32 = 65536;
pub const TRF_SIGNED_THRESHOLD: u32 = 32768;
pub const TRF_TIME_DECIMALS: i32 = 2;

// iCom
pub const ICOM_PORT: u16 = 1706;
pub const ICOM_READS_PER_FLUSH: usize = 120;
pub const ICOM_READ_SIZE: usize = 16384;
pub const ICOM_RECONNECT_DELAY_SECS: u64 = 5;
/// Record start precedes the timestamp signature by this many bytes
pub const ICOM_TIMESTAMP_OFFSET: usize = 8;
/// Payload marking a key as absent at this position in the record
pub const ICOM_ABSENT_SENTINEL: &str = "-32767";
pub const ICOM_MLC_ITEMS: usize = 160;
pub const ICOM_JAW_ITEMS: usize = 2;
pub const HOLDING_DIR: &str = "holding";
pub const PROCESSING_DIR: &str = "processing";

// Mosaiq
/// Byte appended to every odd length leaf blob. Empirical, possibly a vendor bug.
pub const MOSAIQ_ODD_BYTE_PAD: u8 = 0x00;
pub const MOSAIQ_LEAF_UNITS_PER_CM: f64 = 100.0;
pub const MOSAIQ_MAX_READ_ATTEMPTS: usize = 10;

/// Agility, 80 pairs of 5 mm
pub const AGILITY_LEAF_PAIR_WIDTHS: [(usize, f64); 1] = [(80, 5.0)];
/// Millennium, 10 x 10 mm then 40 x 5 mm then 10 x 10 mm
pub const MILLENNIUM_LEAF_PAIR_WIDTHS: [(usize, f64); 3] = [(10, 10.0), (40, 5.0), (10, 10.0)];
/// BrainLab m3 micro-MLC
pub const BRAINLAB_M3_LEAF_PAIR_WIDTHS: [(usize, f64); 5] =
    [(3, 5.5), (3, 4.5), (14, 3.0), (3, 4.5), (3, 5.5)];

/// Expand a run-length leaf width table into one width per pair
pub fn expand_leaf_widths(runs: &[(usize, f64)]) -> Vec<f64> {
    runs.iter()
        .flat_map(|(count, width)| std::iter::repeat(*width).take(*count))
        .collect()
}
