use std::path::PathBuf;
use thiserror::Error;

use super::listener_status::ListenerStatus;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("Cannot resolve the sign of the 180 degree angle at index {index}; neighbours disagree ({left} vs {right})")]
    AngleAmbiguous { index: usize, left: f64, right: f64 },
    #[error("Expected an MLC array with two banks, found {0}")]
    BadBankCount(usize),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Delivery attributes have mismatched lengths -- monitor units: {mu}, gantry: {gantry}, collimator: {collimator}, mlc: {mlc}, jaw: {jaw}")]
    MismatchedLengths {
        mu: usize,
        gantry: usize,
        collimator: usize,
        mlc: usize,
        jaw: usize,
    },
    #[error("Delivery monitor units must start at 0, found {0}")]
    NonZeroStart(f64),
    #[error("Delivery monitor units decrease at control point {0}")]
    DecreasingMonitorUnits(usize),
    #[error("Delivery MLC must have shape (control points, leaf pairs, 2) and jaw (control points, 2); found {0:?} and {1:?}")]
    BadShape(Vec<usize>, Vec<usize>),
    #[error("Cannot merge deliveries with {0} and {1} leaf pairs")]
    MismatchedLeafPairs(usize, usize),
    #[error("Gantry angle {0} was found in more than one contiguous run of control points")]
    DuplicateAngle(f64),
    #[error("Gantry angles {angles:?} are not within {tolerance} degrees of any requested angle")]
    AngleOutOfTolerance { angles: Vec<f64>, tolerance: f64 },
    #[error("Decimation step must be at least 1")]
    BadDecimation,
    #[error("Failed to build array for delivery: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
}

#[derive(Debug, Error)]
pub enum SharedFileError {
    #[error("Could not open file {0:?} as it does not exist")]
    BadFilePath(PathBuf),
    #[error("Shared file read failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MonacoError {
    #[error("Monaco segment type ({0}) is neither a dynamic (1,1) nor a static (2,2) control point")]
    UnknownSegmentType(String),
    #[error("No control points were found in the Monaco plan")]
    NoControlPoints,
    #[error("Monaco control point pattern failed to compile: {0}")]
    PatternError(#[from] regex::Error),
    #[error("Monaco plan contained an invalid number: {0}")]
    ParsingError(#[from] std::num::ParseFloatError),
    #[error("Monaco plan failed due to file error: {0}")]
    FileError(#[from] SharedFileError),
    #[error("Monaco plan failed due to transform error: {0}")]
    TransformError(#[from] TransformError),
    #[error("Monaco plan failed due to delivery error: {0}")]
    DeliveryError(#[from] DeliveryError),
}

#[derive(Debug, Error)]
pub enum DicomPlanError {
    #[error("Could not open RT plan {0:?} as it does not exist")]
    BadFilePath(PathBuf),
    #[error("RT plan is missing {0}")]
    MissingAttribute(String),
    #[error("RT plan has fraction groups {0:?}; choose one")]
    AmbiguousFractionGroup(Vec<i64>),
    #[error("RT plan has no fraction group numbered {0}")]
    UnknownFractionGroup(i64),
    #[error("No RT plan fraction group matches the delivered metersets and gantry angles")]
    NoMatchingFractionGroup,
    #[error("RT plan references beam {0} which is not in the beam sequence")]
    UnknownBeam(i64),
    #[error("Only MLCX with ASYMY collimation is supported; found {0:?}")]
    UnsupportedDevices(Vec<String>),
    #[error("Expected one {device} item per control point, found {found}")]
    DeviceCount { device: String, found: usize },
    #[error("{device} holds {found} positions; expected {expected}")]
    BadPositions {
        device: String,
        found: usize,
        expected: usize,
    },
    #[error("MLCX declares {declared} leaf pairs but its boundaries give {boundaries}")]
    LeafCountMismatch { declared: i64, boundaries: usize },
    #[error("Beam {0} has a zero FinalCumulativeMetersetWeight")]
    ZeroFinalWeight(i64),
    #[error("Beam {0} has more than one gantry angle")]
    MultipleGantryAngles(i64),
    #[error("More than one beam sits at gantry angle {0}")]
    SharedGantryAngle(f64),
    #[error("No delivered control points fall at the gantry angle {0} of a plan beam")]
    EmptyBeam(f64),
    #[error("RT plan value could not be converted: {0}")]
    ConvertError(#[from] dicom_core::value::ConvertValueError),
    #[error("RT plan could not be read: {0}")]
    ReadError(#[from] dicom_object::ReadError),
    #[error("RT plan failed due to transform error: {0}")]
    TransformError(#[from] TransformError),
    #[error("RT plan failed due to delivery error: {0}")]
    DeliveryError(#[from] DeliveryError),
}

#[derive(Debug, Error)]
pub enum TrfError {
    #[error("Trajectory log header does not match the expected form")]
    HeaderMalformed,
    #[error("Trajectory log table of {0} bytes decodes cleanly under more than one row width")]
    AmbiguousEncoding(usize),
    #[error("Trajectory log table of {0} bytes is not a multiple of any supported row width")]
    UnexpectedTableLength(usize),
    #[error("Trajectory log table of {0} bytes has no row width whose state codes are all known")]
    NoValidEncoding(usize),
    #[error("Trajectory log {name} code(s) {codes:?} are missing from the code table")]
    UnknownCode { name: String, codes: Vec<u16> },
    #[error("Trajectory log table has {0} columns; expected 350 or 354")]
    UnexpectedColumnCount(usize),
    #[error("Trajectory log table has no column named {0}")]
    MissingColumn(String),
    #[error("Trajectory log failed due to code table error: {0}")]
    CodeTableError(#[from] TrfCodeTableError),
    #[error("Trajectory log failed due to file error: {0}")]
    FileError(#[from] SharedFileError),
    #[error("Trajectory log failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Trajectory log header pattern failed to compile: {0}")]
    PatternError(#[from] regex::Error),
    #[error("Trajectory log failed due to transform error: {0}")]
    TransformError(#[from] TransformError),
    #[error("Trajectory log failed due to delivery error: {0}")]
    DeliveryError(#[from] DeliveryError),
    #[error("Trajectory log failed to build its table: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
}

#[derive(Debug, Error)]
pub enum TrfCodeTableError {
    #[error("Trajectory log code table failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Trajectory log code table failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Trajectory log code table must not list 0 as a linac state")]
    ZeroStateCode,
}

#[derive(Debug, Error)]
pub enum IcomError {
    #[error("iCom record contained an invalid {key} value: {value}")]
    BadValue { key: String, value: String },
    #[error("iCom record is missing the {0} item")]
    MissingItem(String),
    #[error("No complete iCom records were found in the stream")]
    NoRecords,
    #[error("{0} is not a known iCom item")]
    UnknownKey(String),
    #[error("iCom item pattern failed to compile: {0}")]
    PatternError(#[from] regex::Error),
    #[error("iCom stream failed due to transform error: {0}")]
    TransformError(#[from] TransformError),
    #[error("iCom stream failed due to delivery error: {0}")]
    DeliveryError(#[from] DeliveryError),
    #[error("iCom stream failed due to file error: {0}")]
    FileError(#[from] SharedFileError),
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("iCom listener failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("iCom listener failed to format a timestamp: {0}")]
    TimeFormatError(#[from] time::error::Format),
    #[error("iCom listener failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<ListenerStatus>),
}

#[derive(Debug, Error)]
pub enum MosaiqError {
    #[error("No Mosaiq entries were found for {label}/{name} at {time}")]
    NoEntries {
        label: String,
        name: String,
        time: String,
    },
    #[error("Disagreeing Mosaiq entries were found for {label}/{name} at {time}")]
    MultipleEntries {
        label: String,
        name: String,
        time: String,
    },
    #[error("Mosaiq reads did not agree after {0} attempts")]
    ReadInconsistent(usize),
    #[error("Mosaiq TxField query returned {0} rows; expected exactly one")]
    BadTxFieldRows(usize),
    #[error("No TxFieldPoints were returned for field {0}")]
    NoFieldPoints(i64),
    #[error("All Mosaiq leaf blobs should be the same length; lengths seen were {0:?}")]
    UnequalBlobLengths(Vec<usize>),
    #[error("Mosaiq column {column} held an unexpected value: {value}")]
    UnexpectedValue { column: String, value: String },
    #[error("Mosaiq field type {0} is not a known field type")]
    UnknownFieldType(i64),
    #[error("No Mosaiq patient was found with ID {0}")]
    NoPatient(String),
    #[error("Multiple Mosaiq patients were found with ID {0}")]
    MultiplePatients(String),
    #[error("Mosaiq query failed: {0}")]
    QueryFailed(String),
    #[error("Mosaiq failed due to transform error: {0}")]
    TransformError(#[from] TransformError),
    #[error("Mosaiq failed due to delivery error: {0}")]
    DeliveryError(#[from] DeliveryError),
}

#[derive(Debug, Error)]
pub enum IdentifyError {
    #[error("No field label in trajectory log header")]
    NoFieldLabel,
    #[error("Trajectory log date {0} could not be parsed")]
    BadDate(String),
    #[error("Field identification failed due to time error: {0}")]
    TimeError(#[from] time::error::ComponentRange),
    #[error("Field identification failed to format a timestamp: {0}")]
    TimeFormatError(#[from] time::error::Format),
    #[error("Field identification failed due to trajectory log error: {0}")]
    TrfError(#[from] TrfError),
    #[error("Field identification failed due to Mosaiq error: {0}")]
    MosaiqError(#[from] MosaiqError),
    #[error("Field identification failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum MetersetMapError {
    #[error("Length {value} is not an integer multiple of the grid resolution {resolution}")]
    GridMisaligned { value: f64, resolution: f64 },
    #[error("Leaf at control point {control_point} travels to {position} mm, beyond half the maximum leaf gap ({limit} mm)")]
    LeafOutOfRange {
        control_point: usize,
        position: f64,
        limit: f64,
    },
    #[error("Jaw travels to {position} mm, beyond the leaf bank limit of {limit} mm")]
    JawOutOfRange { position: f64, limit: f64 },
    #[error("Delivery has {found} leaf pairs but the leaf geometry has {expected}")]
    LeafCountMismatch { found: usize, expected: usize },
    #[error("Meterset map failed due to delivery error: {0}")]
    DeliveryError(#[from] DeliveryError),
}

#[derive(Debug, Error)]
pub enum GantrySelectorError {
    #[error("Gantry selector failed due to delivery error: {0}")]
    DeliveryError(#[from] DeliveryError),
    #[error("Gantry selector failed due to meterset map error: {0}")]
    MetersetMapError(#[from] MetersetMapError),
    #[error("Gantry selector requires at least one gantry angle")]
    NoAngles,
}

#[derive(Debug, Error)]
pub enum MapWriterError {
    #[error("MetersetMapWriter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("MetersetMapWriter failed to convert to yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid Mosaiq UTC offset {0}; expected +HH:MM or -HH:MM")]
    BadUtcOffset(String),
    #[error("Config has no output path; set output_path to write meterset maps")]
    NoOutputPath,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor could not determine the source kind of {0:?}")]
    UnknownSource(String),
    #[error("Processor failed due to Monaco error: {0}")]
    MonacoError(#[from] MonacoError),
    #[error("Processor failed due to trajectory log error: {0}")]
    TrfError(#[from] TrfError),
    #[error("Processor failed due to RT plan error: {0}")]
    DicomPlanError(#[from] DicomPlanError),
    #[error("Processor failed due to iCom error: {0}")]
    IcomError(#[from] IcomError),
    #[error("Processor failed due to meterset map error: {0}")]
    MetersetMapError(#[from] MetersetMapError),
    #[error("Processor failed due to gantry selector error: {0}")]
    GantrySelectorError(#[from] GantrySelectorError),
    #[error("Processor failed due to MetersetMapWriter error: {0}")]
    WriterError(#[from] MapWriterError),
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to listener error: {0}")]
    ListenerError(#[from] ListenerError),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
}
